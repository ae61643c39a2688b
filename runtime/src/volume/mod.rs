//! Volume registry: lifecycle state machine, parameter merging and
//! on-disk persistence.

mod manager;
mod merge;
mod store;

pub use manager::{Capabilities, VolumeManager, SCOPE_LOCAL};
pub use merge::{merge_parameters, DRIVER_SELECTOR};
pub use store::VolumeStore;
