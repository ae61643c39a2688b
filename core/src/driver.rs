//! Driver instance lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a driver instance for one alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverState {
    /// Never started, or the previous instance was discarded.
    #[default]
    Absent,
    /// Bring-up in progress.
    Starting,
    /// Endpoint confirmed reachable.
    Ready,
    /// Last bring-up attempt failed; the next call retries from scratch.
    Failed,
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DriverState::Absent => "absent",
            DriverState::Starting => "starting",
            DriverState::Ready => "ready",
            DriverState::Failed => "failed",
        };
        f.write_str(s)
    }
}
