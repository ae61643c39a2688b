//! Option / secret classification for volume creation.

use std::collections::HashMap;

/// Request option naming the driver alias.
pub const DRIVER_SELECTOR: &str = "driver";

/// Merge a driver's defaults with caller-supplied options.
///
/// Caller keys override defaults. A key is a secret iff it appears in
/// `default_secrets`, whichever side supplied it; secrets never appear in
/// the returned options. The selector key is dropped.
pub fn merge_parameters(
    default_options: &HashMap<String, String>,
    default_secrets: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
) -> (HashMap<String, String>, HashMap<String, String>) {
    let mut options: HashMap<String, String> = default_options
        .iter()
        .filter(|(key, _)| !default_secrets.contains_key(*key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let mut secrets = default_secrets.clone();

    for (key, value) in overrides {
        if key == DRIVER_SELECTOR {
            continue;
        }
        if default_secrets.contains_key(key) {
            secrets.insert(key.clone(), value.clone());
        } else {
            options.insert(key.clone(), value.clone());
        }
    }

    (options, secrets)
}
