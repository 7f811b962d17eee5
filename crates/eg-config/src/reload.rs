use serde::Deserialize;

use crate::types::HumanDuration;

/// Hot-reload coordinator settings for the rules and plugin directories.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// When false, no watcher is created and snapshots are loaded once.
    pub enabled: bool,
    /// Filesystem event bursts within this window coalesce into one reload.
    pub debounce: HumanDuration,
    /// Fallback scan cadence when the OS notification facility is
    /// unavailable.
    pub poll_interval: HumanDuration,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce: std::time::Duration::from_millis(100).into(),
            poll_interval: std::time::Duration::from_secs(5).into(),
        }
    }
}
