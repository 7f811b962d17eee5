use serde::Deserialize;

use crate::types::HumanDuration;

// ---------------------------------------------------------------------------
// PluginsConfig — deserialized from [plugins]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Sidecar link is degraded after this long without any frame.
    pub heartbeat_timeout: HumanDuration,
    /// Degraded link is failed after this additional grace period.
    pub heartbeat_grace: HumanDuration,
    /// A draining instance is stopped after this long without emitting data.
    pub drain_grace: HumanDuration,
    /// Adapter readings are published once this many are buffered…
    pub batch_size: usize,
    /// …or once this interval elapses, whichever comes first.
    pub batch_interval: HumanDuration,
    /// Capacity of the shared adapter output channel.
    pub channel_capacity: usize,
    pub restart: RestartPolicy,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: std::time::Duration::from_secs(15).into(),
            heartbeat_grace: std::time::Duration::from_secs(30).into(),
            drain_grace: std::time::Duration::from_secs(10).into(),
            batch_size: 100,
            batch_interval: std::time::Duration::from_millis(200).into(),
            channel_capacity: 8192,
            restart: RestartPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// RestartPolicy — bounded exponential backoff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub initial: HumanDuration,
    pub factor: f64,
    pub max: HumanDuration,
    /// Attempt ceiling; exceeding it stops the instance for good.
    pub ceiling: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial: std::time::Duration::from_secs(1).into(),
            factor: 2.0,
            max: std::time::Duration::from_secs(60).into(),
            ceiling: 10,
        }
    }
}

impl RestartPolicy {
    /// Backoff delay before restart attempt `attempt` (1-based), capped at
    /// `max`.
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let initial = self.initial.as_duration().as_secs_f64();
        let raw = initial * self.factor.powi(attempt.saturating_sub(1) as i32);
        let capped = raw.min(self.max.as_duration().as_secs_f64());
        std::time::Duration::from_secs_f64(capped)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
