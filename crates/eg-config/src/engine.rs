use serde::Deserialize;

use crate::types::{ByteSize, HumanDuration};

// ---------------------------------------------------------------------------
// EngineConfig — deserialized from [engine]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rule execution parallelism (Semaphore upper limit).
    pub max_workers: usize,
    /// Capacity of the engine's raw-reading subscription queue.
    pub queue_size: usize,
    /// Single rule pipeline execution timeout.
    pub exec_timeout: HumanDuration,
    pub aggregate: AggregateConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            queue_size: 4096,
            exec_timeout: std::time::Duration::from_secs(30).into(),
            aggregate: AggregateConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// AggregateConfig — deserialized from [engine.aggregate]
// ---------------------------------------------------------------------------

/// Memory discipline for the aggregation engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    /// Per-rule ceiling on live `(rule, group)` states.
    pub max_states: usize,
    /// Engine-wide budget for buffered window bytes.
    pub max_memory: ByteSize,
    /// Sweep cadence for idle-state eviction and memory pressure.
    pub cleanup_interval: HumanDuration,
    /// A state idle longer than this is evicted on the next sweep.
    pub idle_ttl: HumanDuration,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            max_states: 10_000,
            max_memory: ByteSize::from(128 * 1024 * 1024),
            cleanup_interval: std::time::Duration::from_secs(60).into(),
            idle_ttl: std::time::Duration::from_secs(30 * 60).into(),
        }
    }
}
