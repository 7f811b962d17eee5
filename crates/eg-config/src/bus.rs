use serde::Deserialize;

use crate::types::{ByteSize, HumanDuration};

// ---------------------------------------------------------------------------
// BusConfig — deserialized from [bus]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// `embedded` runs the in-process bus; `external` names a broker URL.
    /// Only `embedded` is implemented — `external` is rejected at validation.
    pub mode: BusMode,
    /// Default subscription queue capacity when the subscriber passes none.
    pub default_queue_size: usize,
    /// Durable stream settings.
    pub stream: StreamConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mode: BusMode::Embedded,
            default_queue_size: 1024,
            stream: StreamConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "url")]
pub enum BusMode {
    Embedded,
    External(String),
}

// ---------------------------------------------------------------------------
// StreamConfig — deserialized from [bus.stream]
// ---------------------------------------------------------------------------

/// File-backed durable stream: retained subjects, storage bounds, and the
/// redelivery deadline for pull consumers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub enabled: bool,
    /// Storage directory, resolved against the config file's parent.
    pub dir: String,
    /// Subject patterns captured into the stream (e.g. `raw.>`).
    pub subjects: Vec<String>,
    pub max_age: HumanDuration,
    pub max_bytes: ByteSize,
    /// A fetched-but-unacked message is redelivered after this deadline.
    pub ack_deadline: HumanDuration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: "stream".to_string(),
            subjects: vec!["raw.>".to_string(), "processed.>".to_string()],
            max_age: std::time::Duration::from_secs(24 * 3600).into(),
            max_bytes: ByteSize::from(256 * 1024 * 1024),
            ack_deadline: std::time::Duration::from_secs(30).into(),
        }
    }
}
