use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use eg_core::bus::subject::sanitize_token;
use eg_core::bus::{Bus, PersistentStream};
use eg_core::reading::Reading;

use super::{Sink, sink_err};
use crate::adapters::Health;
use crate::error::RuntimeResult;

// ---------------------------------------------------------------------------
// StreamSink — durable archive through the bus's persistent stream
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StreamSinkParams {
    /// Subject prefix the archived readings are appended under; kept
    /// outside the bus's captured subject set to avoid double storage.
    #[serde(default = "default_prefix")]
    subject_prefix: String,
}

fn default_prefix() -> String {
    "archive".to_string()
}

/// Writes batches into the durable stream. This sink's bus coupling is
/// internal — it goes through the stream append API, never a subscription.
pub struct StreamSink {
    name: String,
    prefix: String,
    stream: Arc<PersistentStream>,
}

impl StreamSink {
    pub fn from_params(name: &str, params: &serde_json::Value, bus: &Bus) -> RuntimeResult<Self> {
        let params: StreamSinkParams = serde_json::from_value(params.clone())
            .map_err(|e| sink_err(format!("stream sink params: {e}")))?;
        let stream = bus
            .stream()
            .ok_or_else(|| sink_err("stream sink requires bus.stream.enabled"))?;
        Ok(Self {
            name: name.to_string(),
            prefix: params.subject_prefix,
            stream,
        })
    }
}

#[async_trait]
impl Sink for StreamSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, batch: &[Reading]) -> RuntimeResult<()> {
        for reading in batch {
            let body = serde_json::to_vec(reading)
                .map_err(|e| sink_err(format!("encode reading: {e}")))?;
            let subject = format!(
                "{}.{}.{}",
                self.prefix,
                sanitize_token(&reading.device_id),
                sanitize_token(&reading.key)
            );
            self.stream
                .append(&subject, &body)
                .map_err(|e| sink_err(format!("stream append: {e}")))?;
        }
        Ok(())
    }

    async fn stop(&self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn health(&self) -> Health {
        Health::Ok
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use eg_core::reading::Value;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn batches_survive_in_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let stream = PersistentStream::open(
            dir.path(),
            vec!["raw.>".to_string()],
            Duration::from_secs(3600),
            1 << 20,
            Duration::from_secs(30),
        )
        .unwrap();
        let bus = Bus::new(16);
        bus.attach_stream(Arc::clone(&stream));

        let sink = StreamSink::from_params("archiver", &json!({}), &bus).unwrap();
        sink.publish(&[Reading::new("d1", "t", Value::Float(1.0))])
            .await
            .unwrap();

        let consumer = stream.consumer("verify");
        let entries = consumer.fetch(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].subject, "archive.d1.t");
    }

    #[tokio::test]
    async fn requires_enabled_stream() {
        let bus = Bus::new(16);
        assert!(StreamSink::from_params("s", &json!({}), &bus).is_err());
    }
}
