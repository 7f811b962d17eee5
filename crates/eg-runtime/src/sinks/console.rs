use async_trait::async_trait;

use eg_core::reading::Reading;

use super::Sink;
use crate::adapters::Health;
use crate::error::RuntimeResult;

/// Debug sink: one JSON line per reading on stdout.
pub struct ConsoleSink {
    name: String,
}

impl ConsoleSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, batch: &[Reading]) -> RuntimeResult<()> {
        for reading in batch {
            match serde_json::to_string(reading) {
                Ok(line) => println!("{line}"),
                Err(e) => eg_warn!(pipe, sink = %self.name, error = %e, "encode error"),
            }
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
