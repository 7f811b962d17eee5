use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use eg_core::reading::Reading;

use super::{Sink, sink_err};
use crate::adapters::Health;
use crate::error::RuntimeResult;

// ---------------------------------------------------------------------------
// FileSink — JSON Lines appender
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FileSinkParams {
    path: PathBuf,
}

/// Appends readings as JSON Lines. The writer is created lazily on the
/// first publish so a missing parent directory fails the batch, not the
/// build.
pub struct FileSink {
    name: String,
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl FileSink {
    pub fn from_params(name: &str, params: &serde_json::Value) -> RuntimeResult<Self> {
        let params: FileSinkParams = serde_json::from_value(params.clone())
            .map_err(|e| sink_err(format!("file sink params: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            path: params.path,
            writer: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, batch: &[Reading]) -> RuntimeResult<()> {
        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| sink_err(format!("create {}: {e}", parent.display())))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| sink_err(format!("open {}: {e}", self.path.display())))?;
            *guard = Some(BufWriter::new(file));
        }
        let writer = guard.as_mut().expect("writer initialised above");

        for reading in batch {
            let line = serde_json::to_vec(reading)
                .map_err(|e| sink_err(format!("encode reading: {e}")))?;
            writer
                .write_all(&line)
                .await
                .map_err(|e| sink_err(format!("write: {e}")))?;
            writer
                .write_all(b"\n")
                .await
                .map_err(|e| sink_err(format!("write newline: {e}")))?;
        }
        // Flush before returning: publish promises a durable handoff.
        writer
            .flush()
            .await
            .map_err(|e| sink_err(format!("flush: {e}")))?;
        Ok(())
    }

    async fn stop(&self) -> RuntimeResult<()> {
        if let Some(writer) = self.writer.lock().await.as_mut() {
            writer
                .flush()
                .await
                .map_err(|e| sink_err(format!("flush on stop: {e}")))?;
        }
        Ok(())
    }

    async fn health(&self) -> Health {
        Health::Ok
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
