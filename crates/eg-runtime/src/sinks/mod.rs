//! Northbound sinks. All sinks are pure consumers fed by the fanout sink's
//! routing table; the fanout sink itself is the only one constructed with a
//! bus handle.

mod console;
mod fanout;
mod file;
mod stream;

pub use console::ConsoleSink;
pub use fanout::{FanoutClass, FanoutConfig, FanoutSink};
pub use file::FileSink;
pub use stream::StreamSink;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use orion_error::prelude::*;
use tokio_util::sync::CancellationToken;

use eg_core::bus::Bus;
use eg_core::reading::Reading;

use crate::adapters::Health;
use crate::error::{RuntimeError, RuntimeReason, RuntimeResult};

/// Northbound consumer contract.
///
/// A successful `publish` return promises the batch has been durably handed
/// off (flushed to the transport or a durable internal buffer) — the
/// at-least-once delivery contract. Batches are ordered within themselves
/// but not across calls, and must not be mutated.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, _ctx: CancellationToken) -> RuntimeResult<()> {
        Ok(())
    }

    async fn publish(&self, batch: &[Reading]) -> RuntimeResult<()>;

    async fn stop(&self) -> RuntimeResult<()>;

    async fn health(&self) -> Health;
}

// ---------------------------------------------------------------------------
// SinkRegistry — name → instance, used by the fanout routing table
// ---------------------------------------------------------------------------

#[derive(Default, Clone)]
pub struct SinkRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<dyn Sink>>>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sink: Arc<dyn Sink>) {
        self.inner
            .lock()
            .expect("sink registry lock poisoned")
            .insert(sink.name().to_string(), sink);
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn Sink>> {
        self.inner
            .lock()
            .expect("sink registry lock poisoned")
            .remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Sink>> {
        self.inner
            .lock()
            .expect("sink registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("sink registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("sink registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build a built-in sink from its descriptor entrypoint name.
///
/// Only `fanout` receives the bus handle; `stream` couples to the bus's
/// durable stream through the stream API, not a subscription.
pub fn build(
    entrypoint: &str,
    name: &str,
    params: &serde_json::Value,
    bus: &Bus,
    registry: &SinkRegistry,
) -> RuntimeResult<Arc<dyn Sink>> {
    match entrypoint {
        "console" => Ok(Arc::new(ConsoleSink::new(name))),
        "file" => Ok(Arc::new(FileSink::from_params(name, params)?)),
        "stream" => Ok(Arc::new(StreamSink::from_params(name, params, bus)?)),
        "fanout" => Ok(Arc::new(FanoutSink::from_params(
            name,
            params,
            bus.clone(),
            registry.clone(),
        )?)),
        other => Err(StructError::from(RuntimeReason::Supervisor)
            .with_detail(format!("unknown sink entrypoint {other:?}"))),
    }
}

pub(crate) fn sink_err(detail: impl Into<String>) -> RuntimeError {
    StructError::from(RuntimeReason::Core(eg_core::error::CoreReason::Sink))
        .with_detail(detail.into())
}
