//! Southbound adapters: polling/streaming sources that emit readings into
//! the supervisor's shared channel.

mod http_poll;
mod mock;
mod sidecar;

pub use http_poll::HttpPollAdapter;
pub use mock::MockAdapter;
pub use sidecar::SidecarAdapter;

use async_trait::async_trait;
use orion_error::prelude::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use eg_config::PluginsConfig;
use eg_core::reading::Reading;

use crate::error::{RuntimeError, RuntimeReason, RuntimeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Ok,
    Degraded,
    Failed,
}

/// Southbound source contract.
///
/// `start` runs the adapter's acquisition loop until the context cancels or
/// a fatal error occurs; implementations must not emit after `stop`
/// returns, must tag readings with their declared device id unless a
/// register/topic overrides it, and set `quality = 0` when the underlying
/// protocol has no quality notion.
#[async_trait]
pub trait Adapter: Send {
    fn name(&self) -> &str;

    async fn start(
        &mut self,
        ctx: CancellationToken,
        out: mpsc::Sender<Reading>,
    ) -> RuntimeResult<()>;

    async fn stop(&mut self) -> RuntimeResult<()>;

    async fn health(&self) -> Health;
}

/// Build a built-in adapter from its descriptor entrypoint name.
pub fn build(
    entrypoint: &str,
    name: &str,
    params: &serde_json::Value,
    plugins: &PluginsConfig,
) -> RuntimeResult<Box<dyn Adapter>> {
    match entrypoint {
        "mock" => Ok(Box::new(MockAdapter::from_params(name, params)?)),
        "http_poll" => Ok(Box::new(HttpPollAdapter::from_params(name, params)?)),
        "sidecar" => Ok(Box::new(SidecarAdapter::from_params(name, params, plugins)?)),
        other => Err(StructError::from(RuntimeReason::Supervisor)
            .with_detail(format!("unknown adapter entrypoint {other:?}"))),
    }
}

pub(crate) fn adapter_err(detail: impl Into<String>) -> RuntimeError {
    StructError::from(RuntimeReason::Core(eg_core::error::CoreReason::Adapter))
        .with_detail(detail.into())
}
