use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use eg_config::PluginsConfig;
use eg_core::reading::Reading;

use super::{Adapter, Health, adapter_err};
use crate::error::RuntimeResult;
use crate::sidecar::{LinkHealth, SidecarClient};

// ---------------------------------------------------------------------------
// SidecarAdapter — delegates acquisition to an out-of-process plugin
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SidecarParams {
    /// `host:port` the sidecar listens on.
    address: String,
    /// Opaque configuration forwarded in the `CONFIG` frame.
    #[serde(default)]
    config: serde_json::Value,
}

pub struct SidecarAdapter {
    name: String,
    params: SidecarParams,
    heartbeat_timeout: Duration,
    heartbeat_grace: Duration,
    last_health: std::sync::Mutex<Health>,
}

impl SidecarAdapter {
    pub fn from_params(
        name: &str,
        params: &serde_json::Value,
        plugins: &PluginsConfig,
    ) -> RuntimeResult<Self> {
        let params: SidecarParams = serde_json::from_value(params.clone())
            .map_err(|e| adapter_err(format!("sidecar adapter params: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            params,
            heartbeat_timeout: plugins.heartbeat_timeout.as_duration(),
            heartbeat_grace: plugins.heartbeat_grace.as_duration(),
            last_health: std::sync::Mutex::new(Health::Failed),
        })
    }

    fn set_health(&self, health: Health) {
        *self.last_health.lock().expect("health lock poisoned") = health;
    }
}

#[async_trait]
impl Adapter for SidecarAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    /// Connect and relay until the link fails or the context cancels. A
    /// failed link returns an error so the supervisor applies its restart
    /// policy.
    async fn start(
        &mut self,
        ctx: CancellationToken,
        out: mpsc::Sender<Reading>,
    ) -> RuntimeResult<()> {
        let client = SidecarClient::connect(
            &self.params.address,
            self.params.config.clone(),
            out,
            self.heartbeat_timeout,
            self.heartbeat_grace,
            &ctx,
        )
        .await?;
        self.set_health(Health::Ok);
        let link = client.link_token();

        let mut watchdog = tokio::time::interval(self.heartbeat_timeout / 2);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    client.close();
                    self.set_health(Health::Failed);
                    return Ok(());
                }
                _ = link.cancelled() => {
                    self.set_health(Health::Failed);
                    return Err(adapter_err(format!(
                        "sidecar {} link failed", self.params.address
                    )));
                }
                _ = watchdog.tick() => {
                    match client.health().await {
                        LinkHealth::Ok => self.set_health(Health::Ok),
                        LinkHealth::Degraded => {
                            eg_warn!(conn, adapter = %self.name, "sidecar link degraded");
                            self.set_health(Health::Degraded);
                        }
                        LinkHealth::Failed => {
                            client.close();
                            self.set_health(Health::Failed);
                            return Err(adapter_err(format!(
                                "sidecar {} heartbeat expired", self.params.address
                            )));
                        }
                    }
                }
            }
        }
    }

    async fn stop(&mut self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn health(&self) -> Health {
        *self.last_health.lock().expect("health lock poisoned")
    }
}
