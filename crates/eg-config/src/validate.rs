use std::net::ToSocketAddrs;

use crate::bus::BusMode;
use crate::gateway::GatewayConfig;

/// Internal validation, called automatically during `GatewayConfig::from_str`
/// / `load`.
pub(crate) fn validate(config: &GatewayConfig) -> anyhow::Result<()> {
    if config.gateway.id.trim().is_empty() {
        anyhow::bail!("gateway.id must be non-empty");
    }
    if config.gateway.plugin_dir.trim().is_empty() {
        anyhow::bail!("gateway.plugin_dir must be non-empty");
    }
    if config.gateway.rules_dir.trim().is_empty() {
        anyhow::bail!("gateway.rules_dir must be non-empty");
    }

    if let BusMode::External(url) = &config.bus.mode {
        anyhow::bail!(
            "bus.mode = external ({url:?}) is not supported; only the embedded bus is implemented"
        );
    }
    if config.bus.default_queue_size == 0 {
        anyhow::bail!("bus.default_queue_size must be > 0");
    }
    if config.bus.stream.enabled {
        if config.bus.stream.subjects.is_empty() {
            anyhow::bail!("bus.stream.subjects must be non-empty when the stream is enabled");
        }
        if config.bus.stream.dir.trim().is_empty() {
            anyhow::bail!("bus.stream.dir must be non-empty when the stream is enabled");
        }
        if config.bus.stream.ack_deadline.as_duration().is_zero() {
            anyhow::bail!("bus.stream.ack_deadline must be > 0");
        }
    }

    if config.engine.max_workers == 0 {
        anyhow::bail!("engine.max_workers must be > 0");
    }
    if config.engine.queue_size == 0 {
        anyhow::bail!("engine.queue_size must be > 0");
    }
    if config.engine.aggregate.max_states == 0 {
        anyhow::bail!("engine.aggregate.max_states must be > 0");
    }
    if config.engine.aggregate.cleanup_interval.as_duration().is_zero() {
        anyhow::bail!("engine.aggregate.cleanup_interval must be > 0");
    }

    if config.plugins.batch_size == 0 {
        anyhow::bail!("plugins.batch_size must be > 0");
    }
    if config.plugins.heartbeat_timeout.as_duration().is_zero() {
        anyhow::bail!("plugins.heartbeat_timeout must be > 0");
    }
    if config.plugins.channel_capacity == 0 {
        anyhow::bail!("plugins.channel_capacity must be > 0");
    }
    if config.plugins.restart.factor < 1.0 {
        anyhow::bail!("plugins.restart.factor must be >= 1.0");
    }

    if config.telemetry.enabled {
        if config.telemetry.listen.trim().is_empty() {
            anyhow::bail!("telemetry.listen must be non-empty when telemetry.enabled=true");
        }
        // Must be host:port (no scheme).
        if config
            .telemetry
            .listen
            .to_socket_addrs()
            .map_err(|e| anyhow::anyhow!("telemetry.listen invalid: {e}"))?
            .next()
            .is_none()
        {
            anyhow::bail!("telemetry.listen resolved to no socket address");
        }
    }

    Ok(())
}
