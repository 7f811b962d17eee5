use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::bus::BusConfig;
use crate::engine::EngineConfig;
use crate::logging::LoggingConfig;
use crate::plugins::PluginsConfig;
use crate::reload::ReloadConfig;
use crate::telemetry::TelemetryConfig;
use crate::validate;

// ---------------------------------------------------------------------------
// Raw TOML structure (intermediate representation)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GatewayConfigRaw {
    gateway: GatewaySection,
    #[serde(default)]
    bus: BusConfig,
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default)]
    plugins: PluginsConfig,
    #[serde(default)]
    reload: ReloadConfig,
    #[serde(default)]
    telemetry: TelemetryConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    /// Gateway instance identifier; carried on alerts and telemetry.
    pub id: String,
    /// Directory holding plugin descriptor files.
    pub plugin_dir: String,
    /// Directory holding rule files (`*.json`).
    pub rules_dir: String,
}

// ---------------------------------------------------------------------------
// GatewayConfig (resolved, validated)
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct GatewayConfig {
    pub gateway: GatewaySection,
    pub bus: BusConfig,
    pub engine: EngineConfig,
    pub plugins: PluginsConfig,
    pub reload: ReloadConfig,
    pub telemetry: TelemetryConfig,
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Read and parse an `edgegate.toml` file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.as_ref().display()))?;
        content.parse()
    }
}

impl FromStr for GatewayConfig {
    type Err = anyhow::Error;

    /// Parse a TOML string into a resolved, validated [`GatewayConfig`].
    fn from_str(toml_str: &str) -> anyhow::Result<Self> {
        let raw: GatewayConfigRaw = toml::from_str(toml_str)?;

        let config = GatewayConfig {
            gateway: raw.gateway,
            bus: raw.bus,
            engine: raw.engine,
            plugins: raw.plugins,
            reload: raw.reload,
            telemetry: raw.telemetry,
            logging: raw.logging,
        };

        validate::validate(&config)?;

        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// resolve_glob — expand a glob pattern relative to a base directory
// ---------------------------------------------------------------------------

/// Expand `pattern` against `base_dir`, returning matching paths sorted for
/// deterministic load order.
pub fn resolve_glob(pattern: &str, base_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let full = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        base_dir.join(pattern).to_string_lossy().into_owned()
    };
    let mut paths: Vec<PathBuf> = glob::glob(&full)
        .map_err(|e| anyhow::anyhow!("invalid glob {pattern:?}: {e}"))?
        .filter_map(Result::ok)
        .collect();
    paths.sort();
    Ok(paths)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusMode;
    use crate::types::{ByteSize, HumanDuration};
    use std::time::Duration;

    const FULL_TOML: &str = r#"
[gateway]
id = "edge-01"
plugin_dir = "plugins"
rules_dir = "rules"

[bus]
default_queue_size = 512

[bus.stream]
enabled = true
dir = "data/stream"
subjects = ["raw.>", "processed.>"]
max_age = "12h"
max_bytes = "64MB"
ack_deadline = "10s"

[engine]
max_workers = 4
queue_size = 2048
exec_timeout = "10s"

[engine.aggregate]
max_states = 5000
max_memory = "32MB"
cleanup_interval = "30s"
idle_ttl = "10m"

[plugins]
batch_size = 50
batch_interval = "100ms"

[plugins.restart]
initial = "1s"
factor = 2.0
max = "30s"
ceiling = 5

[reload]
enabled = true
debounce = "100ms"

[telemetry]
enabled = true
listen = "127.0.0.1:9464"
"#;

    #[test]
    fn load_full_toml() {
        let cfg: GatewayConfig = FULL_TOML.parse().unwrap();

        assert_eq!(cfg.gateway.id, "edge-01");
        assert_eq!(cfg.gateway.rules_dir, "rules");

        assert_eq!(cfg.bus.mode, BusMode::Embedded);
        assert_eq!(cfg.bus.default_queue_size, 512);
        assert!(cfg.bus.stream.enabled);
        assert_eq!(cfg.bus.stream.max_bytes, "64MB".parse::<ByteSize>().unwrap());
        assert_eq!(
            cfg.bus.stream.ack_deadline,
            "10s".parse::<HumanDuration>().unwrap(),
        );

        assert_eq!(cfg.engine.max_workers, 4);
        assert_eq!(
            cfg.engine.exec_timeout.as_duration(),
            Duration::from_secs(10),
        );
        assert_eq!(cfg.engine.aggregate.max_states, 5000);

        assert_eq!(cfg.plugins.batch_size, 50);
        assert_eq!(cfg.plugins.restart.ceiling, 5);

        assert!(cfg.reload.enabled);
        assert_eq!(
            cfg.reload.debounce.as_duration(),
            Duration::from_millis(100),
        );

        assert!(cfg.telemetry.enabled);
    }

    #[test]
    fn sections_default_when_omitted() {
        let toml = r#"
[gateway]
id = "edge-02"
plugin_dir = "plugins"
rules_dir = "rules"
"#;
        let cfg: GatewayConfig = toml.parse().unwrap();
        assert_eq!(cfg.engine.max_workers, 8);
        assert!(!cfg.bus.stream.enabled);
        assert!(cfg.reload.enabled);
    }

    #[test]
    fn missing_gateway_section_fails() {
        assert!("[engine]\nmax_workers = 2\n".parse::<GatewayConfig>().is_err());
    }

    #[test]
    fn reject_empty_id() {
        let toml = FULL_TOML.replace("id = \"edge-01\"", "id = \"\"");
        assert!(toml.parse::<GatewayConfig>().is_err());
    }

    #[test]
    fn reject_zero_workers() {
        let toml = FULL_TOML.replace("max_workers = 4", "max_workers = 0");
        assert!(toml.parse::<GatewayConfig>().is_err());
    }

    #[test]
    fn reject_zero_queue() {
        let toml = FULL_TOML.replace("default_queue_size = 512", "default_queue_size = 0");
        assert!(toml.parse::<GatewayConfig>().is_err());
    }

    #[test]
    fn reject_external_bus() {
        let toml = FULL_TOML.replace(
            "[bus]\ndefault_queue_size = 512",
            "[bus]\ndefault_queue_size = 512\nmode = { kind = \"external\", url = \"nats://localhost:4222\" }",
        );
        let err = toml.parse::<GatewayConfig>().unwrap_err();
        assert!(err.to_string().contains("external"), "got: {err}");
    }

    #[test]
    fn reject_stream_without_subjects() {
        let toml = FULL_TOML.replace(
            "subjects = [\"raw.>\", \"processed.>\"]",
            "subjects = []",
        );
        assert!(toml.parse::<GatewayConfig>().is_err());
    }

    #[test]
    fn resolve_glob_sorts_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.json"), "[]").unwrap();
        std::fs::write(dir.path().join("a.json"), "[]").unwrap();
        std::fs::write(dir.path().join("c.txt"), "").unwrap();

        let paths = resolve_glob("*.json", dir.path()).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("a.json"));
        assert!(paths[1].ends_with("b.json"));
    }
}
