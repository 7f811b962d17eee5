pub mod bus;
pub mod engine;
pub mod gateway;
pub mod logging;
pub mod plugins;
pub mod reload;
pub mod telemetry;
pub mod types;
pub mod validate;

pub use bus::{BusConfig, BusMode, StreamConfig};
pub use engine::{AggregateConfig, EngineConfig};
pub use gateway::{GatewayConfig, resolve_glob};
pub use logging::{LogFormat, LoggingConfig};
pub use plugins::{PluginsConfig, RestartPolicy};
pub use reload::ReloadConfig;
pub use telemetry::TelemetryConfig;
pub use types::{ByteSize, HumanDuration};
