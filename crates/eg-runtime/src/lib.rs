#[macro_use]
mod log_macros;

pub mod adapters;
pub mod error;
pub mod lifecycle;
pub mod reload;
pub mod sidecar;
pub mod sinks;
pub mod supervisor;
pub mod telemetry;
pub mod tracing_init;
pub(crate) mod engine_task;
