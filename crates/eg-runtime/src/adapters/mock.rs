use std::f64::consts::TAU;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use eg_config::HumanDuration;
use eg_core::reading::{Location, Reading, Value};

use super::{Adapter, Health, adapter_err};
use crate::error::RuntimeResult;

// ---------------------------------------------------------------------------
// MockAdapter — signal generator for development and tests
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MockParams {
    device_id: String,
    #[serde(default = "default_interval")]
    interval: HumanDuration,
    signals: Vec<SignalSpec>,
}

fn default_interval() -> HumanDuration {
    Duration::from_secs(1).into()
}

#[derive(Debug, Deserialize)]
struct SignalSpec {
    key: String,
    #[serde(flatten)]
    shape: SignalShape,
    /// Per-signal device override.
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SignalShape {
    /// `offset + amplitude * sin(t / period)`
    Sine {
        #[serde(default)]
        offset: f64,
        #[serde(default = "default_amplitude")]
        amplitude: f64,
        #[serde(default = "default_period")]
        period: HumanDuration,
    },
    /// Uniform noise in `[min, max]`.
    Random { min: f64, max: f64 },
    Constant { value: f64 },
    /// Random walk around a starting coordinate.
    Location { latitude: f64, longitude: f64 },
}

fn default_amplitude() -> f64 {
    1.0
}

fn default_period() -> HumanDuration {
    Duration::from_secs(60).into()
}

pub struct MockAdapter {
    name: String,
    params: MockParams,
    running: bool,
}

impl MockAdapter {
    pub fn from_params(name: &str, params: &serde_json::Value) -> RuntimeResult<Self> {
        let params: MockParams = serde_json::from_value(params.clone())
            .map_err(|e| adapter_err(format!("mock adapter params: {e}")))?;
        if params.signals.is_empty() {
            return Err(adapter_err("mock adapter needs at least one signal"));
        }
        Ok(Self {
            name: name.to_string(),
            params,
            running: false,
        })
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(
        &mut self,
        ctx: CancellationToken,
        out: mpsc::Sender<Reading>,
    ) -> RuntimeResult<()> {
        self.running = true;
        let mut tick = tokio::time::interval(self.params.interval.as_duration());
        let started = tokio::time::Instant::now();
        let mut walk: Vec<(f64, f64)> = self
            .params
            .signals
            .iter()
            .map(|s| match &s.shape {
                SignalShape::Location { latitude, longitude } => (*latitude, *longitude),
                _ => (0.0, 0.0),
            })
            .collect();

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = ctx.cancelled() => break,
            }
            let t = started.elapsed().as_secs_f64();
            for (idx, signal) in self.params.signals.iter().enumerate() {
                let value = sample(&signal.shape, t, &mut walk[idx]);
                let device = signal
                    .device_id
                    .clone()
                    .unwrap_or_else(|| self.params.device_id.clone());
                let reading = Reading::new(device, signal.key.clone(), value);
                if out.send(reading).await.is_err() {
                    // Supervisor went away; nothing left to produce for.
                    self.running = false;
                    return Ok(());
                }
            }
        }
        self.running = false;
        Ok(())
    }

    async fn stop(&mut self) -> RuntimeResult<()> {
        self.running = false;
        Ok(())
    }

    async fn health(&self) -> Health {
        if self.running { Health::Ok } else { Health::Failed }
    }
}

fn sample(shape: &SignalShape, t: f64, walk: &mut (f64, f64)) -> Value {
    let mut rng = rand::thread_rng();
    match shape {
        SignalShape::Sine {
            offset,
            amplitude,
            period,
        } => {
            let period = period.as_duration().as_secs_f64().max(1e-3);
            Value::Float(offset + amplitude * (TAU * t / period).sin())
        }
        SignalShape::Random { min, max } => Value::Float(rng.gen_range(*min..=*max)),
        SignalShape::Constant { value } => Value::Float(*value),
        SignalShape::Location { .. } => {
            walk.0 += rng.gen_range(-0.0005..0.0005);
            walk.1 += rng.gen_range(-0.0005..0.0005);
            Value::Location(Location {
                latitude: walk.0,
                longitude: walk.1,
                altitude: None,
                speed: None,
                heading: None,
                accuracy: Some(5.0),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
