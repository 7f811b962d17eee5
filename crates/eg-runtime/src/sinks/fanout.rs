use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use eg_config::HumanDuration;
use eg_core::action::alert::AlertEvent;
use eg_core::bus::{Bus, BusMessage};
use eg_core::expr::Scalar;
use eg_core::reading::{Reading, Value};

use super::{Sink, SinkRegistry, sink_err};
use crate::adapters::Health;
use crate::error::RuntimeResult;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Data classes a fanout subscription tags its traffic with, and the
/// granularity at which downstream sinks accept it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutClass {
    Raw,
    Rule,
    Alert,
    System,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FanoutSubscription {
    pub pattern: String,
    pub class: FanoutClass,
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FanoutRoute {
    pub sink: String,
    pub accepts: Vec<FanoutClass>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FanoutFilter {
    pub field: String,
    pub operator: FilterOp,
    pub value: serde_json::Value,
    /// Exclude filters drop matches; include filters (the default) admit
    /// only matches.
    #[serde(default)]
    pub exclude: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FanoutConfig {
    pub subscriptions: Vec<FanoutSubscription>,
    pub routes: Vec<FanoutRoute>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval: HumanDuration,
    #[serde(default)]
    pub filters: Vec<FanoutFilter>,
    /// Per-batch delivery retries before the batch is dropped and counted.
    #[serde(default = "default_retry")]
    pub retry: u32,
    /// Bounded queue depth per downstream sink.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

fn default_batch_size() -> usize {
    100
}
fn default_flush_interval() -> HumanDuration {
    Duration::from_millis(200).into()
}
fn default_retry() -> u32 {
    3
}
fn default_queue_size() -> usize {
    64
}

// ---------------------------------------------------------------------------
// FanoutSink
// ---------------------------------------------------------------------------

/// The single bus-aware sink: owns an ordered list of subscriptions,
/// decodes and filters matching messages, buffers per data class, and
/// flushes into each matching downstream over its own bounded queue.
pub struct FanoutSink {
    name: String,
    config: FanoutConfig,
    bus: Bus,
    registry: SinkRegistry,
    pub delivered_batches: AtomicU64,
    pub failed_batches: AtomicU64,
    pub dropped_batches: AtomicU64,
    pub filtered_out: AtomicU64,
}

impl FanoutSink {
    pub fn from_params(
        name: &str,
        params: &serde_json::Value,
        bus: Bus,
        registry: SinkRegistry,
    ) -> RuntimeResult<Self> {
        let config: FanoutConfig = serde_json::from_value(params.clone())
            .map_err(|e| sink_err(format!("fanout sink params: {e}")))?;
        if config.subscriptions.is_empty() {
            return Err(sink_err("fanout sink needs at least one subscription"));
        }
        if config.routes.is_empty() {
            return Err(sink_err("fanout sink needs at least one route"));
        }
        Ok(Self {
            name: name.to_string(),
            config,
            bus,
            registry,
            delivered_batches: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            dropped_batches: AtomicU64::new(0),
            filtered_out: AtomicU64::new(0),
        })
    }

    fn spawn_downstream_worker(
        &self,
        route: &FanoutRoute,
        ctx: &CancellationToken,
    ) -> RuntimeResult<DownstreamHandle> {
        let sink = self.registry.get(&route.sink).ok_or_else(|| {
            sink_err(format!("fanout route references unknown sink {:?}", route.sink))
        })?;
        let (tx, mut rx) = mpsc::channel::<Vec<Reading>>(self.config.queue_size);
        let retry = self.config.retry;
        let ctx = ctx.clone();
        let name = route.sink.clone();

        tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    batch = rx.recv() => match batch {
                        Some(batch) => batch,
                        None => break,
                    },
                    _ = ctx.cancelled() => break,
                };
                deliver_with_retry(&*sink, &name, &batch, retry).await;
            }
            if let Err(e) = sink.stop().await {
                eg_warn!(pipe, sink = %name, error = %e, "downstream stop error");
            }
        });

        Ok(DownstreamHandle {
            accepts: route.accepts.clone(),
            name: route.sink.clone(),
            tx,
        })
    }

    fn decode(&self, class: FanoutClass, msg: &BusMessage) -> Option<Reading> {
        match class {
            FanoutClass::Raw | FanoutClass::Rule => {
                serde_json::from_slice::<Reading>(&msg.payload).ok()
            }
            FanoutClass::Alert => {
                let event: AlertEvent = serde_json::from_slice(&msg.payload).ok()?;
                let mut reading = Reading::new(
                    event.device_id,
                    format!("alert_{}", event.level.as_str()),
                    Value::String(event.message),
                );
                reading.tags = event.tags;
                reading.tags.insert("rule_id".to_string(), event.rule_id);
                Some(reading)
            }
            FanoutClass::System => {
                let text = String::from_utf8_lossy(&msg.payload).into_owned();
                let mut reading =
                    Reading::new("gateway", "system_event", Value::String(text));
                reading.tags.insert("subject".to_string(), msg.subject.clone());
                Some(reading)
            }
        }
    }

    fn passes_filters(&self, reading: &Reading) -> bool {
        let mut has_include = false;
        let mut included = false;
        for filter in &self.config.filters {
            let matches = filter_matches(filter, reading);
            if filter.exclude {
                if matches {
                    return false;
                }
            } else {
                has_include = true;
                included |= matches;
            }
        }
        !has_include || included
    }

    fn route(&self, class: FanoutClass, batch: Vec<Reading>, downstreams: &[DownstreamHandle]) {
        for handle in downstreams {
            if !handle.accepts.contains(&class) {
                continue;
            }
            match handle.tx.try_send(batch.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped_batches.fetch_add(1, Ordering::Relaxed);
                    eg_warn!(pipe, sink = %handle.name, "downstream queue full, batch dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    eg_warn!(pipe, sink = %handle.name, "downstream worker gone");
                }
            }
        }
    }
}

struct DownstreamHandle {
    name: String,
    accepts: Vec<FanoutClass>,
    tx: mpsc::Sender<Vec<Reading>>,
}

async fn deliver_with_retry(sink: &dyn Sink, name: &str, batch: &[Reading], retry: u32) {
    let mut backoff = Duration::from_millis(100);
    for attempt in 0..=retry {
        if attempt > 0 {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(2));
        }
        match sink.publish(batch).await {
            Ok(()) => return,
            Err(e) => {
                eg_warn!(pipe, sink = %name, attempt, error = %e, "downstream publish failed");
            }
        }
    }
    eg_warn!(pipe, sink = %name, len = batch.len(), "batch dropped after retries");
}

#[async_trait]
impl Sink for FanoutSink {
    fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe, decode, filter, buffer, and flush until cancelled.
    async fn start(&self, ctx: CancellationToken) -> RuntimeResult<()> {
        let mut downstreams = Vec::with_capacity(self.config.routes.len());
        for route in &self.config.routes {
            downstreams.push(self.spawn_downstream_worker(route, &ctx)?);
        }

        // One forwarder task per subscription feeds a single ingest
        // channel; the flush loop below owns the class buffers.
        let (ingest_tx, mut ingest_rx) = mpsc::channel::<(FanoutClass, BusMessage)>(1024);
        for sub_config in &self.config.subscriptions {
            let sub = self
                .bus
                .subscribe(&sub_config.pattern, sub_config.group.as_deref(), None)
                .map_err(|e| sink_err(format!("fanout subscribe: {e}")))?;
            let class = sub_config.class;
            let tx = ingest_tx.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        msg = sub.recv() => match msg {
                            Some(msg) => {
                                if tx.send((class, msg)).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        _ = ctx.cancelled() => break,
                    }
                }
            });
        }
        drop(ingest_tx);

        let mut buffers: HashMap<FanoutClass, Vec<Reading>> = HashMap::new();
        let mut flush_tick = tokio::time::interval(self.config.flush_interval.as_duration());
        loop {
            tokio::select! {
                item = ingest_rx.recv() => {
                    let Some((class, msg)) = item else { break };
                    let Some(reading) = self.decode(class, &msg) else {
                        eg_debug!(pipe, subject = %msg.subject, "undecodable fanout message");
                        continue;
                    };
                    if !self.passes_filters(&reading) {
                        self.filtered_out.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    let buffer = buffers.entry(class).or_default();
                    buffer.push(reading);
                    if buffer.len() >= self.config.batch_size {
                        let batch = std::mem::take(buffer);
                        self.delivered_batches.fetch_add(1, Ordering::Relaxed);
                        self.route(class, batch, &downstreams);
                    }
                }
                _ = flush_tick.tick() => {
                    for (class, buffer) in buffers.iter_mut() {
                        if buffer.is_empty() {
                            continue;
                        }
                        let batch = std::mem::take(buffer);
                        self.delivered_batches.fetch_add(1, Ordering::Relaxed);
                        self.route(*class, batch, &downstreams);
                    }
                }
                _ = ctx.cancelled() => {
                    // Final drain: hand remaining buffers to the workers.
                    for (class, buffer) in buffers.iter_mut() {
                        if !buffer.is_empty() {
                            let batch = std::mem::take(buffer);
                            self.route(*class, batch, &downstreams);
                        }
                    }
                    break;
                }
            }
        }
        Ok(())
    }

    /// Direct feed (bypassing the bus) treats the batch as raw class.
    async fn publish(&self, batch: &[Reading]) -> RuntimeResult<()> {
        let _ = batch;
        Err(sink_err("the fanout sink is fed by its subscriptions, not publish"))
    }

    async fn stop(&self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn health(&self) -> Health {
        Health::Ok
    }
}

fn filter_matches(filter: &FanoutFilter, reading: &Reading) -> bool {
    let Some(actual) = reading.field(&filter.field) else {
        return false;
    };
    match (&actual, &filter.value) {
        (Scalar::Number(a), serde_json::Value::Number(b)) => {
            let Some(b) = b.as_f64() else { return false };
            match filter.operator {
                FilterOp::Eq => (a - b).abs() < f64::EPSILON,
                FilterOp::Ne => (a - b).abs() >= f64::EPSILON,
                FilterOp::Gt => *a > b,
                FilterOp::Gte => *a >= b,
                FilterOp::Lt => *a < b,
                FilterOp::Lte => *a <= b,
            }
        }
        (Scalar::Str(a), serde_json::Value::String(b)) => match filter.operator {
            FilterOp::Eq => a == b,
            FilterOp::Ne => a != b,
            FilterOp::Gt => a > b,
            FilterOp::Gte => a >= b,
            FilterOp::Lt => a < b,
            FilterOp::Lte => a <= b,
        },
        (Scalar::Bool(a), serde_json::Value::Bool(b)) => match filter.operator {
            FilterOp::Eq => a == b,
            FilterOp::Ne => a != b,
            _ => false,
        },
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use eg_core::action::alert::{AlertDispatcher, AlertParams};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Test sink that records every batch it receives.
    struct CollectorSink {
        name: String,
        batches: Arc<Mutex<Vec<Vec<Reading>>>>,
        fail_first: AtomicU64,
    }

    #[async_trait]
    impl Sink for CollectorSink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn publish(&self, batch: &[Reading]) -> RuntimeResult<()> {
            if self.fail_first.load(Ordering::Relaxed) > 0 {
                self.fail_first.fetch_sub(1, Ordering::Relaxed);
                return Err(sink_err("transient"));
            }
            self.batches
                .lock()
                .expect("lock")
                .push(batch.to_vec());
            Ok(())
        }

        async fn stop(&self) -> RuntimeResult<()> {
            Ok(())
        }

        async fn health(&self) -> Health {
            Health::Ok
        }
    }

    fn collector(name: &str, fail_first: u64) -> (Arc<CollectorSink>, Arc<Mutex<Vec<Vec<Reading>>>>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(CollectorSink {
            name: name.to_string(),
            batches: Arc::clone(&batches),
            fail_first: AtomicU64::new(fail_first),
        });
        (sink, batches)
    }

    fn publish_reading(bus: &Bus, subject: &str, reading: &Reading) {
        bus.publish(subject, serde_json::to_vec(reading).unwrap()).unwrap();
    }

    async fn start_fanout(
        bus: &Bus,
        registry: &SinkRegistry,
        params: serde_json::Value,
    ) -> (Arc<FanoutSink>, CancellationToken) {
        let fanout = Arc::new(
            FanoutSink::from_params("fanout", &params, bus.clone(), registry.clone()).unwrap(),
        );
        let ctx = CancellationToken::new();
        let runner = Arc::clone(&fanout);
        let run_ctx = ctx.clone();
        tokio::spawn(async move { runner.start(run_ctx).await });
        tokio::task::yield_now().await;
        (fanout, ctx)
    }

    #[tokio::test]
    async fn routes_classes_to_accepting_sinks() {
        let bus = Bus::new(64);
        let registry = SinkRegistry::new();
        let (raw_sink, raw_batches) = collector("raw-store", 0);
        let (alert_sink, alert_batches) = collector("alert-store", 0);
        registry.insert(raw_sink);
        registry.insert(alert_sink);

        let (_fanout, ctx) = start_fanout(
            &bus,
            &registry,
            json!({
                "subscriptions": [
                    {"pattern": "processed.>", "class": "rule"},
                    {"pattern": "alerts.>", "class": "alert"}
                ],
                "routes": [
                    {"sink": "raw-store", "accepts": ["rule"]},
                    {"sink": "alert-store", "accepts": ["alert"]}
                ],
                "batch_size": 10,
                "flush_interval": "20ms"
            }),
        )
        .await;

        publish_reading(
            &bus,
            "processed.d1.t",
            &Reading::new("d1", "t", Value::Float(1.0)),
        );

        // Fire a real alert through the dispatcher so the wire shape matches.
        let dispatcher = AlertDispatcher::new(bus.clone());
        let alert: AlertParams = serde_json::from_value(json!({
            "level": "warning", "message": "hot", "channels": []
        }))
        .unwrap();
        dispatcher
            .fire("r1", &alert, &Reading::new("d1", "t", Value::Float(99.0)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        ctx.cancel();

        let raw = raw_batches.lock().unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0][0].key, "t");

        let alerts = alert_batches.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0][0].key, "alert_warning");
        assert_eq!(alerts[0][0].tags["rule_id"], "r1");
    }

    #[tokio::test]
    async fn batch_size_triggers_flush() {
        let bus = Bus::new(64);
        let registry = SinkRegistry::new();
        let (sink, batches) = collector("store", 0);
        registry.insert(sink);

        let (_fanout, ctx) = start_fanout(
            &bus,
            &registry,
            json!({
                "subscriptions": [{"pattern": "raw.>", "class": "raw"}],
                "routes": [{"sink": "store", "accepts": ["raw"]}],
                "batch_size": 3,
                "flush_interval": "10s"
            }),
        )
        .await;

        for i in 0..3i64 {
            publish_reading(
                &bus,
                "raw.d1.t",
                &Reading::new("d1", format!("k{i}"), Value::Int(i)),
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctx.cancel();

        let got = batches.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].len(), 3);
    }

    #[tokio::test]
    async fn filters_gate_traffic() {
        let bus = Bus::new(64);
        let registry = SinkRegistry::new();
        let (sink, batches) = collector("store", 0);
        registry.insert(sink);

        let (fanout, ctx) = start_fanout(
            &bus,
            &registry,
            json!({
                "subscriptions": [{"pattern": "raw.>", "class": "raw"}],
                "routes": [{"sink": "store", "accepts": ["raw"]}],
                "batch_size": 1,
                "flush_interval": "10s",
                "filters": [
                    {"field": "value", "operator": "gte", "value": 10.0}
                ]
            }),
        )
        .await;

        publish_reading(&bus, "raw.d1.t", &Reading::new("d1", "t", Value::Float(5.0)));
        publish_reading(&bus, "raw.d1.t", &Reading::new("d1", "t", Value::Float(15.0)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctx.cancel();

        let got = batches.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0][0].value, Value::Float(15.0));
        assert_eq!(fanout.filtered_out.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn transient_downstream_failure_is_retried() {
        let bus = Bus::new(64);
        let registry = SinkRegistry::new();
        let (sink, batches) = collector("flaky", 2);
        registry.insert(sink);

        let (_fanout, ctx) = start_fanout(
            &bus,
            &registry,
            json!({
                "subscriptions": [{"pattern": "raw.>", "class": "raw"}],
                "routes": [{"sink": "flaky", "accepts": ["raw"]}],
                "batch_size": 1,
                "flush_interval": "10s",
                "retry": 3
            }),
        )
        .await;

        publish_reading(&bus, "raw.d1.t", &Reading::new("d1", "t", Value::Int(1)));
        tokio::time::sleep(Duration::from_millis(800)).await;
        ctx.cancel();

        assert_eq!(batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_route_fails_start() {
        let bus = Bus::new(64);
        let registry = SinkRegistry::new();
        let fanout = FanoutSink::from_params(
            "fanout",
            &json!({
                "subscriptions": [{"pattern": "raw.>", "class": "raw"}],
                "routes": [{"sink": "nope", "accepts": ["raw"]}]
            }),
            bus.clone(),
            registry,
        )
        .unwrap();
        assert!(fanout.start(CancellationToken::new()).await.is_err());
    }
}
