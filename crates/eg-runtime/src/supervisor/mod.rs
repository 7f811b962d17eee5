//! Plugin supervision: descriptor discovery, per-instance lifecycle with
//! bounded-backoff restart, blue/green replacement on descriptor change,
//! and the adapter drainer that multiplexes readings onto the bus.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use orion_error::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use eg_config::PluginsConfig;
use eg_core::bus::{Bus, error_subject, raw_subject};
use eg_core::reading::Reading;

use crate::adapters;
use crate::error::{RuntimeError, RuntimeReason, RuntimeResult};
use crate::sinks::{self, SinkRegistry};

/// An instance is considered healthy once it has run this long without
/// failing (sidecars additionally require their CONFIG handshake, which
/// `start` enforces before this timer begins).
const HEALTHY_AFTER: Duration = Duration::from_millis(250);
/// Blue/green replacement waits this long for the new instance.
const REPLACE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub component: ComponentKind,
    #[serde(default)]
    pub mode: PluginMode,
    /// Built-in factory name (`mock`, `http_poll`, `console`, `file`,
    /// `stream`, `fanout`); ignored for sidecar mode.
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Adapter,
    Sink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PluginMode {
    #[default]
    Builtin,
    Sidecar,
}

/// Read every `*.json` descriptor in the plugin directory.
pub fn discover(dir: &Path) -> RuntimeResult<Vec<PluginDescriptor>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| supervisor_err(format!("read plugin dir {}: {e}", dir.display())))?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut descriptors = Vec::new();
    for path in paths {
        let body = std::fs::read_to_string(&path)
            .map_err(|e| supervisor_err(format!("read {}: {e}", path.display())))?;
        let descriptor: PluginDescriptor = serde_json::from_str(&body)
            .map_err(|e| supervisor_err(format!("parse {}: {e}", path.display())))?;
        descriptors.push(descriptor);
    }
    Ok(descriptors)
}

// ---------------------------------------------------------------------------
// Instance state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Discovered,
    Configured,
    Starting,
    Running,
    Draining,
    Stopped,
    Failed,
}

struct Instance {
    descriptor: PluginDescriptor,
    state: Arc<StdMutex<PluginState>>,
    healthy: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Instance {
    fn state(&self) -> PluginState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(state: &Arc<StdMutex<PluginState>>, next: PluginState) {
        *state.lock().expect("state lock poisoned") = next;
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    config: PluginsConfig,
    bus: Bus,
    registry: SinkRegistry,
    readings_tx: mpsc::Sender<Reading>,
    instances: Mutex<HashMap<String, Instance>>,
    root: CancellationToken,
    drainer_cancel: CancellationToken,
    pub restarts_total: Arc<AtomicU64>,
    pub readings_published: Arc<AtomicU64>,
}

impl Supervisor {
    /// Build the supervisor and spawn its drainer: the sole reader of the
    /// shared adapter channel, batching by size or interval and publishing
    /// to `raw.<device>.<key>`.
    pub fn new(
        config: PluginsConfig,
        bus: Bus,
        registry: SinkRegistry,
        root: CancellationToken,
    ) -> Arc<Self> {
        let (readings_tx, readings_rx) = mpsc::channel(config.channel_capacity);
        let published = Arc::new(AtomicU64::new(0));
        let drainer_cancel = root.child_token();

        tokio::spawn(drain_readings(
            readings_rx,
            bus.clone(),
            config.batch_size,
            config.batch_interval.as_duration(),
            Arc::clone(&published),
            drainer_cancel.clone(),
        ));

        Arc::new(Self {
            config,
            bus,
            registry,
            readings_tx,
            instances: Mutex::new(HashMap::new()),
            root,
            drainer_cancel,
            restarts_total: Arc::new(AtomicU64::new(0)),
            readings_published: published,
        })
    }

    pub fn registry(&self) -> &SinkRegistry {
        &self.registry
    }

    /// Reconcile the running instance set against the discovered
    /// descriptors: start new ones, blue/green-replace changed ones, drain
    /// removed ones. Non-fanout sinks start first so fanout routes resolve.
    pub async fn reconcile(&self, mut descriptors: Vec<PluginDescriptor>) {
        descriptors.sort_by_key(|d| match (d.component, d.entrypoint.as_str()) {
            (ComponentKind::Sink, "fanout") => 1,
            (ComponentKind::Sink, _) => 0,
            (ComponentKind::Adapter, _) => 2,
        });

        let names: Vec<String> = descriptors.iter().map(|d| d.name.clone()).collect();

        for descriptor in descriptors {
            let existing = {
                let instances = self.instances.lock().await;
                instances.get(&descriptor.name).map(|i| i.descriptor.clone())
            };
            match existing {
                None => {
                    eg_info!(sys, plugin = %descriptor.name, "starting plugin");
                    let instance = self.spawn_instance(descriptor.clone());
                    self.instances
                        .lock()
                        .await
                        .insert(descriptor.name, instance);
                }
                Some(current) if current != descriptor => {
                    self.replace_instance(descriptor).await;
                }
                Some(_) => {}
            }
        }

        // Removed descriptors drain out.
        let stale: Vec<String> = {
            let instances = self.instances.lock().await;
            instances
                .keys()
                .filter(|name| !names.contains(name))
                .cloned()
                .collect()
        };
        for name in stale {
            eg_info!(sys, plugin = %name, "plugin descriptor removed, draining");
            self.drain_and_remove(&name).await;
        }
    }

    /// Blue/green: the replacement starts alongside the old instance and
    /// must report healthy before the old one drains; otherwise the old
    /// instance stays.
    async fn replace_instance(&self, descriptor: PluginDescriptor) {
        let name = descriptor.name.clone();
        eg_info!(sys, plugin = %name, "descriptor changed, replacing");
        let fresh = self.spawn_instance(descriptor);

        let deadline = tokio::time::Instant::now() + REPLACE_TIMEOUT;
        while !fresh.healthy.load(Ordering::Acquire) {
            if tokio::time::Instant::now() >= deadline {
                eg_warn!(sys, plugin = %name, "replacement never became healthy, keeping old");
                fresh.cancel.cancel();
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.drain_and_remove(&name).await;
        self.instances.lock().await.insert(name, fresh);
    }

    async fn drain_and_remove(&self, name: &str) {
        let instance = self.instances.lock().await.remove(name);
        if let Some(instance) = instance {
            Instance::set_state(&instance.state, PluginState::Draining);
            tokio::time::sleep(self.config.drain_grace.as_duration()).await;
            instance.cancel.cancel();
            let _ = instance.task.await;
        }
    }

    fn spawn_instance(&self, descriptor: PluginDescriptor) -> Instance {
        let state = Arc::new(StdMutex::new(PluginState::Discovered));
        let healthy = Arc::new(AtomicBool::new(false));
        let cancel = self.root.child_token();

        let task = match descriptor.component {
            ComponentKind::Adapter => tokio::spawn(run_adapter_instance(
                descriptor.clone(),
                self.config.clone(),
                self.bus.clone(),
                self.readings_tx.clone(),
                Arc::clone(&state),
                Arc::clone(&healthy),
                cancel.clone(),
                Arc::clone(&self.restarts_total),
            )),
            // Sinks build and register synchronously so fanout routes
            // resolve regardless of task scheduling order.
            ComponentKind::Sink => match self.build_sink(&descriptor) {
                Ok(sink) => {
                    Instance::set_state(&state, PluginState::Configured);
                    self.registry.insert(Arc::clone(&sink));
                    tokio::spawn(run_sink_instance(
                        descriptor.clone(),
                        sink,
                        self.registry.clone(),
                        Arc::clone(&state),
                        Arc::clone(&healthy),
                        cancel.clone(),
                    ))
                }
                Err(e) => {
                    eg_error!(sys, plugin = %descriptor.name, error = %e, "sink build failed");
                    let _ = self.bus.publish(
                        &error_subject("plugin"),
                        format!("sink {} failed to build: {e}", descriptor.name).into_bytes(),
                    );
                    Instance::set_state(&state, PluginState::Stopped);
                    tokio::spawn(async {})
                }
            },
        };

        Instance {
            descriptor,
            state,
            healthy,
            cancel,
            task,
        }
    }

    fn build_sink(&self, descriptor: &PluginDescriptor) -> RuntimeResult<Arc<dyn sinks::Sink>> {
        if descriptor.mode == PluginMode::Sidecar {
            return Err(supervisor_err(format!(
                "sink {} requests sidecar mode, which is not supported",
                descriptor.name
            )));
        }
        sinks::build(
            &descriptor.entrypoint,
            &descriptor.name,
            &descriptor.params,
            &self.bus,
            &self.registry,
        )
    }

    pub async fn running_counts(&self) -> (usize, usize) {
        let instances = self.instances.lock().await;
        let mut adapters = 0;
        let mut sinks = 0;
        for instance in instances.values() {
            if instance.state() == PluginState::Running {
                match instance.descriptor.component {
                    ComponentKind::Adapter => adapters += 1,
                    ComponentKind::Sink => sinks += 1,
                }
            }
        }
        (adapters, sinks)
    }

    pub async fn instance_state(&self, name: &str) -> Option<PluginState> {
        self.instances.lock().await.get(name).map(Instance::state)
    }

    /// Stop every instance at once (tests and abnormal teardown).
    pub async fn shutdown(&self) {
        let mut instances = self.instances.lock().await;
        for (_, instance) in instances.iter() {
            instance.cancel.cancel();
        }
        for (name, instance) in instances.drain() {
            if instance.task.await.is_err() {
                eg_warn!(sys, plugin = %name, "instance task panicked");
            }
        }
        self.drainer_cancel.cancel();
    }

    /// Ordered unwind, phase one: stop the producers and flush the drainer
    /// so every emitted reading reaches the bus before the engine drains.
    pub async fn shutdown_adapters(&self) {
        self.shutdown_component(ComponentKind::Adapter).await;
        self.drainer_cancel.cancel();
    }

    /// Ordered unwind, final phase: stop the consumers.
    pub async fn shutdown_sinks(&self) {
        self.shutdown_component(ComponentKind::Sink).await;
    }

    async fn shutdown_component(&self, component: ComponentKind) {
        let picked: Vec<(String, Instance)> = {
            let mut instances = self.instances.lock().await;
            let names: Vec<String> = instances
                .iter()
                .filter(|(_, i)| i.descriptor.component == component)
                .map(|(name, _)| name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|name| instances.remove(&name).map(|i| (name, i)))
                .collect()
        };
        for (name, instance) in picked {
            instance.cancel.cancel();
            if instance.task.await.is_err() {
                eg_warn!(sys, plugin = %name, "instance task panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Instance run loops
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn run_adapter_instance(
    descriptor: PluginDescriptor,
    config: PluginsConfig,
    bus: Bus,
    readings_tx: mpsc::Sender<Reading>,
    state: Arc<StdMutex<PluginState>>,
    healthy: Arc<AtomicBool>,
    cancel: CancellationToken,
    restarts: Arc<AtomicU64>,
) {
    let entrypoint = match descriptor.mode {
        PluginMode::Builtin => descriptor.entrypoint.clone(),
        PluginMode::Sidecar => "sidecar".to_string(),
    };
    let mut attempts = 0u32;
    Instance::set_state(&state, PluginState::Configured);

    loop {
        Instance::set_state(&state, PluginState::Starting);
        let failure = match adapters::build(&entrypoint, &descriptor.name, &descriptor.params, &config)
        {
            Ok(mut adapter) => {
                Instance::set_state(&state, PluginState::Running);
                let mark = {
                    let healthy = Arc::clone(&healthy);
                    tokio::spawn(async move {
                        tokio::time::sleep(HEALTHY_AFTER).await;
                        healthy.store(true, Ordering::Release);
                    })
                };
                let result = adapter.start(cancel.child_token(), readings_tx.clone()).await;
                mark.abort();
                let _ = adapter.stop().await;
                match result {
                    _ if cancel.is_cancelled() => {
                        Instance::set_state(&state, PluginState::Stopped);
                        return;
                    }
                    Ok(()) => {
                        // The source finished on its own; treat as failure
                        // so the restart policy applies.
                        Some(supervisor_err(format!(
                            "adapter {} exited unexpectedly",
                            descriptor.name
                        )))
                    }
                    Err(e) => Some(e),
                }
            }
            Err(e) => Some(e),
        };

        healthy.store(false, Ordering::Release);
        Instance::set_state(&state, PluginState::Failed);
        attempts += 1;
        restarts.fetch_add(1, Ordering::Relaxed);

        if let Some(e) = &failure {
            eg_warn!(sys, plugin = %descriptor.name, attempts, error = %e, "adapter failed");
        }

        if attempts > config.restart.ceiling {
            eg_error!(sys, plugin = %descriptor.name, "restart ceiling exceeded, stopping");
            let _ = bus.publish(
                &error_subject("plugin"),
                format!("plugin {} exceeded restart ceiling", descriptor.name).into_bytes(),
            );
            Instance::set_state(&state, PluginState::Stopped);
            return;
        }

        let delay = config.restart.delay_for(attempts);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                Instance::set_state(&state, PluginState::Stopped);
                return;
            }
        }
    }
}

async fn run_sink_instance(
    descriptor: PluginDescriptor,
    sink: Arc<dyn sinks::Sink>,
    registry: SinkRegistry,
    state: Arc<StdMutex<PluginState>>,
    healthy: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    Instance::set_state(&state, PluginState::Starting);
    Instance::set_state(&state, PluginState::Running);
    healthy.store(true, Ordering::Release);

    // Fanout's start runs its subscription loop; passive sinks return
    // immediately and simply wait for cancellation.
    if let Err(e) = sink.start(cancel.clone()).await {
        eg_error!(sys, plugin = %descriptor.name, error = %e, "sink start failed");
    } else {
        cancel.cancelled().await;
    }

    if let Err(e) = sink.stop().await {
        eg_warn!(sys, plugin = %descriptor.name, error = %e, "sink stop error");
    }
    registry.remove(&descriptor.name);
    Instance::set_state(&state, PluginState::Stopped);
}

// ---------------------------------------------------------------------------
// Drainer — shared channel → raw.<device>.<key>
// ---------------------------------------------------------------------------

async fn drain_readings(
    mut readings_rx: mpsc::Receiver<Reading>,
    bus: Bus,
    batch_size: usize,
    batch_interval: Duration,
    published: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut buffer: Vec<Reading> = Vec::with_capacity(batch_size);
    let mut tick = tokio::time::interval(batch_interval);
    loop {
        tokio::select! {
            reading = readings_rx.recv() => {
                match reading {
                    Some(reading) => {
                        if reading.validate().is_err() {
                            eg_warn!(pipe, device = %reading.device_id, "invalid reading dropped");
                            continue;
                        }
                        buffer.push(reading);
                        if buffer.len() >= batch_size {
                            flush_batch(&bus, &mut buffer, &published);
                        }
                    }
                    None => break,
                }
            }
            _ = tick.tick() => {
                if !buffer.is_empty() {
                    flush_batch(&bus, &mut buffer, &published);
                }
            }
            _ = cancel.cancelled() => {
                // Drain what adapters managed to emit before cancellation.
                while let Ok(reading) = readings_rx.try_recv() {
                    buffer.push(reading);
                }
                flush_batch(&bus, &mut buffer, &published);
                break;
            }
        }
    }
}

fn flush_batch(bus: &Bus, buffer: &mut Vec<Reading>, published: &AtomicU64) {
    for reading in buffer.drain(..) {
        let subject = raw_subject(&reading.device_id, &reading.key);
        match serde_json::to_vec(&reading) {
            Ok(body) => {
                if let Err(e) = bus.publish(&subject, body) {
                    eg_warn!(pipe, subject = %subject, error = %e, "raw publish failed");
                } else {
                    published.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => eg_warn!(pipe, error = %e, "reading encode failed"),
        }
    }
}

fn supervisor_err(detail: impl Into<String>) -> RuntimeError {
    StructError::from(RuntimeReason::Supervisor).with_detail(detail.into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plugins_config(ceiling: u32) -> PluginsConfig {
        let mut config = PluginsConfig::default();
        config.batch_size = 4;
        config.batch_interval = Duration::from_millis(20).into();
        config.drain_grace = Duration::from_millis(20).into();
        config.restart.initial = Duration::from_millis(10).into();
        config.restart.max = Duration::from_millis(40).into();
        config.restart.ceiling = ceiling;
        config
    }

    fn mock_descriptor(name: &str, interval: &str) -> PluginDescriptor {
        serde_json::from_value(json!({
            "name": name,
            "component": "adapter",
            "entrypoint": "mock",
            "params": {
                "device_id": "sim-1",
                "interval": interval,
                "signals": [{"key": "temperature", "kind": "constant", "value": 20.0}]
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn discovery_reads_descriptor_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("10-mock.json"),
            serde_json::to_string(&mock_descriptor("m1", "1s")).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("ignore.yaml"), "x: 1").unwrap();

        let descriptors = discover(dir.path()).unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].name, "m1");
        assert_eq!(descriptors[0].mode, PluginMode::Builtin);
    }

    #[tokio::test]
    async fn adapter_readings_reach_the_bus_batched() {
        let bus = Bus::new(64);
        let sub = bus.subscribe("raw.>", None, None).unwrap();
        let root = CancellationToken::new();
        let supervisor = Supervisor::new(
            plugins_config(3),
            bus.clone(),
            SinkRegistry::new(),
            root.clone(),
        );

        supervisor
            .reconcile(vec![mock_descriptor("m1", "10ms")])
            .await;

        let msg = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("readings should flow")
            .unwrap();
        assert_eq!(msg.subject, "raw.sim-1.temperature");
        let reading: Reading = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(reading.device_id, "sim-1");

        assert_eq!(
            supervisor.instance_state("m1").await,
            Some(PluginState::Running),
        );
        let (adapters_up, _) = supervisor.running_counts().await;
        assert_eq!(adapters_up, 1);

        root.cancel();
        supervisor.shutdown().await;
        assert!(supervisor.readings_published.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn restart_ceiling_stops_and_reports() {
        let bus = Bus::new(64);
        let errors = bus.subscribe("errors.plugin", None, None).unwrap();
        let root = CancellationToken::new();
        let supervisor = Supervisor::new(
            plugins_config(2),
            bus.clone(),
            SinkRegistry::new(),
            root.clone(),
        );

        // Unknown entrypoint: every start attempt fails immediately.
        let broken: PluginDescriptor = serde_json::from_value(json!({
            "name": "broken",
            "component": "adapter",
            "entrypoint": "no_such_adapter"
        }))
        .unwrap();
        supervisor.reconcile(vec![broken]).await;

        let msg = tokio::time::timeout(Duration::from_secs(2), errors.recv())
            .await
            .expect("ceiling report should arrive")
            .unwrap();
        assert!(String::from_utf8_lossy(&msg.payload).contains("broken"));

        // Give the task a beat to settle into Stopped.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            supervisor.instance_state("broken").await,
            Some(PluginState::Stopped),
        );
        assert!(supervisor.restarts_total.load(Ordering::Relaxed) >= 3);
        root.cancel();
    }

    #[tokio::test]
    async fn removed_descriptor_drains_instance() {
        let bus = Bus::new(64);
        let root = CancellationToken::new();
        let supervisor = Supervisor::new(
            plugins_config(3),
            bus.clone(),
            SinkRegistry::new(),
            root.clone(),
        );

        supervisor.reconcile(vec![mock_descriptor("m1", "10ms")]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        supervisor.reconcile(vec![]).await;
        assert_eq!(supervisor.instance_state("m1").await, None);
        root.cancel();
    }

    #[tokio::test]
    async fn changed_descriptor_replaces_blue_green() {
        let bus = Bus::new(64);
        let root = CancellationToken::new();
        let supervisor = Supervisor::new(
            plugins_config(3),
            bus.clone(),
            SinkRegistry::new(),
            root.clone(),
        );

        supervisor.reconcile(vec![mock_descriptor("m1", "10ms")]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Same name, different params → blue/green replace.
        supervisor.reconcile(vec![mock_descriptor("m1", "20ms")]).await;
        assert_eq!(
            supervisor.instance_state("m1").await,
            Some(PluginState::Running),
        );

        let instances = supervisor.instances.lock().await;
        let current = instances.get("m1").unwrap();
        assert_eq!(
            current.descriptor.params["interval"],
            json!("20ms"),
        );
        drop(instances);
        root.cancel();
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn sink_instances_register_in_the_registry() {
        let bus = Bus::new(64);
        let root = CancellationToken::new();
        let registry = SinkRegistry::new();
        let supervisor =
            Supervisor::new(plugins_config(3), bus.clone(), registry.clone(), root.clone());

        let console: PluginDescriptor = serde_json::from_value(json!({
            "name": "debug-out",
            "component": "sink",
            "entrypoint": "console"
        }))
        .unwrap();
        supervisor.reconcile(vec![console]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(registry.get("debug-out").is_some());
        let (_, sinks_up) = supervisor.running_counts().await;
        assert_eq!(sinks_up, 1);
        root.cancel();
        supervisor.shutdown().await;
    }
}
