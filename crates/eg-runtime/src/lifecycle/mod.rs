mod signal;
mod types;

pub use signal::wait_for_signal;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use orion_error::compat_prelude::*;
use orion_error::op_context;
use orion_error::prelude::*;
use tokio_util::sync::CancellationToken;

use eg_config::GatewayConfig;
use eg_core::action::{ActionContext, AlertDispatcher, ExprCache, FilterState, ForwardExecutor};
use eg_core::aggregate::AggregationEngine;
use eg_core::bus::{Bus, PersistentStream};
use eg_core::rule::{RuleStore, load_rules_dir};

use crate::engine_task::{self, EngineTaskConfig};
use crate::error::{RuntimeReason, RuntimeResult};
use crate::reload::ReloadCoordinator;
use crate::sinks::SinkRegistry;
use crate::supervisor::{self, Supervisor};
use crate::telemetry::{self, GatewayMetrics, TelemetrySources};
use types::TaskGroup;

/// Components exceeding this during shutdown are abandoned with a warning.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Gateway — the top-level lifecycle handle
// ---------------------------------------------------------------------------

/// Manages the full gateway lifecycle: bootstrap, run, and graceful
/// shutdown.
///
/// Cancellation unwinds in topological reverse order: adapters stop and
/// the drainer flushes, then the engine drains its queue, then sinks stop,
/// then the auxiliary tasks (reload, telemetry).
pub struct Gateway {
    cancel: CancellationToken,
    engine_cancel: CancellationToken,
    aux_cancel: CancellationToken,
    supervisor: Arc<Supervisor>,
    groups: Vec<TaskGroup>,
    sources: Arc<TelemetrySources>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").finish_non_exhaustive()
    }
}

impl Gateway {
    /// Bootstrap from a validated [`GatewayConfig`]; relative paths resolve
    /// against `base_dir` (the config file's parent).
    pub async fn start(config: GatewayConfig, base_dir: &Path) -> RuntimeResult<Self> {
        let mut op = op_context!("gateway-bootstrap").with_auto_log();
        op.record("gateway_id", config.gateway.id.as_str());

        let cancel = CancellationToken::new();
        let engine_cancel = CancellationToken::new();
        let aux_cancel = CancellationToken::new();

        // Phase 1: bus, with the durable stream when enabled.
        let bus = Bus::new(config.bus.default_queue_size);
        if config.bus.stream.enabled {
            let stream = PersistentStream::open(
                base_dir.join(&config.bus.stream.dir),
                config.bus.stream.subjects.clone(),
                config.bus.stream.max_age.as_duration(),
                config.bus.stream.max_bytes.as_bytes(),
                config.bus.stream.ack_deadline.as_duration(),
            )
            .owe(RuntimeReason::Bootstrap)?;
            bus.attach_stream(stream);
        }

        // Phase 2: initial rule snapshot.
        let rules_dir = base_dir.join(&config.gateway.rules_dir);
        let plugin_dir = base_dir.join(&config.gateway.plugin_dir);
        std::fs::create_dir_all(&rules_dir).owe_sys()?;
        std::fs::create_dir_all(&plugin_dir).owe_sys()?;

        let store = Arc::new(RuleStore::new());
        let rules = load_rules_dir(&rules_dir).owe_conf()?;
        let snapshot = store.install(rules).owe_conf()?;
        eg_info!(sys, rules = snapshot.len(), "initial rule snapshot installed");

        // Phase 3: action handlers.
        let aggregates = Arc::new(AggregationEngine::new(
            bus.clone(),
            config.engine.aggregate.max_states,
            config.engine.aggregate.max_memory.as_bytes(),
            config.engine.aggregate.idle_ttl.as_duration(),
        ));
        let actions = Arc::new(ActionContext {
            bus: bus.clone(),
            filters: Arc::new(FilterState::new()),
            exprs: Arc::new(ExprCache::new()),
            aggregates,
            alerts: AlertDispatcher::new(bus.clone()),
            forwarder: Arc::new(ForwardExecutor::new(bus.clone(), config.engine.max_workers)),
        });

        let metrics = Arc::new(GatewayMetrics::new());
        let ids: Vec<String> = snapshot.rules().iter().map(|r| r.rule.id.clone()).collect();
        metrics.set_rules(&ids);

        // Phase 4: plugin supervisor with the initial descriptor set.
        // Instances hang off the supervisor's own token so shutdown can
        // unwind adapters and sinks separately.
        let supervisor = Supervisor::new(
            config.plugins.clone(),
            bus.clone(),
            SinkRegistry::new(),
            CancellationToken::new(),
        );
        let descriptors = supervisor::discover(&plugin_dir).owe_conf()?;
        supervisor.reconcile(descriptors).await;

        // Phase 5: task groups (start order: engine → reload → telemetry).
        let mut groups: Vec<TaskGroup> = Vec::with_capacity(3);

        let mut engine_group = TaskGroup::new("engine");
        engine_group.push(tokio::spawn(engine_task::run_engine(EngineTaskConfig {
            bus: bus.clone(),
            store: Arc::clone(&store),
            actions: Arc::clone(&actions),
            metrics: Arc::clone(&metrics),
            max_workers: config.engine.max_workers,
            queue_size: config.engine.queue_size,
            exec_timeout: config.engine.exec_timeout.as_duration(),
            cleanup_interval: config.engine.aggregate.cleanup_interval.as_duration(),
            cancel: engine_cancel.clone(),
        })));
        groups.push(engine_group);

        let coordinator = ReloadCoordinator {
            config: config.reload.clone(),
            rules_dir,
            plugin_dir,
            store: Arc::clone(&store),
            supervisor: Arc::clone(&supervisor),
            metrics: Arc::clone(&metrics),
        };
        let mut reload_group = TaskGroup::new("reload");
        let reload_cancel = aux_cancel.child_token();
        reload_group.push(tokio::spawn(async move {
            coordinator.run(reload_cancel).await;
            Ok(())
        }));
        groups.push(reload_group);

        let sources = Arc::new(TelemetrySources {
            metrics,
            bus,
            actions,
            supervisor: Arc::clone(&supervisor),
        });
        if config.telemetry.enabled {
            let mut telemetry_group = TaskGroup::new("telemetry");
            let listen = config.telemetry.listen.clone();
            let telemetry_cancel = aux_cancel.child_token();
            let telemetry_sources = Arc::clone(&sources);
            telemetry_group.push(tokio::spawn(async move {
                telemetry::run_telemetry(&listen, telemetry_sources, telemetry_cancel).await
            }));
            groups.push(telemetry_group);
        }

        op.mark_suc();
        Ok(Self {
            cancel,
            engine_cancel,
            aux_cancel,
            supervisor,
            groups,
            sources,
        })
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        eg_info!(sys, "initiating graceful shutdown");
        self.cancel.cancel();
    }

    /// Unwind after [`shutdown`](Self::shutdown): adapters → engine drain →
    /// sinks → auxiliary tasks, each bounded by the shutdown grace.
    pub async fn wait(mut self) -> RuntimeResult<()> {
        self.cancel.cancelled().await;

        // 1. Producers stop; the drainer flushes buffered readings.
        self.supervisor.shutdown_adapters().await;

        // 2. The engine drains its queue, then finishes in-flight
        //    pipelines.
        self.engine_cancel.cancel();
        if let Some(engine_group) = pop_named(&mut self.groups, "engine") {
            engine_group.wait(SHUTDOWN_GRACE).await?;
        }

        // 3. Consumers stop once nothing more can reach them.
        self.supervisor.shutdown_sinks().await;

        // 4. Auxiliary tasks, LIFO.
        self.aux_cancel.cancel();
        while let Some(group) = self.groups.pop() {
            eg_debug!(sys, task_group = group.name, "waiting for task group");
            group.wait(SHUTDOWN_GRACE).await?;
        }
        eg_info!(sys, "gateway stopped");
        Ok(())
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Read-only accessors for the management surfaces.
    pub fn telemetry_sources(&self) -> Arc<TelemetrySources> {
        Arc::clone(&self.sources)
    }
}

fn pop_named(groups: &mut Vec<TaskGroup>, name: &str) -> Option<TaskGroup> {
    let idx = groups.iter().position(|g| g.name == name)?;
    Some(groups.remove(idx))
}
