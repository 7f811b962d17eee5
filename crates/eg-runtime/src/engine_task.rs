//! The rule-engine loop: one subscription on `raw.>`, snapshot-per-reading
//! evaluation, and semaphore-bounded parallel pipeline execution.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use eg_core::action::{ActionContext, PipelineResult, filter, run_pipeline};
use eg_core::bus::Bus;
use eg_core::reading::Reading;
use eg_core::rule::RuleStore;

use crate::telemetry::GatewayMetrics;

pub struct EngineTaskConfig {
    pub bus: Bus,
    pub store: Arc<RuleStore>,
    pub actions: Arc<ActionContext>,
    pub metrics: Arc<GatewayMetrics>,
    pub max_workers: usize,
    pub queue_size: usize,
    pub exec_timeout: Duration,
    pub cleanup_interval: Duration,
    pub cancel: CancellationToken,
}

/// Run until cancelled, then drain the queued readings and return.
pub async fn run_engine(config: EngineTaskConfig) -> anyhow::Result<()> {
    let EngineTaskConfig {
        bus,
        store,
        actions,
        metrics,
        max_workers,
        queue_size,
        exec_timeout,
        cleanup_interval,
        cancel,
    } = config;

    let sub = bus
        .subscribe("raw.>", None, Some(queue_size))
        .map_err(|e| anyhow::anyhow!("engine subscription: {e}"))?;
    let workers = Arc::new(Semaphore::new(max_workers));
    let mut sweep_tick = tokio::time::interval(cleanup_interval);

    loop {
        tokio::select! {
            msg = sub.recv() => {
                let Some(msg) = msg else { break };
                dispatch_reading(&msg.payload, &store, &actions, &metrics, &workers, exec_timeout).await;
            }
            _ = sweep_tick.tick() => {
                run_sweeps(&store, &actions, cleanup_interval);
            }
            _ = cancel.cancelled() => {
                // The supervisor's drainer has stopped; consume what is
                // left in the queue before exiting.
                while let Some(msg) = sub.try_recv() {
                    dispatch_reading(&msg.payload, &store, &actions, &metrics, &workers, exec_timeout).await;
                }
                // Wait for in-flight pipelines to release their permits.
                let _ = workers.acquire_many(max_workers as u32).await;
                break;
            }
        }
    }
    eg_debug!(pipe, "engine task drained and stopped");
    Ok(())
}

async fn dispatch_reading(
    payload: &[u8],
    store: &Arc<RuleStore>,
    actions: &Arc<ActionContext>,
    metrics: &Arc<GatewayMetrics>,
    workers: &Arc<Semaphore>,
    exec_timeout: Duration,
) {
    let reading: Reading = match serde_json::from_slice(payload) {
        Ok(reading) => reading,
        Err(e) => {
            eg_warn!(pipe, error = %e, "undecodable raw reading");
            return;
        }
    };
    metrics.readings_in.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    // Snapshot acquired once per reading; the evaluation completes against
    // it even if a reload installs a newer set meanwhile.
    let snapshot = store.snapshot();
    let candidates = snapshot.candidates(&reading);
    if candidates.is_empty() {
        return;
    }

    let Ok(permit) = Arc::clone(workers).acquire_owned().await else {
        return;
    };
    let actions = Arc::clone(actions);
    let metrics = Arc::clone(metrics);

    tokio::spawn(async move {
        let _permit = permit;
        for rule in candidates {
            match rule.condition.evaluate(&reading) {
                Ok(false) => continue,
                Ok(true) => {
                    metrics.rule_matched(&rule.rule.id);
                    let run = run_pipeline(&actions, &rule, &reading);
                    match tokio::time::timeout(exec_timeout, run).await {
                        Ok(Ok(PipelineResult::Completed { .. })) => {
                            metrics.rule_executed(&rule.rule.id);
                            metrics
                                .pipelines_ok
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                        Ok(Ok(PipelineResult::Dropped)) => {
                            metrics
                                .pipelines_dropped
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                        Ok(Err(e)) => {
                            metrics
                                .action_errors
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            eg_warn!(pipe, rule = %rule.rule.id, error = %e, "action pipeline error");
                        }
                        Err(_) => {
                            metrics
                                .exec_timeouts
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            eg_warn!(pipe, rule = %rule.rule.id, timeout = ?exec_timeout, "pipeline timed out");
                        }
                    }
                }
                Err(e) => {
                    // Condition errors skip the candidate for this reading.
                    metrics
                        .condition_errors
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    eg_warn!(pipe, rule = %rule.rule.id, error = %e, "condition error");
                }
            }
        }
    });
}

fn run_sweeps(store: &Arc<RuleStore>, actions: &Arc<ActionContext>, idle_ttl_hint: Duration) {
    let snapshot = store.snapshot();
    let flushed = actions.aggregates.sweep(&|rule_id| snapshot.contains(rule_id));
    if !flushed.is_empty() {
        eg_debug!(res, flushed = flushed.len(), "aggregate interval flush");
    }
    actions.filters.sweep(filter::CACHE_TTL);
    // Throttle entries older than several windows carry no information.
    actions.alerts.sweep(idle_ttl_hint.max(Duration::from_secs(3600)));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use eg_core::action::{AlertDispatcher, ExprCache, FilterState, ForwardExecutor};
    use eg_core::aggregate::AggregationEngine;
    use eg_core::reading::Value;
    use eg_core::rule::Rule;
    use serde_json::json;

    fn actions(bus: &Bus) -> Arc<ActionContext> {
        Arc::new(ActionContext {
            bus: bus.clone(),
            filters: Arc::new(FilterState::new()),
            exprs: Arc::new(ExprCache::new()),
            aggregates: Arc::new(AggregationEngine::new(
                bus.clone(),
                1000,
                1 << 20,
                Duration::from_secs(3600),
            )),
            alerts: AlertDispatcher::new(bus.clone()),
            forwarder: Arc::new(ForwardExecutor::new(bus.clone(), 2)),
        })
    }

    fn alert_rule(threshold: f64) -> Rule {
        serde_json::from_value(json!({
            "id": "hot",
            "conditions": {"type": "and", "conditions": [
                {"type": "simple", "field": "key", "operator": "eq", "value": "temperature"},
                {"type": "simple", "field": "value", "operator": "gt", "value": threshold}
            ]},
            "actions": [
                {"type": "alert", "parameters": {
                    "level": "warning",
                    "message": "{{.DeviceID}} at {{.Value}}",
                    "throttle": "0s"
                }}
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn end_to_end_raw_to_alert() {
        let bus = Bus::new(256);
        let alerts = bus.subscribe("alerts.>", None, None).unwrap();
        let store = Arc::new(RuleStore::new());
        store.install(vec![alert_rule(30.0)]).unwrap();
        let metrics = Arc::new(GatewayMetrics::new());
        metrics.set_rules(&["hot".to_string()]);

        let cancel = CancellationToken::new();
        let engine = tokio::spawn(run_engine(EngineTaskConfig {
            bus: bus.clone(),
            store: Arc::clone(&store),
            actions: actions(&bus),
            metrics: Arc::clone(&metrics),
            max_workers: 4,
            queue_size: 64,
            exec_timeout: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
            cancel: cancel.clone(),
        }));
        tokio::task::yield_now().await;

        let hot = Reading::new("d1", "temperature", Value::Float(35.0));
        bus.publish("raw.d1.temperature", serde_json::to_vec(&hot).unwrap())
            .unwrap();
        let cold = Reading::new("d1", "temperature", Value::Float(10.0));
        bus.publish("raw.d1.temperature", serde_json::to_vec(&cold).unwrap())
            .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), alerts.recv())
            .await
            .expect("alert expected")
            .unwrap();
        assert_eq!(msg.subject, "alerts.warning.d1");

        // only the hot reading matched
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(metrics.rule_matches("hot"), 1);

        cancel.cancel();
        engine.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reload_takes_effect_for_subsequent_readings() {
        let bus = Bus::new(256);
        let alerts = bus.subscribe("alerts.>", None, None).unwrap();
        let store = Arc::new(RuleStore::new());
        store.install(vec![alert_rule(100.0)]).unwrap();
        let metrics = Arc::new(GatewayMetrics::new());

        let cancel = CancellationToken::new();
        let engine = tokio::spawn(run_engine(EngineTaskConfig {
            bus: bus.clone(),
            store: Arc::clone(&store),
            actions: actions(&bus),
            metrics,
            max_workers: 4,
            queue_size: 64,
            exec_timeout: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
            cancel: cancel.clone(),
        }));
        tokio::task::yield_now().await;

        let warm = Reading::new("d1", "temperature", Value::Float(50.0));
        bus.publish("raw.d1.temperature", serde_json::to_vec(&warm).unwrap())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(alerts.try_recv().is_none());

        // Lower the threshold; readings observed after install match the
        // new snapshot.
        store.install(vec![alert_rule(30.0)]).unwrap();
        bus.publish("raw.d1.temperature", serde_json::to_vec(&warm).unwrap())
            .unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(2), alerts.recv())
            .await
            .expect("alert expected after reload")
            .unwrap();
        assert_eq!(msg.subject, "alerts.warning.d1");

        cancel.cancel();
        engine.await.unwrap().unwrap();
    }
}
