//! The action pipeline: a matching rule's actions execute in declared
//! order, each returning continue / drop / spawn.

pub mod alert;
pub mod filter;
pub mod forward;
pub mod transform;

pub use alert::{AlertDispatcher, AlertLevel, AlertParams};
pub use filter::{FilterParams, FilterState};
pub use forward::{ForwardExecutor, ForwardParams};
pub use transform::{ExprCache, TransformOutcome, TransformParams};

use std::sync::Arc;

use crate::aggregate::AggregationEngine;
use crate::bus::{Bus, processed_subject};
use crate::error::CoreResult;
use crate::reading::Reading;
use crate::rule::{ActionSpec, CompiledRule};

// ---------------------------------------------------------------------------
// ActionContext — explicit handles, no ambient state
// ---------------------------------------------------------------------------

/// Shared handles the action handlers draw on. Constructed once at startup
/// and passed explicitly into every pipeline run.
pub struct ActionContext {
    pub bus: Bus,
    pub filters: Arc<FilterState>,
    pub exprs: Arc<ExprCache>,
    pub aggregates: Arc<AggregationEngine>,
    pub alerts: Arc<AlertDispatcher>,
    pub forwarder: Arc<ForwardExecutor>,
}

/// Outcome of one rule's full pipeline for one reading.
#[derive(Debug, PartialEq)]
pub enum PipelineResult {
    /// All actions ran; when a transform modified the reading in place the
    /// final form was published under `processed.<device>.<key>`.
    Completed { transformed: bool },
    /// A filter (or an ignoring transform) terminated the pipeline.
    Dropped,
}

// ---------------------------------------------------------------------------
// run_pipeline
// ---------------------------------------------------------------------------

/// Execute a rule's actions in declared order against one reading.
///
/// Spawn policy: a transform with `output_key` publishes its derived
/// reading immediately and the *original* continues down the pipeline,
/// unless `replace_current` is set. Derived readings never re-enter this
/// rule's pipeline.
pub async fn run_pipeline(
    ctx: &ActionContext,
    rule: &CompiledRule,
    reading: &Reading,
) -> CoreResult<PipelineResult> {
    let mut current = reading.clone();
    let mut transformed = false;

    for (idx, action) in rule.rule.actions.iter().enumerate() {
        match action {
            ActionSpec::Filter(params) => {
                if !filter::apply(&ctx.filters, &rule.rule.id, idx, params, &current).await? {
                    return Ok(PipelineResult::Dropped);
                }
            }
            ActionSpec::Transform(params) => {
                match transform::apply(&ctx.exprs, params, &current)? {
                    TransformOutcome::Replaced(modified) => {
                        current = modified;
                        transformed = true;
                        if let Some(subject) = &params.publish_subject {
                            publish_reading(&ctx.bus, subject, &current);
                        }
                    }
                    TransformOutcome::Derived {
                        derived,
                        replace_current,
                    } => {
                        if let Some(subject) = &params.publish_subject {
                            publish_reading(&ctx.bus, subject, &derived);
                        }
                        if replace_current {
                            current = derived;
                            transformed = true;
                        } else {
                            // Spawned: published once, the original reading
                            // continues.
                            publish_reading(
                                &ctx.bus,
                                &processed_subject(&derived.device_id, &derived.key),
                                &derived,
                            );
                        }
                    }
                    TransformOutcome::Dropped => return Ok(PipelineResult::Dropped),
                }
            }
            ActionSpec::Aggregate(params) => {
                ctx.aggregates.apply(&rule.rule.id, params, &current)?;
            }
            ActionSpec::Alert(params) => {
                ctx.alerts.fire(&rule.rule.id, params, &current).await?;
            }
            ActionSpec::Forward(params) => {
                ctx.forwarder.execute(params, &current).await?;
            }
        }
    }

    if transformed {
        publish_reading(
            &ctx.bus,
            &processed_subject(&current.device_id, &current.key),
            &current,
        );
    }
    Ok(PipelineResult::Completed { transformed })
}

fn publish_reading(bus: &Bus, subject: &str, reading: &Reading) {
    match serde_json::to_vec(reading) {
        Ok(body) => {
            if let Err(e) = bus.publish(subject, body) {
                log::warn!("publish to {subject}: {e}");
            }
        }
        Err(e) => log::warn!("encode reading for {subject}: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Value;
    use crate::rule::Rule;
    use serde_json::json;
    use std::time::Duration;

    fn context() -> (ActionContext, Bus) {
        let bus = Bus::new(64);
        let ctx = ActionContext {
            bus: bus.clone(),
            filters: Arc::new(FilterState::new()),
            exprs: Arc::new(ExprCache::new()),
            aggregates: Arc::new(AggregationEngine::new(
                bus.clone(),
                100,
                1 << 20,
                Duration::from_secs(3600),
            )),
            alerts: AlertDispatcher::new(bus.clone()),
            forwarder: Arc::new(ForwardExecutor::new(bus.clone(), 2)),
        };
        (ctx, bus)
    }

    fn compiled(actions: serde_json::Value) -> CompiledRule {
        let rule: Rule = serde_json::from_value(json!({
            "id": "r1",
            "conditions": {"type": "simple", "field": "key", "operator": "eq", "value": "temperature"},
            "actions": actions
        }))
        .unwrap();
        CompiledRule::compile(rule).unwrap()
    }

    fn reading(v: f64) -> Reading {
        Reading::new("d1", "temperature", Value::Float(v))
    }

    #[tokio::test]
    async fn filter_drop_short_circuits_later_actions() {
        let (ctx, bus) = context();
        let sub = bus.subscribe("alerts.>", None, None).unwrap();
        let rule = compiled(json!([
            {"type": "filter", "parameters": {"kind": "range", "min": 0.0, "max": 10.0}},
            {"type": "alert", "parameters": {"level": "warning", "message": "m", "throttle": "0s"}}
        ]));

        let out = run_pipeline(&ctx, &rule, &reading(50.0)).await.unwrap();
        assert_eq!(out, PipelineResult::Dropped);
        assert!(sub.try_recv().is_none());

        let out = run_pipeline(&ctx, &rule, &reading(5.0)).await.unwrap();
        assert_eq!(out, PipelineResult::Completed { transformed: false });
        assert!(sub.try_recv().is_some());
    }

    #[tokio::test]
    async fn in_place_transform_publishes_processed() {
        let (ctx, bus) = context();
        let sub = bus.subscribe("processed.>", None, None).unwrap();
        let rule = compiled(json!([
            {"type": "transform", "parameters": {
                "type": "scale", "parameters": {"factor": 2.0}
            }}
        ]));

        run_pipeline(&ctx, &rule, &reading(21.0)).await.unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.subject, "processed.d1.temperature");
        let out: Reading = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(out.value, Value::Float(42.0));
    }

    #[tokio::test]
    async fn spawned_transform_keeps_original_flowing() {
        let (ctx, bus) = context();
        let sub = bus.subscribe("processed.>", None, None).unwrap();
        let rule = compiled(json!([
            {"type": "transform", "parameters": {
                "type": "expression",
                "parameters": {"expression": "x * 1.8 + 32"},
                "output_key": "temperature_f",
                "precision": 1
            }},
            {"type": "filter", "parameters": {"kind": "range", "min": 0.0, "max": 30.0}}
        ]));

        // 25 °C spawns 77 °F; the original 25 passes the range filter.
        let out = run_pipeline(&ctx, &rule, &reading(25.0)).await.unwrap();
        assert_eq!(out, PipelineResult::Completed { transformed: false });

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.subject, "processed.d1.temperature_f");
        let derived: Reading = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(derived.value, Value::Float(77.0));
    }

    #[tokio::test]
    async fn aggregate_action_feeds_engine() {
        let (ctx, _bus) = context();
        let rule = compiled(json!([
            {"type": "aggregate", "parameters": {
                "window": {"type": "count", "size": 2},
                "functions": ["avg"]
            }}
        ]));
        run_pipeline(&ctx, &rule, &reading(1.0)).await.unwrap();
        run_pipeline(&ctx, &rule, &reading(3.0)).await.unwrap();
        assert_eq!(ctx.aggregates.state_count(), 1);
        assert_eq!(
            ctx.aggregates.flushes.load(std::sync::atomic::Ordering::Relaxed),
            1,
        );
    }
}
