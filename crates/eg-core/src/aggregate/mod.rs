//! The aggregation engine: sliding count/time windows and cumulative
//! accumulators per `(rule, group)` pair, sharded for concurrent update.

mod funcs;
mod window;

pub use funcs::{AggFunc, Complexity, Thresholds};

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use orion_error::prelude::*;
use serde::{Deserialize, Serialize};

use eg_config::HumanDuration;

use crate::bus::{Bus, aggregated_subject};
use crate::error::{CoreError, CoreReason, CoreResult};
use crate::reading::{Reading, Value};
use crate::template;
use window::{WindowData, WindowKind};

const SHARD_COUNT: usize = 16;

// ---------------------------------------------------------------------------
// AggregateParams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateParams {
    pub window: WindowSpec,
    pub functions: Vec<String>,
    /// Field paths forming the group key; defaults to `["device_id"]`.
    #[serde(default)]
    pub group_by: Vec<String>,
    /// Template for the flushed reading's key, e.g. `"{{.Key}}_stats"`.
    #[serde(default)]
    pub output_key: Option<String>,
    /// Extra subject the flushed reading is published to.
    #[serde(default)]
    pub output_subject: Option<String>,
    /// Time-based flush trigger (count windows flush on completion even
    /// without it).
    #[serde(default)]
    pub interval: Option<HumanDuration>,
    #[serde(default)]
    pub upper: Option<f64>,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default = "default_outlier_k")]
    pub outlier_k: f64,
}

fn default_outlier_k() -> f64 {
    2.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WindowSpec {
    Count { size: usize },
    Time { duration: HumanDuration },
    Cumulative,
}

impl AggregateParams {
    /// Structural validation, run at rule compile.
    pub fn validate(&self) -> CoreResult<()> {
        if let WindowSpec::Count { size: 0 } = self.window {
            return Err(config_err("aggregate count window size must be > 0"));
        }
        if self.functions.is_empty() {
            return Err(config_err("aggregate requires at least one function"));
        }
        for name in &self.functions {
            if AggFunc::parse(name).is_none() {
                return Err(config_err(format!("unknown aggregate function {name:?}")));
            }
        }
        Ok(())
    }

    fn window_kind(&self) -> WindowKind {
        match &self.window {
            WindowSpec::Count { size } => WindowKind::Count(*size),
            WindowSpec::Time { duration } => WindowKind::Time(duration.as_duration()),
            WindowSpec::Cumulative => WindowKind::Cumulative,
        }
    }

    fn thresholds(&self) -> Thresholds {
        Thresholds {
            lower: self.lower,
            upper: self.upper,
            outlier_k: self.outlier_k,
        }
    }
}

// ---------------------------------------------------------------------------
// AggregationEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StateKey {
    rule_id: String,
    group: String,
}

struct AggState {
    window: WindowData,
    params: AggregateParams,
    /// Group field name→value pairs, carried as tags on flush output.
    group_tags: Vec<(String, String)>,
    last_reading: Reading,
    last_update: Instant,
    last_flush: Instant,
}

/// Sharded aggregate state store. Updates to one `(rule, group)` serialize
/// on its shard; sweeps visit shards in index order.
pub struct AggregationEngine {
    shards: Vec<Mutex<HashMap<StateKey, AggState>>>,
    bus: Bus,
    max_states_per_rule: usize,
    max_memory: usize,
    idle_ttl: Duration,
    /// States refused because a rule hit `max_states`.
    pub rejected_states: AtomicU64,
    pub evicted_states: AtomicU64,
    pub flushes: AtomicU64,
    state_count: AtomicUsize,
}

impl AggregationEngine {
    pub fn new(bus: Bus, max_states_per_rule: usize, max_memory: usize, idle_ttl: Duration) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            bus,
            max_states_per_rule,
            max_memory,
            idle_ttl,
            rejected_states: AtomicU64::new(0),
            evicted_states: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            state_count: AtomicUsize::new(0),
        }
    }

    pub fn state_count(&self) -> usize {
        self.state_count.load(Ordering::Relaxed)
    }

    pub fn approx_bytes(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                s.lock()
                    .expect("aggregate lock poisoned")
                    .values()
                    .map(|st| st.window.approx_bytes())
                    .sum::<usize>()
            })
            .sum()
    }

    /// Feed one reading into a rule's aggregate. Returns flush output (one
    /// derived reading) when a count window completed.
    pub fn apply(
        &self,
        rule_id: &str,
        params: &AggregateParams,
        reading: &Reading,
    ) -> CoreResult<Vec<Reading>> {
        let group_fields = effective_group_by(params);
        let group_tags: Vec<(String, String)> = group_fields
            .iter()
            .map(|f| {
                let v = reading
                    .field(f)
                    .map(|s| s.display_string())
                    .unwrap_or_default();
                (f.clone(), v)
            })
            .collect();
        let group = group_tags
            .iter()
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join("|");
        let key = StateKey {
            rule_id: rule_id.to_string(),
            group,
        };

        let shard = &self.shards[shard_index(&key, self.shards.len())];

        // The per-rule state bound is checked before taking the target
        // shard's lock (the count walks every shard).
        let is_new = !shard
            .lock()
            .expect("aggregate lock poisoned")
            .contains_key(&key);
        if is_new && self.count_rule_states(rule_id) >= self.max_states_per_rule {
            self.rejected_states.fetch_add(1, Ordering::Relaxed);
            return Err(StructError::from(CoreReason::Action).with_detail(format!(
                "rule {rule_id} exceeded max aggregate states ({})",
                self.max_states_per_rule
            )));
        }

        let mut states = shard.lock().expect("aggregate lock poisoned");
        if !states.contains_key(&key) {
            states.insert(
                key.clone(),
                AggState {
                    window: WindowData::new(params.window_kind()),
                    params: params.clone(),
                    group_tags: group_tags.clone(),
                    last_reading: reading.clone(),
                    last_update: Instant::now(),
                    last_flush: Instant::now(),
                },
            );
            self.state_count.fetch_add(1, Ordering::Relaxed);
        }

        let state = states.get_mut(&key).expect("state inserted above");
        let numeric = reading.value.as_f64();
        state
            .window
            .insert(numeric, reading.timestamp_nanos(), params.outlier_k);
        if let Some(v) = numeric
            && matches!(state.window.kind(), WindowKind::Cumulative)
        {
            // Windowed threshold counters recompute on flush instead.
            window_acc_thresholds(&mut state.window, v, params);
        }
        state.last_reading = reading.clone();
        state.group_tags = group_tags;
        state.last_update = Instant::now();

        let mut out = Vec::new();
        if state.window.is_full() {
            if let Some(flushed) = flush_state(state) {
                self.flushes.fetch_add(1, Ordering::Relaxed);
                self.publish(&state.params, &flushed);
                out.push(flushed);
            }
        }
        Ok(out)
    }

    /// Periodic sweep: interval-due flushes, idle eviction, memory pressure,
    /// and release of states whose rule is gone. Shards are visited in
    /// stable index order.
    pub fn sweep(&self, live_rule_ids: &dyn Fn(&str) -> bool) -> Vec<Reading> {
        let now = Instant::now();
        let mut flushed = Vec::new();
        let mut evicted = 0u64;

        for shard in &self.shards {
            let mut states = shard.lock().expect("aggregate lock poisoned");
            states.retain(|key, state| {
                // Removed rules' states are discarded without a final flush.
                if !live_rule_ids(&key.rule_id) {
                    evicted += 1;
                    return false;
                }
                if now.duration_since(state.last_update) > self.idle_ttl {
                    evicted += 1;
                    return false;
                }
                if let Some(interval) = state.params.interval
                    && now.duration_since(state.last_flush) >= interval.as_duration()
                    && let Some(out) = flush_state(state)
                {
                    self.flushes.fetch_add(1, Ordering::Relaxed);
                    self.publish(&state.params, &out);
                    flushed.push(out);
                }
                true
            });
        }

        // Memory pressure: drop the idlest states until under budget.
        if self.approx_bytes() > self.max_memory {
            evicted += self.evict_for_memory();
        }

        if evicted > 0 {
            self.evicted_states.fetch_add(evicted, Ordering::Relaxed);
        }
        self.refresh_state_count();
        flushed
    }

    fn evict_for_memory(&self) -> u64 {
        let mut candidates: Vec<(Instant, StateKey)> = Vec::new();
        for shard in &self.shards {
            let states = shard.lock().expect("aggregate lock poisoned");
            for (key, state) in states.iter() {
                candidates.push((state.last_update, key.clone()));
            }
        }
        candidates.sort_by_key(|(at, _)| *at);

        let mut evicted = 0u64;
        for (_, key) in candidates {
            if self.approx_bytes() <= self.max_memory {
                break;
            }
            let shard = &self.shards[shard_index(&key, self.shards.len())];
            if shard
                .lock()
                .expect("aggregate lock poisoned")
                .remove(&key)
                .is_some()
            {
                evicted += 1;
            }
        }
        evicted
    }

    fn refresh_state_count(&self) {
        let total: usize = self
            .shards
            .iter()
            .map(|s| s.lock().expect("aggregate lock poisoned").len())
            .sum();
        self.state_count.store(total, Ordering::Relaxed);
    }

    fn count_rule_states(&self, rule_id: &str) -> usize {
        self.shards
            .iter()
            .map(|s| {
                s.lock()
                    .expect("aggregate lock poisoned")
                    .keys()
                    .filter(|k| k.rule_id == rule_id)
                    .count()
            })
            .sum()
    }

    fn publish(&self, params: &AggregateParams, flushed: &Reading) {
        let Ok(body) = serde_json::to_vec(flushed) else {
            return;
        };
        let subject = aggregated_subject(&flushed.device_id, &flushed.key);
        if let Err(e) = self.bus.publish(&subject, body.clone()) {
            log::warn!("aggregate publish to {subject}: {e}");
        }
        if let Some(extra) = &params.output_subject
            && let Err(e) = self.bus.publish(extra, body)
        {
            log::warn!("aggregate publish to {extra}: {e}");
        }
    }
}

fn window_acc_thresholds(window: &mut WindowData, v: f64, params: &AggregateParams) {
    window.acc_mut().update_thresholds(v, params.lower, params.upper);
}

/// Compute every configured function and build the flush reading.
fn flush_state(state: &mut AggState) -> Option<Reading> {
    let thresholds = state.params.thresholds();
    let mut results = BTreeMap::new();
    for name in &state.params.functions {
        let func = AggFunc::parse(name)?;
        if let Some(v) = funcs::compute(func, &state.window, &thresholds) {
            results.insert(name.clone(), v);
        }
    }
    if results.is_empty() {
        return None;
    }

    let source = &state.last_reading;
    let key = match &state.params.output_key {
        Some(tpl) => template::expand(tpl, source, &HashMap::new()),
        None => format!("{}_agg", source.key),
    };

    let mut out = Reading::new(source.device_id.clone(), key, Value::Object(results));
    out.timestamp = chrono::Utc::now();
    for (field, value) in &state.group_tags {
        out.tags.insert(field.clone(), value.clone());
    }
    state.last_flush = Instant::now();
    Some(out)
}

fn effective_group_by(params: &AggregateParams) -> Vec<String> {
    if params.group_by.is_empty() {
        vec!["device_id".to_string()]
    } else {
        params.group_by.clone()
    }
}

fn shard_index(key: &StateKey, shards: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % shards
}

fn config_err(detail: impl Into<String>) -> CoreError {
    StructError::from(CoreReason::Config).with_detail(detail.into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
