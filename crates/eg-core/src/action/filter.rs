use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use orion_error::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};

use eg_config::HumanDuration;

use crate::error::{CoreReason, CoreResult};
use crate::expr::Scalar;
use crate::reading::Reading;
use crate::rule::condition::{CompiledCondition, Condition, SimpleOp};
use crate::stats;

/// Per-filter caches are swept on this cadence.
pub const CACHE_TTL: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// FilterParams — one of eleven kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterParams {
    /// Pass readings whose numeric field lies in `[min, max]`.
    Range {
        #[serde(default = "default_field")]
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// Drop repeats of the same field value within `window`.
    Duplicate {
        #[serde(default = "default_field")]
        field: String,
        window: HumanDuration,
    },
    /// At most `max_rate` readings per `window` per device+key.
    RateLimit { max_rate: u64, window: HumanDuration },
    /// Pass readings whose field matches the regex.
    Pattern {
        #[serde(default = "default_field")]
        field: String,
        regex: String,
    },
    /// Drop readings missing any of the required fields.
    Null { required: Vec<String> },
    /// Pass readings satisfying `field <op> value`.
    Threshold {
        #[serde(default = "default_field")]
        field: String,
        operator: SimpleOp,
        value: f64,
    },
    /// Pass readings stamped within the allowed UTC hours.
    TimeWindow { hours: Vec<u32> },
    /// Pass readings whose quality code is allowed.
    Quality { allowed: Vec<i32> },
    /// Drop readings whose rate of change exceeds `max_rate` units/second.
    ChangeRate {
        #[serde(default = "default_field")]
        field: String,
        max_rate: f64,
        window: HumanDuration,
    },
    /// Drop readings more than `stddev_threshold` deviations from the
    /// sliding-window mean; passes everything until `min_samples` arm it.
    StatisticalAnomaly {
        #[serde(default = "default_field")]
        field: String,
        window_size: usize,
        #[serde(default = "default_stddev_threshold")]
        stddev_threshold: f64,
        #[serde(default = "default_min_samples")]
        min_samples: usize,
    },
    /// Pass once the inner predicate has held for `count` consecutive
    /// readings.
    ConsecutiveAnomaly { condition: Condition, count: usize },
}

fn default_field() -> String {
    "value".to_string()
}
fn default_stddev_threshold() -> f64 {
    3.0
}
fn default_min_samples() -> usize {
    10
}

impl FilterParams {
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            FilterParams::Range { .. } => "range",
            FilterParams::Duplicate { .. } => "duplicate",
            FilterParams::RateLimit { .. } => "rate_limit",
            FilterParams::Pattern { .. } => "pattern",
            FilterParams::Null { .. } => "null",
            FilterParams::Threshold { .. } => "threshold",
            FilterParams::TimeWindow { .. } => "time_window",
            FilterParams::Quality { .. } => "quality",
            FilterParams::ChangeRate { .. } => "change_rate",
            FilterParams::StatisticalAnomaly { .. } => "statistical_anomaly",
            FilterParams::ConsecutiveAnomaly { .. } => "consecutive_anomaly",
        }
    }
}

// ---------------------------------------------------------------------------
// FilterState — shared per-engine caches
// ---------------------------------------------------------------------------

enum CacheData {
    Duplicate { last: Scalar, at: Instant },
    RateLimit { window_start: Instant, count: u64 },
    ChangeRate { last: f64, at_nanos: i64 },
    Window { values: VecDeque<f64> },
    Consecutive { streak: usize },
}

struct CacheEntry {
    touched: Instant,
    data: CacheData,
}

/// Stateful-filter working set. Entries key as
/// `<filter_kind>:<device_id>:<key>` and are swept by TTL.
#[derive(Default)]
pub struct FilterState {
    entries: Mutex<HashMap<String, CacheEntry>>,
    regexes: Mutex<HashMap<String, Arc<Regex>>>,
    conditions: Mutex<HashMap<String, Arc<CompiledCondition>>>,
    passed: AtomicU64,
    dropped: AtomicU64,
}

impl FilterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn passed(&self) -> u64 {
        self.passed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Evict cache entries idle longer than `ttl`.
    pub fn sweep(&self, ttl: Duration) {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("filter lock poisoned")
            .retain(|_, e| now.duration_since(e.touched) < ttl);
    }

    pub fn cached_entries(&self) -> usize {
        self.entries.lock().expect("filter lock poisoned").len()
    }

    fn regex(&self, pattern: &str) -> CoreResult<Arc<Regex>> {
        let mut cache = self.regexes.lock().expect("filter lock poisoned");
        if let Some(re) = cache.get(pattern) {
            return Ok(Arc::clone(re));
        }
        let re = Arc::new(Regex::new(pattern).map_err(|e| {
            StructError::from(CoreReason::Action).with_detail(format!("bad filter regex: {e}"))
        })?);
        cache.insert(pattern.to_string(), Arc::clone(&re));
        Ok(re)
    }

    fn condition(&self, key: &str, cond: &Condition) -> CoreResult<Arc<CompiledCondition>> {
        let mut cache = self.conditions.lock().expect("filter lock poisoned");
        if let Some(compiled) = cache.get(key) {
            return Ok(Arc::clone(compiled));
        }
        let compiled = Arc::new(cond.compile()?);
        cache.insert(key.to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }
}

// ---------------------------------------------------------------------------
// apply — returns true when the reading passes
// ---------------------------------------------------------------------------

pub async fn apply(
    state: &FilterState,
    rule_id: &str,
    action_idx: usize,
    params: &FilterParams,
    reading: &Reading,
) -> CoreResult<bool> {
    let pass = evaluate(state, rule_id, action_idx, params, reading)?;
    if pass {
        state.passed.fetch_add(1, Ordering::Relaxed);
    } else {
        state.dropped.fetch_add(1, Ordering::Relaxed);
    }
    Ok(pass)
}

fn evaluate(
    state: &FilterState,
    rule_id: &str,
    action_idx: usize,
    params: &FilterParams,
    reading: &Reading,
) -> CoreResult<bool> {
    let cache_key = format!(
        "{}:{}:{}",
        params.kind_name(),
        reading.device_id,
        reading.key
    );

    match params {
        FilterParams::Range { field, min, max } => {
            let Some(v) = field_number(reading, field) else {
                return Ok(false);
            };
            Ok(min.is_none_or(|lo| v >= lo) && max.is_none_or(|hi| v <= hi))
        }

        FilterParams::Duplicate { field, window } => {
            let Some(current) = reading.field(field) else {
                return Ok(false);
            };
            let now = Instant::now();
            let mut entries = state.entries.lock().expect("filter lock poisoned");
            let entry = entries.get_mut(&cache_key);
            if let Some(CacheEntry {
                data: CacheData::Duplicate { last, at },
                touched,
            }) = entry
                && crate::expr::scalars_equal(last, &current)
                && now.duration_since(*at) < window.as_duration()
            {
                *touched = now;
                return Ok(false);
            }
            entries.insert(
                cache_key,
                CacheEntry {
                    touched: now,
                    data: CacheData::Duplicate { last: current, at: now },
                },
            );
            Ok(true)
        }

        FilterParams::RateLimit { max_rate, window } => {
            let now = Instant::now();
            let mut entries = state.entries.lock().expect("filter lock poisoned");
            let entry = entries.entry(cache_key).or_insert_with(|| CacheEntry {
                touched: now,
                data: CacheData::RateLimit { window_start: now, count: 0 },
            });
            entry.touched = now;
            let CacheData::RateLimit { window_start, count } = &mut entry.data else {
                return Ok(true);
            };
            if now.duration_since(*window_start) >= window.as_duration() {
                *window_start = now;
                *count = 0;
            }
            *count += 1;
            Ok(*count <= *max_rate)
        }

        FilterParams::Pattern { field, regex } => {
            let Some(v) = reading.field(field) else {
                return Ok(false);
            };
            let re = state.regex(regex)?;
            Ok(re.is_match(&v.display_string()))
        }

        FilterParams::Null { required } => {
            Ok(required.iter().all(|f| reading.field(f).is_some()))
        }

        FilterParams::Threshold {
            field,
            operator,
            value,
        } => {
            let Some(actual) = reading.field(field) else {
                return Ok(false);
            };
            let expected = Scalar::Number(*value);
            use crate::expr::BinOp;
            Ok(match operator {
                SimpleOp::Eq => crate::expr::scalars_equal(&actual, &expected),
                SimpleOp::Ne => !crate::expr::scalars_equal(&actual, &expected),
                SimpleOp::Gt => crate::expr::compare_scalars(BinOp::Gt, &actual, &expected),
                SimpleOp::Gte => crate::expr::compare_scalars(BinOp::Ge, &actual, &expected),
                SimpleOp::Lt => crate::expr::compare_scalars(BinOp::Lt, &actual, &expected),
                SimpleOp::Lte => crate::expr::compare_scalars(BinOp::Le, &actual, &expected),
                _ => false,
            })
        }

        FilterParams::TimeWindow { hours } => {
            use chrono::Timelike;
            Ok(hours.contains(&reading.timestamp.hour()))
        }

        FilterParams::Quality { allowed } => {
            Ok(reading.quality.is_some_and(|q| allowed.contains(&q)))
        }

        FilterParams::ChangeRate {
            field,
            max_rate,
            window,
        } => {
            let Some(v) = field_number(reading, field) else {
                return Ok(false);
            };
            let ts = reading.timestamp_nanos();
            let now = Instant::now();
            let mut entries = state.entries.lock().expect("filter lock poisoned");
            let prev = match entries.get(&cache_key) {
                Some(CacheEntry {
                    data: CacheData::ChangeRate { last, at_nanos },
                    ..
                }) => Some((*last, *at_nanos)),
                _ => None,
            };
            entries.insert(
                cache_key,
                CacheEntry {
                    touched: now,
                    data: CacheData::ChangeRate { last: v, at_nanos: ts },
                },
            );
            let Some((last, at_nanos)) = prev else {
                return Ok(true);
            };
            let dt = (ts - at_nanos) as f64 / 1e9;
            if dt <= 0.0 || dt > window.as_duration().as_secs_f64() {
                // Outside the observation window: treat as a fresh start.
                return Ok(true);
            }
            Ok(((v - last) / dt).abs() <= *max_rate)
        }

        FilterParams::StatisticalAnomaly {
            field,
            window_size,
            stddev_threshold,
            min_samples,
        } => {
            let Some(v) = field_number(reading, field) else {
                return Ok(false);
            };
            let now = Instant::now();
            let mut entries = state.entries.lock().expect("filter lock poisoned");
            let entry = entries.entry(cache_key).or_insert_with(|| CacheEntry {
                touched: now,
                data: CacheData::Window { values: VecDeque::new() },
            });
            entry.touched = now;
            let CacheData::Window { values } = &mut entry.data else {
                return Ok(true);
            };

            let pass = if values.len() < *min_samples {
                true
            } else {
                let sample: Vec<f64> = values.iter().copied().collect();
                let mean = stats::mean(&sample).unwrap_or(0.0);
                let sd = stats::stddev(&sample).unwrap_or(0.0);
                sd == 0.0 || (v - mean).abs() <= stddev_threshold * sd
            };

            values.push_back(v);
            while values.len() > *window_size {
                values.pop_front();
            }
            Ok(pass)
        }

        FilterParams::ConsecutiveAnomaly { condition, count } => {
            let cond_key = format!("consecutive:{rule_id}:{action_idx}");
            let compiled = state.condition(&cond_key, condition)?;
            let hit = compiled.evaluate(reading)?;
            let now = Instant::now();
            let mut entries = state.entries.lock().expect("filter lock poisoned");
            let entry = entries.entry(cache_key).or_insert_with(|| CacheEntry {
                touched: now,
                data: CacheData::Consecutive { streak: 0 },
            });
            entry.touched = now;
            let CacheData::Consecutive { streak } = &mut entry.data else {
                return Ok(false);
            };
            if hit {
                *streak += 1;
                Ok(*streak >= *count)
            } else {
                *streak = 0;
                Ok(false)
            }
        }
    }
}

fn field_number(reading: &Reading, field: &str) -> Option<f64> {
    reading.field(field)?.as_number()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Value;
    use serde_json::json;

    fn params(v: serde_json::Value) -> FilterParams {
        serde_json::from_value(v).unwrap()
    }

    fn reading(v: f64) -> Reading {
        Reading::new("d1", "t", Value::Float(v))
    }

    async fn run(state: &FilterState, p: &FilterParams, r: &Reading) -> bool {
        apply(state, "r1", 0, p, r).await.unwrap()
    }

    #[tokio::test]
    async fn range_filter_bounds() {
        let state = FilterState::new();
        let p = params(json!({"kind": "range", "min": 0.0, "max": 100.0}));
        assert!(run(&state, &p, &reading(50.0)).await);
        assert!(!run(&state, &p, &reading(-1.0)).await);
        assert!(!run(&state, &p, &reading(101.0)).await);
    }

    #[tokio::test]
    async fn duplicate_within_window_passes_once() {
        let state = FilterState::new();
        let p = params(json!({"kind": "duplicate", "window": "10s"}));
        // v,v,v within the window → exactly one continue
        assert!(run(&state, &p, &reading(5.0)).await);
        assert!(!run(&state, &p, &reading(5.0)).await);
        assert!(!run(&state, &p, &reading(5.0)).await);
        // a different value resets the cache
        assert!(run(&state, &p, &reading(6.0)).await);
    }

    #[tokio::test]
    async fn rate_limit_counts_per_window() {
        let state = FilterState::new();
        let p = params(json!({"kind": "rate_limit", "max_rate": 2, "window": "10s"}));
        assert!(run(&state, &p, &reading(1.0)).await);
        assert!(run(&state, &p, &reading(2.0)).await);
        assert!(!run(&state, &p, &reading(3.0)).await);
    }

    #[tokio::test]
    async fn null_filter_requires_fields() {
        let state = FilterState::new();
        let p = params(json!({"kind": "null", "required": ["value", "tags.site"]}));
        assert!(!run(&state, &p, &reading(1.0)).await);

        let mut tagged = reading(1.0);
        tagged.tags.insert("site".into(), "x".into());
        assert!(run(&state, &p, &tagged).await);
    }

    #[tokio::test]
    async fn quality_filter() {
        let state = FilterState::new();
        let p = params(json!({"kind": "quality", "allowed": [0]}));
        assert!(run(&state, &p, &reading(1.0)).await);
        let mut bad = reading(1.0);
        bad.quality = Some(3);
        assert!(!run(&state, &p, &bad).await);
    }

    #[tokio::test]
    async fn statistical_anomaly_arms_after_min_samples() {
        let state = FilterState::new();
        let p = params(json!({
            "kind": "statistical_anomaly",
            "window_size": 10, "stddev_threshold": 2.0, "min_samples": 4
        }));
        for v in [10.0, 10.5, 9.5, 10.0] {
            assert!(run(&state, &p, &reading(v)).await);
        }
        // armed now: a wild outlier is dropped
        assert!(!run(&state, &p, &reading(100.0)).await);
        // a normal value still passes
        assert!(run(&state, &p, &reading(10.2)).await);
    }

    #[tokio::test]
    async fn consecutive_anomaly_needs_streak() {
        let state = FilterState::new();
        let p = params(json!({
            "kind": "consecutive_anomaly",
            "condition": {"type": "simple", "field": "value", "operator": "gt", "value": 90},
            "count": 3
        }));
        assert!(!run(&state, &p, &reading(95.0)).await);
        assert!(!run(&state, &p, &reading(96.0)).await);
        assert!(run(&state, &p, &reading(97.0)).await);
        // streak holds while the predicate holds
        assert!(run(&state, &p, &reading(98.0)).await);
        // one normal value resets it
        assert!(!run(&state, &p, &reading(10.0)).await);
        assert!(!run(&state, &p, &reading(99.0)).await);
    }

    #[tokio::test]
    async fn sweep_evicts_idle_entries() {
        let state = FilterState::new();
        let p = params(json!({"kind": "duplicate", "window": "10s"}));
        run(&state, &p, &reading(5.0)).await;
        assert_eq!(state.cached_entries(), 1);
        state.sweep(Duration::from_secs(0));
        assert_eq!(state.cached_entries(), 0);
    }
}
