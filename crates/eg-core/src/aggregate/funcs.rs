use super::window::{WindowData, WindowKind};
use crate::stats;

// ---------------------------------------------------------------------------
// AggFunc — the summary function registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Mean,
    Median,
    Min,
    Max,
    Stddev,
    Variance,
    First,
    Last,
    Percentile(u8),
    NullRate,
    Completeness,
    OutlierCount,
    Change,
    ChangeRate,
    Volatility,
    Cv,
    AboveCount,
    BelowCount,
    InRangeCount,
}

/// O(1) functions update incrementally on insertion; snapshot functions
/// recompute from the live window on flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Incremental,
    Snapshot,
}

impl AggFunc {
    /// Parse a configured name, honouring the documented aliases.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "count" => AggFunc::Count,
            "sum" => AggFunc::Sum,
            "avg" | "mean" | "average" => AggFunc::Mean,
            "median" => AggFunc::Median,
            "min" => AggFunc::Min,
            "max" => AggFunc::Max,
            "stddev" | "std" => AggFunc::Stddev,
            "variance" => AggFunc::Variance,
            "first" => AggFunc::First,
            "last" => AggFunc::Last,
            "p25" => AggFunc::Percentile(25),
            "p50" => AggFunc::Percentile(50),
            "p75" => AggFunc::Percentile(75),
            "p90" => AggFunc::Percentile(90),
            "p95" => AggFunc::Percentile(95),
            "p99" => AggFunc::Percentile(99),
            "null_rate" => AggFunc::NullRate,
            "completeness" => AggFunc::Completeness,
            "outlier_count" => AggFunc::OutlierCount,
            "change" => AggFunc::Change,
            "change_rate" => AggFunc::ChangeRate,
            "volatility" => AggFunc::Volatility,
            "cv" => AggFunc::Cv,
            "above_count" => AggFunc::AboveCount,
            "below_count" => AggFunc::BelowCount,
            "in_range_count" => AggFunc::InRangeCount,
            _ => return None,
        })
    }

    pub fn complexity(self) -> Complexity {
        match self {
            AggFunc::Median | AggFunc::Percentile(_) => Complexity::Snapshot,
            _ => Complexity::Incremental,
        }
    }
}

/// Threshold configuration shared by the counting functions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Thresholds {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub outlier_k: f64,
}

/// Compute one function over a window. Windowed modes evaluate against live
/// samples; cumulative mode reads the incremental accumulators, so snapshot
/// functions yield `None` there.
pub fn compute(func: AggFunc, window: &WindowData, thresholds: &Thresholds) -> Option<f64> {
    if matches!(window.kind(), WindowKind::Cumulative) {
        return compute_cumulative(func, window);
    }
    let values = window.values();
    let observed = window.observed();

    match func {
        AggFunc::Count => Some(observed as f64),
        AggFunc::Sum => Some(values.iter().sum()),
        AggFunc::Mean => stats::mean(&values),
        AggFunc::Median => stats::median(&values),
        AggFunc::Min => values.iter().copied().reduce(f64::min),
        AggFunc::Max => values.iter().copied().reduce(f64::max),
        AggFunc::Stddev => stats::stddev(&values),
        AggFunc::Variance => stats::variance(&values),
        AggFunc::First => values.first().copied(),
        AggFunc::Last => values.last().copied(),
        AggFunc::Percentile(p) => stats::percentile(&values, p as f64),
        AggFunc::NullRate => {
            (observed > 0).then(|| window.null_count() as f64 / observed as f64)
        }
        AggFunc::Completeness => {
            (observed > 0).then(|| 1.0 - window.null_count() as f64 / observed as f64)
        }
        AggFunc::OutlierCount => {
            let mean = stats::mean(&values)?;
            let sd = stats::stddev(&values)?;
            if sd == 0.0 {
                return Some(0.0);
            }
            Some(
                values
                    .iter()
                    .filter(|v| (**v - mean).abs() > thresholds.outlier_k * sd)
                    .count() as f64,
            )
        }
        AggFunc::Change => {
            let (first, last) = (values.first()?, values.last()?);
            Some(last - first)
        }
        AggFunc::ChangeRate => {
            let (first, last) = (values.first()?, values.last()?);
            (*first != 0.0).then(|| (last - first) / first)
        }
        AggFunc::Volatility => {
            if values.len() < 2 {
                return None;
            }
            let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
            stats::stddev(&diffs)
        }
        AggFunc::Cv => {
            let mean = stats::mean(&values)?;
            let sd = stats::stddev(&values)?;
            (mean != 0.0).then(|| sd / mean)
        }
        AggFunc::AboveCount => {
            let hi = thresholds.upper?;
            Some(values.iter().filter(|v| **v > hi).count() as f64)
        }
        AggFunc::BelowCount => {
            let lo = thresholds.lower?;
            Some(values.iter().filter(|v| **v < lo).count() as f64)
        }
        AggFunc::InRangeCount => {
            let (lo, hi) = (thresholds.lower?, thresholds.upper?);
            Some(values.iter().filter(|v| (lo..=hi).contains(*v)).count() as f64)
        }
    }
}

fn compute_cumulative(func: AggFunc, window: &WindowData) -> Option<f64> {
    let acc = window.acc();
    match func {
        AggFunc::Count => Some((acc.count + acc.null_count) as f64),
        AggFunc::Sum => Some(acc.sum),
        AggFunc::Mean => (acc.count > 0).then_some(acc.mean),
        AggFunc::Min => (acc.count > 0).then_some(acc.min),
        AggFunc::Max => (acc.count > 0).then_some(acc.max),
        AggFunc::Stddev => acc.stddev(),
        AggFunc::Variance => acc.variance(),
        AggFunc::First => acc.first,
        AggFunc::Last => acc.last,
        AggFunc::NullRate => {
            let total = acc.count + acc.null_count;
            (total > 0).then(|| acc.null_count as f64 / total as f64)
        }
        AggFunc::Completeness => {
            let total = acc.count + acc.null_count;
            (total > 0).then(|| 1.0 - acc.null_count as f64 / total as f64)
        }
        AggFunc::OutlierCount => Some(acc.outliers as f64),
        AggFunc::Change => Some(acc.last? - acc.first?),
        AggFunc::ChangeRate => {
            let first = acc.first?;
            (first != 0.0).then(|| (acc.last.unwrap_or(first) - first) / first)
        }
        AggFunc::Volatility => acc.volatility(),
        AggFunc::Cv => {
            let sd = acc.stddev()?;
            (acc.mean != 0.0).then(|| sd / acc.mean)
        }
        AggFunc::AboveCount => Some(acc.above as f64),
        AggFunc::BelowCount => Some(acc.below as f64),
        AggFunc::InRangeCount => Some(acc.in_range as f64),
        // Snapshot-only functions have no incremental form.
        AggFunc::Median | AggFunc::Percentile(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn window_of(values: &[f64]) -> WindowData {
        let mut w = WindowData::new(WindowKind::Count(values.len()));
        for (i, v) in values.iter().enumerate() {
            w.insert(Some(*v), i as i64, 2.0);
        }
        w
    }

    #[test]
    fn aliases_parse() {
        assert_eq!(AggFunc::parse("avg"), Some(AggFunc::Mean));
        assert_eq!(AggFunc::parse("average"), Some(AggFunc::Mean));
        assert_eq!(AggFunc::parse("std"), Some(AggFunc::Stddev));
        assert_eq!(AggFunc::parse("p95"), Some(AggFunc::Percentile(95)));
        assert_eq!(AggFunc::parse("nope"), None);
    }

    #[test]
    fn complexity_classes() {
        assert_eq!(AggFunc::Mean.complexity(), Complexity::Incremental);
        assert_eq!(AggFunc::Median.complexity(), Complexity::Snapshot);
        assert_eq!(AggFunc::Percentile(99).complexity(), Complexity::Snapshot);
    }

    #[test]
    fn basic_functions() {
        let w = window_of(&[10.0, 20.0, 30.0]);
        let t = Thresholds { outlier_k: 2.0, ..Default::default() };
        assert_eq!(compute(AggFunc::Mean, &w, &t), Some(20.0));
        assert_eq!(compute(AggFunc::Max, &w, &t), Some(30.0));
        assert_eq!(compute(AggFunc::Change, &w, &t), Some(20.0));
        assert_eq!(compute(AggFunc::ChangeRate, &w, &t), Some(2.0));
        assert_eq!(compute(AggFunc::Count, &w, &t), Some(3.0));
    }

    #[test]
    fn threshold_counters_need_bounds() {
        let w = window_of(&[1.0, 5.0, 9.0]);
        let unbounded = Thresholds { outlier_k: 2.0, ..Default::default() };
        assert_eq!(compute(AggFunc::AboveCount, &w, &unbounded), None);

        let bounded = Thresholds {
            lower: Some(2.0),
            upper: Some(8.0),
            outlier_k: 2.0,
        };
        assert_eq!(compute(AggFunc::AboveCount, &w, &bounded), Some(1.0));
        assert_eq!(compute(AggFunc::BelowCount, &w, &bounded), Some(1.0));
        assert_eq!(compute(AggFunc::InRangeCount, &w, &bounded), Some(1.0));
    }

    #[test]
    fn volatility_is_stddev_of_diffs() {
        // diffs: +10, -10, +10 → population stddev ≈ 9.43
        let w = window_of(&[0.0, 10.0, 0.0, 10.0]);
        let t = Thresholds { outlier_k: 2.0, ..Default::default() };
        let v = compute(AggFunc::Volatility, &w, &t).unwrap();
        assert!((v - 9.428090).abs() < 1e-5);
    }

    #[test]
    fn cumulative_skips_snapshot_functions() {
        let mut w = WindowData::new(WindowKind::Cumulative);
        for v in [1.0, 2.0, 3.0] {
            w.insert(Some(v), 0, 2.0);
        }
        let t = Thresholds { outlier_k: 2.0, ..Default::default() };
        assert_eq!(compute(AggFunc::Mean, &w, &t), Some(2.0));
        assert_eq!(compute(AggFunc::Median, &w, &t), None);
        assert_eq!(compute(AggFunc::Percentile(95), &w, &t), None);
    }

    #[test]
    fn time_window_functions_reflect_live_samples() {
        let sec = 1_000_000_000i64;
        let mut w = WindowData::new(WindowKind::Time(Duration::from_secs(10)));
        w.insert(Some(100.0), 0, 2.0);
        w.insert(Some(1.0), 11 * sec, 2.0);
        w.insert(Some(3.0), 12 * sec, 2.0);
        let t = Thresholds { outlier_k: 2.0, ..Default::default() };
        // the 100.0 sample expired
        assert_eq!(compute(AggFunc::Mean, &w, &t), Some(2.0));
    }
}
