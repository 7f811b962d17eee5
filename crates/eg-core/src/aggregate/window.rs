use std::collections::VecDeque;
use std::time::Duration;

// ---------------------------------------------------------------------------
// WindowData — one group's rolling sample set (or cumulative accumulators)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WindowKind {
    /// Ring of the last N readings.
    Count(usize),
    /// Readings within the trailing duration.
    Time(Duration),
    /// No window; incremental accumulators only.
    Cumulative,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Sample {
    /// `None` marks a null reading (no numeric value extractable).
    pub value: Option<f64>,
    pub ts_nanos: i64,
}

/// Per-group window state. Count and time windows keep live samples for
/// snapshot functions; the cumulative mode keeps only O(1) accumulators.
#[derive(Debug)]
pub(crate) struct WindowData {
    kind: WindowKind,
    samples: VecDeque<Sample>,
    acc: Accum,
}

impl WindowData {
    pub fn new(kind: WindowKind) -> Self {
        Self {
            kind,
            samples: VecDeque::new(),
            acc: Accum::default(),
        }
    }

    pub fn kind(&self) -> &WindowKind {
        &self.kind
    }

    /// Insert one observation, trimming the window.
    pub fn insert(&mut self, value: Option<f64>, ts_nanos: i64, outlier_k: f64) {
        self.acc.update(value, outlier_k);
        match self.kind {
            WindowKind::Cumulative => {}
            WindowKind::Count(n) => {
                self.samples.push_back(Sample { value, ts_nanos });
                while self.samples.len() > n {
                    self.samples.pop_front();
                }
            }
            WindowKind::Time(dur) => {
                self.samples.push_back(Sample { value, ts_nanos });
                let cutoff = ts_nanos - dur.as_nanos() as i64;
                // window=0 degenerates to "last reading only"
                while self
                    .samples
                    .front()
                    .is_some_and(|s| s.ts_nanos < cutoff || (dur.is_zero() && self.samples.len() > 1))
                {
                    self.samples.pop_front();
                }
            }
        }
    }

    /// True when a count window has reached capacity.
    pub fn is_full(&self) -> bool {
        matches!(self.kind, WindowKind::Count(n) if self.samples.len() == n)
    }

    pub fn observed(&self) -> u64 {
        match self.kind {
            WindowKind::Cumulative => self.acc.count + self.acc.null_count,
            _ => self.samples.len() as u64,
        }
    }

    pub fn null_count(&self) -> u64 {
        match self.kind {
            WindowKind::Cumulative => self.acc.null_count,
            _ => self.samples.iter().filter(|s| s.value.is_none()).count() as u64,
        }
    }

    /// Non-null values in arrival order (windowed modes only).
    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().filter_map(|s| s.value).collect()
    }

    pub fn acc(&self) -> &Accum {
        &self.acc
    }

    pub fn acc_mut(&mut self) -> &mut Accum {
        &mut self.acc
    }

    pub fn approx_bytes(&self) -> usize {
        self.samples.len() * std::mem::size_of::<Sample>() + std::mem::size_of::<Accum>()
    }
}

// ---------------------------------------------------------------------------
// Accum — Welford-style O(1) accumulators
// ---------------------------------------------------------------------------

/// Incremental accumulators maintained on every insertion. They are the
/// only state available for cumulative aggregates; windowed modes recompute
/// snapshot functions from live samples on flush instead.
#[derive(Debug, Default)]
pub(crate) struct Accum {
    pub count: u64,
    pub null_count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    m2: f64,
    pub first: Option<f64>,
    pub last: Option<f64>,
    prev: Option<f64>,
    diff_count: u64,
    diff_mean: f64,
    diff_m2: f64,
    pub above: u64,
    pub below: u64,
    pub in_range: u64,
    pub outliers: u64,
}

impl Accum {
    fn update(&mut self, value: Option<f64>, outlier_k: f64) {
        let Some(v) = value else {
            self.null_count += 1;
            return;
        };

        // Outlier check against the running stats *before* this value joins
        // them (needs at least two prior samples for a meaningful stddev).
        if self.count >= 2 {
            let sd = self.stddev().unwrap_or(0.0);
            if sd > 0.0 && (v - self.mean).abs() > outlier_k * sd {
                self.outliers += 1;
            }
        }

        self.count += 1;
        self.sum += v;
        if self.count == 1 {
            self.min = v;
            self.max = v;
            self.first = Some(v);
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.last = Some(v);

        // Welford
        let delta = v - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (v - self.mean);

        if let Some(prev) = self.prev {
            let diff = v - prev;
            self.diff_count += 1;
            let d = diff - self.diff_mean;
            self.diff_mean += d / self.diff_count as f64;
            self.diff_m2 += d * (diff - self.diff_mean);
        }
        self.prev = Some(v);
    }

    /// Threshold counters are fed separately since bounds live in the
    /// action parameters.
    pub fn update_thresholds(&mut self, v: f64, lower: Option<f64>, upper: Option<f64>) {
        if let Some(hi) = upper
            && v > hi
        {
            self.above += 1;
        }
        if let Some(lo) = lower
            && v < lo
        {
            self.below += 1;
        }
        if let (Some(lo), Some(hi)) = (lower, upper)
            && (lo..=hi).contains(&v)
        {
            self.in_range += 1;
        }
    }

    /// Population variance.
    pub fn variance(&self) -> Option<f64> {
        (self.count > 0).then(|| self.m2 / self.count as f64)
    }

    pub fn stddev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    /// Stddev of adjacent differences.
    pub fn volatility(&self) -> Option<f64> {
        (self.diff_count > 0).then(|| (self.diff_m2 / self.diff_count as f64).sqrt())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_window_is_a_sliding_ring() {
        let mut w = WindowData::new(WindowKind::Count(3));
        for (i, v) in [10.0, 20.0, 30.0, 40.0].iter().enumerate() {
            w.insert(Some(*v), i as i64, 2.0);
        }
        assert_eq!(w.values(), vec![20.0, 30.0, 40.0]);
        assert!(w.is_full());
    }

    #[test]
    fn time_window_trims_by_timestamp() {
        let sec = 1_000_000_000i64;
        let mut w = WindowData::new(WindowKind::Time(Duration::from_secs(10)));
        w.insert(Some(1.0), 0, 2.0);
        w.insert(Some(2.0), 5 * sec, 2.0);
        w.insert(Some(3.0), 12 * sec, 2.0);
        // the t=0 sample fell out of the 10 s window
        assert_eq!(w.values(), vec![2.0, 3.0]);
    }

    #[test]
    fn zero_time_window_keeps_last_reading_only() {
        let mut w = WindowData::new(WindowKind::Time(Duration::ZERO));
        w.insert(Some(1.0), 0, 2.0);
        w.insert(Some(2.0), 1, 2.0);
        assert_eq!(w.values(), vec![2.0]);
    }

    #[test]
    fn cumulative_accumulators_track_welford() {
        let mut w = WindowData::new(WindowKind::Cumulative);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            w.insert(Some(v), 0, 2.0);
        }
        let acc = w.acc();
        assert_eq!(acc.count, 8);
        assert_eq!(acc.mean, 5.0);
        assert_eq!(acc.stddev(), Some(2.0));
        assert_eq!(acc.first, Some(2.0));
        assert_eq!(acc.last, Some(9.0));
        assert_eq!(acc.min, 2.0);
        assert_eq!(acc.max, 9.0);
    }

    #[test]
    fn nulls_count_separately() {
        let mut w = WindowData::new(WindowKind::Count(5));
        w.insert(Some(1.0), 0, 2.0);
        w.insert(None, 1, 2.0);
        w.insert(Some(3.0), 2, 2.0);
        assert_eq!(w.observed(), 3);
        assert_eq!(w.null_count(), 1);
        assert_eq!(w.values(), vec![1.0, 3.0]);
    }
}
