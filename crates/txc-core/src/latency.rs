//! Histogram of connector round-trip times.
//!
//! Used by the benchmark tooling to measure how long `SendCommand` blocks and
//! how far apart the resulting callback messages arrive. Samples are bucketed
//! into fixed-width bins; anything past the last bin is counted there while
//! `max` keeps the exact value.

use std::time::Duration;

/// Summary of the recorded samples, all in microseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStats {
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    pub std_dev_us: f64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
}

impl std::fmt::Display for LatencyStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "n={} min={}µs max={}µs mean={:.2}µs std={:.2}µs p50={}µs p90={}µs p99={}µs",
            self.count,
            self.min_us,
            self.max_us,
            self.mean_us,
            self.std_dev_us,
            self.p50_us,
            self.p90_us,
            self.p99_us,
        )
    }
}

/// Round-trip latency histogram.
///
/// Not thread-safe; the benchmark keeps one per measured quantity.
pub struct LatencyHistogram {
    bin_width_us: u64,
    bins: Vec<u64>,
    count: u64,
    sum: u128,
    sum_sq: u128,
    min: u64,
    max: u64,
}

impl LatencyHistogram {
    /// `bin_width_us` wide bins covering `0..bin_width_us * bins` µs.
    pub fn new(bin_width_us: u64, bins: usize) -> Self {
        Self {
            bin_width_us: bin_width_us.max(1),
            bins: vec![0; bins.max(1)],
            count: 0,
            sum: 0,
            sum_sq: 0,
            min: u64::MAX,
            max: 0,
        }
    }

    #[inline]
    pub fn record(&mut self, sample: Duration) {
        self.record_us(sample.as_micros().min(u64::MAX as u128) as u64);
    }

    #[inline]
    pub fn record_us(&mut self, us: u64) {
        self.count += 1;
        self.sum += us as u128;
        self.sum_sq += (us as u128) * (us as u128);
        self.min = self.min.min(us);
        self.max = self.max.max(us);

        let last = self.bins.len() - 1;
        let bin = ((us / self.bin_width_us) as usize).min(last);
        self.bins[bin] += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// `None` until something was recorded.
    pub fn stats(&self) -> Option<LatencyStats> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        let mean = self.sum as f64 / n;
        // sample variance; a single sample has none
        let var = if self.count > 1 {
            ((self.sum_sq as f64) - n * mean * mean).max(0.0) / (n - 1.0)
        } else {
            0.0
        };

        Some(LatencyStats {
            count: self.count,
            min_us: self.min,
            max_us: self.max,
            mean_us: mean,
            std_dev_us: var.sqrt(),
            p50_us: self.percentile(0.50),
            p90_us: self.percentile(0.90),
            p99_us: self.percentile(0.99),
        })
    }

    pub fn reset(&mut self) {
        self.bins.fill(0);
        self.count = 0;
        self.sum = 0;
        self.sum_sq = 0;
        self.min = u64::MAX;
        self.max = 0;
    }

    fn percentile(&self, pct: f64) -> u64 {
        let target = ((self.count as f64 * pct).ceil() as u64).max(1);
        let last = self.bins.len() - 1;
        let mut cumulative = 0u64;
        for (i, &c) in self.bins.iter().enumerate() {
            cumulative += c;
            if cumulative >= target {
                return if i == last {
                    self.max
                } else {
                    i as u64 * self.bin_width_us
                };
            }
        }
        self.max
    }
}

impl Default for LatencyHistogram {
    /// 1µs bins up to 10ms.
    fn default() -> Self {
        Self::new(1, 10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_has_no_stats() {
        assert!(LatencyHistogram::default().stats().is_none());
    }

    #[test]
    fn mean_and_spread() {
        let mut h = LatencyHistogram::default();
        for us in [10, 20, 30] {
            h.record_us(us);
        }
        let s = h.stats().unwrap();
        assert_eq!(s.count, 3);
        assert_eq!((s.min_us, s.max_us), (10, 30));
        assert!((s.mean_us - 20.0).abs() < 1e-9);
        assert!((s.std_dev_us - 10.0).abs() < 1e-9);
        assert_eq!(s.p50_us, 20);
    }

    #[test]
    fn overflow_bin_reports_exact_max() {
        let mut h = LatencyHistogram::new(10, 100);
        h.record(Duration::from_millis(50));
        let s = h.stats().unwrap();
        assert_eq!(s.max_us, 50_000);
        assert_eq!(s.p99_us, 50_000);
        assert_eq!(s.std_dev_us, 0.0);
    }

    #[test]
    fn reset_clears() {
        let mut h = LatencyHistogram::default();
        h.record_us(5);
        h.reset();
        assert_eq!(h.count(), 0);
        assert!(h.stats().is_none());
    }
}
