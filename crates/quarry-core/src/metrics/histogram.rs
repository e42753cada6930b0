//! Fixed-bucket latency histogram.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free histogram of microsecond durations.
///
/// Each observation lands in the first bucket whose upper boundary is not
/// below it; observations above the last boundary land in the last bucket.
pub struct Histogram {
    boundaries: Vec<u64>,
    counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Histogram with the given ascending upper boundaries.
    pub fn with_boundaries(mut boundaries: Vec<u64>) -> Self {
        boundaries.sort_unstable();
        boundaries.dedup();
        let counts = boundaries.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            boundaries,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Buckets suited to in-memory query phases: 10us up to 1s.
    pub fn latency() -> Self {
        Self::with_boundaries(vec![
            10, 50, 100, 500, 1_000, 5_000, 10_000, 50_000, 100_000, 1_000_000,
        ])
    }

    /// Record a value in microseconds.
    pub fn observe(&self, micros: u64) {
        self.sum.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.max.fetch_max(micros, Ordering::Relaxed);

        let bucket = self
            .boundaries
            .iter()
            .position(|boundary| micros <= *boundary)
            .unwrap_or(self.boundaries.len().saturating_sub(1));
        if let Some(count) = self.counts.get(bucket) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a duration.
    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_micros().min(u64::MAX as u128) as u64);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    pub fn avg(&self) -> u64 {
        match self.count() {
            0 => 0,
            count => self.sum() / count,
        }
    }

    /// Upper boundary of the bucket holding the `p` quantile (0.0 - 1.0).
    pub fn percentile(&self, p: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }
        let target = ((total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0;
        for (boundary, count) in self.boundaries.iter().zip(&self.counts) {
            cumulative += count.load(Ordering::Relaxed);
            if cumulative >= target {
                return *boundary;
            }
        }
        self.boundaries.last().copied().unwrap_or(0)
    }

    pub fn p50(&self) -> u64 {
        self.percentile(0.50)
    }

    pub fn p99(&self) -> u64 {
        self.percentile(0.99)
    }

    pub fn reset(&self) {
        self.sum.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
        for count in &self.counts {
            count.store(0, Ordering::Relaxed);
        }
    }

    /// `(boundary, count)` pairs of every bucket.
    pub fn snapshot(&self) -> Vec<(u64, u64)> {
        self.boundaries
            .iter()
            .zip(&self.counts)
            .map(|(boundary, count)| (*boundary, count.load(Ordering::Relaxed)))
            .collect()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::latency()
    }
}
