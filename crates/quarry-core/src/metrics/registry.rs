//! Engine-wide query metrics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::histogram::Histogram;
use crate::error::ErrorKind;

/// Counters and latency histograms of a [`crate::QueryEngine`].
pub struct EngineMetrics {
    started_at: Instant,

    queries: AtomicU64,
    query_latency: Histogram,
    planning_latency: Histogram,
    queries_by_collection: RwLock<HashMap<String, u64>>,

    usage_failures: AtomicU64,
    internal_failures: AtomicU64,
    storage_failures: AtomicU64,

    plans_built: AtomicU64,
    empty_plans: AtomicU64,
    prefetches: AtomicU64,
    inconsistencies: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            queries: AtomicU64::new(0),
            query_latency: Histogram::latency(),
            planning_latency: Histogram::latency(),
            queries_by_collection: RwLock::new(HashMap::new()),
            usage_failures: AtomicU64::new(0),
            internal_failures: AtomicU64::new(0),
            storage_failures: AtomicU64::new(0),
            plans_built: AtomicU64::new(0),
            empty_plans: AtomicU64::new(0),
            prefetches: AtomicU64::new(0),
            inconsistencies: AtomicU64::new(0),
        }
    }

    /// Record a finished query.
    pub fn record_query(&self, collection: Option<&str>, elapsed: Duration) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.query_latency.observe_duration(elapsed);
        *self
            .queries_by_collection
            .write()
            .entry(collection.unwrap_or("*").to_string())
            .or_default() += 1;
    }

    /// Record a failed query.
    pub fn record_failure(&self, kind: ErrorKind) {
        let counter = match kind {
            ErrorKind::Usage => &self.usage_failures,
            ErrorKind::Storage => &self.storage_failures,
            ErrorKind::Internal | ErrorKind::SchemaValidation => &self.internal_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the planning phase of a query.
    pub fn record_planning(&self, plans: usize, elapsed: Duration) {
        self.plans_built.fetch_add(plans as u64, Ordering::Relaxed);
        self.planning_latency.observe_duration(elapsed);
    }

    /// Record a query answered without planning because its filter
    /// provably matches nothing.
    pub fn record_empty_plan(&self) {
        self.empty_plans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch(&self) {
        self.prefetches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record plans of one query disagreeing on the result.
    pub fn record_inconsistency(&self) {
        self.inconsistencies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn query_latency(&self) -> &Histogram {
        &self.query_latency
    }

    pub fn planning_latency(&self) -> &Histogram {
        &self.planning_latency
    }

    /// Query counts by collection, `*` for cross-collection queries.
    pub fn queries_by_collection(&self) -> HashMap<String, u64> {
        self.queries_by_collection.read().clone()
    }

    pub fn usage_failures(&self) -> u64 {
        self.usage_failures.load(Ordering::Relaxed)
    }

    pub fn internal_failures(&self) -> u64 {
        self.internal_failures.load(Ordering::Relaxed)
    }

    pub fn storage_failures(&self) -> u64 {
        self.storage_failures.load(Ordering::Relaxed)
    }

    pub fn plans_built(&self) -> u64 {
        self.plans_built.load(Ordering::Relaxed)
    }

    pub fn empty_plans(&self) -> u64 {
        self.empty_plans.load(Ordering::Relaxed)
    }

    pub fn prefetches(&self) -> u64 {
        self.prefetches.load(Ordering::Relaxed)
    }

    pub fn inconsistencies(&self) -> u64 {
        self.inconsistencies.load(Ordering::Relaxed)
    }

    /// Export in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let mut metric = |name: &str, kind: &str, help: &str, value: String| {
            out.push_str(&format!("# HELP quarry_{name} {help}\n"));
            out.push_str(&format!("# TYPE quarry_{name} {kind}\n"));
            out.push_str(&format!("quarry_{name} {value}\n\n"));
        };
        metric(
            "uptime_seconds",
            "gauge",
            "Engine uptime in seconds",
            self.uptime_secs().to_string(),
        );
        metric(
            "queries_total",
            "counter",
            "Queries executed",
            self.query_count().to_string(),
        );
        metric(
            "query_duration_us_p50",
            "gauge",
            "P50 query duration in microseconds",
            self.query_latency.p50().to_string(),
        );
        metric(
            "query_duration_us_p99",
            "gauge",
            "P99 query duration in microseconds",
            self.query_latency.p99().to_string(),
        );
        metric(
            "planning_duration_us_p99",
            "gauge",
            "P99 planning duration in microseconds",
            self.planning_latency.p99().to_string(),
        );
        metric(
            "query_failures_usage_total",
            "counter",
            "Queries rejected as invalid",
            self.usage_failures().to_string(),
        );
        metric(
            "query_failures_internal_total",
            "counter",
            "Queries failed on engine errors",
            self.internal_failures().to_string(),
        );
        metric(
            "plans_built_total",
            "counter",
            "Query plans built",
            self.plans_built().to_string(),
        );
        metric(
            "prefetches_total",
            "counter",
            "Plans executed with entity prefetch",
            self.prefetches().to_string(),
        );
        metric(
            "inconsistent_results_total",
            "counter",
            "Verification runs whose plans disagreed",
            self.inconsistencies().to_string(),
        );
        out
    }

    /// Reset every counter.
    pub fn reset(&self) {
        self.queries.store(0, Ordering::Relaxed);
        self.query_latency.reset();
        self.planning_latency.reset();
        self.queries_by_collection.write().clear();
        for counter in [
            &self.usage_failures,
            &self.internal_failures,
            &self.storage_failures,
            &self.plans_built,
            &self.empty_plans,
            &self.prefetches,
            &self.inconsistencies,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_counts_by_collection() {
        let metrics = EngineMetrics::new();
        metrics.record_query(Some("Product"), Duration::from_micros(800));
        metrics.record_query(Some("Product"), Duration::from_micros(200));
        metrics.record_query(None, Duration::from_micros(20));

        assert_eq!(metrics.query_count(), 3);
        assert_eq!(metrics.query_latency().avg(), 340);
        let by_collection = metrics.queries_by_collection();
        assert_eq!(by_collection.get("Product"), Some(&2));
        assert_eq!(by_collection.get("*"), Some(&1));
    }

    #[test]
    fn test_failures_by_kind() {
        let metrics = EngineMetrics::new();
        metrics.record_failure(ErrorKind::Usage);
        metrics.record_failure(ErrorKind::Usage);
        metrics.record_failure(ErrorKind::Internal);
        assert_eq!(metrics.usage_failures(), 2);
        assert_eq!(metrics.internal_failures(), 1);
        assert_eq!(metrics.storage_failures(), 0);
    }

    #[test]
    fn test_prometheus_and_reset() {
        let metrics = EngineMetrics::new();
        metrics.record_query(Some("Brand"), Duration::from_micros(5));
        metrics.record_inconsistency();

        let text = metrics.to_prometheus();
        assert!(text.contains("quarry_queries_total 1"));
        assert!(text.contains("quarry_inconsistent_results_total 1"));
        assert!(text.contains("# TYPE quarry_queries_total counter"));

        metrics.reset();
        assert_eq!(metrics.query_count(), 0);
        assert_eq!(metrics.inconsistencies(), 0);
        assert!(metrics.queries_by_collection().is_empty());
    }
}
