//! Observability metrics: ingest outcomes, orphans, query latency.

use std::time::Duration;

/// Collects runtime metrics for the retrieval pipeline.
#[derive(Debug)]
pub struct MetricsCollector {
    query_latencies_us: Vec<f64>,
    total_queries: u64,
    total_inserts: u64,
    failed_inserts: u64,
    orphans_tombstoned: u64,
    dangling_references: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            query_latencies_us: Vec::new(),
            total_queries: 0,
            total_inserts: 0,
            failed_inserts: 0,
            orphans_tombstoned: 0,
            dangling_references: 0,
        }
    }

    /// Record a query with its duration.
    pub fn record_query(&mut self, duration: Duration) {
        self.total_queries += 1;
        self.query_latencies_us.push(duration.as_micros() as f64);
    }

    /// Record an item that was indexed and correlated.
    pub fn record_insert(&mut self) {
        self.total_inserts += 1;
    }

    /// Record an item that failed to ingest.
    pub fn record_failed_insert(&mut self) {
        self.failed_inserts += 1;
    }

    pub fn record_orphan(&mut self) {
        self.orphans_tombstoned += 1;
    }

    pub fn record_dangling(&mut self, count: u64) {
        self.dangling_references += count;
    }

    pub fn total_queries(&self) -> u64 {
        self.total_queries
    }

    pub fn total_inserts(&self) -> u64 {
        self.total_inserts
    }

    pub fn failed_inserts(&self) -> u64 {
        self.failed_inserts
    }

    pub fn orphans_tombstoned(&self) -> u64 {
        self.orphans_tombstoned
    }

    pub fn dangling_references(&self) -> u64 {
        self.dangling_references
    }

    /// Average query latency in microseconds.
    pub fn avg_query_latency_us(&self) -> f64 {
        if self.query_latencies_us.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.query_latencies_us.iter().sum();
        sum / self.query_latencies_us.len() as f64
    }

    /// Get a percentile of query latency (e.g., 50.0, 95.0, 99.0).
    pub fn percentile_query_latency_us(&self, percentile: f64) -> f64 {
        if self.query_latencies_us.is_empty() {
            return 0.0;
        }

        let mut sorted = self.query_latencies_us.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let index = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[index.min(sorted.len() - 1)]
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
