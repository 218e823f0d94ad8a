// Metrics collection module for the Swarm node
//
// Each protocol owns a set of atomic counters. Snapshots are plain
// serializable structs so the devnet can print them as JSON.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Add one
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n`
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Latency histogram bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyBucket {
    /// Minimum latency in microseconds
    pub min_us: u64,

    /// Maximum latency in microseconds
    pub max_us: u64,

    /// Count of operations in this bucket
    pub count: u64,
}

/// Latency histogram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyHistogram {
    /// Buckets
    pub buckets: Vec<LatencyBucket>,

    /// Minimum latency seen in microseconds
    pub min_latency_us: u64,

    /// Maximum latency seen in microseconds
    pub max_latency_us: u64,

    /// Total count
    pub total_count: u64,

    /// Sum of all latencies in microseconds
    pub latency_sum_us: u64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    /// Create a histogram with decade buckets from 100us to 10s
    pub fn new() -> Self {
        let bounds = [0, 100, 1_000, 10_000, 100_000, 1_000_000, 10_000_000, u64::MAX];
        let buckets = bounds
            .windows(2)
            .map(|w| LatencyBucket {
                min_us: w[0],
                max_us: w[1],
                count: 0,
            })
            .collect();

        Self {
            buckets,
            min_latency_us: u64::MAX,
            max_latency_us: 0,
            total_count: 0,
            latency_sum_us: 0,
        }
    }

    /// Add a latency measurement to the histogram
    pub fn add_latency(&mut self, latency: Duration) {
        let latency_us = latency.as_micros().min(u64::MAX as u128) as u64;
        self.min_latency_us = self.min_latency_us.min(latency_us);
        self.max_latency_us = self.max_latency_us.max(latency_us);
        self.total_count += 1;
        self.latency_sum_us = self.latency_sum_us.saturating_add(latency_us);

        if let Some(bucket) = self
            .buckets
            .iter_mut()
            .find(|b| latency_us >= b.min_us && latency_us < b.max_us)
        {
            bucket.count += 1;
        }
    }

    /// Get average latency in microseconds
    pub fn average_latency_us(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.latency_sum_us as f64 / self.total_count as f64
        }
    }

    /// Percentile latency, approximated as the midpoint of its bucket
    pub fn percentile_latency_us(&self, percentile: f64) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }

        let target = (self.total_count as f64 * percentile / 100.0).round() as u64;
        let mut count_sum = 0;
        for bucket in &self.buckets {
            count_sum += bucket.count;
            if count_sum >= target {
                return (bucket.min_us as f64 + bucket.max_us.min(self.max_latency_us) as f64) / 2.0;
            }
        }
        self.max_latency_us as f64
    }
}

/// Accounting counters
#[derive(Debug, Default)]
pub struct AccountingMetrics {
    pub reserves: Counter,
    pub overdrafts: Counter,
    pub credits: Counter,
    pub credited_amount: Counter,
    pub debits: Counter,
    pub debited_amount: Counter,
    /// Peers blocklisted for crossing their payment threshold
    pub threshold_blocklists: Counter,
    /// Peers disconnected for exceeding the disconnect threshold
    pub debt_disconnects: Counter,
    /// Debt dropped above the disconnect threshold
    pub ghost_amount: Counter,
    pub settlements_dispatched: Counter,
    pub settlement_failures: Counter,
    pub payments_received: Counter,
    pub refreshments_received: Counter,
    pub refreshments_sent: Counter,
}

/// Snapshot of the accounting counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingMetricsSnapshot {
    pub reserves: u64,
    pub overdrafts: u64,
    pub credits: u64,
    pub credited_amount: u64,
    pub debits: u64,
    pub debited_amount: u64,
    pub threshold_blocklists: u64,
    pub debt_disconnects: u64,
    pub ghost_amount: u64,
    pub settlements_dispatched: u64,
    pub settlement_failures: u64,
    pub payments_received: u64,
    pub refreshments_received: u64,
    pub refreshments_sent: u64,
}

impl AccountingMetrics {
    pub fn snapshot(&self) -> AccountingMetricsSnapshot {
        AccountingMetricsSnapshot {
            reserves: self.reserves.get(),
            overdrafts: self.overdrafts.get(),
            credits: self.credits.get(),
            credited_amount: self.credited_amount.get(),
            debits: self.debits.get(),
            debited_amount: self.debited_amount.get(),
            threshold_blocklists: self.threshold_blocklists.get(),
            debt_disconnects: self.debt_disconnects.get(),
            ghost_amount: self.ghost_amount.get(),
            settlements_dispatched: self.settlements_dispatched.get(),
            settlement_failures: self.settlement_failures.get(),
            payments_received: self.payments_received.get(),
            refreshments_received: self.refreshments_received.get(),
            refreshments_sent: self.refreshments_sent.get(),
        }
    }
}

/// Pushsync counters
#[derive(Debug, Default)]
pub struct PushSyncMetrics {
    /// Chunks pushed by this node as origin or forwarder
    pub total_sent: Counter,
    /// Deliveries accepted by the handler
    pub total_received: Counter,
    /// Receipts produced by this node as storer
    pub total_stored: Counter,
    /// Replicas pushed to neighbourhood peers
    pub total_replicated: Counter,
    pub want_self: Counter,
    pub shallow_receipts: Counter,
    pub invalid_receipts: Counter,
    pub overdraft_skips: Counter,
    pub stream_errors: Counter,
    pub timeouts: Counter,
    pub handler_errors: Counter,
    pub latency: Mutex<LatencyHistogram>,
}

/// Snapshot of the pushsync counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushSyncMetricsSnapshot {
    pub total_sent: u64,
    pub total_received: u64,
    pub total_stored: u64,
    pub total_replicated: u64,
    pub want_self: u64,
    pub shallow_receipts: u64,
    pub invalid_receipts: u64,
    pub overdraft_skips: u64,
    pub stream_errors: u64,
    pub timeouts: u64,
    pub handler_errors: u64,
    pub average_latency_us: f64,
}

impl PushSyncMetrics {
    pub fn snapshot(&self) -> PushSyncMetricsSnapshot {
        PushSyncMetricsSnapshot {
            total_sent: self.total_sent.get(),
            total_received: self.total_received.get(),
            total_stored: self.total_stored.get(),
            total_replicated: self.total_replicated.get(),
            want_self: self.want_self.get(),
            shallow_receipts: self.shallow_receipts.get(),
            invalid_receipts: self.invalid_receipts.get(),
            overdraft_skips: self.overdraft_skips.get(),
            stream_errors: self.stream_errors.get(),
            timeouts: self.timeouts.get(),
            handler_errors: self.handler_errors.get(),
            average_latency_us: self.latency.lock().average_latency_us(),
        }
    }
}

/// Retrieval counters
#[derive(Debug, Default)]
pub struct RetrievalMetrics {
    pub requests: Counter,
    pub local_hits: Counter,
    pub peer_attempts: Counter,
    pub deliveries: Counter,
    pub invalid_deliveries: Counter,
    pub timeouts: Counter,
    pub overdraft_skips: Counter,
    pub not_found: Counter,
    /// Chunks served to requesting peers
    pub served: Counter,
    pub latency: Mutex<LatencyHistogram>,
}

/// Snapshot of the retrieval counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalMetricsSnapshot {
    pub requests: u64,
    pub local_hits: u64,
    pub peer_attempts: u64,
    pub deliveries: u64,
    pub invalid_deliveries: u64,
    pub timeouts: u64,
    pub overdraft_skips: u64,
    pub not_found: u64,
    pub served: u64,
    pub average_latency_us: f64,
    pub p99_latency_us: f64,
}

impl RetrievalMetrics {
    pub fn snapshot(&self) -> RetrievalMetricsSnapshot {
        let latency = self.latency.lock();
        RetrievalMetricsSnapshot {
            requests: self.requests.get(),
            local_hits: self.local_hits.get(),
            peer_attempts: self.peer_attempts.get(),
            deliveries: self.deliveries.get(),
            invalid_deliveries: self.invalid_deliveries.get(),
            timeouts: self.timeouts.get(),
            overdraft_skips: self.overdraft_skips.get(),
            not_found: self.not_found.get(),
            served: self.served.get(),
            average_latency_us: latency.average_latency_us(),
            p99_latency_us: latency.percentile_latency_us(99.0),
        }
    }
}

/// Pusher counters
#[derive(Debug, Default)]
pub struct PusherMetrics {
    pub attempts: Counter,
    pub synced: Counter,
    pub retries: Counter,
    pub abandoned: Counter,
    pub invalid: Counter,
    pub errors: Counter,
}

/// Snapshot of the pusher counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PusherMetricsSnapshot {
    pub attempts: u64,
    pub synced: u64,
    pub retries: u64,
    pub abandoned: u64,
    pub invalid: u64,
    pub errors: u64,
}

impl PusherMetrics {
    pub fn snapshot(&self) -> PusherMetricsSnapshot {
        PusherMetricsSnapshot {
            attempts: self.attempts.get(),
            synced: self.synced.get(),
            retries: self.retries.get(),
            abandoned: self.abandoned.get(),
            invalid: self.invalid.get(),
            errors: self.errors.get(),
        }
    }
}

/// All counters of one node
#[derive(Debug, Default, Clone)]
pub struct NodeMetrics {
    pub accounting: Arc<AccountingMetrics>,
    pub pushsync: Arc<PushSyncMetrics>,
    pub retrieval: Arc<RetrievalMetrics>,
    pub pusher: Arc<PusherMetrics>,
}

/// Snapshot of all counters of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetricsSnapshot {
    pub accounting: AccountingMetricsSnapshot,
    pub pushsync: PushSyncMetricsSnapshot,
    pub retrieval: RetrievalMetricsSnapshot,
    pub pusher: PusherMetricsSnapshot,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> NodeMetricsSnapshot {
        NodeMetricsSnapshot {
            accounting: self.accounting.snapshot(),
            pushsync: self.pushsync.snapshot(),
            retrieval: self.retrieval.snapshot(),
            pusher: self.pusher.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_histogram() {
        let mut histogram = LatencyHistogram::new();
        assert_eq!(histogram.average_latency_us(), 0.0);

        histogram.add_latency(Duration::from_micros(50));
        histogram.add_latency(Duration::from_micros(150));
        histogram.add_latency(Duration::from_millis(20));

        assert_eq!(histogram.total_count, 3);
        assert_eq!(histogram.min_latency_us, 50);
        assert_eq!(histogram.max_latency_us, 20_000);
        assert_eq!(histogram.buckets[0].count, 1);
        assert_eq!(histogram.buckets[1].count, 1);
        assert_eq!(histogram.buckets[3].count, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = NodeMetrics::new();
        metrics.pushsync.total_sent.inc();
        metrics.accounting.credited_amount.add(110);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pushsync.total_sent, 1);
        assert_eq!(snapshot.accounting.credited_amount, 110);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"credited_amount\":110"));
    }
}
