use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod encoders;

use encoders::create_encoder;
use encoders::Point;

pub const MEASUREMENT: &str = "tf_cpu_manager";

/// Counters and gauges of the CPU manager, shared by `Arc` between the
/// manager and the reporter.
#[derive(Debug, Default)]
pub struct ManagerMetrics {
    allocation_attempts: AtomicU64,
    allocation_failures: AtomicU64,
    reconcile_successes: AtomicU64,
    reconcile_failures: AtomicU64,
    stale_containers_removed: AtomicU64,
    queue_requeues: AtomicU64,
    exclusive_cpus: AtomicU64,
    shared_cpus: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub allocation_attempts: u64,
    pub allocation_failures: u64,
    pub reconcile_successes: u64,
    pub reconcile_failures: u64,
    pub stale_containers_removed: u64,
    pub queue_requeues: u64,
    pub exclusive_cpus: u64,
    pub shared_cpus: u64,
}

impl ManagerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_allocation(&self, ok: bool) {
        self.allocation_attempts.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.allocation_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_reconcile(&self, successes: usize, failures: usize) {
        self.reconcile_successes
            .fetch_add(successes as u64, Ordering::Relaxed);
        self.reconcile_failures
            .fetch_add(failures as u64, Ordering::Relaxed);
    }

    pub fn record_stale_removed(&self, count: usize) {
        self.stale_containers_removed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_requeue(&self) {
        self.queue_requeues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_cpu_pools(&self, exclusive: usize, shared: usize) {
        self.exclusive_cpus.store(exclusive as u64, Ordering::Relaxed);
        self.shared_cpus.store(shared as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocation_attempts: self.allocation_attempts.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            reconcile_successes: self.reconcile_successes.load(Ordering::Relaxed),
            reconcile_failures: self.reconcile_failures.load(Ordering::Relaxed),
            stale_containers_removed: self.stale_containers_removed.load(Ordering::Relaxed),
            queue_requeues: self.queue_requeues.load(Ordering::Relaxed),
            exclusive_cpus: self.exclusive_cpus.load(Ordering::Relaxed),
            shared_cpus: self.shared_cpus.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    pub fn to_point(&self, node_name: &str, timestamp: i64) -> Point {
        Point::new(MEASUREMENT, timestamp)
            .tag("node", node_name)
            .field("allocation_attempts", self.allocation_attempts)
            .field("allocation_failures", self.allocation_failures)
            .field("reconcile_successes", self.reconcile_successes)
            .field("reconcile_failures", self.reconcile_failures)
            .field("stale_containers_removed", self.stale_containers_removed)
            .field("queue_requeues", self.queue_requeues)
            .field("exclusive_cpus", self.exclusive_cpus)
            .field("shared_cpus", self.shared_cpus)
    }
}

/// Periodically writes a metrics line through the `metrics` tracing target.
pub async fn run_metrics(
    metrics: Arc<ManagerMetrics>,
    node_name: String,
    interval: Duration,
    metrics_format: String,
    cancellation_token: CancellationToken,
) {
    let encoder = create_encoder(&metrics_format);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                info!("Metrics reporter shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                let line = encoder.encode(&metrics.snapshot().to_point(&node_name, current_time()));
                tracing::info!(target: "metrics", msg = %line.trim_end());
            }
        }
    }
}

/// Milliseconds since the epoch.
pub fn current_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::metrics::encoders::influx::InfluxEncoder;
    use crate::metrics::encoders::MetricsEncoder;

    #[test]
    fn counters_accumulate() {
        let metrics = ManagerMetrics::new();
        metrics.record_allocation(true);
        metrics.record_allocation(false);
        metrics.record_reconcile(3, 1);
        metrics.record_reconcile(2, 0);
        metrics.record_stale_removed(2);
        metrics.record_requeue();
        metrics.set_cpu_pools(4, 12);

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                allocation_attempts: 2,
                allocation_failures: 1,
                reconcile_successes: 5,
                reconcile_failures: 1,
                stale_containers_removed: 2,
                queue_requeues: 1,
                exclusive_cpus: 4,
                shared_cpus: 12,
            }
        );
    }

    #[test]
    fn snapshot_encodes_with_node_tag() {
        let metrics = ManagerMetrics::new();
        metrics.set_cpu_pools(2, 6);
        let line = InfluxEncoder.encode(&metrics.snapshot().to_point("worker-1", 7));

        assert!(line.starts_with("tf_cpu_manager,node=worker-1 "), "{line}");
        assert!(line.contains("exclusive_cpus=2u"));
        assert!(line.contains("shared_cpus=6u"));
        assert!(line.ends_with(" 7\n"));
    }
}
