//! Periodic throughput statistics for the digest server.
//!
//! Each sweep harvests (and resets) the throughput counter of every live
//! connection, evicts dead connections from the registry, and reports the
//! sum, mean and population standard deviation of the samples.

use crate::runtime::connection::ConnectionRegistry;
use chrono::Local;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Timestamp format used by periodic report lines.
pub const REPORT_TIME_FORMAT: &str = "%Y.%m.%d at %H:%M:%S";

/// Aggregate of one sweep's throughput samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSummary {
    /// Total responses across all live connections.
    pub total: u64,
    /// Number of live connections sampled.
    pub connections: usize,
    pub mean: f64,
    /// Population standard deviation.
    pub stddev: f64,
}

impl ThroughputSummary {
    /// Summarize a sample set. An empty set yields all zeros.
    pub fn from_samples(samples: &[u64]) -> Self {
        let connections = samples.len();
        let total: u64 = samples.iter().sum();

        if connections == 0 {
            return Self {
                total,
                connections,
                mean: 0.0,
                stddev: 0.0,
            };
        }

        let n = connections as f64;
        let mean = total as f64 / n;
        let variance = samples
            .iter()
            .map(|&x| {
                let d = x as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;

        Self {
            total,
            connections,
            mean,
            stddev: variance.sqrt(),
        }
    }
}

/// Sweeps the connection registry on a fixed interval.
pub struct StatsCollector {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
}

impl StatsCollector {
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Harvest live counters and evict dead connections.
    pub fn sweep(&self) -> ThroughputSummary {
        let mut samples = Vec::new();
        let evicted = self
            .registry
            .sweep(|conn| samples.push(conn.take_throughput()));

        if evicted > 0 {
            debug!(evicted, "Evicted dead connections");
        }
        ThroughputSummary::from_samples(&samples)
    }

    /// Run one sweep and log the report line.
    pub fn report(&self) -> ThroughputSummary {
        let summary = self.sweep();
        info!(
            total = summary.total,
            connections = summary.connections,
            "[{}] Server Throughput: {} messages, Active Client Connections: {}, \
             Mean Throughput: {:.2} messages, StdDev. Throughput: {:.2} messages",
            Local::now().format(REPORT_TIME_FORMAT),
            summary.total,
            summary.connections,
            summary.mean,
            summary.stddev,
        );
        summary
    }

    /// Report every interval on a dedicated thread until `shutdown` receives
    /// a message or its sender is dropped.
    pub fn spawn(self, shutdown: Receiver<()>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("stats".to_string())
            .spawn(move || loop {
                match shutdown.recv_timeout(self.interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        self.report();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        debug!("Stats collector stopped");
                        break;
                    }
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::connection::tests::loopback_connection;
    use crossbeam::channel;

    #[test]
    fn test_summary_known_values() {
        let summary = ThroughputSummary::from_samples(&[2, 4, 4, 4, 5, 5, 7, 9]);
        assert_eq!(summary.total, 40);
        assert_eq!(summary.connections, 8);
        assert!((summary.mean - 5.0).abs() < 1e-9);
        assert!((summary.stddev - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_empty() {
        let summary = ThroughputSummary::from_samples(&[]);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.connections, 0);
        assert_eq!(summary.mean, 0.0);
        assert_eq!(summary.stddev, 0.0);
    }

    #[test]
    fn test_summary_zero_variance() {
        let summary = ThroughputSummary::from_samples(&[3, 3, 3]);
        assert_eq!(summary.mean, 3.0);
        assert_eq!(summary.stddev, 0.0);
    }

    #[test]
    fn test_sweep_excludes_and_evicts_dead() {
        let registry = Arc::new(ConnectionRegistry::new(16));
        let (live, _p1) = loopback_connection(1);
        let (dead, _p2) = loopback_connection(2);
        let live = Arc::new(live);
        let dead = Arc::new(dead);
        registry.insert(Arc::clone(&live));
        registry.insert(Arc::clone(&dead));

        for _ in 0..3 {
            live.record_response();
        }
        dead.record_response();
        dead.mark_dead();

        let collector = StatsCollector::new(Arc::clone(&registry), Duration::from_secs(20));
        let summary = collector.report();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.connections, 1);
        assert_eq!(registry.len(), 1);

        // Counters were reset by the previous sweep.
        let summary = collector.sweep();
        assert_eq!(summary.total, 0);
        assert_eq!(summary.connections, 1);
    }

    #[test]
    fn test_spawned_collector_stops_on_shutdown() {
        let registry = Arc::new(ConnectionRegistry::new(4));
        let collector = StatsCollector::new(registry, Duration::from_millis(10));
        let (tx, rx) = channel::bounded(1);
        let handle = collector.spawn(rx).unwrap();

        thread::sleep(Duration::from_millis(50));
        tx.send(()).unwrap();
        handle.join().unwrap();
    }
}
