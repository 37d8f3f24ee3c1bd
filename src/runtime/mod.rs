//! Digest server runtime.
//!
//! Components:
//! - `Reactor`: single mio thread owning readiness detection and connection
//!   lifecycle
//! - `TaskPool`: fixed set of workers running digest-and-respond jobs
//! - `ConnectionRegistry`: arena of connections shared with the stats sweep
//! - `StatsCollector`: periodic throughput report and dead-connection eviction

mod connection;
mod pool;
mod reactor;
mod stats;
mod task;

pub use connection::ConnectionRegistry;
pub use reactor::Reactor;
#[cfg(test)]
pub use reactor::ReactorHandle;
pub use stats::{StatsCollector, REPORT_TIME_FORMAT};

use crate::config::ServerConfig;
use crossbeam::channel;
use std::io;
use std::sync::Arc;
use tracing::{info, warn};

/// Run the digest server until the reactor stops.
pub fn run(config: ServerConfig) -> io::Result<()> {
    let addr = config.socket_addr()?;
    let registry = Arc::new(ConnectionRegistry::new(config.max_connections));

    let reactor = Reactor::bind(addr, config.workers, Arc::clone(&registry))?;
    info!(
        addr = %reactor.local_addr()?,
        workers = config.workers,
        stats_interval_secs = config.stats_interval.as_secs(),
        "Server listening"
    );

    let (stop_stats, stats_stopped) = channel::bounded::<()>(1);
    let stats = StatsCollector::new(registry, config.stats_interval).spawn(stats_stopped)?;

    let result = reactor.run();

    drop(stop_stats);
    if stats.join().is_err() {
        warn!("Stats collector exited abnormally");
    }
    result
}
