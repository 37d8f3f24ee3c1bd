//! Per-connection state and the registry arena shared with the stats sweep.
//!
//! A [`Connection`] is created by the reactor on accept and shared (via
//! `Arc`) with whichever worker currently owns its response cycle. Its
//! flags are atomics so the reactor, one worker and the stats sweep can each
//! touch it without a registry-wide lock.
//!
//! Dead connections stay in the [`ConnectionRegistry`] until the next sweep;
//! removal never happens on the dispatch path.

use mio::net::TcpStream;
use parking_lot::Mutex;
use slab::Slab;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A single accepted client connection.
#[derive(Debug)]
pub struct Connection {
    /// Process-unique identifier assigned by the reactor.
    id: u64,
    /// Remote address captured at accept time (empty when unavailable).
    peer: String,
    stream: TcpStream,
    /// Set while a worker owns this connection's response cycle.
    in_flight: AtomicBool,
    /// Set once any I/O on this connection fails. Never cleared.
    dead: AtomicBool,
    /// Completed response cycles since the last sweep.
    throughput: AtomicU64,
}

impl Connection {
    pub fn new(id: u64, peer: String, stream: TcpStream) -> Self {
        Self {
            id,
            peer,
            stream,
            in_flight: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            throughput: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Claim the response cycle.
    ///
    /// Returns `false` if a cycle is already in flight or the connection is
    /// dead; the caller must not dispatch work in that case.
    pub fn try_begin_cycle(&self) -> bool {
        if self.is_dead() {
            return false;
        }
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the response cycle claimed by [`try_begin_cycle`](Self::try_begin_cycle).
    pub fn end_cycle(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Permanently retire the connection.
    ///
    /// Returns `true` for the caller that performed the transition.
    pub fn mark_dead(&self) -> bool {
        !self.dead.swap(true, Ordering::AcqRel)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Record one completed response cycle.
    pub fn record_response(&self) {
        self.throughput.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the throughput counter and reset it to zero.
    pub fn take_throughput(&self) -> u64 {
        self.throughput.swap(0, Ordering::Relaxed)
    }
}

/// Arena of accepted connections.
///
/// The reactor inserts on accept; the stats sweep harvests live connections
/// and evicts dead ones. Both go through the same lock, which is held only
/// for the insert or the sweep itself.
///
/// Dead entries linger until the next sweep, so `len` is not the number of
/// live connections. The reactor enforces [`capacity`](Self::capacity)
/// against its own live sessions.
pub struct ConnectionRegistry {
    connections: Mutex<Slab<Arc<Connection>>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(Slab::new()),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    pub fn insert(&self, conn: Arc<Connection>) -> usize {
        self.connections.lock().insert(conn)
    }

    /// Number of registered connections, dead ones included until swept.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Maximum number of simultaneous live connections.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Visit every live connection and evict every dead one, under a single
    /// acquisition of the registry lock.
    ///
    /// Returns the number of connections evicted.
    pub fn sweep<F>(&self, mut visit_live: F) -> usize
    where
        F: FnMut(&Connection),
    {
        let mut connections = self.connections.lock();
        let mut dead = Vec::new();

        for (key, conn) in connections.iter() {
            if conn.is_dead() {
                dead.push(key);
            } else {
                visit_live(conn.as_ref());
            }
        }

        for key in &dead {
            connections.remove(*key);
        }
        dead.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::TcpListener as StdListener;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    /// Build a connection over a loopback socket pair.
    ///
    /// The returned std stream is the peer end and must be kept alive for as
    /// long as the connection is expected to be healthy.
    pub(crate) fn loopback_connection(id: u64) -> (Connection, std::net::TcpStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, addr) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let conn = Connection::new(id, addr.to_string(), TcpStream::from_std(accepted));
        (conn, peer)
    }

    #[test]
    fn test_cycle_guard_transitions() {
        let (conn, _peer) = loopback_connection(7);
        assert_eq!(conn.id(), 7);
        assert!(!conn.peer().is_empty());

        assert!(conn.try_begin_cycle());
        assert!(conn.is_in_flight());
        assert!(!conn.try_begin_cycle());

        conn.end_cycle();
        assert!(!conn.is_in_flight());
        assert!(conn.try_begin_cycle());
        conn.end_cycle();
    }

    #[test]
    fn test_dead_connection_never_begins_cycle() {
        let (conn, _peer) = loopback_connection(1);
        assert!(conn.mark_dead());
        assert!(!conn.mark_dead());
        assert!(conn.is_dead());
        assert!(!conn.try_begin_cycle());
    }

    #[test]
    fn test_in_flight_exclusivity_under_contention() {
        let (conn, _peer) = loopback_connection(1);
        let conn = Arc::new(conn);
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let conn = Arc::clone(&conn);
                let active = Arc::clone(&active);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        if conn.try_begin_cycle() {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            thread::yield_now();
                            active.fetch_sub(1, Ordering::SeqCst);
                            conn.end_cycle();
                        }
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_throughput_take_resets() {
        let (conn, _peer) = loopback_connection(1);
        conn.record_response();
        conn.record_response();
        assert_eq!(conn.take_throughput(), 2);
        assert_eq!(conn.take_throughput(), 0);
    }

    #[test]
    fn test_connection_registry() {
        let registry = ConnectionRegistry::new(2);
        let (c1, _p1) = loopback_connection(1);
        let (c2, _p2) = loopback_connection(2);

        let k1 = registry.insert(Arc::new(c1));
        let k2 = registry.insert(Arc::new(c2));
        assert_ne!(k1, k2);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.capacity(), 2);
    }

    #[test]
    fn test_sweep_evicts_dead_and_visits_live() {
        let registry = ConnectionRegistry::new(16);
        let (live, _p1) = loopback_connection(1);
        let (dead, _p2) = loopback_connection(2);
        let live = Arc::new(live);
        let dead = Arc::new(dead);
        registry.insert(Arc::clone(&live));
        registry.insert(Arc::clone(&dead));

        dead.record_response();
        dead.mark_dead();

        let mut visited = Vec::new();
        let evicted = registry.sweep(|conn| visited.push(conn.id()));

        assert_eq!(evicted, 1);
        assert_eq!(visited, vec![1]);
        assert_eq!(registry.len(), 1);

        // The evicted connection is still usable by whoever holds it.
        assert!(dead.is_dead());
    }
}
