//! Single-threaded mio reactor feeding the task pool.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking syscalls. Uses epoll on Linux, kqueue on macOS.
//!
//! The reactor thread owns the poll instance, the listener and every
//! register/deregister call. Payloads are accumulated here, one resumable
//! [`Frame`] per connection, and only complete payloads are handed to the
//! [`TaskPool`]. While a connection's job is in flight the reactor leaves its
//! socket alone; the worker's completion notice (delivered through a channel
//! and a [`Waker`]) tells the reactor to resume reading it. Readiness is
//! edge-triggered, so resuming on completion is what keeps data that arrived
//! during the job from being stranded.

use crate::protocol::{FillResult, Frame};
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::pool::TaskPool;
use crate::runtime::task::{Notice, Notifier, RespondTask};
use crossbeam::channel::{self, Receiver};
use mio::net::TcpListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Maximum readiness events handled per poll.
const EVENT_CAPACITY: usize = 1024;

/// Reactor-side view of a connection.
struct Session {
    conn: Arc<Connection>,
    /// Payload accumulated so far.
    frame: Frame,
}

/// Stops a running [`Reactor`] from another thread.
#[cfg_attr(not(test), allow(dead_code))] // the binary runs until killed
#[derive(Clone)]
pub struct ReactorHandle {
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
}

#[cfg_attr(not(test), allow(dead_code))]
impl ReactorHandle {
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake reactor for shutdown");
        }
    }
}

pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    pool: TaskPool,
    registry: Arc<ConnectionRegistry>,
    sessions: Slab<Session>,
    notices: Receiver<Notice>,
    notifier: Notifier,
    next_id: u64,
    running: Arc<AtomicBool>,
}

impl Reactor {
    /// Bind the listener and start the task pool.
    ///
    /// Connections are not accepted until [`run`](Self::run) is called.
    pub fn bind(
        addr: SocketAddr,
        workers: usize,
        registry: Arc<ConnectionRegistry>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;

        let listener = create_listener(addr)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, notices) = channel::unbounded();
        let notifier = Notifier::new(tx, Arc::clone(&waker));

        let mut pool = TaskPool::new(workers);
        pool.initialize()?;

        Ok(Self {
            poll,
            listener,
            waker,
            pool,
            registry,
            sessions: Slab::new(),
            notices,
            notifier,
            next_id: 0,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            waker: Arc::clone(&self.waker),
            running: Arc::clone(&self.running),
        }
    }

    /// Run the event loop until [`ReactorHandle::shutdown`] is called or
    /// polling fails.
    ///
    /// On exit every connection is shut down and the task pool is joined.
    pub fn run(mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr()?,
            workers = self.pool.size(),
            "Reactor started"
        );

        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let result = self.event_loop(&mut events);

        self.close_all();
        self.pool.shutdown();
        info!("Reactor stopped");
        result
    }

    fn event_loop(&mut self, events: &mut Events) -> io::Result<()> {
        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll failed");
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => self.drain_notices(),
                    token => self.handle_readable(token),
                }
            }
        }
        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    // Retired sessions no longer count, even before the
                    // sweep evicts them from the registry.
                    if self.sessions.len() >= self.registry.capacity() {
                        warn!(peer = %peer_addr, "Connection limit reached");
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let entry = self.sessions.vacant_entry();
                    let token = Token(entry.key());
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        error!(peer = %peer_addr, error = %e, "Failed to register connection");
                        continue;
                    }

                    let id = self.next_id;
                    self.next_id += 1;
                    let conn = Arc::new(Connection::new(id, peer_addr.to_string(), stream));

                    self.registry.insert(Arc::clone(&conn));
                    entry.insert(Session {
                        conn,
                        frame: Frame::payload(),
                    });

                    debug!(conn_id = id, peer = %peer_addr, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let Some(session) = self.sessions.get_mut(token.0) else {
            return;
        };
        if session.conn.is_dead() {
            return;
        }
        if session.conn.is_in_flight() {
            // Resumed by the completion notice.
            trace!(conn_id = session.conn.id(), "Suppressed event while in flight");
            return;
        }

        let conn = Arc::clone(&session.conn);
        let mut stream = conn.stream();
        let result = session.frame.fill_from(&mut stream);

        match result {
            Ok(FillResult::NeedData) => {}
            Ok(FillResult::Complete) => self.dispatch(token),
            Ok(FillResult::Closed) => {
                debug!(
                    conn_id = conn.id(),
                    partial = session.frame.filled(),
                    "Client closed connection"
                );
                self.retire(token);
            }
            Err(e) => {
                warn!(
                    conn_id = conn.id(),
                    peer = conn.peer(),
                    error = %e,
                    "Failed to read from client, dropping it"
                );
                self.retire(token);
            }
        }
    }

    /// Hand the completed payload to the task pool.
    fn dispatch(&mut self, token: Token) {
        let Some(session) = self.sessions.get_mut(token.0) else {
            return;
        };
        if !session.conn.try_begin_cycle() {
            return;
        }

        let conn = Arc::clone(&session.conn);
        let payload = session.frame.take();
        let task = RespondTask::new(token, Arc::clone(&conn), payload, self.notifier.clone());

        if self.pool.submit(move || task.run()).is_none() {
            conn.end_cycle();
            return;
        }
        trace!(conn_id = conn.id(), queued = self.pool.queued(), "Dispatched payload");
    }

    fn drain_notices(&mut self) {
        while let Ok(notice) = self.notices.try_recv() {
            match notice {
                Notice::Completed(token) => self.handle_readable(token),
                Notice::Failed(token) => self.retire(token),
            }
        }
    }

    /// Mark a connection dead and cancel its registration.
    ///
    /// The registry entry is left for the stats sweep to evict.
    fn retire(&mut self, token: Token) {
        if let Some(session) = self.sessions.try_remove(token.0) {
            session.conn.mark_dead();
            deregister(&self.poll, &session.conn);
            debug!(conn_id = session.conn.id(), "Connection retired");
        }
    }

    fn close_all(&mut self) {
        for session in self.sessions.drain() {
            session.conn.mark_dead();
            let _ = session.conn.stream().shutdown(Shutdown::Both);
        }
    }
}

fn deregister(poll: &Poll, conn: &Connection) {
    let fd = conn.stream().as_raw_fd();
    if let Err(e) = poll.registry().deregister(&mut SourceFd(&fd)) {
        debug!(conn_id = conn.id(), error = %e, "Failed to deregister connection");
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR set.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
