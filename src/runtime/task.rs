//! Digest-and-respond job executed on the task pool.
//!
//! The reactor hands a job one complete payload together with the connection
//! it came from. The job digests the payload, writes the digest back and
//! counts the response. Whatever happens, the connection's in-flight flag is
//! cleared and the reactor is told the cycle is over, so it can resume
//! reading (or cancel the registration if the connection died).

use crate::protocol::{write_fully, Digest};
use crate::runtime::connection::Connection;
use crossbeam::channel::Sender;
use mio::{Token, Waker};
use std::sync::Arc;
use tracing::{trace, warn};

/// Message from a worker to the reactor at the end of a response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// The cycle finished and the connection is still healthy.
    Completed(Token),
    /// The connection is dead; its registration should be cancelled.
    Failed(Token),
}

/// Worker-side handle for posting [`Notice`]s and waking the reactor.
#[derive(Clone)]
pub struct Notifier {
    tx: Sender<Notice>,
    waker: Arc<Waker>,
}

impl Notifier {
    pub fn new(tx: Sender<Notice>, waker: Arc<Waker>) -> Self {
        Self { tx, waker }
    }

    fn notify(&self, notice: Notice) {
        // The reactor owns the receiver; once it is gone there is nobody left
        // to tell.
        if self.tx.send(notice).is_err() {
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake reactor");
        }
    }
}

/// Releases the in-flight flag and reports the outcome, even on panic.
struct CycleGuard<'a> {
    conn: &'a Connection,
    token: Token,
    notifier: &'a Notifier,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.conn.end_cycle();
        let notice = if self.conn.is_dead() {
            Notice::Failed(self.token)
        } else {
            Notice::Completed(self.token)
        };
        self.notifier.notify(notice);
    }
}

/// One read/digest/respond cycle for a single connection.
pub struct RespondTask {
    token: Token,
    conn: Arc<Connection>,
    payload: Vec<u8>,
    notifier: Notifier,
}

impl RespondTask {
    /// The caller must already hold the connection's cycle
    /// (see [`Connection::try_begin_cycle`]).
    pub fn new(token: Token, conn: Arc<Connection>, payload: Vec<u8>, notifier: Notifier) -> Self {
        Self {
            token,
            conn,
            payload,
            notifier,
        }
    }

    pub fn run(self) {
        let _cycle = CycleGuard {
            conn: &self.conn,
            token: self.token,
            notifier: &self.notifier,
        };

        // A failure may have been detected after this job was queued.
        if self.conn.is_dead() {
            return;
        }

        let digest = Digest::of(&self.payload);
        let mut stream = self.conn.stream();
        match write_fully(&mut stream, digest.as_bytes()) {
            Ok(()) => {
                self.conn.record_response();
                trace!(conn_id = self.conn.id(), %digest, "Sent digest");
            }
            Err(e) => {
                if self.conn.mark_dead() {
                    warn!(
                        conn_id = self.conn.id(),
                        peer = self.conn.peer(),
                        error = %e,
                        "Failed to respond, dropping client"
                    );
                }
            }
        }
    }
}
