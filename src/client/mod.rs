//! Load-generating client.
//!
//! One connection, three threads of control:
//! - sender: paces random payloads onto the socket, recording each digest in
//!   the [`OutstandingLedger`] before the payload is written
//! - receiver: a mio poll loop on the calling thread that reads echoed
//!   digests and matches them against the ledger
//! - reporter (verbose only): logs sent/received counters on an interval
//!
//! An echo that matches nothing in the ledger means the server answered
//! something this client never sent. After [`POISON_THRESHOLD`] of those the
//! client gives up with [`ClientError::Poisoned`].

pub mod launcher;
mod ledger;

pub use ledger::OutstandingLedger;

use crate::config::ClientConfig;
use crate::protocol::{random_payload, write_fully, Digest, FillResult, Frame};
use crate::runtime::REPORT_TIME_FORMAT;
use chrono::Local;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, TryRecvError};
use mio::{Events, Interest, Poll, Token};
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Unmatched echoes tolerated before the client stops.
pub const POISON_THRESHOLD: u32 = 5;

const STREAM_TOKEN: Token = Token(0);

/// Upper bound on how long the receiver waits before rechecking the sender.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Client failures. Each maps to a process exit status.
#[derive(Debug)]
pub enum ClientError {
    Connect(io::Error),
    Spawn(io::Error),
    SendFailed(io::Error),
    ReceiveFailed(io::Error),
    /// The server closed the connection.
    Disconnected,
    /// Too many echoes matched nothing in the ledger.
    Poisoned { count: u32 },
}

impl ClientError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Poisoned { .. } => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Connect(e) => write!(f, "Failed to connect to server: {}", e),
            ClientError::Spawn(e) => write!(f, "Failed to start client thread: {}", e),
            ClientError::SendFailed(e) => write!(f, "Failed to send payload: {}", e),
            ClientError::ReceiveFailed(e) => write!(f, "Failed to receive digest: {}", e),
            ClientError::Disconnected => write!(f, "Server closed the connection"),
            ClientError::Poisoned { count } => {
                write!(f, "Received {} unrecognized digests, giving up", count)
            }
        }
    }
}

impl std::error::Error for ClientError {}

/// Sent and received counts since the last [`ClientStats::take`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCounts {
    pub sent: u64,
    pub received: u64,
}

#[derive(Debug, Default)]
pub struct ClientStats {
    sent: AtomicU64,
    received: AtomicU64,
}

impl ClientStats {
    fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Read both counters and reset them to zero.
    pub fn take(&self) -> ClientCounts {
        ClientCounts {
            sent: self.sent.swap(0, Ordering::Relaxed),
            received: self.received.swap(0, Ordering::Relaxed),
        }
    }
}

/// Matches echoed digests against the ledger and counts violations.
pub struct EchoVerifier {
    ledger: Arc<OutstandingLedger>,
    stats: Arc<ClientStats>,
    poisoned: u32,
}

impl EchoVerifier {
    pub fn new(ledger: Arc<OutstandingLedger>, stats: Arc<ClientStats>) -> Self {
        Self {
            ledger,
            stats,
            poisoned: 0,
        }
    }

    pub fn verify(&mut self, digest: &Digest) -> Result<(), ClientError> {
        if self.ledger.remove(digest) {
            self.stats.record_received();
            return Ok(());
        }

        self.poisoned += 1;
        let outstanding: Vec<String> = self
            .ledger
            .snapshot()
            .iter()
            .map(Digest::to_string)
            .collect();
        error!(
            %digest,
            poisoned = self.poisoned,
            outstanding = ?outstanding,
            "Received unrecognized digest"
        );

        if self.poisoned >= POISON_THRESHOLD {
            return Err(ClientError::Poisoned {
                count: self.poisoned,
            });
        }
        Ok(())
    }
}

pub struct Client {
    config: ClientConfig,
    ledger: Arc<OutstandingLedger>,
    stats: Arc<ClientStats>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            ledger: Arc::new(OutstandingLedger::new()),
            stats: Arc::new(ClientStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ClientStats> {
        Arc::clone(&self.stats)
    }

    /// Shared view of the digests still awaiting an echo.
    pub fn ledger(&self) -> Arc<OutstandingLedger> {
        Arc::clone(&self.ledger)
    }

    /// Connect and run until the payload limit is reached and every digest is
    /// matched, or until a fatal error.
    pub fn run(&self) -> Result<(), ClientError> {
        let stream = std::net::TcpStream::connect((self.config.host.as_str(), self.config.port))
            .map_err(ClientError::Connect)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        stream.set_nonblocking(true).map_err(ClientError::Connect)?;
        let writer = stream.try_clone().map_err(ClientError::Connect)?;
        let mut stream = mio::net::TcpStream::from_std(stream);

        info!(
            host = %self.config.host,
            port = self.config.port,
            rate = self.config.rate,
            "Client connected"
        );

        let (stop_reporter, reporter_stopped) = channel::bounded::<()>(1);
        let reporter = if self.config.verbose {
            Some(self.spawn_reporter(reporter_stopped)?)
        } else {
            None
        };

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, sender_done) = channel::bounded(1);
        let sender = {
            let ledger = Arc::clone(&self.ledger);
            let stats = Arc::clone(&self.stats);
            let stop = Arc::clone(&stop);
            let pause = Duration::from_micros(1_000_000 / self.config.rate.max(1));
            let count = self.config.count;
            thread::Builder::new()
                .name("sender".to_string())
                .spawn(move || {
                    let result = send_loop(writer, &ledger, &stats, pause, count, &stop);
                    let _ = done_tx.send(result);
                })
                .map_err(ClientError::Spawn)?
        };

        let result = self.receive(&mut stream, &sender_done);

        stop.store(true, Ordering::Release);
        if result.is_err() {
            // Unblocks a sender stuck behind a full socket.
            let _ = stream.shutdown(Shutdown::Both);
        }
        if sender.join().is_err() {
            warn!("Sender thread panicked");
        }
        drop(stop_reporter);
        if let Some(reporter) = reporter {
            let _ = reporter.join();
        }

        result
    }

    fn receive(
        &self,
        stream: &mut mio::net::TcpStream,
        sender_done: &Receiver<io::Result<u64>>,
    ) -> Result<(), ClientError> {
        let mut poll = Poll::new().map_err(ClientError::ReceiveFailed)?;
        poll.registry()
            .register(stream, STREAM_TOKEN, Interest::READABLE)
            .map_err(ClientError::ReceiveFailed)?;

        let mut events = Events::with_capacity(16);
        let mut frame = Frame::digest();
        let mut verifier = EchoVerifier::new(Arc::clone(&self.ledger), Arc::clone(&self.stats));
        let mut sender_finished = false;

        loop {
            if !sender_finished {
                match sender_done.try_recv() {
                    Ok(Ok(sent)) => {
                        debug!(sent, "Sender finished");
                        sender_finished = true;
                    }
                    Ok(Err(e)) => return Err(ClientError::SendFailed(e)),
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => {
                        return Err(ClientError::SendFailed(io::Error::other(
                            "sender exited without reporting",
                        )));
                    }
                }
            }
            if sender_finished && self.ledger.is_empty() {
                return Ok(());
            }

            if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ClientError::ReceiveFailed(e));
            }
            if !events.is_empty() {
                drain_echoes(stream, &mut frame, &mut verifier)?;
            }
        }
    }

    fn spawn_reporter(&self, stopped: Receiver<()>) -> Result<JoinHandle<()>, ClientError> {
        let stats = Arc::clone(&self.stats);
        let ledger = Arc::clone(&self.ledger);
        let interval = self.config.report_interval;
        thread::Builder::new()
            .name("reporter".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let counts = stats.take();
                        info!(
                            "[{}] Client Throughput: sent {} messages, received {} messages, \
                             outstanding {}",
                            Local::now().format(REPORT_TIME_FORMAT),
                            counts.sent,
                            counts.received,
                            ledger.len(),
                        );
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(ClientError::Spawn)
    }
}

/// Write payloads until the limit is reached, the stop flag is raised or a
/// write fails. Returns the number of payloads sent.
fn send_loop(
    mut writer: std::net::TcpStream,
    ledger: &OutstandingLedger,
    stats: &ClientStats,
    pause: Duration,
    count: Option<u64>,
    stop: &AtomicBool,
) -> io::Result<u64> {
    let mut rng = rand::rng();
    let mut sent = 0;

    while !stop.load(Ordering::Acquire) && count.map_or(true, |limit| sent < limit) {
        let payload = random_payload(&mut rng);
        ledger.insert(Digest::of(&payload));
        write_fully(&mut writer, &payload)?;
        stats.record_sent();
        sent += 1;
        thread::sleep(pause);
    }
    Ok(sent)
}

/// Read every complete digest currently available on the socket.
fn drain_echoes(
    stream: &mut mio::net::TcpStream,
    frame: &mut Frame,
    verifier: &mut EchoVerifier,
) -> Result<(), ClientError> {
    loop {
        match frame.fill_from(stream) {
            Ok(FillResult::Complete) => {
                if let Some(digest) = Digest::from_slice(&frame.take()) {
                    verifier.verify(&digest)?;
                }
            }
            Ok(FillResult::NeedData) => return Ok(()),
            Ok(FillResult::Closed) => return Err(ClientError::Disconnected),
            Err(e) => return Err(ClientError::ReceiveFailed(e)),
        }
    }
}
