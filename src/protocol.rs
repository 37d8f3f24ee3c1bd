//! Wire protocol shared by the digest server and the load generator.
//!
//! The protocol has no framing beyond fixed sizes:
//! - Request:  exactly `PAYLOAD_SIZE` bytes of opaque data
//! - Response: exactly `DIGEST_SIZE` bytes, the binary SHA-1 of the request
//!
//! Both sides use non-blocking sockets, so short reads and writes are normal.
//! [`Frame`] accumulates a fixed-size message across as many reads as it
//! takes, and [`write_fully`] loops until every byte has been sent.

use rand::RngCore;
use sha1::{Digest as _, Sha1};
use std::fmt;
use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

/// Size of every request payload in bytes.
pub const PAYLOAD_SIZE: usize = 8 * 1024;

/// Size of every response digest in bytes.
pub const DIGEST_SIZE: usize = 20;

/// Fixed-length binary fingerprint of a payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    /// Compute the digest of `payload`.
    pub fn of(payload: &[u8]) -> Self {
        let mut bytes = [0u8; DIGEST_SIZE];
        bytes.copy_from_slice(&Sha1::digest(payload));
        Digest(bytes)
    }

    /// Interpret `bytes` as a digest received off the wire.
    ///
    /// Returns `None` unless `bytes` is exactly `DIGEST_SIZE` long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; DIGEST_SIZE] = bytes.try_into().ok()?;
        Some(Digest(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

/// Generate a fresh random payload.
pub fn random_payload<R: RngCore + ?Sized>(rng: &mut R) -> Vec<u8> {
    let mut payload = vec![0u8; PAYLOAD_SIZE];
    rng.fill_bytes(&mut payload);
    payload
}

/// Outcome of pulling bytes into a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillResult {
    /// The frame holds a complete message.
    Complete,
    /// The socket has no more data right now; the frame is partially filled.
    NeedData,
    /// The peer closed the stream before the frame was complete.
    Closed,
}

/// A fixed-size message being accumulated from a non-blocking reader.
///
/// Reading resumes where the previous call left off, so a frame can be fed
/// from successive readiness events without ever blocking.
#[derive(Debug)]
pub struct Frame {
    buf: Vec<u8>,
    filled: usize,
}

impl Frame {
    /// Create an empty frame of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size],
            filled: 0,
        }
    }

    /// Frame sized for one request payload.
    pub fn payload() -> Self {
        Self::new(PAYLOAD_SIZE)
    }

    /// Frame sized for one response digest.
    pub fn digest() -> Self {
        Self::new(DIGEST_SIZE)
    }

    /// Bytes accumulated so far.
    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.buf.len()
    }

    /// Read from `reader` until the frame is full, the reader would block,
    /// or the peer closes.
    ///
    /// Never reads past the end of the frame, so bytes belonging to the next
    /// message stay in the socket.
    pub fn fill_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<FillResult> {
        while !self.is_complete() {
            match reader.read(&mut self.buf[self.filled..]) {
                Ok(0) => return Ok(FillResult::Closed),
                Ok(n) => self.filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FillResult::NeedData)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(FillResult::Complete)
    }

    /// Take the accumulated bytes and reset the frame for the next message.
    pub fn take(&mut self) -> Vec<u8> {
        let size = self.buf.len();
        self.filled = 0;
        std::mem::replace(&mut self.buf, vec![0u8; size])
    }
}

/// First pause after a write would block.
const WRITE_BACKOFF_MIN: Duration = Duration::from_micros(50);

/// Longest pause between retries of a blocked write.
const WRITE_BACKOFF_MAX: Duration = Duration::from_millis(5);

/// Write all of `buf` to a non-blocking writer.
///
/// Partial writes are continued. On `WouldBlock` the thread sleeps before
/// retrying, doubling the pause up to [`WRITE_BACKOFF_MAX`] until the writer
/// makes progress again. A zero-length write is reported as `WriteZero`.
pub fn write_fully<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    let mut backoff = WRITE_BACKOFF_MIN;
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => {
                written += n;
                backoff = WRITE_BACKOFF_MIN;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(backoff);
                backoff = (backoff * 2).min(WRITE_BACKOFF_MAX);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
