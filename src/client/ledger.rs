//! Outstanding-response ledger.
//!
//! Digests of payloads that were sent but not yet echoed back. The sender
//! inserts before writing and the receiver removes on each echo. Echoes may
//! be matched in any order; duplicates are kept as separate entries.

use crate::protocol::Digest;
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct OutstandingLedger {
    entries: Mutex<Vec<Digest>>,
}

impl OutstandingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a digest as awaiting its echo.
    pub fn insert(&self, digest: Digest) {
        self.entries.lock().push(digest);
    }

    /// Remove the first entry equal to `digest`.
    ///
    /// Returns `false` if the digest was never sent (or was already matched).
    pub fn remove(&self, digest: &Digest) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|d| d == digest) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of unconfirmed requests.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of the current entries, oldest first.
    pub fn snapshot(&self) -> Vec<Digest> {
        self.entries.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn digest(n: u32) -> Digest {
        Digest::of(&n.to_be_bytes())
    }

    #[test]
    fn test_remove_in_any_order() {
        let ledger = OutstandingLedger::new();
        for n in 0..4 {
            ledger.insert(digest(n));
        }
        assert_eq!(ledger.len(), 4);

        assert!(ledger.remove(&digest(2)));
        assert!(ledger.remove(&digest(0)));
        assert!(!ledger.remove(&digest(0)));
        assert_eq!(ledger.snapshot(), vec![digest(1), digest(3)]);

        assert!(ledger.remove(&digest(3)));
        assert!(ledger.remove(&digest(1)));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_duplicates_are_removed_one_at_a_time() {
        let ledger = OutstandingLedger::new();
        ledger.insert(digest(7));
        ledger.insert(digest(7));

        assert!(ledger.remove(&digest(7)));
        assert_eq!(ledger.len(), 1);
        assert!(ledger.remove(&digest(7)));
        assert!(!ledger.remove(&digest(7)));
    }

    #[test]
    fn test_unknown_digest_is_not_matched() {
        let ledger = OutstandingLedger::new();
        ledger.insert(digest(1));
        assert!(!ledger.remove(&digest(2)));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_concurrent_insert_and_remove() {
        let ledger = Arc::new(OutstandingLedger::new());

        let sender = {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                for n in 0..1_000 {
                    ledger.insert(digest(n));
                }
            })
        };

        let mut matched = 0;
        let mut next = 0;
        while matched < 1_000 {
            if ledger.remove(&digest(next)) {
                matched += 1;
                next += 1;
            } else {
                thread::yield_now();
            }
        }

        sender.join().unwrap();
        assert!(ledger.is_empty());
    }
}
