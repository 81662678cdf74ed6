//! Reader/writer lock separating transactions from recovery.
//!
//! Transactions hold the read side while they address the current
//! primary. Primary recovery holds the write side for its whole run, so
//! no transaction can observe a half-recovered cluster. The lock also
//! counts its holders and panics if a writer ever coexists with a
//! reader, which would mean the exclusion itself is broken.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
pub struct RecoveryLock {
    inner: RwLock<()>,
    readers: AtomicUsize,
    writer: AtomicBool,
}

/// Held by a transaction attempt.
pub struct TransactionGuard<'a> {
    lock: &'a RecoveryLock,
    _guard: RwLockReadGuard<'a, ()>,
}

/// Held by primary recovery.
pub struct RecoveryGuard<'a> {
    lock: &'a RecoveryLock,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl RecoveryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> TransactionGuard<'_> {
        let guard = self.inner.read().expect("recovery lock");
        assert!(
            !self.writer.load(Ordering::SeqCst),
            "transaction entered while recovery holds the lock"
        );
        self.readers.fetch_add(1, Ordering::SeqCst);
        TransactionGuard { lock: self, _guard: guard }
    }

    pub fn write(&self) -> RecoveryGuard<'_> {
        let guard = self.inner.write().expect("recovery lock");
        assert_eq!(
            self.readers.load(Ordering::SeqCst),
            0,
            "recovery entered while transactions hold the lock"
        );
        let overlapping = self.writer.swap(true, Ordering::SeqCst);
        assert!(!overlapping, "two recoveries hold the lock");
        RecoveryGuard { lock: self, _guard: guard }
    }

    /// Transactions currently inside the lock.
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }

    pub fn is_recovering(&self) -> bool {
        self.writer.load(Ordering::SeqCst)
    }
}

// Counters are updated before the inner guard is released.

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        self.lock.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for RecoveryGuard<'_> {
    fn drop(&mut self) {
        self.lock.writer.store(false, Ordering::SeqCst);
    }
}
