//! Fault injection for the in-memory transport and storage, used to drive error paths in tests
//! and local runs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct FaultInjector {
    /// Fail the next N operations with a retryable error.
    transient: AtomicUsize,
    /// Fail every operation with a non-retryable error until cleared.
    fatal: AtomicBool,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_transient(&self, count: usize) {
        self.transient.store(count, Ordering::Relaxed);
    }

    pub fn set_fatal(&self, fatal: bool) {
        self.fatal.store(fatal, Ordering::Relaxed);
    }

    pub(crate) fn check(&self) -> Option<Fault> {
        if self.fatal.load(Ordering::Relaxed) {
            return Some(Fault::Fatal);
        }
        self.transient
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
            .ok()
            .map(|_| Fault::Transient)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    Transient,
    Fatal,
}
