use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Live counters shared by the acceptor, the poller and the workers.
#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    registered: AtomicU64,
    dispatched: AtomicU64,
    responded: AtomicU64,
    closed_idle: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
    active: AtomicUsize,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Connections returned by `accept`.
    pub accepted: u64,
    /// Connections added to the poller's registration table.
    pub registered: u64,
    /// Work items handed to the worker pool.
    pub dispatched: u64,
    /// Responses written in full.
    pub responded: u64,
    /// Connections that closed before sending a byte.
    pub closed_idle: u64,
    /// Connections turned away by a saturated pool.
    pub rejected: u64,
    /// Connection-scoped I/O failures.
    pub errors: u64,
    /// Entries currently in the registration table.
    pub active: usize,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            registered: self.registered.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            responded: self.responded.load(Ordering::Relaxed),
            closed_idle: self.closed_idle.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_registered(&self) {
        self.registered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_responded(&self) {
        self.responded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_closed_idle(&self) {
        self.closed_idle.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_active(&self, active: usize) {
        self.active.store(active, Ordering::Relaxed);
    }
}
