//! Event queue counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
/// Snapshot of event queue counters at a point in time.
pub struct EqStatsSnapshot {
    /// Raw connection manager events processed.
    pub raw_events: u64,
    /// Entries handed to the application.
    pub events_delivered: u64,
    /// Raw events consumed internally without a visible entry.
    pub events_internal: u64,
    /// Raw events of an unrecognized kind.
    pub unknown_events: u64,
    /// Transparent XRC connect retries.
    pub xrc_retries: u64,
    /// Accept responses resent for retransmitted SIDR requests.
    pub sidr_resends: u64,
    /// Rejects observed.
    pub rejects: u64,
    /// Structured errors recorded.
    pub errors_recorded: u64,
}

/// Thread-safe event queue counters.
#[derive(Default)]
pub struct EqStats {
    raw_events: AtomicU64,
    events_delivered: AtomicU64,
    events_internal: AtomicU64,
    unknown_events: AtomicU64,
    xrc_retries: AtomicU64,
    sidr_resends: AtomicU64,
    rejects: AtomicU64,
    errors_recorded: AtomicU64,
}

impl std::fmt::Debug for EqStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EqStats")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl EqStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn raw_event(&self) {
        self.raw_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn internal(&self) {
        self.events_internal.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unknown(&self) {
        self.unknown_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn xrc_retry(&self) {
        self.xrc_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sidr_resend(&self) {
        self.sidr_resends.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reject(&self) {
        self.rejects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn error_recorded(&self) {
        self.errors_recorded.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> EqStatsSnapshot {
        EqStatsSnapshot {
            raw_events: self.raw_events.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_internal: self.events_internal.load(Ordering::Relaxed),
            unknown_events: self.unknown_events.load(Ordering::Relaxed),
            xrc_retries: self.xrc_retries.load(Ordering::Relaxed),
            sidr_resends: self.sidr_resends.load(Ordering::Relaxed),
            rejects: self.rejects.load(Ordering::Relaxed),
            errors_recorded: self.errors_recorded.load(Ordering::Relaxed),
        }
    }
}
