//! Readiness notification for blocking reads.
//!
//! The signal is a monotonically increasing sequence number. Producers bump it
//! whenever an entry is written or the connection manager has raw events
//! pending; waiters remember the sequence they observed before their last
//! non-blocking attempt and sleep until it moves or the deadline passes.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Readiness signal shared by the queue and its connection manager.
#[derive(Debug, Default)]
pub struct EqSignal {
    seq: Mutex<u64>,
    cond: Condvar,
    notify: Notify,
}

impl EqSignal {
    /// Creates a signal with sequence zero.
    pub fn new() -> Self {
        Self::default()
    }

    fn seq(&self) -> MutexGuard<'_, u64> {
        self.seq.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current sequence number.
    pub fn sequence(&self) -> u64 {
        *self.seq()
    }

    /// Marks the queue readable and wakes every waiter.
    pub fn notify(&self) {
        let mut seq = self.seq();
        *seq = seq.wrapping_add(1);
        drop(seq);
        self.cond.notify_all();
        self.notify.notify_waiters();
    }

    /// Blocks until the sequence differs from `seen` or `timeout` elapses.
    /// `None` waits forever. Returns false on timeout.
    pub fn wait_since(&self, seen: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut seq = self.seq();
        while *seq == seen {
            match deadline {
                None => {
                    seq = self.cond.wait(seq).unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .cond
                        .wait_timeout(seq, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    seq = guard;
                }
            }
        }
        true
    }

    /// Async variant of [`EqSignal::wait_since`].
    pub async fn wait_since_async(&self, seen: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.sequence() != seen {
                return true;
            }
            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.sequence() != seen;
                    }
                }
            }
        }
    }
}
