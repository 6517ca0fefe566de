//! Cross-queue ordering events
//!
//! Events are the sole ordering primitive between command queues: a queue
//! that waits on an event stalls until the recording queue executes the
//! matching record command. Events are reusable across iterations; each
//! record enqueue takes a fresh ticket and waiters bind to the most recent
//! ticket at enqueue time.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct EventInner {
    /// Highest ticket whose record command has executed
    completed: Mutex<u64>,
    cond: Condvar,
    /// Tickets handed out to record enqueues
    enqueued: AtomicU64,
}

/// A reusable cross-queue synchronization event
#[derive(Clone, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    /// Create a new event with no pending records
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next record ticket (called at record-enqueue time)
    pub(crate) fn next_ticket(&self) -> u64 {
        self.inner.enqueued.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Most recent record ticket (what a wait-enqueue binds to)
    pub(crate) fn current_ticket(&self) -> u64 {
        self.inner.enqueued.load(Ordering::Acquire)
    }

    /// Mark a ticket complete (called by the recording queue's worker)
    pub(crate) fn complete(&self, ticket: u64) {
        let mut completed = self.inner.completed.lock();
        if ticket > *completed {
            *completed = ticket;
        }
        self.inner.cond.notify_all();
    }

    /// Block until the given ticket has completed
    pub(crate) fn wait_completed(&self, ticket: u64) {
        let mut completed = self.inner.completed.lock();
        while *completed < ticket {
            self.inner.cond.wait(&mut completed);
        }
    }

    /// Block until the given ticket has completed, with a deadline
    pub(crate) fn wait_completed_timeout(&self, ticket: u64, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut completed = self.inner.completed.lock();
        while *completed < ticket {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            if self
                .inner
                .cond
                .wait_for(&mut completed, deadline - now)
                .timed_out()
                && *completed < ticket
            {
                return false;
            }
        }
        true
    }

    /// Whether every enqueued record has executed
    pub fn is_signaled(&self) -> bool {
        *self.inner.completed.lock() >= self.current_ticket()
    }

    /// Block the host until every enqueued record has executed
    pub fn synchronize(&self) {
        self.wait_completed(self.current_ticket());
    }

    /// Host-side wait with a watchdog deadline; false on timeout
    pub fn synchronize_timeout(&self, timeout: Duration) -> bool {
        self.wait_completed_timeout(self.current_ticket(), timeout)
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("enqueued", &self.current_ticket())
            .field("completed", &*self.inner.completed.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_sequence() {
        let e = Event::new();
        assert_eq!(e.current_ticket(), 0);
        assert!(e.is_signaled()); // nothing recorded yet
        let t = e.next_ticket();
        assert_eq!(t, 1);
        assert!(!e.is_signaled());
        e.complete(t);
        assert!(e.is_signaled());
    }

    #[test]
    fn test_cross_thread_wait() {
        let e = Event::new();
        let t = e.next_ticket();
        let waiter = e.clone();
        let handle = std::thread::spawn(move || {
            waiter.wait_completed(t);
            true
        });
        std::thread::sleep(Duration::from_millis(10));
        e.complete(t);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let e = Event::new();
        let t = e.next_ticket();
        assert!(!e.wait_completed_timeout(t, Duration::from_millis(20)));
        e.complete(t);
        assert!(e.wait_completed_timeout(t, Duration::from_millis(20)));
    }
}
