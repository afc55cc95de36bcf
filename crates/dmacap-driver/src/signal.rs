//! Completion signal: the mailbox between the DMA completion context and
//! the blocked reader.
//!
//! The engine side (`notify`) only bumps a period counter, sets the
//! single-slot "new data" bit, and wakes one waiter. All cursor math and
//! copying happens on the reader side after `wait` returns.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dmacap_core::error::{DmacapError, Result};
use dmacap_core::notifier::Notifier;

#[derive(Debug, Default)]
struct Slot {
    /// At least one segment completed since the last `clear`.
    pending: bool,
    /// Session torn down; waiters must bail out.
    closed: bool,
}

/// One-bit mailbox plus wait queue.
pub struct CompletionSignal {
    slot: Mutex<Slot>,
    condvar: Condvar,
    /// Segments completed since creation. Monotonic.
    periods: AtomicU64,
    /// Threads currently blocked in `wait` (hint only).
    waiting: AtomicUsize,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            condvar: Condvar::new(),
            periods: AtomicU64::new(0),
            waiting: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the bit is set or the signal is closed.
    ///
    /// Returns `SessionClosed` once closed, `TimedOut` if `timeout` expires
    /// first. Does not clear the bit.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = self.lock();
        self.waiting.fetch_add(1, Ordering::SeqCst);

        let outcome = loop {
            if slot.closed {
                break Err(DmacapError::SessionClosed);
            }
            if slot.pending {
                break Ok(());
            }
            match deadline {
                None => {
                    slot = self.condvar.wait(slot).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(DmacapError::TimedOut);
                    }
                    let (guard, _) = self
                        .condvar
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    slot = guard;
                }
            }
        };

        self.waiting.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    /// Consume the bit after the corresponding data has been copied.
    pub fn clear(&self) {
        self.lock().pending = false;
    }

    /// Clear the bit only if no segment completed since `seen` was sampled
    /// from [`periods`](Self::periods). Returns whether it was cleared.
    ///
    /// `notify` bumps the counter before taking the lock, so a completion
    /// racing this call either keeps the bit set or sets it again after.
    pub fn clear_seen(&self, seen: u64) -> bool {
        let mut slot = self.lock();
        if self.periods.load(Ordering::Acquire) == seen {
            slot.pending = false;
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        self.lock().pending
    }

    /// Segments completed so far.
    #[inline]
    pub fn periods(&self) -> u64 {
        self.periods.load(Ordering::Acquire)
    }

    /// Release every waiter with `SessionClosed`, now and forever.
    pub fn close(&self) {
        self.lock().closed = true;
        self.condvar.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of threads blocked in `wait` (may be stale).
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for CompletionSignal {
    fn notify(&self) {
        self.periods.fetch_add(1, Ordering::AcqRel);
        // Idempotent: a second completion before the reader wakes just
        // re-sets the bit.
        self.lock().pending = true;
        self.condvar.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_timeout() {
        let signal = CompletionSignal::new();
        let start = Instant::now();
        let result = signal.wait(Some(Duration::from_millis(50)));
        assert!(matches!(result, Err(DmacapError::TimedOut)));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_notify_before_wait() {
        let signal = CompletionSignal::new();
        signal.notify();
        signal.notify();
        assert_eq!(signal.periods(), 2);
        assert!(signal.wait(Some(Duration::from_millis(10))).is_ok());
        // wait does not consume
        assert!(signal.is_pending());
        signal.clear();
        assert!(!signal.is_pending());
    }

    #[test]
    fn test_clear_seen_keeps_newer_completion() {
        let signal = CompletionSignal::new();
        signal.notify();
        let seen = signal.periods();
        signal.notify();
        assert!(!signal.clear_seen(seen));
        assert!(signal.is_pending());
        assert!(signal.clear_seen(signal.periods()));
        assert!(!signal.is_pending());
    }

    #[test]
    fn test_wake_blocked_waiter() {
        let signal = Arc::new(CompletionSignal::new());
        let signal2 = Arc::clone(&signal);

        let handle = thread::spawn(move || signal2.wait(Some(Duration::from_secs(10))));

        thread::sleep(Duration::from_millis(50));
        signal.notify();

        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_close_releases_waiter() {
        let signal = Arc::new(CompletionSignal::new());
        let signal2 = Arc::clone(&signal);

        let handle = thread::spawn(move || signal2.wait(None));

        thread::sleep(Duration::from_millis(50));
        signal.close();

        assert!(matches!(handle.join().unwrap(), Err(DmacapError::SessionClosed)));
        // closed wins over pending
        signal.notify();
        assert!(matches!(signal.wait(None), Err(DmacapError::SessionClosed)));
    }
}
