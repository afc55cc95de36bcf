//! Completion notification abstraction.
//!
//! A `Notifier` is what the DMA engine calls from its completion context
//! (the interrupt half) to tell a consumer that a period of the cyclic ring
//! has been filled, or that a one-shot transfer finished.
//!
//! # Implementors
//!
//! - `CompletionSignal` (driver): single-slot mailbox + condvar. Sets the
//!   "new data" bit, bumps the period counter, wakes one waiter.
//! - Test doubles that count calls.

/// Wakes the consumer when a transfer segment completes.
///
/// **Contract:**
/// - `notify()` must NEVER block for longer than a short critical section.
/// - Multiple calls before the consumer wakes are coalesced into one
///   wakeup; the bit only means "at least one segment arrived".
/// - May be called concurrently from several completion contexts.
pub trait Notifier: Send + Sync {
    /// Signal that one more segment has completed.
    fn notify(&self);
}

impl<F> Notifier for F
where
    F: Fn() + Send + Sync,
{
    fn notify(&self) {
        self()
    }
}
