//! Request tokens and completion entries.
//!
//! These are the lingua franca between the pipeline and whichever
//! completion queue backend executes its I/O.

/// Opaque per-request id. Carried in io_uring's `user_data` (or the worker
/// queue's item) and handed back untouched with the completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Token(pub u64);

impl Token {
    /// Reserved for backend-internal operations (cancel requests).
    pub const INTERNAL: Self = Self(u64::MAX);
}

/// What an in-flight request is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

/// A finished operation as reported by a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Token that was submitted.
    pub token: Token,
    /// Bytes transferred, or negative errno.
    pub result: i64,
}

impl Completion {
    #[inline]
    pub fn is_err(&self) -> bool {
        self.result < 0
    }
}
