//! Completion queue abstraction.
//!
//! A `CompletionQueue` executes reads from the device and writes to the
//! sink asynchronously, and hands back completions in whatever order the
//! underlying facility finishes them.
//!
//! # Implementors
//!
//! - `UringQueue` (pipeline, Linux): io_uring `Read`/`Write` SQEs against a
//!   device fd and a sink fd. Nothing blocks except `wait()`.
//! - `WorkerQueue` (pipeline): a fixed pool of threads running blocking
//!   reads against any `Read` source and writes against a `ByteSink`.
//!   Used to drive the modelled driver.
//!
//! # Buffer ownership
//!
//! Submissions pass a raw `(ptr, len)` pair. The caller owns the memory and
//! must keep it alive and untouched until the matching completion is
//! returned by `wait()`, including after `cancel()`.

use crate::entry::{Completion, Token};
use crate::error::Result;

/// Borrowed view of an I/O buffer handed to a backend.
#[derive(Debug, Clone, Copy)]
pub struct IoBuf {
    pub ptr: *mut u8,
    pub len: usize,
}

// Safety: IoBuf is a pointer + length; the submit contract above keeps the
// memory alive and exclusive for the life of the operation.
unsafe impl Send for IoBuf {}

impl IoBuf {
    pub fn from_slice(buf: &mut [u8]) -> Self {
        Self {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }
}

/// Asynchronous read/write submission and completion.
///
/// The pipeline calls `submit_*()` for new work, `flush()` once per batch,
/// then `wait()` to block for the next completion.
///
/// **Contract:**
/// - `submit_*()` and `flush()` never block on I/O.
/// - Completions may arrive in any order; match them by `Token`.
/// - Every successful submission yields exactly one completion, even if
///   cancelled (a cancelled op completes with a negative errno or its
///   natural result).
pub trait CompletionQueue {
    /// Queue a read of up to `buf.len` bytes from the device.
    ///
    /// # Safety
    /// `buf` must stay valid and unaliased until the completion is returned.
    unsafe fn submit_read(&mut self, token: Token, buf: IoBuf) -> Result<()>;

    /// Queue a write of `buf.len` bytes to the sink at `offset`.
    ///
    /// # Safety
    /// `buf` must stay valid until the completion is returned.
    unsafe fn submit_write(&mut self, token: Token, offset: u64, buf: IoBuf) -> Result<()>;

    /// Kick queued submissions. Returns how many were handed off.
    fn flush(&mut self) -> Result<usize>;

    /// Block until one completion is available and return it.
    fn wait(&mut self) -> Result<Completion>;

    /// Best-effort cancellation; the op still produces a completion.
    fn cancel(&mut self, token: Token) -> Result<()>;

    /// Operations submitted but not yet returned by `wait()`.
    fn inflight(&self) -> usize;
}
