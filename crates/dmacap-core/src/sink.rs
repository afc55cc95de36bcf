//! Downstream byte sink abstraction.
//!
//! # Implementors
//!
//! - `FileSink` (pipeline): positioned writes into a regular file.
//! - `FilterSink` (pipeline, Linux): stream writes into the stdin pipe of an
//!   external filter process (e.g. `gzip`) whose stdout is the output file.
//!
//! The pipeline does not care which one it has; it only assigns offsets.

use std::os::unix::io::RawFd;

use crate::error::Result;

/// Accepts blocks of captured bytes.
pub trait ByteSink: Send + Sync {
    /// Write `bytes` at `offset`. Stream sinks ignore the offset and rely
    /// on submission order. Returns bytes written (may be short).
    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<usize>;

    /// True if the sink is a pipe/stream with no random access.
    fn is_stream(&self) -> bool {
        false
    }

    /// Descriptor for backends that write directly (io_uring).
    fn raw_fd(&self) -> RawFd;

    /// Flush and release. For filter sinks: close the pipe and reap the child.
    fn finish(&mut self) -> Result<()>;
}
