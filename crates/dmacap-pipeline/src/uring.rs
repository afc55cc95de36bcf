//! `UringQueue` — io_uring `CompletionQueue`.
//!
//! Reads are `IORING_OP_READ` on the device fd, writes `IORING_OP_WRITE`
//! on the sink fd. `flush()` is one `io_uring_enter`; `wait()` drains the
//! CQ and only blocks when it is empty.
//!
//! Device reads use offset 0 (a character device ignores it).
//!
//! Stream sinks (a filter's stdin pipe) have no offsets, and io-wq neither
//! orders concurrent pipe writes nor finishes them whole. Writes to a
//! stream are therefore queued here and go to the kernel one at a time, in
//! submission order; a short write is resubmitted for its remainder and
//! completes to the caller only once the whole block is in the pipe.

use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::io::AsRawFd;

use dmacap_core::entry::{Completion, Token};
use dmacap_core::error::{DmacapError, Result};
use dmacap_core::queue::{CompletionQueue, IoBuf};
use dmacap_core::sink::ByteSink;
use io_uring::{opcode, types, IoUring};
use tracing::{debug, trace};

/// Current file position, for `Write` on pipes.
const CURRENT_POS: u64 = u64::MAX;

/// A block bound for a stream sink.
struct StreamWrite {
    token: Token,
    buf: IoBuf,
    done: usize,
}

/// io_uring backend over a device file and a sink.
pub struct UringQueue<S: ByteSink> {
    ring: IoUring,
    device: File,
    sink: S,
    /// SQEs handed to the kernel and not yet reaped.
    in_kernel: usize,
    pending_submit: u32,
    /// Submissions not yet returned by `wait()`.
    outstanding: usize,
    /// Stream writes in order; the head has an SQE out while `stream_busy`.
    stream: VecDeque<StreamWrite>,
    stream_busy: bool,
    /// Completions decided without the kernel (cancelled queued writes).
    ready: VecDeque<Completion>,
}

impl<S: ByteSink> UringQueue<S> {
    /// `entries` is the SQ size (power of two).
    pub fn new(device: File, sink: S, entries: u32) -> Result<Self> {
        let ring = IoUring::builder().build(entries)?;
        debug!(
            entries,
            device_fd = device.as_raw_fd(),
            sink_fd = sink.raw_fd(),
            stream = sink.is_stream(),
            "io_uring ready"
        );
        Ok(Self {
            ring,
            device,
            sink,
            in_kernel: 0,
            pending_submit: 0,
            outstanding: 0,
            stream: VecDeque::new(),
            stream_busy: false,
            ready: VecDeque::new(),
        })
    }

    /// Hand back the device and the sink.
    pub fn into_parts(self) -> (File, S) {
        (self.device, self.sink)
    }

    fn push(&mut self, sqe: io_uring::squeue::Entry) -> Result<()> {
        // Safety: every buffer referenced by `sqe` stays valid until its CQE
        // is reaped (the `CompletionQueue` submit contract).
        unsafe {
            self.ring
                .submission()
                .push(&sqe)
                .map_err(|_| DmacapError::QueueFull)?;
        }
        self.pending_submit += 1;
        Ok(())
    }

    fn submit(&mut self, want: usize) -> Result<()> {
        let submitted = loop {
            match self.ring.submit_and_wait(want) {
                Ok(n) => break n,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        };
        self.in_kernel += submitted;
        self.pending_submit = self.pending_submit.saturating_sub(submitted as u32);
        Ok(())
    }

    /// Queue an SQE for the unwritten rest of the head stream write.
    fn push_stream_head(&mut self) -> Result<()> {
        let Some(head) = self.stream.front() else {
            return Ok(());
        };
        let rest = head.buf.len - head.done;
        let len = u32::try_from(rest).map_err(|_| DmacapError::InvalidConfig("block too large"))?;
        // Safety: `done < buf.len`, so the pointer stays inside the block.
        let ptr = unsafe { head.buf.ptr.add(head.done) };
        let sqe = opcode::Write::new(types::Fd(self.sink.raw_fd()), ptr, len)
            .offset(CURRENT_POS)
            .build()
            .user_data(head.token.0);
        self.push(sqe)?;
        self.stream_busy = true;
        Ok(())
    }

    /// Start the next stream write if none is with the kernel.
    fn kick_stream(&mut self) -> Result<()> {
        if self.stream_busy || self.stream.is_empty() {
            return Ok(());
        }
        self.push_stream_head()
    }

    fn is_stream_head(&self, token: Token) -> bool {
        self.stream_busy && self.stream.front().is_some_and(|w| w.token == token)
    }

    /// Account one CQE of the head stream write. `None` while bytes remain.
    fn stream_progress(&mut self, result: i32) -> Result<Option<Completion>> {
        let Some(head) = self.stream.front_mut() else {
            return Ok(None);
        };
        if result > 0 {
            head.done += result as usize;
            if head.done < head.buf.len {
                trace!(token = head.token.0, done = head.done, len = head.buf.len, "partial pipe write");
                return self.push_stream_head().map(|()| None);
            }
        }
        self.stream_busy = false;
        let Some(head) = self.stream.pop_front() else {
            return Ok(None);
        };
        let result = if result < 0 { i64::from(result) } else { head.done as i64 };
        Ok(Some(Completion { token: head.token, result }))
    }

    fn reap(&mut self) -> Result<Option<Completion>> {
        loop {
            let Some(cqe) = self.ring.completion().next() else {
                break;
            };
            self.in_kernel = self.in_kernel.saturating_sub(1);
            let token = Token(cqe.user_data());
            if token == Token::INTERNAL {
                trace!(result = cqe.result(), "cancel completion");
                continue;
            }
            if self.is_stream_head(token) {
                match self.stream_progress(cqe.result())? {
                    Some(c) => return Ok(Some(c)),
                    None => continue,
                }
            }
            return Ok(Some(Completion {
                token,
                result: i64::from(cqe.result()),
            }));
        }
        Ok(None)
    }
}

impl<S: ByteSink> CompletionQueue for UringQueue<S> {
    unsafe fn submit_read(&mut self, token: Token, buf: IoBuf) -> Result<()> {
        let len = u32::try_from(buf.len).map_err(|_| DmacapError::InvalidConfig("block too large"))?;
        let sqe = opcode::Read::new(types::Fd(self.device.as_raw_fd()), buf.ptr, len)
            .offset(0)
            .build()
            .user_data(token.0);
        self.push(sqe)?;
        self.outstanding += 1;
        Ok(())
    }

    unsafe fn submit_write(&mut self, token: Token, offset: u64, buf: IoBuf) -> Result<()> {
        let len = u32::try_from(buf.len).map_err(|_| DmacapError::InvalidConfig("block too large"))?;
        if self.sink.is_stream() {
            self.stream.push_back(StreamWrite { token, buf, done: 0 });
            self.outstanding += 1;
            return Ok(());
        }
        let sqe = opcode::Write::new(types::Fd(self.sink.raw_fd()), buf.ptr, len)
            .offset(offset)
            .build()
            .user_data(token.0);
        self.push(sqe)?;
        self.outstanding += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<usize> {
        self.kick_stream()?;
        if self.pending_submit == 0 {
            return Ok(0);
        }
        let before = self.in_kernel;
        self.submit(0)?;
        Ok(self.in_kernel - before)
    }

    fn wait(&mut self) -> Result<Completion> {
        loop {
            if let Some(c) = self.ready.pop_front() {
                self.outstanding = self.outstanding.saturating_sub(1);
                return Ok(c);
            }
            if let Some(c) = self.reap()? {
                self.outstanding = self.outstanding.saturating_sub(1);
                return Ok(c);
            }
            self.kick_stream()?;
            if self.in_kernel == 0 && self.pending_submit == 0 {
                return Err(DmacapError::ResourceUnavailable("nothing in flight"));
            }
            self.submit(1)?;
        }
    }

    fn cancel(&mut self, token: Token) -> Result<()> {
        // A stream write still queued here never reached the kernel.
        if !self.is_stream_head(token) {
            if let Some(i) = self.stream.iter().position(|w| w.token == token) {
                if let Some(w) = self.stream.remove(i) {
                    self.ready.push_back(Completion {
                        token: w.token,
                        result: -(libc::ECANCELED as i64),
                    });
                }
                return Ok(());
            }
        }
        let sqe = opcode::AsyncCancel::new(token.0)
            .build()
            .user_data(Token::INTERNAL.0);
        self.push(sqe)
    }

    fn inflight(&self) -> usize {
        self.outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::sink::{FileSink, FilterSink};
    use dmacap_core::config::PipelineConfig;
    use std::io::Write;

    fn uring_available() -> bool {
        IoUring::new(2).is_ok()
    }

    #[test]
    fn test_copy_regular_file_blocks() {
        if !uring_available() {
            eprintln!("io_uring unavailable, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();

        // A regular file read at offset 0 always returns its first block,
        // so the output is N copies of it.
        let block: Vec<u8> = (0..4096u32).map(|i| (i % 199) as u8).collect();
        let src_path = dir.path().join("src");
        File::create(&src_path).unwrap().write_all(&block).unwrap();

        let out_path = dir.path().join("out");
        let sink = FileSink::create(&out_path).unwrap();
        let q = UringQueue::new(File::open(&src_path).unwrap(), sink, 16).unwrap();

        let config = PipelineConfig::new()
            .block_size(4096)
            .concurrency(4)
            .queue_depth(16)
            .target_blocks(6);
        let mut p = Pipeline::new(q, config).unwrap();
        let report = p.run().unwrap();
        assert_eq!(report.bytes_written, 6 * 4096);

        let (_dev, mut sink) = p.into_queue().into_parts();
        sink.finish().unwrap();
        let out = std::fs::read(&out_path).unwrap();
        assert_eq!(out.len(), 6 * 4096);
        assert!(out.chunks(4096).all(|c| c == &block[..]));
    }

    #[test]
    fn test_filter_sink_gets_whole_blocks_in_order() {
        if !uring_available() {
            return;
        }
        const BLOCK: usize = 256 * 1024;
        const BLOCKS: u64 = 8;
        let dir = tempfile::tempdir().unwrap();

        // 251 is prime, so any misplaced chunk breaks the pattern.
        let block: Vec<u8> = (0..BLOCK).map(|i| (i % 251) as u8).collect();
        let src_path = dir.path().join("src");
        File::create(&src_path).unwrap().write_all(&block).unwrap();

        // A 64 KiB pipe forces partial writes of every block.
        let out_path = dir.path().join("out");
        let sink = FilterSink::spawn("cat", &[], &out_path, 64 * 1024).unwrap();
        let q = UringQueue::new(File::open(&src_path).unwrap(), sink, 32).unwrap();

        let config = PipelineConfig::new()
            .block_size(BLOCK)
            .concurrency(4)
            .queue_depth(32)
            .target_blocks(BLOCKS);
        let mut p = Pipeline::new(q, config).unwrap();
        let report = p.run().unwrap();
        assert_eq!(report.bytes_written, BLOCKS * BLOCK as u64);
        assert_eq!(p.queue().inflight(), 0);

        let (_dev, mut sink) = p.into_queue().into_parts();
        sink.finish().unwrap();
        let out = std::fs::read(&out_path).unwrap();
        assert_eq!(out.len(), BLOCKS as usize * BLOCK);
        for (i, chunk) in out.chunks(BLOCK).enumerate() {
            assert!(chunk == &block[..], "block {} corrupted", i);
        }
    }

    #[test]
    fn test_queued_stream_write_cancels_locally() {
        if !uring_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let sink = FilterSink::spawn("cat", &[], &dir.path().join("out"), 64 * 1024).unwrap();
        let mut q = UringQueue::new(tempfile::tempfile().unwrap(), sink, 8).unwrap();

        let mut a = vec![1u8; 4096];
        let mut b = vec![2u8; 4096];
        unsafe {
            q.submit_write(Token(0), 0, IoBuf::from_slice(&mut a)).unwrap();
            q.submit_write(Token(1), 4096, IoBuf::from_slice(&mut b)).unwrap();
        }
        // only the head goes to the kernel; the second is still ours
        q.cancel(Token(1)).unwrap();
        q.flush().unwrap();
        assert_eq!(q.inflight(), 2);

        let mut got = vec![q.wait().unwrap(), q.wait().unwrap()];
        got.sort_by_key(|c| c.token);
        assert_eq!(got[0], Completion { token: Token(0), result: 4096 });
        assert_eq!(got[1], Completion { token: Token(1), result: -(libc::ECANCELED as i64) });
        assert_eq!(q.inflight(), 0);

        let (_dev, mut sink) = q.into_parts();
        sink.finish().unwrap();
        assert_eq!(std::fs::read(dir.path().join("out")).unwrap(), vec![1u8; 4096]);
    }

    #[test]
    fn test_short_device_read_fails() {
        if !uring_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("src");
        File::create(&src_path).unwrap().write_all(&[1u8; 100]).unwrap();

        let sink = FileSink::create(&dir.path().join("out")).unwrap();
        let q = UringQueue::new(File::open(&src_path).unwrap(), sink, 8).unwrap();
        let config = PipelineConfig::new().block_size(512).concurrency(2).target_blocks(2);
        let mut p = Pipeline::new(q, config).unwrap();

        let err = p.run().unwrap_err();
        assert!(matches!(
            err,
            DmacapError::ShortCompletion { requested: 512, transferred: 100 }
        ));
        assert_eq!(p.queue().inflight(), 0);
    }
}
