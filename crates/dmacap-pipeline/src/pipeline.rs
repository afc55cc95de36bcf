//! Overlapped acquisition pipeline.
//!
//! Single-threaded event loop over a [`CompletionQueue`]:
//!
//! ```text
//!   ┌──────── submit_read(B) ◀──────────────────────────┐
//!   ▼                                                   │
//!  device ── read done (== B?) ── submit_write(off) ── sink ── write done
//!                                  off += B                    (refill)
//! ```
//!
//! At every instant `reads + writes <= concurrency`. A request keeps its
//! slot, and with it its buffer, from read submission until its write
//! completes; the slot index is the token the backend hands back, so
//! completions may arrive in any order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dmacap_core::config::PipelineConfig;
use dmacap_core::entry::{Completion, Op, Token};
use dmacap_core::error::{DmacapError, Result};
use dmacap_core::queue::{CompletionQueue, IoBuf};
use tracing::{debug, error, info, trace, warn};

use crate::stats::{format_rate, BlockTiming, Throughput, ThroughputSnapshot};

/// Requests a graceful stop: no new reads, drain what is in flight.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub blocks: u64,
    /// Highest `reads + writes` seen.
    pub max_outstanding: usize,
    pub elapsed: Duration,
    pub throughput: ThroughputSnapshot,
}

/// One in-flight block.
struct Request {
    op: Op,
    buf: Vec<u8>,
    offset: u64,
    read_queued: Instant,
    read_done: Instant,
    write_queued: Instant,
}

/// Slot table keyed by token, plus a pool of idle buffers.
struct Slots {
    slots: Vec<Option<Request>>,
    free: Vec<usize>,
    pool: Vec<Vec<u8>>,
    reads: usize,
    writes: usize,
}

impl Slots {
    fn new(concurrency: usize) -> Self {
        Self {
            slots: (0..concurrency).map(|_| None).collect(),
            free: (0..concurrency).rev().collect(),
            pool: Vec::new(),
            reads: 0,
            writes: 0,
        }
    }

    #[inline]
    fn outstanding(&self) -> usize {
        self.reads + self.writes
    }

    /// Remove the request behind `token`. The slot stays reserved until
    /// [`retire`](Self::retire) or the request is put back.
    fn take(&mut self, token: Token) -> Option<(usize, Request)> {
        let idx = usize::try_from(token.0).ok()?;
        let req = self.slots.get_mut(idx)?.take()?;
        match req.op {
            Op::Read => self.reads -= 1,
            Op::Write => self.writes -= 1,
        }
        Some((idx, req))
    }

    /// Free the slot and return the buffer to the pool.
    fn retire(&mut self, idx: usize, req: Request) {
        self.free.push(idx);
        self.pool.push(req.buf);
    }
}

/// The acquisition pipeline over some completion queue backend.
pub struct Pipeline<Q: CompletionQueue> {
    queue: Q,
    config: PipelineConfig,
    stop: StopHandle,
}

impl<Q: CompletionQueue> Pipeline<Q> {
    pub fn new(queue: Q, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            queue,
            config,
            stop: StopHandle::default(),
        })
    }

    /// Share an existing stop handle (e.g. one a timer already holds).
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn into_queue(self) -> Q {
        self.queue
    }

    /// Run until the target is written, or until stopped and drained.
    pub fn run(&mut self) -> Result<RunReport> {
        let block = self.config.block_size;
        let concurrency = self.config.concurrency;
        let target_blocks = self.config.target_blocks_count();

        let mut slots = Slots::new(concurrency);
        let mut throughput = Throughput::new(block, concurrency);
        let mut issued: u64 = 0;
        let mut next_offset: u64 = 0;
        let mut bytes_read: u64 = 0;
        let mut bytes_written: u64 = 0;
        let mut max_outstanding = 0;
        let started = Instant::now();

        info!(block, concurrency, target_blocks, "pipeline starting");

        loop {
            // Admission: fill up to the depth unless done or stopping.
            while slots.outstanding() < concurrency
                && !self.stop.is_stopped()
                && target_blocks.map_or(true, |n| issued < n)
            {
                if let Err(e) = self.submit_read(&mut slots, block) {
                    return Err(self.abort(&mut slots, e));
                }
                issued += 1;
            }
            max_outstanding = max_outstanding.max(slots.outstanding());

            if slots.outstanding() == 0 {
                break;
            }
            if let Err(e) = self.queue.flush() {
                return Err(self.abort(&mut slots, e));
            }

            let c = match self.queue.wait() {
                Ok(c) => c,
                Err(e) => return Err(self.abort(&mut slots, e)),
            };
            let Some((idx, mut req)) = slots.take(c.token) else {
                warn!(token = c.token.0, result = c.result, "completion for unknown token");
                continue;
            };

            match req.op {
                Op::Read => {
                    if let Err(e) = check(&c, req.buf.len()) {
                        slots.retire(idx, req);
                        return Err(self.abort(&mut slots, e));
                    }
                    req.read_done = Instant::now();
                    bytes_read += req.buf.len() as u64;
                    req.offset = next_offset;
                    next_offset += req.buf.len() as u64;
                    trace!(token = c.token.0, offset = req.offset, "read done");

                    if let Err(e) = self.submit_write(&mut slots, idx, req) {
                        return Err(self.abort(&mut slots, e));
                    }
                }
                Op::Write => {
                    if let Err(e) = check(&c, req.buf.len()) {
                        slots.retire(idx, req);
                        return Err(self.abort(&mut slots, e));
                    }
                    let now = Instant::now();
                    bytes_written += req.buf.len() as u64;
                    let timing = BlockTiming {
                        read: req.read_done - req.read_queued,
                        write: now - req.write_queued,
                        end_to_end: now - req.read_queued,
                    };
                    let rate = throughput.record(timing);
                    debug!(
                        offset = req.offset,
                        read_us = timing.read.as_micros() as u64,
                        write_us = timing.write.as_micros() as u64,
                        e2e_us = timing.end_to_end.as_micros() as u64,
                        rate = %format_rate(rate.unwrap_or(0.0)),
                        estimate = %format_rate(throughput.estimate_bps()),
                        "block written"
                    );
                    slots.retire(idx, req);
                }
            }
        }

        let report = RunReport {
            bytes_read,
            bytes_written,
            blocks: throughput.blocks(),
            max_outstanding,
            elapsed: started.elapsed(),
            throughput: throughput.snapshot(),
        };
        info!(
            bytes = report.bytes_written,
            blocks = report.blocks,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "pipeline finished: {}",
            report.throughput
        );
        Ok(report)
    }

    fn submit_read(&mut self, slots: &mut Slots, block: usize) -> Result<()> {
        let idx = slots.free.pop().ok_or(DmacapError::QueueFull)?;
        let mut buf = slots.pool.pop().unwrap_or_else(|| vec![0u8; block]);
        let token = Token(idx as u64);

        // Safety: the buffer moves into the slot right after; a Vec's heap
        // storage does not move with it and stays untouched until the
        // completion for `token` is taken.
        let submitted = unsafe { self.queue.submit_read(token, IoBuf::from_slice(&mut buf)) };
        if let Err(e) = submitted {
            slots.free.push(idx);
            slots.pool.push(buf);
            return Err(e);
        }

        let now = Instant::now();
        slots.slots[idx] = Some(Request {
            op: Op::Read,
            buf,
            offset: 0,
            read_queued: now,
            read_done: now,
            write_queued: now,
        });
        slots.reads += 1;
        Ok(())
    }

    fn submit_write(&mut self, slots: &mut Slots, idx: usize, mut req: Request) -> Result<()> {
        // Same slot, same token: the buffer never changes hands.
        let token = Token(idx as u64);

        // Safety: as in `submit_read`.
        let submitted =
            unsafe { self.queue.submit_write(token, req.offset, IoBuf::from_slice(&mut req.buf)) };
        if let Err(e) = submitted {
            slots.retire(idx, req);
            return Err(e);
        }

        req.op = Op::Write;
        req.write_queued = Instant::now();
        slots.slots[idx] = Some(req);
        slots.writes += 1;
        Ok(())
    }

    /// Cancel and drain everything in flight, then hand back `err`.
    fn abort(&mut self, slots: &mut Slots, err: DmacapError) -> DmacapError {
        error!(error = %err, outstanding = slots.outstanding(), "pipeline aborting");

        for (idx, slot) in slots.slots.iter().enumerate() {
            if slot.is_some() {
                if let Err(e) = self.queue.cancel(Token(idx as u64)) {
                    warn!(token = idx, error = %e, "cancel failed");
                }
            }
        }
        if let Err(e) = self.queue.flush() {
            warn!(error = %e, "flush during abort failed");
        }

        while slots.outstanding() > 0 {
            match self.queue.wait() {
                Ok(c) => {
                    if let Some((idx, req)) = slots.take(c.token) {
                        trace!(token = c.token.0, result = c.result, "drained");
                        slots.retire(idx, req);
                    }
                }
                Err(e) => {
                    // Cannot prove the backend is done with these buffers.
                    warn!(error = %e, outstanding = slots.outstanding(), "drain failed, leaking buffers");
                    for req in slots.slots.iter_mut().filter_map(Option::take) {
                        std::mem::forget(req.buf);
                    }
                    break;
                }
            }
        }
        err
    }
}

/// A completion must move exactly `want` bytes.
fn check(c: &Completion, want: usize) -> Result<()> {
    if c.is_err() {
        return Err(DmacapError::from_errno(c.result));
    }
    if c.result as usize != want {
        return Err(DmacapError::ShortCompletion {
            requested: want,
            transferred: c.result as usize,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Clone, Copy)]
    struct Pending {
        token: Token,
        op: Op,
        buf: IoBuf,
        offset: u64,
        cancelled: bool,
    }

    /// Deterministic backend that completes ops in a scrambled order.
    #[derive(Default)]
    struct ScriptedQueue {
        pending: Vec<Pending>,
        rng: u64,
        /// Next byte of the simulated device stream.
        stream: u64,
        /// offset -> bytes as written to the "sink".
        written: BTreeMap<u64, Vec<u8>>,
        max_inflight: usize,
        reads_completed: usize,
        writes_completed: usize,
        short_read_at: Option<usize>,
        /// Read number and the errno it fails with.
        fail_read_at: Option<(usize, i32)>,
        fail_write_at: Option<usize>,
        stop_after_writes: Option<(usize, StopHandle)>,
        cancels: usize,
    }

    impl ScriptedQueue {
        fn new(seed: u64) -> Self {
            Self { rng: seed | 1, ..Default::default() }
        }

        fn next(&mut self) -> u64 {
            self.rng ^= self.rng << 13;
            self.rng ^= self.rng >> 7;
            self.rng ^= self.rng << 17;
            self.rng
        }

        fn output(&self) -> Vec<u8> {
            let mut out = Vec::new();
            for (off, bytes) in &self.written {
                assert_eq!(*off, out.len() as u64, "gap or overlap at {}", off);
                out.extend_from_slice(bytes);
            }
            out
        }
    }

    fn stream_byte(pos: u64) -> u8 {
        (pos % 253) as u8
    }

    impl CompletionQueue for ScriptedQueue {
        unsafe fn submit_read(&mut self, token: Token, buf: IoBuf) -> Result<()> {
            self.pending.push(Pending { token, op: Op::Read, buf, offset: 0, cancelled: false });
            self.max_inflight = self.max_inflight.max(self.pending.len());
            Ok(())
        }

        unsafe fn submit_write(&mut self, token: Token, offset: u64, buf: IoBuf) -> Result<()> {
            self.pending.push(Pending { token, op: Op::Write, buf, offset, cancelled: false });
            self.max_inflight = self.max_inflight.max(self.pending.len());
            Ok(())
        }

        fn flush(&mut self) -> Result<usize> {
            Ok(self.pending.len())
        }

        fn wait(&mut self) -> Result<Completion> {
            if self.pending.is_empty() {
                return Err(DmacapError::ResourceUnavailable("nothing in flight"));
            }
            let i = (self.next() % self.pending.len() as u64) as usize;
            let p = self.pending.swap_remove(i);
            if p.cancelled {
                return Ok(Completion { token: p.token, result: -(libc::ECANCELED as i64) });
            }
            // Safety: the pipeline keeps the buffer alive until this returns.
            let buf = unsafe { std::slice::from_raw_parts_mut(p.buf.ptr, p.buf.len) };
            let result = match p.op {
                Op::Read => {
                    let n = self.reads_completed;
                    self.reads_completed += 1;
                    if let Some((_, errno)) = self.fail_read_at.filter(|(at, _)| *at == n) {
                        -(errno as i64)
                    } else {
                        let len = if self.short_read_at == Some(n) { buf.len() - 1 } else { buf.len() };
                        for b in &mut buf[..len] {
                            *b = stream_byte(self.stream);
                            self.stream += 1;
                        }
                        len as i64
                    }
                }
                Op::Write => {
                    let n = self.writes_completed;
                    self.writes_completed += 1;
                    if let Some((after, stop)) = &self.stop_after_writes {
                        if n + 1 >= *after {
                            stop.stop();
                        }
                    }
                    if self.fail_write_at == Some(n) {
                        -(libc::ENOSPC as i64)
                    } else {
                        self.written.insert(p.offset, buf.to_vec());
                        buf.len() as i64
                    }
                }
            };
            Ok(Completion { token: p.token, result })
        }

        fn cancel(&mut self, token: Token) -> Result<()> {
            self.cancels += 1;
            for p in self.pending.iter_mut().filter(|p| p.token == token) {
                p.cancelled = true;
            }
            Ok(())
        }

        fn inflight(&self) -> usize {
            self.pending.len()
        }
    }

    fn config(block: usize, concurrency: usize, blocks: u64) -> PipelineConfig {
        PipelineConfig::new()
            .block_size(block)
            .concurrency(concurrency)
            .target_blocks(blocks)
    }

    #[test]
    fn test_backpressure_and_contiguous_output() {
        const B: usize = 64;
        const N: u64 = 25;
        let mut p = Pipeline::new(ScriptedQueue::new(0xdead_beef), config(B, 4, N)).unwrap();
        let report = p.run().unwrap();

        assert_eq!(report.bytes_written, N * B as u64);
        assert_eq!(report.bytes_read, N * B as u64);
        assert_eq!(report.blocks, N);
        assert!(report.max_outstanding <= 4);

        let q = p.into_queue();
        assert!(q.max_inflight <= 4);
        assert_eq!(q.written.len(), N as usize);

        // offsets are 0, B, 2B, ... and the bytes follow the device stream
        let out = q.output();
        assert_eq!(out.len(), N as usize * B);
        for (i, b) in out.iter().enumerate() {
            assert_eq!(*b, stream_byte(i as u64));
        }
    }

    #[test]
    fn test_fewer_blocks_than_depth() {
        let mut p = Pipeline::new(ScriptedQueue::new(7), config(16, 8, 3)).unwrap();
        let report = p.run().unwrap();
        assert_eq!(report.bytes_written, 48);
        assert_eq!(report.max_outstanding, 3);
    }

    #[test]
    fn test_short_read_aborts_without_advancing() {
        let mut q = ScriptedQueue::new(42);
        q.short_read_at = Some(5);
        let mut p = Pipeline::new(q, config(32, 4, 20)).unwrap();

        let err = p.run().unwrap_err();
        assert!(matches!(
            err,
            DmacapError::ShortCompletion { requested: 32, transferred: 31 }
        ));
        assert!(err.is_device_error());

        let q = p.into_queue();
        // everything drained, no write past the five good reads
        assert_eq!(q.pending.len(), 0);
        assert!(q.written.keys().all(|off| *off < 5 * 32));
        assert!(q.written.len() <= 5);
    }

    #[test]
    fn test_read_error_is_device_error() {
        let mut q = ScriptedQueue::new(3);
        q.fail_read_at = Some((0, libc::EIO));
        let mut p = Pipeline::new(q, config(32, 4, 8)).unwrap();
        let err = p.run().unwrap_err();
        assert!(matches!(err, DmacapError::Device(code) if code == libc::EIO));
        assert_eq!(p.queue().inflight(), 0);
    }

    #[test]
    fn test_device_overrun_surfaces_as_overrun() {
        let mut q = ScriptedQueue::new(11);
        q.fail_read_at = Some((3, libc::EOVERFLOW));
        let mut p = Pipeline::new(q, config(32, 4, 8)).unwrap();
        let err = p.run().unwrap_err();
        assert!(matches!(err, DmacapError::Overrun { .. }));
        assert!(!err.is_device_error());
        assert_eq!(p.queue().inflight(), 0);
    }

    #[test]
    fn test_write_failure_aborts_and_cancels() {
        let mut q = ScriptedQueue::new(99);
        q.fail_write_at = Some(2);
        let mut p = Pipeline::new(q, config(32, 4, 50)).unwrap();

        let err = p.run().unwrap_err();
        assert!(matches!(err, DmacapError::Device(code) if code == libc::ENOSPC));

        let q = p.into_queue();
        assert_eq!(q.pending.len(), 0);
        assert!(q.cancels > 0);
    }

    #[test]
    fn test_stop_drains_in_flight() {
        let stop = StopHandle::default();
        let mut q = ScriptedQueue::new(5);
        q.stop_after_writes = Some((10, stop.clone()));
        let config = PipelineConfig::new().block_size(16).concurrency(4);
        let mut p = Pipeline::new(q, config).unwrap().with_stop_handle(stop);

        let report = p.run().unwrap();
        // every read issued before the stop was written out
        assert_eq!(report.bytes_read, report.bytes_written);
        assert!(report.blocks >= 10);
        assert_eq!(report.bytes_written % 16, 0);

        let q = p.into_queue();
        assert_eq!(q.pending.len(), 0);
        assert_eq!(q.output().len() as u64, report.bytes_written);
    }

    #[test]
    fn test_rejects_bad_config() {
        let r = Pipeline::new(ScriptedQueue::new(1), PipelineConfig::new().concurrency(0));
        assert!(matches!(r, Err(DmacapError::InvalidConfig(_))));
    }
}
