//! `WorkerQueue` — blocking-thread `CompletionQueue`.
//!
//! One reader thread owns the source and runs reads in submission order
//! (the device has a single reader). Writer threads run sink writes; a
//! stream sink gets exactly one so bytes land in submission order.
//! Completions come back through a lock-free result queue and the waiting
//! thread is unparked.
//!
//! A read keeps pulling until its buffer is full: the device contract is
//! full-length delivery or an error, and `Session::read` may legitimately
//! return less than asked.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use dmacap_core::entry::{Completion, Token};
use dmacap_core::error::{DmacapError, Result};
use dmacap_core::queue::{CompletionQueue, IoBuf};
use dmacap_core::sink::ByteSink;
use tracing::{debug, trace, warn};

/// Idle workers re-check for work at least this often.
const IDLE_PARK: Duration = Duration::from_millis(10);

#[derive(Clone, Copy)]
struct Job {
    token: Token,
    buf: IoBuf,
    offset: u64,
}

/// Shared state between the submitting thread and the workers.
struct Shared {
    reads: ArrayQueue<Job>,
    writes: ArrayQueue<Job>,
    results: ArrayQueue<Completion>,
    /// Tokens cancelled before a worker picked them up.
    cancelled: Mutex<Vec<Token>>,
    /// Thread blocked in `wait()`, if any.
    waiter: Mutex<Option<Thread>>,
    shutdown: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn take_cancelled(&self, token: Token) -> bool {
        let mut cancelled = lock(&self.cancelled);
        match cancelled.iter().position(|t| *t == token) {
            Some(i) => {
                cancelled.swap_remove(i);
                true
            }
            None => false,
        }
    }

    fn complete(&self, token: Token, result: i64) {
        // A cancel that raced a running job is moot now.
        self.take_cancelled(token);
        let mut c = Completion { token, result };
        // Sized to the queue depth; only full if the waiter is far behind.
        while let Err(back) = self.results.push(c) {
            c = back;
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            thread::yield_now();
        }
        if let Some(t) = lock(&self.waiter).as_ref() {
            t.unpark();
        }
    }
}

/// Hook that unblocks a read stuck inside the source (e.g. a session
/// closer). Called on `cancel`.
pub type Interrupt = Box<dyn Fn() + Send>;

/// Thread-backed completion queue over a `Read` source and a `ByteSink`.
pub struct WorkerQueue<R, S> {
    shared: Arc<Shared>,
    sink: Option<Arc<S>>,
    reader: Option<JoinHandle<R>>,
    writers: Vec<JoinHandle<()>>,
    pending_reads: Vec<Job>,
    pending_writes: Vec<Job>,
    inflight: usize,
    depth: usize,
    interrupt: Option<Interrupt>,
}

impl<R, S> WorkerQueue<R, S>
where
    R: Read + Send + 'static,
    S: ByteSink + 'static,
{
    /// Spawn the reader and `writers` write workers (one for stream sinks).
    /// `depth` bounds operations in flight.
    pub fn new(source: R, sink: S, writers: usize, depth: usize) -> Result<Self> {
        let depth = depth.max(1);
        let writers = if sink.is_stream() { 1 } else { writers.clamp(1, 32) };

        let shared = Arc::new(Shared {
            reads: ArrayQueue::new(depth),
            writes: ArrayQueue::new(depth),
            results: ArrayQueue::new(depth),
            cancelled: Mutex::new(Vec::new()),
            waiter: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });
        let sink = Arc::new(sink);

        let reader = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("dmacap-reader".into())
                .spawn(move || reader_loop(shared, source))?
        };

        let mut handles = Vec::with_capacity(writers);
        for id in 0..writers {
            let shared = Arc::clone(&shared);
            let sink = Arc::clone(&sink);
            let handle = thread::Builder::new()
                .name(format!("dmacap-writer-{}", id))
                .spawn(move || writer_loop(shared, sink))?;
            handles.push(handle);
        }
        debug!(writers, depth, "worker queue started");

        Ok(Self {
            shared,
            sink: Some(sink),
            reader: Some(reader),
            writers: handles,
            pending_reads: Vec::new(),
            pending_writes: Vec::new(),
            inflight: 0,
            depth,
            interrupt: None,
        })
    }

    /// Install a hook run on `cancel` to unblock a read in progress.
    pub fn set_interrupt(&mut self, f: impl Fn() + Send + 'static) {
        self.interrupt = Some(Box::new(f));
    }

    fn wake_workers(&self) {
        if let Some(r) = &self.reader {
            r.thread().unpark();
        }
        for w in &self.writers {
            w.thread().unpark();
        }
    }

    /// Stop the workers and hand back the source and the sink.
    ///
    /// Call with nothing in flight; a read blocked in the source is
    /// interrupted first if a hook is installed.
    pub fn shutdown(mut self) -> Result<(R, S)> {
        if self.inflight > 0 {
            warn!(inflight = self.inflight, "shutting down with operations in flight");
            if let Some(f) = &self.interrupt {
                f();
            }
        }
        self.stop_threads();

        let source = self
            .reader
            .take()
            .ok_or(DmacapError::SessionClosed)?
            .join()
            .map_err(|_| DmacapError::ResourceUnavailable("reader thread panicked"))?;
        for w in self.writers.drain(..) {
            if w.join().is_err() {
                warn!("writer thread panicked");
            }
        }

        let sink = self
            .sink
            .take()
            .and_then(|s| Arc::try_unwrap(s).ok())
            .ok_or(DmacapError::ResourceUnavailable("sink still shared"))?;
        Ok((source, sink))
    }

    fn stop_threads(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.wake_workers();
    }
}

impl<R, S> CompletionQueue for WorkerQueue<R, S>
where
    R: Read + Send + 'static,
    S: ByteSink + 'static,
{
    unsafe fn submit_read(&mut self, token: Token, buf: IoBuf) -> Result<()> {
        if self.inflight >= self.depth {
            return Err(DmacapError::QueueFull);
        }
        self.pending_reads.push(Job { token, buf, offset: 0 });
        self.inflight += 1;
        Ok(())
    }

    unsafe fn submit_write(&mut self, token: Token, offset: u64, buf: IoBuf) -> Result<()> {
        if self.inflight >= self.depth {
            return Err(DmacapError::QueueFull);
        }
        self.pending_writes.push(Job { token, buf, offset });
        self.inflight += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<usize> {
        let mut n = 0;
        for job in self.pending_reads.drain(..) {
            self.shared.reads.push(job).map_err(|_| DmacapError::QueueFull)?;
            n += 1;
        }
        for job in self.pending_writes.drain(..) {
            self.shared.writes.push(job).map_err(|_| DmacapError::QueueFull)?;
            n += 1;
        }
        if n > 0 {
            self.wake_workers();
        }
        Ok(n)
    }

    fn wait(&mut self) -> Result<Completion> {
        if self.inflight == 0 {
            return Err(DmacapError::ResourceUnavailable("nothing in flight"));
        }
        self.flush()?;
        *lock(&self.shared.waiter) = Some(thread::current());

        loop {
            if let Some(c) = self.shared.results.pop() {
                self.inflight -= 1;
                return Ok(c);
            }
            thread::park_timeout(IDLE_PARK);
        }
    }

    fn cancel(&mut self, token: Token) -> Result<()> {
        lock(&self.shared.cancelled).push(token);
        if let Some(f) = &self.interrupt {
            f();
        }
        Ok(())
    }

    fn inflight(&self) -> usize {
        self.inflight
    }
}

impl<R, S> Drop for WorkerQueue<R, S> {
    fn drop(&mut self) {
        // Workers exit on their next pass; not joined here.
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(r) = &self.reader {
            r.thread().unpark();
        }
        for w in &self.writers {
            w.thread().unpark();
        }
    }
}

fn errno_of(e: &std::io::Error) -> i64 {
    -(e.raw_os_error().unwrap_or(libc::EIO) as i64)
}

/// Fill `buf` completely. Returns bytes read, or a negative errno.
fn fill<R: Read>(source: &mut R, buf: &mut [u8]) -> i64 {
    let mut done = 0;
    while done < buf.len() {
        match source.read(&mut buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                trace!(done, error = %e, "read failed");
                return errno_of(&e);
            }
        }
    }
    done as i64
}

fn reader_loop<R: Read>(shared: Arc<Shared>, mut source: R) -> R {
    while !shared.shutdown.load(Ordering::Relaxed) {
        let Some(job) = shared.reads.pop() else {
            thread::park_timeout(IDLE_PARK);
            continue;
        };
        if shared.take_cancelled(job.token) {
            shared.complete(job.token, -(libc::ECANCELED as i64));
            continue;
        }
        // Safety: the submitter keeps the buffer alive and untouched until
        // this job's completion is returned by `wait()`.
        let buf = unsafe { std::slice::from_raw_parts_mut(job.buf.ptr, job.buf.len) };
        let result = fill(&mut source, buf);
        shared.complete(job.token, result);
    }
    source
}

fn writer_loop<S: ByteSink>(shared: Arc<Shared>, sink: Arc<S>) {
    while !shared.shutdown.load(Ordering::Relaxed) {
        let Some(job) = shared.writes.pop() else {
            thread::park_timeout(IDLE_PARK);
            continue;
        };
        if shared.take_cancelled(job.token) {
            shared.complete(job.token, -(libc::ECANCELED as i64));
            continue;
        }
        // Safety: as in `reader_loop`.
        let buf = unsafe { std::slice::from_raw_parts(job.buf.ptr, job.buf.len) };

        let mut done = 0;
        let result = loop {
            if done == buf.len() {
                break done as i64;
            }
            match sink.write_at(job.offset + done as u64, &buf[done..]) {
                Ok(0) => break done as i64,
                Ok(n) => done += n,
                Err(DmacapError::Io(e)) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(offset = job.offset, error = %e, "sink write failed");
                    break -(e.errno() as i64);
                }
            }
        };
        shared.complete(job.token, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::sink::{FileSink, FilterSink};
    use dmacap_core::config::{DeviceConfig, PipelineConfig};
    use dmacap_driver::sim::{pattern_byte, SimController};
    use dmacap_driver::Device;
    use std::io::Cursor;
    use std::sync::atomic::AtomicU64;

    fn source(n: usize) -> Vec<u8> {
        (0..n as u64).map(pattern_byte).collect()
    }

    /// Records writes in memory and counts bytes accepted.
    #[derive(Default)]
    struct MemSink {
        data: Mutex<Vec<u8>>,
        written: Arc<AtomicU64>,
    }

    impl ByteSink for MemSink {
        fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<usize> {
            let mut data = lock(&self.data);
            let end = offset as usize + bytes.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[offset as usize..end].copy_from_slice(bytes);
            self.written.fetch_add(bytes.len() as u64, Ordering::SeqCst);
            Ok(bytes.len())
        }

        fn raw_fd(&self) -> std::os::unix::io::RawFd {
            -1
        }

        fn finish(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_file_to_file_copy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copy.bin");
        let input = source(64 * 1024);

        let sink = FileSink::create(&path).unwrap();
        let q = WorkerQueue::new(Cursor::new(input.clone()), sink, 4, 8).unwrap();
        let config = PipelineConfig::new().block_size(4096).concurrency(8).target_blocks(16);
        let mut p = Pipeline::new(q, config).unwrap();

        let report = p.run().unwrap();
        assert_eq!(report.bytes_written, input.len() as u64);

        let (_src, mut sink) = p.into_queue().shutdown().unwrap();
        sink.finish().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), input);
    }

    #[test]
    fn test_stream_sink_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("piped.bin");
        let input = source(32 * 1024);

        let sink = FilterSink::spawn("cat", &[], &path, 64 * 1024).unwrap();
        let q = WorkerQueue::new(Cursor::new(input.clone()), sink, 4, 4).unwrap();
        let config = PipelineConfig::new().block_size(1024).concurrency(4).target_blocks(32);
        let mut p = Pipeline::new(q, config).unwrap();
        p.run().unwrap();

        let (_src, mut sink) = p.into_queue().shutdown().unwrap();
        sink.finish().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), input);
    }

    #[test]
    fn test_exhausted_source_is_short_completion() {
        let q = WorkerQueue::new(Cursor::new(source(5000)), MemSink::default(), 2, 4).unwrap();
        let config = PipelineConfig::new().block_size(1024).concurrency(4).target_blocks(8);
        let mut p = Pipeline::new(q, config).unwrap();

        let err = p.run().unwrap_err();
        assert!(matches!(
            err,
            DmacapError::ShortCompletion { requested: 1024, transferred: 904 }
        ));
        assert_eq!(p.queue().inflight(), 0);
    }

    #[test]
    fn test_cancel_unblocks_session_read() {
        let ctrl = SimController::new();
        let dev = Device::new(ctrl, DeviceConfig::new().ring_size(4096), None).unwrap();
        let session = dev.open().unwrap();
        let closer = session.closer();

        let mut q = WorkerQueue::new(session, MemSink::default(), 1, 2).unwrap();
        q.set_interrupt(move || closer.cancel());

        let mut buf = vec![0u8; 512];
        unsafe { q.submit_read(Token(0), IoBuf::from_slice(&mut buf)).unwrap() };
        q.flush().unwrap();
        thread::sleep(Duration::from_millis(30));

        q.cancel(Token(0)).unwrap();
        let c = q.wait().unwrap();
        assert_eq!(c.token, Token(0));
        assert!(c.is_err());

        let (mut session, _sink) = q.shutdown().unwrap();
        session.close();
        assert!(!dev.is_active());
    }

    #[test]
    fn test_simulated_device_end_to_end() {
        const RING: usize = 64 * 1024;
        const BLOCK: usize = 4096;
        const BLOCKS: u64 = 48;

        let ctrl = SimController::new();
        let dev = Device::new(ctrl.clone(), DeviceConfig::new().ring_size(RING), None).unwrap();
        let session = dev.open().unwrap();

        let sink = MemSink::default();
        let written = Arc::clone(&sink.written);

        // Producer never gets more than a ring ahead of what reached the sink.
        let producer = ctrl.producer();
        let done = Arc::new(AtomicBool::new(false));
        let done2 = Arc::clone(&done);
        let feeder = thread::spawn(move || {
            let mut pos: u64 = 0;
            let chunk = 1000u64;
            while !done2.load(Ordering::SeqCst) {
                if pos + chunk - written.load(Ordering::SeqCst) > RING as u64 {
                    thread::yield_now();
                    continue;
                }
                let bytes: Vec<u8> = (pos..pos + chunk).map(pattern_byte).collect();
                pos += producer.produce(&bytes) as u64;
            }
        });

        let q = WorkerQueue::new(session, sink, 2, 8).unwrap();
        let config = PipelineConfig::new()
            .block_size(BLOCK)
            .concurrency(4)
            .target_blocks(BLOCKS);
        let mut p = Pipeline::new(q, config).unwrap();
        let report = p.run().unwrap();
        assert!(report.max_outstanding <= 4);

        let (mut session, sink) = p.into_queue().shutdown().unwrap();
        assert_eq!(session.stats().overruns, 0);
        session.close();
        done.store(true, Ordering::SeqCst);
        feeder.join().unwrap();

        let data = lock(&sink.data);
        assert_eq!(data.len() as u64, BLOCKS * BLOCK as u64);
        for (i, b) in data.iter().enumerate() {
            assert_eq!(*b, pattern_byte(i as u64), "mismatch at {}", i);
        }
    }
}
