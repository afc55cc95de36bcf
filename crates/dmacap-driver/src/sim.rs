//! `SimController` — software DMA engine.
//!
//! Stands in for the peripheral + DMA controller pair. The "hardware" side
//! is a [`SimProducer`]: tests call `produce()` directly to place bytes in
//! the ring at the live cursor, and the capture binary runs a [`Feeder`]
//! thread that produces a verifiable byte pattern at a fixed rate.
//!
//! Behaviour matches what the driver expects from a real engine:
//! - cyclic transfers notify once per completed period,
//! - `tx_status` residue counts down to the end of the ring, and
//!   `in_flight` covers the step being written but not yet committed,
//! - `terminate_sync` waits for an in-progress produce to finish,
//! - one RX and one TX channel; a second request is `ResourceUnavailable`.

use std::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use dmacap_core::dma::{
    Cookie, DmaBuffer, DmaChannel, DmaController, Direction, TxState, TxStatus,
};
use dmacap_core::error::{DmacapError, Result};
use dmacap_core::notifier::Notifier;
use tracing::{debug, trace, warn};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Byte the feeder writes at absolute stream position `pos`.
#[inline]
pub fn pattern_byte(pos: u64) -> u8 {
    (pos % 251) as u8
}

/// Called with the claimed end position after a step's bytes are in the
/// ring and before the cursor moves.
pub type StepHook = Arc<dyn Fn(u64) + Send + Sync>;

/// Shared state between controller, channels and producers.
struct SimInner {
    rx_claimed: AtomicBool,
    tx_claimed: AtomicBool,
    offline: AtomicBool,
    fail_alloc: AtomicBool,
    tx_stall: AtomicBool,
    next_bus: AtomicU64,
    next_cookie: AtomicI32,
    /// The running cyclic transfer, if any.
    cyclic: Mutex<Option<Arc<SimCyclic>>>,
    /// Everything the TX side has "sent".
    transmitted: Mutex<Vec<u8>>,
    step_hook: Mutex<Option<StepHook>>,
}

/// One cyclic transfer.
struct SimCyclic {
    ring: Arc<DmaBuffer>,
    period: usize,
    notifier: Arc<dyn Notifier>,
    cookie: Cookie,
    /// Absolute bytes produced since start.
    pos: AtomicU64,
    /// End of the step being written; equals `pos` between steps.
    claimed: AtomicU64,
    running: AtomicBool,
    error: AtomicBool,
    /// Held for the whole of a produce call; terminate takes it to wait
    /// for the engine to go quiet.
    engine: Mutex<()>,
}

impl SimCyclic {
    fn produce(&self, data: &[u8], hook: Option<&StepHook>) -> usize {
        let _engine = lock(&self.engine);
        if !self.running.load(Ordering::Acquire) {
            return 0;
        }

        let size = self.ring.len() as u64;
        let period = self.period as u64;
        let mut pos = self.pos.load(Ordering::Relaxed);
        let mut rest = data;

        while !rest.is_empty() {
            // Never cross a period boundary (or the ring end) in one step.
            let to_boundary = period - (pos % period);
            let n = (rest.len() as u64).min(to_boundary) as usize;
            let off = (pos % size) as usize;
            let end = pos + n as u64;

            // Claim before touching the ring; pairs with the reader's
            // fence between its copy and the status re-sample.
            self.claimed.store(end, Ordering::Relaxed);
            fence(Ordering::SeqCst);

            // Safety: the reader only keeps bytes of [read, write) that
            // no claim reached by the time its copy finished.
            if unsafe { self.ring.copy_in(off, &rest[..n]) }.is_err() {
                self.error.store(true, Ordering::Release);
                self.claimed.store(pos, Ordering::Release);
                return data.len() - rest.len();
            }
            if let Some(hook) = hook {
                hook(end);
            }

            pos = end;
            self.pos.store(pos, Ordering::Release);
            rest = &rest[n..];

            if pos % period == 0 {
                trace!(pos, "period complete");
                self.notifier.notify();
            }
        }
        data.len()
    }

    fn status(&self) -> TxStatus {
        let size = self.ring.len() as u64;
        // `pos` first: a claim read after it is never older.
        let pos = self.pos.load(Ordering::Acquire);
        let claimed = self.claimed.load(Ordering::Acquire);
        let state = if self.error.load(Ordering::Acquire) {
            TxState::Error
        } else if self.running.load(Ordering::Acquire) {
            TxState::InProgress
        } else {
            TxState::Complete
        };
        TxStatus {
            state,
            residue: (size - pos % size) as usize,
            in_flight: claimed.saturating_sub(pos) as usize,
        }
    }

    fn terminate(&self) {
        let _engine = lock(&self.engine);
        self.running.store(false, Ordering::Release);
    }
}

/// Software DMA controller.
#[derive(Clone)]
pub struct SimController {
    inner: Arc<SimInner>,
}

impl SimController {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SimInner {
                rx_claimed: AtomicBool::new(false),
                tx_claimed: AtomicBool::new(false),
                offline: AtomicBool::new(false),
                fail_alloc: AtomicBool::new(false),
                tx_stall: AtomicBool::new(false),
                next_bus: AtomicU64::new(0x1000_0000),
                next_cookie: AtomicI32::new(1),
                cyclic: Mutex::new(None),
                transmitted: Mutex::new(Vec::new()),
                step_hook: Mutex::new(None),
            }),
        }
    }

    /// Handle for the "hardware" side.
    pub fn producer(&self) -> SimProducer {
        SimProducer {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Make every `alloc_coherent` fail with `OutOfMemory`.
    pub fn set_fail_alloc(&self, fail: bool) {
        self.inner.fail_alloc.store(fail, Ordering::SeqCst);
    }

    /// Make every `request_channel` fail with `ResourceUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Hold one-shot TX transfers forever (to exercise timeouts).
    pub fn set_tx_stall(&self, stall: bool) {
        self.inner.tx_stall.store(stall, Ordering::SeqCst);
    }

    /// Run `hook` inside every produce step, between writing the ring and
    /// moving the cursor. The engine lock is held while it runs.
    pub fn set_step_hook(&self, hook: Option<StepHook>) {
        *lock(&self.inner.step_hook) = hook;
    }

    /// Bytes sent by completed one-shot TX transfers.
    pub fn transmitted(&self) -> Vec<u8> {
        lock(&self.inner.transmitted).clone()
    }

    /// True while a channel for `dir` is held.
    pub fn is_claimed(&self, dir: Direction) -> bool {
        match dir {
            Direction::DevToMem => self.inner.rx_claimed.load(Ordering::SeqCst),
            Direction::MemToDev => self.inner.tx_claimed.load(Ordering::SeqCst),
        }
    }
}

impl Default for SimController {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaController for SimController {
    type Channel = SimChannel;

    fn request_channel(&self, dir: Direction) -> Result<SimChannel> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(DmacapError::ResourceUnavailable("dma controller offline"));
        }
        let (flag, what) = match dir {
            Direction::DevToMem => (&self.inner.rx_claimed, "rx dma channel"),
            Direction::MemToDev => (&self.inner.tx_claimed, "tx dma channel"),
        };
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DmacapError::ResourceUnavailable(what));
        }
        debug!(?dir, "sim channel acquired");
        Ok(SimChannel {
            dir,
            inner: Arc::clone(&self.inner),
            prepared: Vec::new(),
            cyclic: None,
            singles: Vec::new(),
        })
    }

    fn alloc_coherent(&self, len: usize) -> Result<DmaBuffer> {
        if self.inner.fail_alloc.load(Ordering::SeqCst) {
            return Err(DmacapError::OutOfMemory(len));
        }
        let span = (len as u64 + 0xfff) & !0xfff;
        let bus = self.inner.next_bus.fetch_add(span, Ordering::SeqCst);
        DmaBuffer::alloc(len, Some(bus))
    }
}

enum Prepared {
    Cyclic(Arc<SimCyclic>),
    Single(SingleXfer),
}

struct SingleXfer {
    cookie: Cookie,
    buf: Arc<DmaBuffer>,
    len: usize,
    notifier: Arc<dyn Notifier>,
}

/// A claimed channel. Dropping it terminates and releases.
pub struct SimChannel {
    dir: Direction,
    inner: Arc<SimInner>,
    prepared: Vec<Prepared>,
    cyclic: Option<Arc<SimCyclic>>,
    /// Issued one-shot transfers with their completion flag.
    singles: Vec<(Cookie, bool)>,
}

impl SimChannel {
    fn cookie(&self) -> Cookie {
        Cookie(self.inner.next_cookie.fetch_add(1, Ordering::SeqCst))
    }
}

impl DmaChannel for SimChannel {
    fn direction(&self) -> Direction {
        self.dir
    }

    fn prep_cyclic(
        &mut self,
        buf: &Arc<DmaBuffer>,
        period_len: usize,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Cookie> {
        if self.dir != Direction::DevToMem {
            return Err(DmacapError::InvalidConfig("cyclic transfers are rx only"));
        }
        if period_len == 0 || buf.len() % period_len != 0 {
            return Err(DmacapError::InvalidConfig("period must divide the ring"));
        }
        let cookie = self.cookie();
        self.prepared.push(Prepared::Cyclic(Arc::new(SimCyclic {
            ring: Arc::clone(buf),
            period: period_len,
            notifier,
            cookie,
            pos: AtomicU64::new(0),
            claimed: AtomicU64::new(0),
            running: AtomicBool::new(false),
            error: AtomicBool::new(false),
            engine: Mutex::new(()),
        })));
        Ok(cookie)
    }

    fn prep_single(
        &mut self,
        buf: &Arc<DmaBuffer>,
        len: usize,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Cookie> {
        if self.dir != Direction::MemToDev {
            return Err(DmacapError::InvalidConfig("one-shot transfers are tx only"));
        }
        if len > buf.len() {
            return Err(DmacapError::Fault);
        }
        let cookie = self.cookie();
        self.prepared.push(Prepared::Single(SingleXfer {
            cookie,
            buf: Arc::clone(buf),
            len,
            notifier,
        }));
        Ok(cookie)
    }

    fn issue_pending(&mut self) {
        for prepared in std::mem::take(&mut self.prepared) {
            match prepared {
                Prepared::Cyclic(cyclic) => {
                    cyclic.running.store(true, Ordering::Release);
                    *lock(&self.inner.cyclic) = Some(Arc::clone(&cyclic));
                    self.cyclic = Some(cyclic);
                }
                Prepared::Single(xfer) => {
                    if self.inner.tx_stall.load(Ordering::SeqCst) {
                        self.singles.push((xfer.cookie, false));
                        continue;
                    }
                    let mut out = vec![0u8; xfer.len];
                    // Safety: the submitter does not touch the buffer until
                    // the completion fires.
                    let ok = unsafe { xfer.buf.copy_out(0, &mut out) }.is_ok();
                    if ok {
                        lock(&self.inner.transmitted).extend_from_slice(&out);
                    }
                    self.singles.push((xfer.cookie, ok));
                    xfer.notifier.notify();
                }
            }
        }
    }

    fn tx_status(&self, cookie: Cookie) -> TxStatus {
        if let Some(cyclic) = self.cyclic.as_ref().filter(|c| c.cookie == cookie) {
            return cyclic.status();
        }
        match self.singles.iter().find(|(c, _)| *c == cookie) {
            Some((_, true)) => TxStatus { state: TxState::Complete, residue: 0, in_flight: 0 },
            Some((_, false)) => TxStatus { state: TxState::InProgress, residue: 1, in_flight: 0 },
            None => TxStatus { state: TxState::Complete, residue: 0, in_flight: 0 },
        }
    }

    fn terminate_sync(&mut self) {
        self.prepared.clear();
        self.singles.clear();
        if let Some(cyclic) = self.cyclic.take() {
            cyclic.terminate();
            let mut current = lock(&self.inner.cyclic);
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &cyclic)) {
                *current = None;
            }
        }
    }
}

impl Drop for SimChannel {
    fn drop(&mut self) {
        self.terminate_sync();
        let flag = match self.dir {
            Direction::DevToMem => &self.inner.rx_claimed,
            Direction::MemToDev => &self.inner.tx_claimed,
        };
        flag.store(false, Ordering::SeqCst);
        debug!(dir = ?self.dir, "sim channel released");
    }
}

/// The hardware side of the simulated peripheral.
#[derive(Clone)]
pub struct SimProducer {
    inner: Arc<SimInner>,
}

impl SimProducer {
    fn current(&self) -> Option<Arc<SimCyclic>> {
        lock(&self.inner.cyclic).clone()
    }

    /// Write `data` at the live cursor of the running cyclic transfer.
    /// Returns bytes accepted (0 if nothing is running).
    pub fn produce(&self, data: &[u8]) -> usize {
        let hook = lock(&self.inner.step_hook).clone();
        match self.current() {
            Some(cyclic) => cyclic.produce(data, hook.as_ref()),
            None => 0,
        }
    }

    /// Absolute bytes produced into the running transfer.
    pub fn position(&self) -> Option<u64> {
        self.current().map(|c| c.pos.load(Ordering::Acquire))
    }

    /// Flag a transfer error on the running transfer.
    pub fn inject_error(&self) {
        if let Some(cyclic) = self.current() {
            cyclic.error.store(true, Ordering::Release);
        }
    }

    /// Start a thread producing [`pattern_byte`] data in `chunk`-sized
    /// steps, throttled to `rate` bytes/s when given.
    pub fn spawn_feeder(&self, chunk: usize, rate: Option<u64>) -> Result<Feeder> {
        let producer = self.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);
        let chunk = chunk.max(1);

        let handle = thread::Builder::new()
            .name("dmacap-sim-feeder".into())
            .spawn(move || feeder_loop(producer, stop2, chunk, rate))?;

        Ok(Feeder {
            stop,
            handle: Some(handle),
        })
    }
}

fn feeder_loop(producer: SimProducer, stop: Arc<AtomicBool>, chunk: usize, rate: Option<u64>) -> u64 {
    let start = Instant::now();
    let mut produced: u64 = 0;
    let mut buf = vec![0u8; chunk];

    while !stop.load(Ordering::Relaxed) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = pattern_byte(produced + i as u64);
        }
        let n = producer.produce(&buf);
        if n == 0 {
            // No session yet (or between sessions).
            thread::sleep(Duration::from_millis(1));
            continue;
        }
        if n < buf.len() {
            warn!(accepted = n, "sim engine stopped mid-chunk");
        }
        produced += n as u64;

        if let Some(rate) = rate.filter(|r| *r > 0) {
            let due = Duration::from_secs_f64(produced as f64 / rate as f64);
            let elapsed = start.elapsed();
            if due > elapsed {
                thread::sleep(due - elapsed);
            }
        }
    }
    produced
}

/// Running feeder thread.
pub struct Feeder {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<u64>>,
}

impl Feeder {
    /// Stop producing and return the number of bytes produced.
    pub fn stop(mut self) -> u64 {
        self.halt()
    }

    fn halt(&mut self) -> u64 {
        self.stop.store(true, Ordering::SeqCst);
        self.handle
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or(0)
    }
}

impl Drop for Feeder {
    fn drop(&mut self) {
        self.halt();
    }
}
