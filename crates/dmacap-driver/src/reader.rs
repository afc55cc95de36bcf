//! Consumer read protocol.
//!
//! Wait for the completion signal, re-derive the write cursor from the live
//! residue, then copy `min(buf.len(), available)` bytes out of the ring in
//! at most two pieces (tail of ring, then head).
//!
//! The consumer keeps an absolute read position. Together with the period
//! counter this tells a lapped ring apart from an empty one:
//!
//! ```text
//!   produced (A) ──────────────────────────────┐
//!   read_pos ───────────┐                      │
//!                       ▼                      ▼
//!   ... ──────────[ unread, <= ring_size ]─────── ...   ok
//!   ... ──[ lost ][ unread == ring_size      ]─── ...   overrun
//! ```

use std::sync::atomic::{fence, Ordering};
use std::time::{Duration, Instant};

use dmacap_core::dma::DmaChannel;
use dmacap_core::error::{DmacapError, Result};
use tracing::{trace, warn};

use crate::cursor::{lead, lead_claimed, Lead};
use crate::ring::RingManager;
use crate::signal::CompletionSignal;

/// Per-session read counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Bytes handed to the caller.
    pub bytes: u64,
    /// Successful reads.
    pub reads: u64,
    /// Overruns reported.
    pub overruns: u64,
    /// Lower bound on bytes dropped by overruns.
    pub lost: u64,
}

/// Consumer side of one session.
#[derive(Debug, Default)]
pub struct RxState {
    read_pos: u64,
    stats: ReadStats,
}

impl RxState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absolute consumer position.
    #[inline]
    pub fn position(&self) -> u64 {
        self.read_pos
    }

    #[inline]
    pub fn stats(&self) -> ReadStats {
        self.stats
    }

    fn overrun(&mut self, lost: u64, resume_at: u64, signal: &CompletionSignal) -> DmacapError {
        warn!(lost, from = self.read_pos, resume_at, "ring overrun, resyncing");
        self.read_pos = resume_at;
        self.stats.overruns += 1;
        self.stats.lost += lost;
        signal.clear();
        DmacapError::Overrun { lost }
    }

    /// Blocking read of up to `buf.len()` bytes.
    ///
    /// `timeout` bounds the total time spent waiting for the signal.
    pub fn read<C: DmaChannel>(
        &mut self,
        ring: &RingManager<C>,
        signal: &CompletionSignal,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let geom = ring.geometry();
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            signal.wait(remaining)?;

            // Period count first: a cursor sampled after it can only be newer.
            let periods = signal.periods();
            let write = ring.write_cursor()?;

            let avail = match lead(&geom, self.read_pos, periods, write) {
                Lead::Overrun { lost, resume_at } => {
                    return Err(self.overrun(lost, resume_at, signal));
                }
                Lead::Available(0) => {
                    trace!(periods, write, "spurious wake");
                    signal.clear_seen(periods);
                    continue;
                }
                Lead::Available(n) => n,
            };

            let ring_buf = ring.ring().ok_or(DmacapError::SessionClosed)?;
            let n = avail.min(buf.len());
            let off = geom.offset(self.read_pos);
            let (tail, head) = geom.split(off, n);

            // Safety: [read_pos, read_pos + n) is behind the producer; the
            // lap check below rejects the copy if it was overwritten meanwhile.
            unsafe {
                ring_buf.copy_out(off, &mut buf[..tail])?;
                if head > 0 {
                    ring_buf.copy_out(0, &mut buf[tail..n])?;
                }
            }

            // The copy must be complete before the engine is re-sampled;
            // a step it is still writing counts against us.
            fence(Ordering::SeqCst);
            let periods_after = signal.periods();
            let (write_after, in_flight) = ring.write_window()?;
            if let Lead::Overrun { lost, resume_at } =
                lead_claimed(&geom, self.read_pos, periods_after, write_after, in_flight)
            {
                return Err(self.overrun(lost, resume_at, signal));
            }

            self.read_pos += n as u64;
            self.stats.bytes += n as u64;
            self.stats.reads += 1;

            // Leftovers keep the bit set so the next read does not block.
            if n == avail {
                signal.clear_seen(periods);
            }
            trace!(n, avail, off, split = head > 0, "read");
            return Ok(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimController;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn setup(size: usize) -> (SimController, RingManager<crate::sim::SimChannel>, Arc<CompletionSignal>) {
        let ctrl = SimController::new();
        let signal = Arc::new(CompletionSignal::new());
        let ring = RingManager::start(&ctrl, size, signal.clone()).unwrap();
        (ctrl, ring, signal)
    }

    fn seq(from: u8, n: usize) -> Vec<u8> {
        (0..n).map(|i| from.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_wraparound_read_returns_tail_then_head() {
        let (ctrl, ring, signal) = setup(16);
        let p = ctrl.producer();
        let mut rx = RxState::new();

        p.produce(&seq(0, 12));
        let mut buf = [0u8; 12];
        assert_eq!(rx.read(&ring, &signal, &mut buf, None).unwrap(), 12);
        assert_eq!(rx.position(), 12);

        // producer wraps: write cursor 4, read cursor 12
        p.produce(&seq(12, 8));
        assert_eq!(ring.write_cursor().unwrap(), 4);

        let mut big = [0u8; 100];
        let n = rx.read(&ring, &signal, &mut big, None).unwrap();
        assert_eq!(n, 8);
        assert_eq!(&big[..8], &seq(12, 8)[..]);
        // nothing written past the returned count
        assert!(big[8..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_read_clamps_to_buffer() {
        let (ctrl, ring, signal) = setup(16);
        let p = ctrl.producer();
        let mut rx = RxState::new();

        p.produce(&seq(0, 12));
        let mut buf = [0u8; 12];
        rx.read(&ring, &signal, &mut buf, None).unwrap();

        // wrapped region of 8, caller asks for 5
        p.produce(&seq(12, 8));
        let mut small = [0u8; 5];
        assert_eq!(rx.read(&ring, &signal, &mut small, None).unwrap(), 5);
        assert_eq!(small, [12, 13, 14, 15, 16]);

        // leftovers did not clear the signal
        assert!(signal.is_pending());
        let mut rest = [0u8; 16];
        let n = rx.read(&ring, &signal, &mut rest, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(&rest[..n], &[17, 18, 19]);
        assert!(!signal.is_pending());
    }

    #[test]
    fn test_zero_length_buffer() {
        let (_ctrl, ring, signal) = setup(16);
        let mut rx = RxState::new();
        assert_eq!(rx.read(&ring, &signal, &mut [], None).unwrap(), 0);
    }

    #[test]
    fn test_timeout_without_data() {
        let (_ctrl, ring, signal) = setup(16);
        let mut rx = RxState::new();
        let mut buf = [0u8; 4];
        let r = rx.read(&ring, &signal, &mut buf, Some(Duration::from_millis(20)));
        assert!(matches!(r, Err(DmacapError::TimedOut)));
        assert_eq!(rx.stats(), ReadStats::default());
    }

    #[test]
    fn test_overrun_reported_then_recovers() {
        let (ctrl, ring, signal) = setup(16);
        let p = ctrl.producer();
        let mut rx = RxState::new();

        // 40 bytes with nothing read: 24 lost
        p.produce(&seq(0, 40));
        let mut buf = [0u8; 16];
        let r = rx.read(&ring, &signal, &mut buf, None);
        assert!(matches!(r, Err(DmacapError::Overrun { lost: 24 })));
        assert_eq!(rx.position(), 40);
        assert_eq!(rx.stats().overruns, 1);

        // next read sees only fresh data
        p.produce(&seq(40, 8));
        let n = rx.read(&ring, &signal, &mut buf, None).unwrap();
        assert_eq!(&buf[..n], &seq(40, 8)[..]);
    }

    #[test]
    fn test_lap_during_copy_is_overrun() {
        let (ctrl, ring, signal) = setup(16);
        let p = ctrl.producer();
        p.produce(&seq(0, 12));

        // Park the engine after it has rewritten [0, 4) for the next lap
        // but before its cursor moves past 16.
        let gate = Arc::new(Barrier::new(2));
        let g = Arc::clone(&gate);
        ctrl.set_step_hook(Some(Arc::new(move |end| {
            if end == 20 {
                g.wait();
                g.wait();
            }
        })));
        let engine = {
            let p = p.clone();
            thread::spawn(move || p.produce(&seq(12, 8)))
        };
        gate.wait();

        let mut rx = RxState::new();
        let mut buf = [0u8; 16];
        let r = rx.read(&ring, &signal, &mut buf, None);
        assert!(matches!(r, Err(DmacapError::Overrun { lost: 4 })));
        assert_eq!(rx.position(), 16);
        assert_eq!(rx.stats().bytes, 0);

        gate.wait();
        assert_eq!(engine.join().unwrap(), 8);
        ctrl.set_step_hook(None);

        // resumes on the bytes that replaced the lost ones
        p.produce(&seq(20, 4));
        let n = rx.read(&ring, &signal, &mut buf, None).unwrap();
        assert_eq!(&buf[..n], &seq(16, 8)[..]);
    }

    #[test]
    fn test_full_ring_is_not_overrun() {
        let (ctrl, ring, signal) = setup(16);
        let p = ctrl.producer();
        let mut rx = RxState::new();

        p.produce(&seq(0, 16));
        let mut buf = [0u8; 32];
        assert_eq!(rx.read(&ring, &signal, &mut buf, None).unwrap(), 16);
        assert_eq!(&buf[..16], &seq(0, 16)[..]);
    }

    #[test]
    fn test_closed_signal_unblocks() {
        let (_ctrl, ring, signal) = setup(16);
        let mut rx = RxState::new();
        signal.close();
        let mut buf = [0u8; 4];
        assert!(matches!(
            rx.read(&ring, &signal, &mut buf, None),
            Err(DmacapError::SessionClosed)
        ));
    }
}
