//! Throughput accounting.
//!
//! Every finished block carries three latencies: read (submit → read
//! completion), write (write submit → write completion) and end to end.
//! With `concurrency` blocks in flight, one block per `end_to_end` is only
//! the single-lane rate, so the estimate scales it by the depth.

use std::fmt;
use std::time::{Duration, Instant};

/// Smoothing factor for the moving estimate.
const EWMA_ALPHA: f64 = 0.2;

/// Latencies of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTiming {
    pub read: Duration,
    pub write: Duration,
    pub end_to_end: Duration,
}

/// Running totals plus an EWMA of the pipelined rate.
#[derive(Debug, Clone)]
pub struct Throughput {
    block_size: usize,
    concurrency: usize,
    blocks: u64,
    read_total: Duration,
    write_total: Duration,
    e2e_total: Duration,
    ewma_bps: Option<f64>,
    started: Instant,
}

impl Throughput {
    pub fn new(block_size: usize, concurrency: usize) -> Self {
        Self {
            block_size,
            concurrency: concurrency.max(1),
            blocks: 0,
            read_total: Duration::ZERO,
            write_total: Duration::ZERO,
            e2e_total: Duration::ZERO,
            ewma_bps: None,
            started: Instant::now(),
        }
    }

    /// `block_size / end_to_end * concurrency`, in bytes per second.
    pub fn block_rate(&self, end_to_end: Duration) -> Option<f64> {
        let secs = end_to_end.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        Some(self.block_size as f64 / secs * self.concurrency as f64)
    }

    /// Fold one finished block in. Returns the block's own rate estimate.
    pub fn record(&mut self, timing: BlockTiming) -> Option<f64> {
        self.blocks += 1;
        self.read_total += timing.read;
        self.write_total += timing.write;
        self.e2e_total += timing.end_to_end;

        let rate = self.block_rate(timing.end_to_end)?;
        self.ewma_bps = Some(match self.ewma_bps {
            None => rate,
            Some(prev) => prev + EWMA_ALPHA * (rate - prev),
        });
        Some(rate)
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Moving estimate of sustained throughput.
    pub fn estimate_bps(&self) -> f64 {
        self.ewma_bps.unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> ThroughputSnapshot {
        let avg = |total: Duration| match self.blocks {
            0 => Duration::ZERO,
            n => total / n.min(u32::MAX as u64) as u32,
        };
        let bytes = self.blocks * self.block_size as u64;
        let elapsed = self.started.elapsed();
        let wall_bps = match elapsed.as_secs_f64() {
            s if s > 0.0 => bytes as f64 / s,
            _ => 0.0,
        };
        ThroughputSnapshot {
            blocks: self.blocks,
            bytes,
            avg_read: avg(self.read_total),
            avg_write: avg(self.write_total),
            avg_end_to_end: avg(self.e2e_total),
            estimate_bps: self.estimate_bps(),
            wall_bps,
        }
    }
}

/// Point-in-time summary.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThroughputSnapshot {
    pub blocks: u64,
    pub bytes: u64,
    pub avg_read: Duration,
    pub avg_write: Duration,
    pub avg_end_to_end: Duration,
    /// Moving estimate (depth-scaled).
    pub estimate_bps: f64,
    /// Bytes over wall-clock time since start.
    pub wall_bps: f64,
}

/// Human-readable byte rate.
pub fn format_rate(bps: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KiB/s", "MiB/s", "GiB/s"];
    let mut v = bps;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", v, UNITS[unit])
}

impl fmt::Display for ThroughputSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} blocks, {} bytes, read {:?}, write {:?}, e2e {:?}, est {}, wall {}",
            self.blocks,
            self.bytes,
            self.avg_read,
            self.avg_write,
            self.avg_end_to_end,
            format_rate(self.estimate_bps),
            format_rate(self.wall_bps),
        )
    }
}
