//! dmacap configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration priority (highest wins)
//!
//! 1. Builder calls / CLI flags
//! 2. Environment variables (`DMACAP_*`)
//! 3. Library defaults (`defaults` module)
//!
//! ```rust,ignore
//! use dmacap_core::config::PipelineConfig;
//!
//! let config = PipelineConfig::from_env()
//!     .block_size(1 << 20)
//!     .concurrency(8);
//! config.validate()?;
//! ```

use std::time::Duration;

use crate::env::{env_get, env_get_opt, env_get_size};
use crate::error::{DmacapError, Result};

/// Library defaults.
pub mod defaults {
    /// Ring size in bytes. Two periods of 2 MiB.
    pub const RING_SIZE: usize = 4 * 1024 * 1024;
    /// Smallest ring accepted: two periods of two 4-byte bus words.
    pub const MIN_RING_SIZE: usize = 16;
    /// Payloads shorter than this go through direct register writes.
    pub const DIRECT_THRESHOLD: usize = 2;
    /// Upper bound on a one-shot transmit DMA transfer.
    pub const TX_TIMEOUT_MS: u64 = 10_000;

    /// Bytes per pipeline read/write.
    pub const BLOCK_SIZE: usize = 10 * 1024 * 1024;
    /// Outstanding reads + writes.
    pub const CONCURRENCY: usize = 10;
    /// Submission queue entries for the io_uring backend.
    pub const QUEUE_DEPTH: u32 = 64;
    /// Worker threads for the blocking backend.
    pub const WORKERS: usize = 4;
}

/// Driver-side configuration: one instance per device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Cyclic ring size in bytes (power of two).
    pub ring_size: usize,
    /// Writes shorter than this bypass DMA.
    pub direct_threshold: usize,
    /// Wait bound for one-shot transmit completion.
    pub tx_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceConfig {
    /// Library defaults, no environment lookup.
    pub fn new() -> Self {
        Self {
            ring_size: defaults::RING_SIZE,
            direct_threshold: defaults::DIRECT_THRESHOLD,
            tx_timeout: Duration::from_millis(defaults::TX_TIMEOUT_MS),
        }
    }

    /// Defaults with environment overrides:
    /// - `DMACAP_RING_SIZE` - ring size, suffixes allowed
    /// - `DMACAP_DIRECT_THRESHOLD` - direct-write threshold in bytes
    /// - `DMACAP_TX_TIMEOUT_MS` - transmit completion timeout
    pub fn from_env() -> Self {
        Self {
            ring_size: env_get_size("DMACAP_RING_SIZE", defaults::RING_SIZE),
            direct_threshold: env_get("DMACAP_DIRECT_THRESHOLD", defaults::DIRECT_THRESHOLD),
            tx_timeout: Duration::from_millis(env_get(
                "DMACAP_TX_TIMEOUT_MS",
                defaults::TX_TIMEOUT_MS,
            )),
        }
    }

    pub fn ring_size(mut self, size: usize) -> Self {
        self.ring_size = size;
        self
    }

    pub fn direct_threshold(mut self, n: usize) -> Self {
        self.direct_threshold = n;
        self
    }

    pub fn tx_timeout(mut self, d: Duration) -> Self {
        self.tx_timeout = d;
        self
    }

    /// Half the ring: the completion-interrupt granularity.
    pub fn period(&self) -> usize {
        self.ring_size / 2
    }

    pub fn validate(&self) -> Result<()> {
        validate_ring_size(self.ring_size)?;
        if self.tx_timeout.is_zero() {
            return Err(DmacapError::InvalidConfig("tx_timeout must be > 0"));
        }
        Ok(())
    }
}

/// Ring size rule shared by config validation and ring start.
pub fn validate_ring_size(ring_size: usize) -> Result<()> {
    if !ring_size.is_power_of_two() {
        return Err(DmacapError::InvalidConfig("ring_size must be a power of two"));
    }
    if ring_size < defaults::MIN_RING_SIZE {
        return Err(DmacapError::InvalidConfig("ring_size must be >= 16"));
    }
    Ok(())
}

/// User-side pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bytes per read (and per write).
    pub block_size: usize,
    /// Cap on outstanding reads + writes.
    pub concurrency: usize,
    /// Stop after this many bytes are written. `None` runs until stopped.
    pub target_bytes: Option<u64>,
    /// io_uring submission queue entries.
    pub queue_depth: u32,
    /// Threads for the blocking worker backend.
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self {
            block_size: defaults::BLOCK_SIZE,
            concurrency: defaults::CONCURRENCY,
            target_bytes: None,
            queue_depth: defaults::QUEUE_DEPTH,
            workers: defaults::WORKERS,
        }
    }

    /// Defaults with environment overrides:
    /// - `DMACAP_BLOCK_SIZE` - bytes per block, suffixes allowed
    /// - `DMACAP_CONCURRENCY` - in-flight depth
    /// - `DMACAP_TARGET_BYTES` - stop after this many bytes
    /// - `DMACAP_QUEUE_DEPTH` - io_uring SQ entries
    /// - `DMACAP_WORKERS` - worker backend threads
    pub fn from_env() -> Self {
        Self {
            block_size: env_get_size("DMACAP_BLOCK_SIZE", defaults::BLOCK_SIZE),
            concurrency: env_get("DMACAP_CONCURRENCY", defaults::CONCURRENCY),
            target_bytes: env_get_opt("DMACAP_TARGET_BYTES"),
            queue_depth: env_get("DMACAP_QUEUE_DEPTH", defaults::QUEUE_DEPTH),
            workers: env_get("DMACAP_WORKERS", defaults::WORKERS),
        }
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn target_bytes(mut self, bytes: Option<u64>) -> Self {
        self.target_bytes = bytes;
        self
    }

    /// Convenience: target of `n` whole blocks.
    pub fn target_blocks(self, n: u64) -> Self {
        let bytes = n.saturating_mul(self.block_size as u64);
        self.target_bytes(Some(bytes))
    }

    pub fn queue_depth(mut self, depth: u32) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    /// Number of blocks the target requires, if bounded.
    pub fn target_blocks_count(&self) -> Option<u64> {
        self.target_bytes.map(|t| t / self.block_size.max(1) as u64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(DmacapError::InvalidConfig("block_size must be > 0"));
        }
        if self.block_size > u32::MAX as usize {
            return Err(DmacapError::InvalidConfig("block_size must fit in 32 bits"));
        }
        if self.concurrency == 0 {
            return Err(DmacapError::InvalidConfig("concurrency must be > 0"));
        }
        if self.concurrency > self.queue_depth as usize {
            return Err(DmacapError::InvalidConfig("concurrency must be <= queue_depth"));
        }
        if let Some(target) = self.target_bytes {
            if target % self.block_size as u64 != 0 {
                return Err(DmacapError::InvalidConfig(
                    "target_bytes must be a multiple of block_size",
                ));
            }
        }
        if self.workers == 0 {
            return Err(DmacapError::InvalidConfig("workers must be > 0"));
        }
        Ok(())
    }
}
