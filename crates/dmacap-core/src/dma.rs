//! DMA engine abstraction.
//!
//! Mirrors the shape of a slave DMA engine API: a controller hands out
//! channels and coherent memory; a channel accepts prepared transfers
//! (cyclic or one-shot), starts them on `issue_pending`, reports live
//! progress through `tx_status`, and stops synchronously on
//! `terminate_sync`.
//!
//! # Implementors
//!
//! - `SimController` / `SimChannel` (driver crate): a software engine whose
//!   "hardware" is a producer thread or a test calling `produce()`.
//! - A real platform binding would wrap the kernel's dmaengine calls.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{DmacapError, Result};
use crate::notifier::Notifier;

/// Transfer direction of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Peripheral FIFO → memory (receive ring).
    DevToMem,
    /// Memory → peripheral FIFO (transmit).
    MemToDev,
}

/// Handle to a submitted transfer, as returned by `prep_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Cookie(pub i32);

/// Coarse transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    InProgress,
    Paused,
    Complete,
    Error,
}

/// Live status of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxStatus {
    pub state: TxState,
    /// Bytes left before the end of the transfer buffer. For a cyclic
    /// transfer this counts down to the end of the ring, then reloads.
    pub residue: usize,
    /// Bytes the engine may already be writing past the residue cursor
    /// (burst or FIFO drain not yet reflected in the residue).
    pub in_flight: usize,
}

/// Cache-line alignment for DMA targets.
const DMA_ALIGN: usize = 64;

/// A DMA-capable buffer: process-visible address plus bus address.
///
/// The hardware writes through the bus address while software reads through
/// `as_ptr()`. Contents are therefore only meaningful for ranges the caller
/// knows the engine is not currently writing.
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    len: usize,
    bus_addr: u64,
}

// Safety: the buffer is a plain heap allocation. Concurrent access is
// coordinated by the ring cursors; all raw accesses go through the unsafe
// copy methods whose callers uphold the range contract.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Allocate `len` zeroed bytes. `bus_addr` is whatever the controller
    /// mapped for the device; `None` uses the process address (no IOMMU).
    pub fn alloc(len: usize, bus_addr: Option<u64>) -> Result<Self> {
        if len == 0 {
            return Err(DmacapError::InvalidConfig("DMA buffer length must be > 0"));
        }
        let layout =
            Layout::from_size_align(len, DMA_ALIGN).map_err(|_| DmacapError::OutOfMemory(len))?;
        // Safety: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(DmacapError::OutOfMemory(len))?;
        Ok(Self {
            ptr,
            len,
            bus_addr: bus_addr.unwrap_or(raw as u64),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the buffer.
    ///
    /// # Safety
    /// The engine must not be writing `[offset, offset + dst.len())` while
    /// the copy runs.
    pub unsafe fn copy_out(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let end = offset.checked_add(dst.len()).ok_or(DmacapError::Fault)?;
        if end > self.len {
            return Err(DmacapError::Fault);
        }
        std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        Ok(())
    }

    /// Copy `src` into the buffer at `offset`. This is the engine's side.
    ///
    /// # Safety
    /// No reader may be copying `[offset, offset + src.len())` concurrently.
    pub unsafe fn copy_in(&self, offset: usize, src: &[u8]) -> Result<()> {
        let end = offset.checked_add(src.len()).ok_or(DmacapError::Fault)?;
        if end > self.len {
            return Err(DmacapError::Fault);
        }
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        Ok(())
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        // Safety: ptr was allocated in `alloc` with exactly this layout.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.len, DMA_ALIGN);
            alloc::dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("len", &self.len)
            .field("bus_addr", &format_args!("{:#x}", self.bus_addr))
            .finish()
    }
}

/// One DMA channel. Dropping it releases the channel to the controller.
///
/// **Contract:**
/// - `prep_*` only queues; nothing moves until `issue_pending()`.
/// - The notifier is invoked from the engine's completion context and must
///   not block.
/// - `tx_status()` reflects live hardware position; callers must not cache it.
/// - `terminate_sync()` returns only once no further notifier calls or
///   buffer writes can happen for any transfer on this channel.
pub trait DmaChannel: Send {
    fn direction(&self) -> Direction;

    /// Prepare a cyclic transfer over the whole of `buf`, notifying after
    /// every `period_len` bytes.
    fn prep_cyclic(
        &mut self,
        buf: &Arc<DmaBuffer>,
        period_len: usize,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Cookie>;

    /// Prepare a one-shot transfer of the first `len` bytes of `buf`,
    /// notifying once on completion.
    fn prep_single(
        &mut self,
        buf: &Arc<DmaBuffer>,
        len: usize,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Cookie>;

    /// Start all prepared transfers.
    fn issue_pending(&mut self);

    /// Live status of `cookie`.
    fn tx_status(&self, cookie: Cookie) -> TxStatus;

    /// Stop everything on this channel and wait until the engine is quiet.
    fn terminate_sync(&mut self);
}

/// Source of channels and DMA memory for one device.
pub trait DmaController: Send + Sync {
    type Channel: DmaChannel;

    /// Acquire a channel for `dir`. `ResourceUnavailable` if none is free.
    fn request_channel(&self, dir: Direction) -> Result<Self::Channel>;

    /// Allocate memory the engine can target. `OutOfMemory` on failure.
    fn alloc_coherent(&self, len: usize) -> Result<DmaBuffer> {
        DmaBuffer::alloc(len, None)
    }
}

/// Memory-mapped data register of the peripheral, for the direct path.
pub trait RegisterPort: Send + Sync {
    /// Write one word to the peripheral FIFO.
    fn write_word(&self, word: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_zeroed_and_aligned() {
        let buf = DmaBuffer::alloc(256, None).unwrap();
        assert_eq!(buf.len(), 256);
        assert_eq!(buf.as_ptr() as usize % DMA_ALIGN, 0);
        let mut out = [0xffu8; 256];
        unsafe { buf.copy_out(0, &mut out).unwrap() };
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_copy_bounds() {
        let buf = DmaBuffer::alloc(16, Some(0x1000)).unwrap();
        assert_eq!(buf.bus_addr(), 0x1000);
        unsafe {
            buf.copy_in(12, &[1, 2, 3, 4]).unwrap();
            assert!(matches!(buf.copy_in(13, &[1, 2, 3, 4]), Err(DmacapError::Fault)));
            let mut out = [0u8; 4];
            buf.copy_out(12, &mut out).unwrap();
            assert_eq!(out, [1, 2, 3, 4]);
            assert!(matches!(buf.copy_out(usize::MAX, &mut out), Err(DmacapError::Fault)));
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(DmaBuffer::alloc(0, None).is_err());
    }
}
