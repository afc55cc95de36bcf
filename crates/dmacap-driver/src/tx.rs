//! One-shot transmit over a `Role::Transmit` channel.

use std::sync::Arc;
use std::time::Duration;

use dmacap_core::dma::{DmaChannel, DmaController, Direction, TxState};
use dmacap_core::error::{DmacapError, Result};
use tracing::{debug, warn};

use crate::ring::Role;
use crate::signal::CompletionSignal;

/// Copy `data` into a coherent buffer, run a single memory-to-device
/// transfer and block until it completes or `timeout` expires.
pub fn transmit<D: DmaController>(controller: &D, data: &[u8], timeout: Duration) -> Result<usize> {
    // Buffer first: it must outlive the channel.
    let buf = Arc::new(controller.alloc_coherent(data.len())?);
    // Safety: the buffer is not shared with the engine yet.
    unsafe { buf.copy_in(0, data)? };

    let mut role = Role::Transmit {
        channel: controller.request_channel(Direction::MemToDev)?,
    };
    let signal = Arc::new(CompletionSignal::new());

    let cookie = role.channel_mut().prep_single(&buf, data.len(), signal.clone())?;
    role.channel_mut().issue_pending();

    if let Err(e) = signal.wait(Some(timeout)) {
        warn!(len = data.len(), ?timeout, "tx dma did not complete");
        role.channel_mut().terminate_sync();
        return Err(e);
    }

    match role.channel().tx_status(cookie).state {
        TxState::Error => Err(DmacapError::Device(libc::EIO)),
        _ => {
            debug!(len = data.len(), "tx dma complete");
            Ok(data.len())
        }
    }
}
