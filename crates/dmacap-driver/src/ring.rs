//! Ring Buffer Manager.
//!
//! Owns the cyclic DMA target for one session: acquires the RX channel,
//! allocates the ring, programs a cyclic device-to-memory transfer that
//! notifies every half ring, and tears all of it down synchronously.
//!
//! The hardware write cursor is never stored. Every caller that needs it
//! goes through [`RingManager::progress`], which asks the engine.

use std::sync::Arc;

use dmacap_core::config::validate_ring_size;
use dmacap_core::dma::{Cookie, DmaBuffer, DmaChannel, DmaController, Direction, TxState, TxStatus};
use dmacap_core::error::{DmacapError, Result};
use dmacap_core::notifier::Notifier;
use tracing::{debug, info};

use crate::cursor::RingGeometry;

/// What a channel is being used for. Only the receive role has a ring.
pub enum Role<C: DmaChannel> {
    Receive {
        channel: C,
        ring: Arc<DmaBuffer>,
        cookie: Cookie,
    },
    Transmit {
        channel: C,
    },
}

impl<C: DmaChannel> Role<C> {
    pub fn channel(&self) -> &C {
        match self {
            Role::Receive { channel, .. } | Role::Transmit { channel } => channel,
        }
    }

    pub fn channel_mut(&mut self) -> &mut C {
        match self {
            Role::Receive { channel, .. } | Role::Transmit { channel } => channel,
        }
    }

    pub fn ring(&self) -> Option<&Arc<DmaBuffer>> {
        match self {
            Role::Receive { ring, .. } => Some(ring),
            Role::Transmit { .. } => None,
        }
    }
}

/// Live cyclic transfer into a ring. `None` role means stopped.
pub struct RingManager<C: DmaChannel> {
    role: Option<Role<C>>,
    geom: RingGeometry,
}

impl<C: DmaChannel> RingManager<C> {
    /// Acquire a channel, allocate `ring_size` bytes and start the cyclic
    /// transfer. On any failure everything acquired so far is released.
    pub fn start<D>(controller: &D, ring_size: usize, notifier: Arc<dyn Notifier>) -> Result<Self>
    where
        D: DmaController<Channel = C>,
    {
        validate_ring_size(ring_size)?;
        let geom = RingGeometry::new(ring_size);

        let mut channel = controller.request_channel(Direction::DevToMem)?;
        if channel.direction() != Direction::DevToMem {
            return Err(DmacapError::ResourceUnavailable("rx dma channel"));
        }

        // `channel` drops (and is released) if either step fails.
        let ring = Arc::new(controller.alloc_coherent(ring_size)?);
        let cookie = channel.prep_cyclic(&ring, geom.period(), notifier)?;
        channel.issue_pending();

        info!(
            ring_size,
            period = geom.period(),
            bus_addr = ring.bus_addr(),
            "cyclic rx started"
        );

        Ok(Self {
            role: Some(Role::Receive { channel, ring, cookie }),
            geom,
        })
    }

    #[inline]
    pub fn geometry(&self) -> RingGeometry {
        self.geom
    }

    pub fn is_running(&self) -> bool {
        self.role.is_some()
    }

    /// The ring, while running.
    pub fn ring(&self) -> Option<&Arc<DmaBuffer>> {
        self.role.as_ref().and_then(Role::ring)
    }

    fn status(&self) -> Result<TxStatus> {
        match &self.role {
            Some(Role::Receive { channel, cookie, .. }) => {
                let status = channel.tx_status(*cookie);
                match status.state {
                    TxState::Error => Err(DmacapError::Device(libc::EIO)),
                    _ => Ok(status),
                }
            }
            _ => Err(DmacapError::SessionClosed),
        }
    }

    /// Live residue from the engine. Never cached.
    pub fn progress(&self) -> Result<usize> {
        self.status().map(|s| s.residue)
    }

    /// `ring_size - residue`, freshly queried.
    pub fn write_cursor(&self) -> Result<usize> {
        self.write_window().map(|(write, _)| write)
    }

    /// Write cursor and the bytes the engine may be writing past it, from
    /// one status query.
    pub fn write_window(&self) -> Result<(usize, usize)> {
        let status = self.status()?;
        let write = self
            .geom
            .write_cursor(status.residue)
            .ok_or(DmacapError::Device(libc::EIO))?;
        Ok((write, status.in_flight))
    }

    /// Terminate the transfer, then free the ring and release the channel.
    /// Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut role) = self.role.take() {
            role.channel_mut().terminate_sync();
            // Engine is quiet; buffer and channel may go.
            drop(role);
            debug!(ring_size = self.geom.size(), "cyclic rx stopped");
        }
    }
}

impl<C: DmaChannel> Drop for RingManager<C> {
    fn drop(&mut self) {
        self.stop();
    }
}
