//! Device handle and session lifecycle.
//!
//! A [`Device`] owns the DMA controller, the configuration and the single
//! "active session" marker. [`Device::open`] claims the marker and starts
//! the ring; dropping or closing the returned [`Session`] stops DMA and
//! releases it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dmacap_core::config::DeviceConfig;
use dmacap_core::dma::{DmaController, RegisterPort};
use dmacap_core::error::{DmacapError, Result};
use tracing::{debug, info};

use crate::reader::{ReadStats, RxState};
use crate::ring::RingManager;
use crate::signal::CompletionSignal;
use crate::tx;

struct DeviceShared<D> {
    controller: D,
    config: DeviceConfig,
    port: Option<Arc<dyn RegisterPort>>,
    active: AtomicBool,
    /// One transmit at a time.
    tx_lock: Mutex<()>,
}

/// The capture device. Cheap to clone; clones share the session marker.
pub struct Device<D: DmaController> {
    shared: Arc<DeviceShared<D>>,
}

impl<D: DmaController> Clone for Device<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: DmaController> Device<D> {
    /// `port` handles payloads below the direct-write threshold; without it
    /// such writes fail with `ResourceUnavailable`.
    pub fn new(controller: D, config: DeviceConfig, port: Option<Arc<dyn RegisterPort>>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(DeviceShared {
                controller,
                config,
                port,
                active: AtomicBool::new(false),
                tx_lock: Mutex::new(()),
            }),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    pub fn controller(&self) -> &D {
        &self.shared.controller
    }

    /// True while a session is open.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Open the one allowed session. `Busy` if one is already active; the
    /// active session is not touched in that case.
    pub fn open(&self) -> Result<Session<D>> {
        if self
            .shared
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("open rejected: session active");
            return Err(DmacapError::Busy);
        }

        let signal = Arc::new(CompletionSignal::new());
        let ring = match RingManager::start(
            &self.shared.controller,
            self.shared.config.ring_size,
            signal.clone(),
        ) {
            Ok(ring) => ring,
            Err(e) => {
                self.shared.active.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        info!(ring_size = self.shared.config.ring_size, "session opened");
        Ok(Session {
            shared: Arc::clone(&self.shared),
            ring,
            signal,
            rx: RxState::new(),
            open: true,
        })
    }

    /// Send `data` to the peripheral. Short payloads go word-per-byte
    /// through the register port, longer ones through one-shot TX DMA.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let config = &self.shared.config;
        let _tx = self.shared.tx_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if data.len() < config.direct_threshold {
            let port = self
                .shared
                .port
                .as_ref()
                .ok_or(DmacapError::ResourceUnavailable("register port"))?;
            for b in data {
                port.write_word(u32::from(*b));
            }
            debug!(len = data.len(), "direct register write");
            return Ok(data.len());
        }

        tx::transmit(&self.shared.controller, data, config.tx_timeout)
    }
}

/// Handle that can release a reader blocked on a session from another
/// thread. The session stays open (and the device busy) until its owner
/// closes or drops it.
#[derive(Clone)]
pub struct SessionCloser {
    signal: Arc<CompletionSignal>,
}

impl SessionCloser {
    /// Make pending and future reads fail with `SessionClosed`.
    pub fn cancel(&self) {
        self.signal.close();
    }
}

/// One open capture session.
pub struct Session<D: DmaController> {
    shared: Arc<DeviceShared<D>>,
    ring: RingManager<D::Channel>,
    signal: Arc<CompletionSignal>,
    rx: RxState,
    open: bool,
}

impl<D: DmaController> Session<D> {
    /// Block until data arrives, then copy up to `buf.len()` bytes.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_inner(buf, None)
    }

    /// As [`read`](Self::read) with a bound on the wait.
    pub fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.read_inner(buf, Some(timeout))
    }

    fn read_inner(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if !self.open {
            return Err(DmacapError::SessionClosed);
        }
        self.rx.read(&self.ring, &self.signal, buf, timeout)
    }

    pub fn closer(&self) -> SessionCloser {
        SessionCloser {
            signal: Arc::clone(&self.signal),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn stats(&self) -> ReadStats {
        self.rx.stats()
    }

    pub fn ring_size(&self) -> usize {
        self.ring.geometry().size()
    }

    /// Stop DMA, free the ring and release the device. Idempotent.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.signal.close();
        self.ring.stop();
        self.shared.active.store(false, Ordering::SeqCst);

        let stats = self.rx.stats();
        info!(
            bytes = stats.bytes,
            reads = stats.reads,
            overruns = stats.overruns,
            "session closed"
        );
    }
}

impl<D: DmaController> io::Read for Session<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Session::read(self, buf).map_err(io::Error::from)
    }
}

impl<D: DmaController> Drop for Session<D> {
    fn drop(&mut self) {
        self.close();
    }
}
