//! # dmacap-driver — cyclic DMA capture, modelled in user space
//!
//! The receive half of the capture device:
//!
//! ```text
//!   DmaChannel (cyclic, period = ring/2)
//!        │ notify() per period
//!        ▼
//!   CompletionSignal ──wake──▶ Session::read ──▶ caller buffer
//!        ▲                        │
//!        └────── RingManager ◀────┘ progress() (live residue)
//! ```
//!
//! - [`ring`]: starts/stops the cyclic transfer, owns the ring region.
//! - [`cursor`]: modular cursor math and overrun classification.
//! - [`signal`]: single-slot completion mailbox.
//! - [`reader`]: the blocking read protocol.
//! - [`session`]: device handle, single-session marker, transmit dispatch.
//! - [`sim`]: software DMA engine for tests and `--simulate`.

pub mod cursor;
pub mod reader;
pub mod ring;
pub mod session;
pub mod signal;
pub mod sim;
mod tx;

pub use reader::ReadStats;
pub use session::{Device, Session, SessionCloser};
pub use signal::CompletionSignal;
pub use sim::{SimController, SimProducer};
