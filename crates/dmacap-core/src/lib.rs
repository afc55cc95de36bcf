//! # dmacap-core — Shared types and trait seams for dmacap
//!
//! This crate defines the boundaries between the two halves of the capture
//! path:
//!
//! - the **driver side** (`dmacap-driver`), which owns a cyclic DMA receive
//!   ring and exposes a blocking read on a session handle, and
//! - the **user side** (`dmacap-pipeline`), which drains the device through a
//!   depth-bounded read/write pipeline into a byte sink.
//!
//! Each trait models one collaborator the core logic needs but does not own:
//!
//! | Trait             | Seam                                   |
//! |-------------------|----------------------------------------|
//! | `DmaController`   | channel acquisition + coherent memory  |
//! | `DmaChannel`      | cyclic / one-shot transfers, residue   |
//! | `RegisterPort`    | direct register writes (small payloads)|
//! | `Notifier`        | completion callback → waiting consumer |
//! | `CompletionQueue` | overlapped read/write submission       |
//! | `ByteSink`        | downstream storage (file or filter)    |
//!
//! Concrete implementations live in the driver and pipeline crates.

pub mod error;
pub mod env;
pub mod config;
pub mod log;
pub mod dma;
pub mod notifier;
pub mod entry;
pub mod queue;
pub mod sink;

pub use error::{DmacapError, Result};
