//! # dmacap-pipeline — overlapped acquisition
//!
//! Drains the capture device with a bounded number of reads in flight and
//! writes every block to a sink as soon as its read completes.
//!
//! | Module          | Provides                                        |
//! |-----------------|-------------------------------------------------|
//! | `pipeline`      | `Pipeline`, `StopHandle`, `RunReport`            |
//! | `stats`         | per-block latencies, depth-scaled throughput     |
//! | `worker_queue`  | `WorkerQueue`: blocking threads, any `Read`      |
//! | `uring`         | `UringQueue`: io_uring (Linux)                   |
//! | `sink`          | `FileSink`, `FilterSink`                         |

pub mod pipeline;
pub mod sink;
pub mod stats;
pub mod worker_queue;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod uring;
        pub use uring::UringQueue;
    }
}

pub use pipeline::{Pipeline, RunReport, StopHandle};
pub use sink::{FileSink, FilterSink};
pub use stats::{Throughput, ThroughputSnapshot};
pub use worker_queue::WorkerQueue;
