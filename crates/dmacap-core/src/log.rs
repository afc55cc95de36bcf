//! Logging setup
//!
//! All crates log through `tracing` macros. Binaries call [`init`] once;
//! libraries never install a subscriber.
//!
//! # Environment Variables
//!
//! - `DMACAP_LOG=<filter>` - `EnvFilter` directive, e.g. `debug` or
//!   `dmacap_pipeline=trace,info`. Falls back to `RUST_LOG`, then `info`.
//! - `DMACAP_LOG_THREADS=1` - include thread names (useful with the worker backend)

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::env::env_get_bool;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install the global fmt subscriber. Safe to call more than once.
pub fn init() {
    init_with_default("info");
}

/// Like [`init`], with an explicit fallback filter (e.g. from `--verbose`).
pub fn init_with_default(default_filter: &str) {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    let filter = std::env::var("DMACAP_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter));

    let threads = env_get_bool("DMACAP_LOG_THREADS", false);
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_names(threads)
        .with_target(true)
        .with_filter(filter);

    // A subscriber may already be installed by a test harness; that is fine.
    let _ = tracing_subscriber::registry().with(layer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        init();
        init_with_default("debug");
        tracing::info!("logging initialized");
    }
}
