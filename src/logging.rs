//! Tracing initialisation for embedding processes.
//!
//! The substrate itself only emits spans and events; hosts decide where
//! they go. This helper wires the common env-filtered subscriber.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialise a global subscriber honouring `RUST_LOG`, defaulting to
/// `info`. Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
