//! Signal handling for graceful shutdown.
//!
//! The returned flag is the cancellation hook every event loop checks at the
//! top of its iteration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Install signal handlers and return a shutdown flag.
pub fn install_signal_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::SeqCst);
    })?;

    Ok(shutdown)
}
