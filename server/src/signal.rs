//! Signal handling for graceful shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Install a SIGINT/SIGTERM handler.
///
/// The returned flag is set on the first signal; load threads stop issuing
/// calls and the run winds down. A second signal exits immediately.
pub fn install_signal_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();

    ctrlc::set_handler(move || {
        if shutdown_flag.swap(true, Ordering::SeqCst) {
            tracing::warn!("received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        tracing::info!("received shutdown signal, draining in-flight calls");
    })?;

    Ok(shutdown)
}
