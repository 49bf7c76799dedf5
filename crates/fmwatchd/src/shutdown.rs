//! Shutdown requests
//!
//! `SIGINT` and `SIGTERM` do not kill the daemon. They raise a
//! flag which the main loop polls, so the process chain is
//! always torn down on the way out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;

/// Raise the returned flag on `SIGINT` or `SIGTERM`
///
/// May be called only once per process.
pub fn install_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let quit = Arc::new(AtomicBool::new(false));
    let flag = quit.clone();
    ctrlc::set_handler(move || {
        info!("shutdown signal received");
        flag.store(true, Ordering::SeqCst);
    })?;
    Ok(quit)
}
