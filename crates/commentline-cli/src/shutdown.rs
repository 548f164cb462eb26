//! SIGINT/SIGTERM handling
//!
//! The first signal cancels the run. In-flight HTTP calls are aborted and
//! their pages are never committed, so the checkpoint keeps the last page
//! committed before the signal. A second signal exits immediately with 130.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use commentline_core::CancelToken;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Exit code after an interrupt
pub const INTERRUPTED: u8 = 130;

/// A signal was received
pub fn requested() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

/// Register handlers and cancel `cancel` once a signal arrives.
pub fn install(cancel: CancelToken) -> Result<()> {
    // SAFETY: the handlers only touch an atomic and call exit
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGTERM, || {
            if SHUTDOWN.swap(true, Ordering::Relaxed) {
                std::process::exit(INTERRUPTED.into());
            }
        })
        .context("failed to register SIGTERM handler")?;
        signal_hook::low_level::register(signal_hook::consts::SIGINT, || {
            if SHUTDOWN.swap(true, Ordering::Relaxed) {
                std::process::exit(INTERRUPTED.into());
            }
        })
        .context("failed to register SIGINT handler")?;
    }

    std::thread::Builder::new()
        .name("signal-watch".into())
        .spawn(move || {
            while !requested() {
                std::thread::sleep(Duration::from_millis(100));
            }
            log::warn!("Shutdown requested, waiting for in-flight calls (again to force)");
            cancel.cancel();
        })
        .context("failed to spawn signal watcher")?;
    Ok(())
}
