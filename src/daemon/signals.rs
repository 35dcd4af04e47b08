//! Shutdown signal handling.
//!
//! SIGTERM and SIGINT only raise a flag. The reactor notices it after its
//! current wait (the signal also interrupts the wait) and then runs the
//! controlled shutdown, including the watchdog disarm.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;

use crate::core::errors::{MuxError, Result};

/// Shared flag raised by SIGTERM/SIGINT or by [`ShutdownSignal::request`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Register SIGTERM and SIGINT handlers that set the shutdown flag.
    pub fn install() -> Result<Self> {
        let signal = Self::detached();
        for sig in [SIGTERM, SIGINT] {
            flag::register(sig, Arc::clone(&signal.requested)).map_err(|err| {
                MuxError::Runtime {
                    details: format!("cannot install handler for signal {sig}: {err}"),
                }
            })?;
        }
        Ok(signal)
    }

    /// A flag with no handlers attached, triggered only through
    /// [`ShutdownSignal::request`].
    #[must_use]
    pub fn detached() -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ask the loop to stop.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown was asked for.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// The raw flag, for loops that poll it.
    #[must_use]
    pub fn flag(&self) -> &AtomicBool {
        &self.requested
    }
}
