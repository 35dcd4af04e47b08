//! Hardware watchdog access.
//!
//! [`WatchdogDriver`] is the seam between the daemon and the timer: a real
//! kernel device ([`linux::LinuxWatchdog`]) or a hardware-free stand-in
//! ([`simulated::SimulatedWatchdog`]). The [`controller::WatchdogController`]
//! wraps a driver with the keepalive failure policy.
//!
//! ```text
//! Disarmed ──arm()──► Armed ──disarm()──► Disarmed
//!                      │  ▲
//!                      └──┘ keepalive()
//! ```

use std::fmt;
use std::time::Duration;

use crate::core::errors::Result;

pub mod controller;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod simulated;

pub use controller::{KeepaliveOutcome, WatchdogController};
pub use simulated::SimulatedWatchdog;

/// What the driver reported about itself when armed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Driver identity string.
    pub driver: String,
    /// Firmware revision, logged in hex.
    pub firmware_version: u32,
    /// Timeout the driver actually applied, which may differ from the request.
    pub timeout: Duration,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' version {:x} timeout {}s",
            self.driver,
            self.firmware_version,
            self.timeout.as_secs()
        )
    }
}

/// Minimal driver contract: arm, pet, safely disarm.
pub trait WatchdogDriver {
    /// Open the device and start the timer with `timeout`.
    ///
    /// # Errors
    /// Any failure here leaves the driver disarmed.
    fn arm(&mut self, timeout: Duration) -> Result<DeviceIdentity>;

    /// Reset the countdown once.
    fn keepalive(&mut self) -> Result<()>;

    /// Stop the timer with the magic-close sequence and release the handle.
    /// Calling it while disarmed does nothing.
    fn disarm(&mut self) -> Result<()>;

    /// Whether the timer is currently running.
    fn is_armed(&self) -> bool;
}

impl<D: WatchdogDriver + ?Sized> WatchdogDriver for &mut D {
    fn arm(&mut self, timeout: Duration) -> Result<DeviceIdentity> {
        (**self).arm(timeout)
    }

    fn keepalive(&mut self) -> Result<()> {
        (**self).keepalive()
    }

    fn disarm(&mut self) -> Result<()> {
        (**self).disarm()
    }

    fn is_armed(&self) -> bool {
        (**self).is_armed()
    }
}

impl<D: WatchdogDriver + ?Sized> WatchdogDriver for Box<D> {
    fn arm(&mut self, timeout: Duration) -> Result<DeviceIdentity> {
        (**self).arm(timeout)
    }

    fn keepalive(&mut self) -> Result<()> {
        (**self).keepalive()
    }

    fn disarm(&mut self) -> Result<()> {
        (**self).disarm()
    }

    fn is_armed(&self) -> bool {
        (**self).is_armed()
    }
}
