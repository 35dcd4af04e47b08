//! Hardware-free watchdog for development machines and tests.
//!
//! Behaves like the kernel driver from the daemon's point of view and counts
//! every call so callers can assert on the interaction.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{DeviceIdentity, WatchdogDriver};
use crate::core::errors::{MuxError, Result};

/// In-memory stand-in for a hardware watchdog.
#[derive(Debug, Default)]
pub struct SimulatedWatchdog {
    timeout: Option<Duration>,
    last_reset: Option<Instant>,
    arms: u32,
    keepalives: u64,
    disarms: u32,
    /// Number of upcoming keepalives that should fail.
    failures_pending: u32,
}

impl SimulatedWatchdog {
    /// A disarmed simulated watchdog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` keepalives fail.
    pub fn fail_next_keepalives(&mut self, count: u32) {
        self.failures_pending = count;
    }

    /// Times the watchdog was armed.
    #[must_use]
    pub fn arm_count(&self) -> u32 {
        self.arms
    }

    /// Successful keepalives.
    #[must_use]
    pub fn keepalive_count(&self) -> u64 {
        self.keepalives
    }

    /// Times the watchdog was disarmed.
    #[must_use]
    pub fn disarm_count(&self) -> u32 {
        self.disarms
    }

    /// Whether real hardware would have rebooted the machine by `now`.
    #[must_use]
    pub fn has_expired(&self, now: Instant) -> bool {
        match (self.timeout, self.last_reset) {
            (Some(timeout), Some(last)) => now.saturating_duration_since(last) >= timeout,
            _ => false,
        }
    }
}

impl WatchdogDriver for SimulatedWatchdog {
    fn arm(&mut self, timeout: Duration) -> Result<DeviceIdentity> {
        if self.timeout.is_some() {
            return Err(MuxError::Runtime {
                details: "simulated watchdog is already armed".to_string(),
            });
        }
        self.timeout = Some(timeout);
        self.last_reset = Some(Instant::now());
        self.arms += 1;
        info!(timeout_secs = timeout.as_secs(), "simulated watchdog armed");
        Ok(DeviceIdentity {
            driver: "Simulated Watchdog".to_string(),
            firmware_version: 0,
            timeout,
        })
    }

    fn keepalive(&mut self) -> Result<()> {
        if self.timeout.is_none() {
            return Err(MuxError::DeviceNotArmed);
        }
        if self.failures_pending > 0 {
            self.failures_pending -= 1;
            return Err(MuxError::ioctl("WDIOC_KEEPALIVE", "simulated failure"));
        }
        self.last_reset = Some(Instant::now());
        self.keepalives += 1;
        debug!(count = self.keepalives, "simulated keepalive");
        Ok(())
    }

    fn disarm(&mut self) -> Result<()> {
        if self.timeout.take().is_some() {
            self.last_reset = None;
            self.disarms += 1;
            info!("simulated watchdog disarmed");
        }
        Ok(())
    }

    fn is_armed(&self) -> bool {
        self.timeout.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_is_counted() {
        let mut wd = SimulatedWatchdog::new();
        assert!(matches!(wd.keepalive(), Err(MuxError::DeviceNotArmed)));

        let identity = wd.arm(Duration::from_secs(20)).expect("arm");
        assert_eq!(identity.timeout, Duration::from_secs(20));
        assert!(wd.is_armed());
        assert!(wd.arm(Duration::from_secs(20)).is_err());

        wd.keepalive().expect("pet");
        wd.keepalive().expect("pet");
        wd.disarm().expect("disarm");
        wd.disarm().expect("second disarm is a no-op");

        assert_eq!(wd.arm_count(), 1);
        assert_eq!(wd.keepalive_count(), 2);
        assert_eq!(wd.disarm_count(), 1);
        assert!(!wd.is_armed());
    }

    #[test]
    fn expiry_tracks_last_reset() {
        let mut wd = SimulatedWatchdog::new();
        wd.arm(Duration::from_secs(5)).expect("arm");
        let now = Instant::now();
        assert!(!wd.has_expired(now));
        assert!(wd.has_expired(now + Duration::from_secs(6)));
        wd.disarm().expect("disarm");
        assert!(!wd.has_expired(now + Duration::from_secs(60)));
    }

    #[test]
    fn injected_failures_are_consumed() {
        let mut wd = SimulatedWatchdog::new();
        wd.arm(Duration::from_secs(5)).expect("arm");
        wd.fail_next_keepalives(2);
        assert!(wd.keepalive().is_err());
        assert!(wd.keepalive().is_err());
        wd.keepalive().expect("recovered");
        assert_eq!(wd.keepalive_count(), 1);
    }
}
