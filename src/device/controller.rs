//! Keepalive policy on top of a [`WatchdogDriver`].
//!
//! The controller is the only owner of the driver. It arms once, pets on
//! request, counts consecutive keepalive failures and turns a streak of
//! `failure_limit` of them into a fatal error.

use std::time::Duration;

use tracing::{error, info, warn};

use super::{DeviceIdentity, WatchdogDriver};
use crate::core::errors::{MuxError, Result};

/// Shortest applied timeout the keepalive loop can keep up with.
const MIN_HARDWARE_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of a single keepalive attempt that did not escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveOutcome {
    /// The driver accepted the keepalive.
    Petted,
    /// The driver refused, still below the failure limit.
    Failed {
        /// Failures in a row, this one included.
        consecutive: u32,
    },
}

/// Armed watchdog plus keepalive failure accounting.
#[derive(Debug)]
pub struct WatchdogController<D: WatchdogDriver> {
    driver: D,
    identity: DeviceIdentity,
    failure_limit: u32,
    consecutive_failures: u32,
}

impl<D: WatchdogDriver> WatchdogController<D> {
    /// Arm `driver` with `timeout`. Fails if the driver cannot be armed or
    /// applies a timeout shorter than one second.
    pub fn arm(mut driver: D, timeout: Duration, failure_limit: u32) -> Result<Self> {
        if failure_limit == 0 {
            return Err(MuxError::InvalidConfig {
                details: "keepalive failure limit must be positive".to_string(),
            });
        }
        let identity = driver.arm(timeout)?;
        info!(
            driver = %identity.driver,
            firmware_version = format_args!("{:x}", identity.firmware_version),
            timeout_secs = identity.timeout.as_secs(),
            "watchdog armed"
        );
        if identity.timeout != timeout {
            warn!(
                requested_secs = timeout.as_secs(),
                effective_secs = identity.timeout.as_secs(),
                "driver adjusted the watchdog timeout"
            );
        }
        if identity.timeout < MIN_HARDWARE_TIMEOUT {
            if let Err(err) = driver.disarm() {
                warn!(error = %err, "disarm after unusable timeout");
            }
            return Err(MuxError::DeviceIoctl {
                op: "WDIOC_SETTIMEOUT",
                details: format!(
                    "driver applied an unusable timeout of {}ms",
                    identity.timeout.as_millis()
                ),
            });
        }
        Ok(Self {
            driver,
            identity,
            failure_limit,
            consecutive_failures: 0,
        })
    }

    /// Pet the watchdog once.
    ///
    /// A failure is tolerated until `failure_limit` of them happen in a row, at
    /// which point [`MuxError::KeepaliveEscalation`] is returned.
    pub fn keepalive(&mut self) -> Result<KeepaliveOutcome> {
        match self.driver.keepalive() {
            Ok(()) => {
                if self.consecutive_failures > 0 {
                    info!(
                        after = self.consecutive_failures,
                        "keepalive recovered"
                    );
                }
                self.consecutive_failures = 0;
                Ok(KeepaliveOutcome::Petted)
            }
            Err(err) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_limit {
                    error!(
                        error = %err,
                        consecutive = self.consecutive_failures,
                        "keepalive keeps failing, giving up"
                    );
                    return Err(MuxError::KeepaliveEscalation {
                        consecutive: self.consecutive_failures,
                    });
                }
                warn!(
                    error = %err,
                    consecutive = self.consecutive_failures,
                    limit = self.failure_limit,
                    "keepalive failed"
                );
                Ok(KeepaliveOutcome::Failed {
                    consecutive: self.consecutive_failures,
                })
            }
        }
    }

    /// Stop the hardware timer with the magic close. Safe to call repeatedly.
    pub fn disarm(&mut self) -> Result<()> {
        if !self.driver.is_armed() {
            return Ok(());
        }
        self.driver.disarm()?;
        info!("watchdog disarmed");
        Ok(())
    }

    /// Whether the driver is still armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.driver.is_armed()
    }

    /// What the driver reported at arm time.
    #[must_use]
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Hardware timeout in effect.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.identity.timeout
    }

    /// Keepalive failures in a row so far.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// The wrapped driver.
    #[must_use]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Mutable access to the wrapped driver.
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}
