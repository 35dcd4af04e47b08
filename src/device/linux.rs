//! Linux `/dev/watchdog` driver.
//!
//! Only the four operations the daemon needs are wrapped: set timeout, read
//! identity, keepalive, and magic close.

#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{DeviceIdentity, WatchdogDriver};
use crate::core::errors::{MuxError, Result};

/// `struct watchdog_info` from `<linux/watchdog.h>`.
#[repr(C)]
#[derive(Debug, Default)]
struct WatchdogInfo {
    options: u32,
    firmware_version: u32,
    identity: [u8; 32],
}

nix::ioctl_read!(wdioc_getsupport, b'W', 0, WatchdogInfo);
nix::ioctl_read!(wdioc_keepalive, b'W', 5, libc::c_int);
nix::ioctl_readwrite!(wdioc_settimeout, b'W', 6, libc::c_int);

/// Byte the kernel expects before close to actually stop the timer.
const MAGIC_CLOSE: &[u8] = b"V";

/// Kernel watchdog device.
#[derive(Debug)]
pub struct LinuxWatchdog {
    path: PathBuf,
    file: Option<File>,
}

impl LinuxWatchdog {
    /// Driver for the device node at `path`; nothing is opened yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    /// Device node path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn set_timeout(file: &File, timeout: Duration) -> Result<Duration> {
        let mut secs = libc::c_int::try_from(timeout.as_secs()).map_err(|_| {
            MuxError::InvalidConfig {
                details: format!("timeout {}s does not fit the driver", timeout.as_secs()),
            }
        })?;
        // SAFETY: the descriptor is open for the lifetime of `file` and `secs`
        // is a valid, exclusively borrowed c_int the driver reads and updates.
        unsafe { wdioc_settimeout(file.as_raw_fd(), &raw mut secs) }
            .map_err(|errno| MuxError::ioctl("WDIOC_SETTIMEOUT", errno))?;
        Ok(Duration::from_secs(u64::try_from(secs).unwrap_or_default()))
    }

    fn read_identity(file: &File) -> Result<WatchdogInfo> {
        let mut info = WatchdogInfo::default();
        // SAFETY: `info` matches the kernel layout of `struct watchdog_info`
        // and outlives the call.
        unsafe { wdioc_getsupport(file.as_raw_fd(), &raw mut info) }
            .map_err(|errno| MuxError::ioctl("WDIOC_GETSUPPORT", errno))?;
        Ok(info)
    }

    fn close_with_magic(&mut self) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        let written = file
            .write_all(MAGIC_CLOSE)
            .map_err(|source| MuxError::io(&self.path, source));
        drop(file);
        written
    }
}

impl WatchdogDriver for LinuxWatchdog {
    fn arm(&mut self, timeout: Duration) -> Result<DeviceIdentity> {
        if self.file.is_some() {
            return Err(MuxError::Runtime {
                details: format!("{} is already armed", self.path.display()),
            });
        }
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|source| MuxError::DeviceOpen {
                path: self.path.clone(),
                source,
            })?;
        let configured = Self::set_timeout(&file, timeout)
            .and_then(|effective| Self::read_identity(&file).map(|info| (effective, info)));
        self.file = Some(file);

        match configured {
            Ok((effective, info)) => {
                let end = memchr::memchr(0, &info.identity).unwrap_or(info.identity.len());
                let identity = DeviceIdentity {
                    driver: String::from_utf8_lossy(&info.identity[..end]).into_owned(),
                    firmware_version: info.firmware_version,
                    timeout: effective,
                };
                debug!(options = info.options, "watchdog capabilities");
                Ok(identity)
            }
            Err(err) => {
                if let Err(close_err) = self.close_with_magic() {
                    warn!(error = %close_err, "magic close after failed arm");
                }
                Err(err)
            }
        }
    }

    fn keepalive(&mut self) -> Result<()> {
        let file = self.file.as_ref().ok_or(MuxError::DeviceNotArmed)?;
        let mut dummy: libc::c_int = 0;
        // SAFETY: the descriptor is open and the argument pointer is valid; the
        // driver ignores its contents.
        unsafe { wdioc_keepalive(file.as_raw_fd(), &raw mut dummy) }
            .map_err(|errno| MuxError::ioctl("WDIOC_KEEPALIVE", errno))?;
        Ok(())
    }

    fn disarm(&mut self) -> Result<()> {
        self.close_with_magic()
    }

    fn is_armed(&self) -> bool {
        self.file.is_some()
    }
}

/// Load `module` (name plus optional parameters, e.g. `"softdog soft_noboot=1"`)
/// when the device node is absent.
pub fn ensure_device_node(path: &Path, module: Option<&str>) -> Result<()> {
    let Some(module) = module.map(str::trim).filter(|m| !m.is_empty()) else {
        return Ok(());
    };
    if path.exists() {
        return Ok(());
    }
    info!(module, device = %path.display(), "device node missing, loading kernel module");
    let status = Command::new("modprobe")
        .arg("-q")
        .args(module.split_whitespace())
        .status()
        .map_err(|err| MuxError::ModuleLoad {
            module: module.to_string(),
            details: err.to_string(),
        })?;
    if !status.success() {
        return Err(MuxError::ModuleLoad {
            module: module.to_string(),
            details: format!("modprobe exited with {status}"),
        });
    }
    Ok(())
}
