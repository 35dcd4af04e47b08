//! Watchdog multiplexer.
//!
//! Owns the single hardware watchdog of a machine and keeps petting it only
//! while every client connected over a local socket keeps checking in within
//! its own deadline. One silent client is enough to withhold the keepalive and
//! let the firmware reboot the box.
//!
//! - [`device`]: driver seam, Linux ioctl driver, simulated driver, keepalive policy
//! - [`clients`]: bounded client registry, aggregate verdict, wire protocol
//! - [`daemon`]: listening socket, event reactor, signals, lifecycle
//! - [`core`]: configuration and errors

pub mod clients;
pub mod core;
pub mod daemon;
pub mod device;
pub mod logger;

#[cfg(feature = "cli")]
pub mod cli_app;
