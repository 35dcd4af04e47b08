//! Daemon subsystem: client socket, event reactor, signal handling, and the
//! top-level lifecycle.

pub mod listener;
#[cfg(feature = "daemon")]
pub mod loop_main;
pub mod reactor;
#[cfg(feature = "daemon")]
pub mod signals;
