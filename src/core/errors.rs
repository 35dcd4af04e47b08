//! WDM-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::clients::registry::ClientId;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, MuxError>;

/// Top-level error type for the watchdog multiplexer.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("[WDM-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[WDM-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[WDM-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[WDM-2001] cannot open watchdog device {path}: {source}")]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[WDM-2002] watchdog ioctl {op} failed: {details}")]
    DeviceIoctl { op: &'static str, details: String },

    #[error("[WDM-2003] watchdog device is not armed")]
    DeviceNotArmed,

    #[error("[WDM-2004] keepalive failed on {consecutive} consecutive ticks")]
    KeepaliveEscalation { consecutive: u32 },

    #[error("[WDM-2005] kernel module {module} could not be loaded: {details}")]
    ModuleLoad { module: String, details: String },

    #[error("[WDM-3001] socket activation failure: {details}")]
    SocketActivation { details: String },

    #[error("[WDM-3002] cannot create listening socket at {path}: {details}")]
    Listener { path: PathBuf, details: String },

    #[error("[WDM-3003] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[WDM-4001] event multiplexer failure in {context}: {source}")]
    Poll {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("[WDM-4002] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[WDM-4900] runtime failure: {details}")]
    Runtime { details: String },

    #[error("[WDM-5001] unknown client {client}")]
    UnknownClient { client: ClientId },

    #[error("[WDM-5002] invalid deadline for {client}: {details}")]
    InvalidDeadline { client: ClientId, details: String },
}

impl MuxError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "WDM-1001",
            Self::MissingConfig { .. } => "WDM-1002",
            Self::ConfigParse { .. } => "WDM-1003",
            Self::DeviceOpen { .. } => "WDM-2001",
            Self::DeviceIoctl { .. } => "WDM-2002",
            Self::DeviceNotArmed => "WDM-2003",
            Self::KeepaliveEscalation { .. } => "WDM-2004",
            Self::ModuleLoad { .. } => "WDM-2005",
            Self::SocketActivation { .. } => "WDM-3001",
            Self::Listener { .. } => "WDM-3002",
            Self::Io { .. } => "WDM-3003",
            Self::Poll { .. } => "WDM-4001",
            Self::Serialization { .. } => "WDM-4002",
            Self::Runtime { .. } => "WDM-4900",
            Self::UnknownClient { .. } => "WDM-5001",
            Self::InvalidDeadline { .. } => "WDM-5002",
        }
    }

    /// Whether the failure is scoped to a single client connection.
    ///
    /// Client-scoped failures close that connection; everything else ends the
    /// daemon.
    #[must_use]
    pub const fn is_client_scoped(&self) -> bool {
        matches!(
            self,
            Self::UnknownClient { .. } | Self::InvalidDeadline { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for failed device ioctls.
    #[must_use]
    pub fn ioctl(op: &'static str, errno: impl std::fmt::Display) -> Self {
        Self::DeviceIoctl {
            op,
            details: errno.to_string(),
        }
    }
}

impl From<serde_json::Error> for MuxError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for MuxError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<toml::ser::Error> for MuxError {
    fn from(value: toml::ser::Error) -> Self {
        Self::Serialization {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MuxError;
    use crate::clients::registry::ClientId;

    #[test]
    fn codes_are_embedded_in_display() {
        let err = MuxError::KeepaliveEscalation { consecutive: 3 };
        assert_eq!(err.code(), "WDM-2004");
        assert!(err.to_string().starts_with("[WDM-2004]"));
    }

    #[test]
    fn client_errors_are_client_scoped() {
        let err = MuxError::InvalidDeadline {
            client: ClientId::from_raw(7),
            details: "deadline must be positive".to_string(),
        };
        assert!(err.is_client_scoped());
        assert!(err.to_string().contains("client#7"));
        assert!(!MuxError::DeviceNotArmed.is_client_scoped());
    }

    #[test]
    fn toml_errors_map_to_config_parse() {
        let parse: std::result::Result<toml::Value, _> = toml::from_str("= broken");
        let err = MuxError::from(parse.unwrap_err());
        assert_eq!(err.code(), "WDM-1003");
    }
}
