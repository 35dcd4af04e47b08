//! Daemon configuration: TOML file, environment overrides, validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{MuxError, Result};

/// Config file consulted when no explicit path is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/watchdog-mux.toml";

/// Environment variable names recognised by [`Config::apply_env_overrides`].
pub const ENV_DEVICE: &str = "WATCHDOG_MUX_DEVICE";
/// Overrides `socket.path`.
pub const ENV_SOCKET: &str = "WATCHDOG_MUX_SOCKET";
/// Overrides `device.timeout_secs`.
pub const ENV_TIMEOUT: &str = "WATCHDOG_MUX_TIMEOUT";
/// Overrides `logging.level`.
pub const ENV_LOG_LEVEL: &str = "WATCHDOG_MUX_LOG_LEVEL";

/// Full daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Hardware watchdog.
    pub device: DeviceConfig,
    /// Client socket.
    pub socket: SocketConfig,
    /// Client registry.
    pub clients: ClientsConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

/// Hardware watchdog settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Watchdog device node.
    pub path: PathBuf,
    /// Hardware timeout requested at arm time.
    pub timeout_secs: u32,
    /// Explicit tick interval; derived from the timeout when unset.
    pub tick_interval_ms: Option<u64>,
    /// Consecutive keepalive failures tolerated before the daemon gives up.
    pub keepalive_failure_limit: u32,
    /// Kernel module loaded with `modprobe` when the device node is missing.
    pub load_module: Option<String>,
    /// Drive a simulated timer instead of real hardware.
    pub simulate: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/watchdog"),
            timeout_secs: 20,
            tick_interval_ms: None,
            keepalive_failure_limit: 3,
            load_module: None,
            simulate: false,
        }
    }
}

/// Client-facing socket settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketConfig {
    /// Socket path created when none is inherited.
    pub path: PathBuf,
    /// Listen backlog.
    pub backlog: u32,
    /// Connections accepted per listener readiness event.
    pub accept_batch: usize,
    /// Honour a listening socket inherited from the service manager.
    pub socket_activation: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/run/watchdog-mux.sock"),
            backlog: 50,
            accept_batch: 16,
            socket_activation: true,
        }
    }
}

/// Client registry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientsConfig {
    /// Maximum number of connected clients.
    pub capacity: usize,
    /// Lowest deadline a client may request; raised to the tick interval if smaller.
    pub min_deadline_secs: u64,
    /// Reads of one client per readiness event before yielding to others.
    pub read_budget: usize,
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            min_deadline_secs: 1,
            read_budget: 16,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl Config {
    /// Load configuration from `path`, or from [`DEFAULT_CONFIG_PATH`] if it exists.
    ///
    /// An explicitly named file must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                if !path.exists() {
                    return Err(MuxError::MissingConfig {
                        path: path.to_path_buf(),
                    });
                }
                Self::from_file(path)?
            }
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| MuxError::io(path, source))?;
        Self::from_toml(&raw)
    }

    /// Parse configuration text.
    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `WATCHDOG_MUX_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(device) = lookup(ENV_DEVICE) {
            self.device.path = PathBuf::from(device);
        }
        if let Some(socket) = lookup(ENV_SOCKET) {
            self.socket.path = PathBuf::from(socket);
        }
        if let Some(timeout) = lookup(ENV_TIMEOUT) {
            self.device.timeout_secs =
                timeout
                    .trim()
                    .parse()
                    .map_err(|_| MuxError::ConfigParse {
                        context: ENV_TIMEOUT,
                        details: format!("not a number of seconds: {timeout:?}"),
                    })?;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        let invalid = |details: String| Err(MuxError::InvalidConfig { details });

        if self.device.timeout_secs == 0 {
            return invalid("device.timeout_secs must be positive".to_string());
        }
        if self.device.keepalive_failure_limit == 0 {
            return invalid("device.keepalive_failure_limit must be positive".to_string());
        }
        if self.device.tick_interval_ms == Some(0) {
            return invalid("device.tick_interval_ms must be positive".to_string());
        }
        let tick = self.tick_interval();
        if tick >= self.hardware_timeout() {
            return invalid(format!(
                "tick interval {}ms must be shorter than the hardware timeout {}s",
                tick.as_millis(),
                self.device.timeout_secs
            ));
        }
        if self.socket.backlog == 0 || i32::try_from(self.socket.backlog).is_err() {
            return invalid(format!("socket.backlog out of range: {}", self.socket.backlog));
        }
        if self.socket.accept_batch == 0 {
            return invalid("socket.accept_batch must be positive".to_string());
        }
        if self.clients.capacity == 0 {
            return invalid("clients.capacity must be positive".to_string());
        }
        if self.clients.read_budget == 0 {
            return invalid("clients.read_budget must be positive".to_string());
        }
        if self.logging.level.trim().is_empty() {
            return invalid("logging.level must not be empty".to_string());
        }
        Ok(())
    }

    /// Hardware timeout as a duration.
    #[must_use]
    pub fn hardware_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.device.timeout_secs))
    }

    /// Interval between health evaluations: explicit, or half the hardware
    /// timeout with a one second floor.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        self.device.tick_interval_ms.map_or_else(
            || (self.hardware_timeout() / 2).max(Duration::from_secs(1)),
            Duration::from_millis,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().expect("defaults must validate");
        assert_eq!(config.hardware_timeout(), Duration::from_secs(20));
        assert_eq!(config.tick_interval(), Duration::from_secs(10));
    }

    #[test]
    fn tick_interval_has_one_second_floor() {
        let mut config = Config::default();
        config.device.timeout_secs = 1;
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        // tick == timeout is rejected
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_tick_must_undercut_timeout() {
        let mut config = Config::default();
        config.device.tick_interval_ms = Some(20_000);
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "WDM-1001");

        config.device.tick_interval_ms = Some(500);
        config.validate().expect("500ms tick is fine");
    }

    #[test]
    fn parses_partial_toml() {
        let config = Config::from_toml(
            r#"
            [device]
            timeout_secs = 30
            simulate = true

            [clients]
            capacity = 4

            [logging]
            format = "json"
            "#,
        )
        .expect("valid toml");
        assert_eq!(config.device.timeout_secs, 30);
        assert!(config.device.simulate);
        assert_eq!(config.clients.capacity, 4);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.socket, SocketConfig::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_toml("[device]\ntimeout = 5\n").unwrap_err();
        assert_eq!(err.code(), "WDM-1003");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, MuxError::MissingConfig { .. }));
    }

    #[test]
    fn loads_file_and_round_trips_through_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mux.toml");
        let mut config = Config::default();
        config.socket.path = dir.path().join("mux.sock");
        config.device.load_module = Some("softdog".to_string());
        std::fs::write(&path, config.to_toml().expect("serialize")).expect("write");

        let loaded = Config::load(Some(&path)).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            (ENV_DEVICE, "/dev/watchdog1"),
            (ENV_TIMEOUT, " 60 "),
            (ENV_LOG_LEVEL, "debug"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_env_overrides(|key| env.get(key).map(ToString::to_string))
            .expect("overrides");
        assert_eq!(config.device.path, PathBuf::from("/dev/watchdog1"));
        assert_eq!(config.device.timeout_secs, 60);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.socket.path, PathBuf::from("/run/watchdog-mux.sock"));
    }

    #[test]
    fn bad_env_timeout_is_a_parse_error() {
        let mut config = Config::default();
        let err = config
            .apply_env_overrides(|key| (key == ENV_TIMEOUT).then(|| "soon".to_string()))
            .unwrap_err();
        assert_eq!(err.code(), "WDM-1003");
    }
}
