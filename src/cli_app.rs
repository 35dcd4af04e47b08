//! Top-level CLI definition and dispatch.

use std::io;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use crate::core::config::Config;
use crate::core::errors::Result;
use crate::daemon::{loop_main, signals::ShutdownSignal};
use crate::logger;

/// Watchdog multiplexer: shares one hardware watchdog among many clients.
#[derive(Parser, Debug)]
#[command(name = "watchdog-mux", version, about)]
pub struct Cli {
    /// Configuration file (default: /etc/watchdog-mux.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Watchdog device node.
    #[arg(long, global = true)]
    pub device: Option<PathBuf>,
    /// Client socket path.
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,
    /// Hardware timeout in seconds.
    #[arg(long, global = true)]
    pub timeout: Option<u32>,
    /// Log filter, e.g. `info` or `watchdog_mux=debug`.
    #[arg(long, global = true)]
    pub log_level: Option<String>,
    /// Use a simulated watchdog instead of hardware.
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon in the foreground (used by systemd).
    Daemon,
    /// Print the effective configuration.
    Config {
        /// Emit JSON instead of TOML.
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

impl Cli {
    /// Resolve the effective configuration: file, then environment, then flags.
    pub fn effective_config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        if let Some(device) = &self.device {
            config.device.path.clone_from(device);
        }
        if let Some(socket) = &self.socket {
            config.socket.path.clone_from(socket);
        }
        if let Some(timeout) = self.timeout {
            config.device.timeout_secs = timeout;
        }
        if let Some(level) = &self.log_level {
            config.logging.level.clone_from(level);
        }
        if self.simulate {
            config.device.simulate = true;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Dispatch CLI commands.
///
/// # Errors
/// Returns an error if the subcommand fails.
pub fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Daemon => {
            let config = cli.effective_config()?;
            logger::init(&config.logging)?;
            let shutdown = ShutdownSignal::install()?;
            loop_main::run(&config, &shutdown)
        }
        Command::Config { json } => {
            let config = cli.effective_config()?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print!("{}", config.to_toml()?);
            }
            Ok(())
        }
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "watchdog-mux", &mut io::stdout());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("mux.toml");
        std::fs::write(&file, "[device]\ntimeout_secs = 40\n").expect("write");
        let cli = Cli::parse_from([
            "watchdog-mux",
            "--config",
            file.to_str().expect("utf-8 path"),
            "--socket",
            "/tmp/other.sock",
            "--simulate",
            "config",
        ]);
        let config = cli.effective_config().expect("config");
        assert_eq!(config.device.timeout_secs, 40);
        assert_eq!(config.socket.path, PathBuf::from("/tmp/other.sock"));
        assert!(config.device.simulate);
    }

    #[test]
    fn invalid_flag_combination_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("mux.toml");
        std::fs::write(&file, "[device]\ntick_interval_ms = 5000\n").expect("write");
        let cli = Cli::parse_from([
            "watchdog-mux",
            "--config",
            file.to_str().expect("utf-8 path"),
            "--timeout",
            "4",
            "daemon",
        ]);
        assert_eq!(cli.effective_config().unwrap_err().code(), "WDM-1001");
    }
}
