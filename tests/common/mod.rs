//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::Duration;

use watchdog_mux::core::config::Config;
use watchdog_mux::daemon::listener::ListeningChannel;
use watchdog_mux::daemon::reactor::Reactor;
use watchdog_mux::device::{SimulatedWatchdog, WatchdogController};

/// Outcome of one CLI invocation, with a log file kept for post-mortems.
pub struct CliResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

/// Run the `watchdog-mux` binary with `args` and record its output.
pub fn run_cli_case(case_name: &str, args: &[&str]) -> CliResult {
    let output = Command::new(env!("CARGO_BIN_EXE_watchdog-mux"))
        .args(args)
        .env_remove("WATCHDOG_MUX_DEVICE")
        .env_remove("WATCHDOG_MUX_SOCKET")
        .env_remove("WATCHDOG_MUX_TIMEOUT")
        .env_remove("WATCHDOG_MUX_LOG_LEVEL")
        .output()
        .expect("spawn watchdog-mux");
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    let log_dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join("cli-cases");
    std::fs::create_dir_all(&log_dir).expect("log dir");
    let log_path = log_dir.join(format!("{case_name}.log"));
    std::fs::write(
        &log_path,
        format!(
            "args: {args:?}\nstatus: {}\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}\n",
            output.status
        ),
    )
    .expect("write case log");

    CliResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Config for a reactor on a private socket with a fast tick.
pub fn fast_config(dir: &Path, capacity: usize) -> Config {
    let mut config = Config::default();
    config.device.simulate = true;
    config.device.tick_interval_ms = Some(50);
    config.socket.path = dir.join("mux.sock");
    config.socket.socket_activation = false;
    config.clients.capacity = capacity;
    config.validate().expect("test config is valid");
    config
}

/// Reactor over a simulated watchdog, listening on `config.socket.path`.
pub fn simulated_reactor(config: &Config) -> Reactor<SimulatedWatchdog> {
    let channel =
        ListeningChannel::create(&config.socket.path, config.socket.backlog).expect("listen");
    let controller = WatchdogController::arm(
        SimulatedWatchdog::new(),
        config.hardware_timeout(),
        config.device.keepalive_failure_limit,
    )
    .expect("arm simulated watchdog");
    Reactor::from_config(config, channel, controller).expect("reactor")
}

/// Cycle the reactor until `done` holds, failing after a few seconds.
pub fn pump_until<F>(reactor: &mut Reactor<SimulatedWatchdog>, what: &str, done: F)
where
    F: Fn(&Reactor<SimulatedWatchdog>) -> bool,
{
    for _ in 0..200 {
        if done(reactor) {
            return;
        }
        reactor.poll_once().expect("poll cycle");
    }
    assert!(done(reactor), "timed out waiting for: {what}");
}

/// Connected client socket with a read timeout so tests never hang.
pub fn connect(path: &Path) -> UnixStream {
    let stream = UnixStream::connect(path).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("read timeout");
    stream
}
