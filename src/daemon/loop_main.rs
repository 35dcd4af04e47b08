//! Daemon entry: arm the watchdog, open the client socket, run the reactor,
//! and take the right exit path.
//!
//! - startup failure after arming: disarm (best effort), return the error;
//! - requested shutdown: disarm, remove our socket path, return `Ok`;
//! - fatal runtime failure: return the error with the watchdog still armed,
//!   so the hardware reboots the machine.

use sd_notify::NotifyState;
use tracing::{debug, error, info, warn};

use super::listener;
use super::reactor::{EventSources, Reactor, ReactorSettings};
use super::signals::ShutdownSignal;
use crate::core::config::Config;
use crate::core::errors::Result;
use crate::device::{SimulatedWatchdog, WatchdogController, WatchdogDriver};

/// Run the daemon until `shutdown` is requested or a fatal error occurs.
pub fn run(config: &Config, shutdown: &ShutdownSignal) -> Result<()> {
    config.validate()?;
    if config.device.simulate {
        warn!("running against a simulated watchdog; the machine is NOT protected");
        return serve(SimulatedWatchdog::new(), config, shutdown);
    }
    hardware(config, shutdown)
}

#[cfg(target_os = "linux")]
fn hardware(config: &Config, shutdown: &ShutdownSignal) -> Result<()> {
    use crate::device::linux::{LinuxWatchdog, ensure_device_node};

    ensure_device_node(&config.device.path, config.device.load_module.as_deref())?;
    serve(LinuxWatchdog::new(&config.device.path), config, shutdown)
}

#[cfg(not(target_os = "linux"))]
fn hardware(_config: &Config, _shutdown: &ShutdownSignal) -> Result<()> {
    Err(crate::core::errors::MuxError::Runtime {
        details: "hardware watchdog support requires Linux; set device.simulate".to_string(),
    })
}

/// Drive `driver` through the full daemon lifecycle.
pub fn serve<D: WatchdogDriver>(
    driver: D,
    config: &Config,
    shutdown: &ShutdownSignal,
) -> Result<()> {
    let mut controller = WatchdogController::arm(
        driver,
        config.hardware_timeout(),
        config.device.keepalive_failure_limit,
    )?;

    let sources = match listener::acquire(&config.socket).and_then(EventSources::new) {
        Ok(sources) => sources,
        Err(err) => {
            error!(error = %err, "cannot set up client socket");
            if let Err(disarm_err) = controller.disarm() {
                warn!(error = %disarm_err, "disarm after startup failure");
            }
            return Err(err);
        }
    };

    let mut reactor = Reactor::new(sources, controller, ReactorSettings::from_config(config));
    notify(NotifyState::Ready);

    match reactor.run(shutdown.flag()) {
        Ok(()) => {
            notify(NotifyState::Stopping);
            reactor.shutdown()?;
            info!("clean shutdown");
            Ok(())
        }
        Err(err) => {
            error!(
                error = %err,
                code = err.code(),
                "fatal runtime error, leaving the watchdog armed"
            );
            Err(err)
        }
    }
}

fn notify(state: NotifyState<'_>) {
    if let Err(err) = sd_notify::notify(false, &[state]) {
        debug!(error = %err, "service manager notification failed");
    }
}
