//! Single-threaded readiness loop.
//!
//! One thread owns the [`Poll`], the client registry and the watchdog
//! controller. Each cycle waits until the next tick is due, drains every ready
//! descriptor, then runs the tick if its time has come:
//!
//! ```text
//!   ┌──────────── wait (timeout = time to next tick) ◄───────────┐
//!   │                                                              │
//!   ├─ listener ready ─► accept batch ─► register / refuse         │
//!   ├─ client ready ───► read budget ─► heartbeat / control / close│
//!   │                                                              │
//!   └─ tick due? ──► evaluate ──► Healthy: keepalive ──────────────┘
//!                             └─► Unhealthy: withhold
//! ```
//!
//! mio readiness is edge-triggered, so a listener or client that still had
//! work when its budget ran out is queued as pending and the next wait does
//! not block.
//!
//! Clients that hang up or misbehave are marked closing during dispatch and
//! reaped once the pass is over, so later events of the same pass never touch
//! them.

use std::collections::BTreeSet;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, trace, warn};

use super::listener::{ListeningChannel, SocketArtifact};
use crate::clients::protocol::{ControlWindow, FirstMessage};
use crate::clients::registry::{ClientId, ClientRegistry, ClientState, Verdict};
use crate::core::config::Config;
use crate::core::errors::{MuxError, Result};
use crate::device::{KeepaliveOutcome, WatchdogController, WatchdogDriver};

const LISTENER: Token = Token(0);
const READ_CHUNK: usize = 4096;
const EVENT_CAPACITY: usize = 64;

/// Loop tuning derived from [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorSettings {
    /// Time between health evaluations.
    pub tick_interval: Duration,
    /// Connections accepted per listener readiness event.
    pub accept_batch: usize,
    /// Reads of one client per readiness event.
    pub read_budget: usize,
    /// Maximum number of registered clients.
    pub capacity: usize,
    /// Configured lower bound for client deadlines, before the tick is applied.
    pub deadline_floor: Duration,
}

impl ReactorSettings {
    /// Settings as configured, before fitting to the applied timeout.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            accept_batch: config.socket.accept_batch.max(1),
            read_budget: config.clients.read_budget.max(1),
            capacity: config.clients.capacity,
            deadline_floor: Duration::from_secs(config.clients.min_deadline_secs.max(1)),
        }
    }

    /// Cap the tick at half of the timeout the driver actually applied, which
    /// may be shorter than the one requested.
    #[must_use]
    pub fn fitted_to(mut self, hardware_timeout: Duration) -> Self {
        let ceiling = hardware_timeout / 2;
        if !ceiling.is_zero() && self.tick_interval > ceiling {
            warn!(
                configured_ms = self.tick_interval.as_millis(),
                effective_ms = ceiling.as_millis(),
                hardware_timeout_ms = hardware_timeout.as_millis(),
                "tick interval lowered to fit the hardware timeout"
            );
            self.tick_interval = ceiling;
        }
        self
    }

    /// Smallest deadline a client can end up with: the configured floor, but
    /// never below one tick.
    #[must_use]
    pub fn min_deadline(&self) -> Duration {
        self.deadline_floor.max(self.tick_interval)
    }
}

/// Counters reported when the loop stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReactorStats {
    /// Health evaluations run.
    pub ticks: u64,
    /// Keepalives the driver accepted.
    pub keepalives_sent: u64,
    /// Keepalives the driver refused.
    pub keepalives_failed: u64,
    /// Ticks that skipped the keepalive.
    pub keepalives_withheld: u64,
    /// Clients registered.
    pub accepted: u64,
    /// Connections refused at capacity.
    pub rejected: u64,
    /// Clients removed after hang-up or error.
    pub disconnected: u64,
}

/// One unit of work for a dispatch pass, resolved through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Listener,
    Client { id: ClientId, errored: bool },
}

/// The multiplexer with the listener registered on it.
///
/// Built before the watchdog controller is handed over so a failure here can
/// still disarm the device.
#[derive(Debug)]
pub struct EventSources {
    poll: Poll,
    listener: UnixListener,
    artifact: SocketArtifact,
}

impl EventSources {
    /// Create the poll and register the listener on it.
    pub fn new(channel: ListeningChannel) -> Result<Self> {
        let poll = Poll::new().map_err(|source| MuxError::Poll {
            context: "create",
            source,
        })?;
        let (std_listener, artifact) = channel.into_parts();
        std_listener
            .set_nonblocking(true)
            .map_err(|source| MuxError::Poll {
                context: "listener non-blocking",
                source,
            })?;
        let mut listener = UnixListener::from_std(std_listener);
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(|source| MuxError::Poll {
                context: "register listener",
                source,
            })?;
        Ok(Self {
            poll,
            listener,
            artifact,
        })
    }
}

/// The event loop: owns the poll, the client registry and the watchdog.
pub struct Reactor<D: WatchdogDriver> {
    poll: Poll,
    events: Events,
    ready: Vec<Readiness>,
    listener: UnixListener,
    artifact: Option<SocketArtifact>,
    registry: ClientRegistry<UnixStream>,
    controller: WatchdogController<D>,
    settings: ReactorSettings,
    next_tick: Instant,
    accept_pending: bool,
    read_pending: BTreeSet<ClientId>,
    closing: Vec<(ClientId, &'static str)>,
    scratch: Vec<u8>,
    healthy: bool,
    stats: ReactorStats,
}

impl<D: WatchdogDriver> Reactor<D> {
    /// Assemble the loop. Clients default to the controller's effective
    /// hardware timeout as their deadline, and the tick is fitted to it.
    #[must_use]
    pub fn new(
        sources: EventSources,
        controller: WatchdogController<D>,
        settings: ReactorSettings,
    ) -> Self {
        let settings = settings.fitted_to(controller.timeout());
        let registry = ClientRegistry::new(
            settings.capacity,
            controller.timeout(),
            settings.min_deadline(),
        );
        Self {
            poll: sources.poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            ready: Vec::with_capacity(EVENT_CAPACITY),
            listener: sources.listener,
            artifact: Some(sources.artifact),
            registry,
            controller,
            next_tick: Instant::now() + settings.tick_interval,
            settings,
            accept_pending: false,
            read_pending: BTreeSet::new(),
            closing: Vec::new(),
            scratch: vec![0; READ_CHUNK],
            healthy: true,
            stats: ReactorStats::default(),
        }
    }

    /// Convenience constructor wiring a channel and controller with settings
    /// taken from `config`.
    pub fn from_config(
        config: &Config,
        channel: ListeningChannel,
        controller: WatchdogController<D>,
    ) -> Result<Self> {
        let sources = EventSources::new(channel)?;
        Ok(Self::new(sources, controller, ReactorSettings::from_config(config)))
    }

    /// Cycle until `shutdown` is raised. Returns an error only for failures
    /// that make further operation unsafe.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        info!(
            tick_ms = self.settings.tick_interval.as_millis(),
            capacity = self.settings.capacity,
            default_deadline_secs = self.registry.default_deadline().as_secs(),
            "reactor running"
        );
        while !shutdown.load(Ordering::SeqCst) {
            self.poll_once()?;
        }
        info!("shutdown requested");
        Ok(())
    }

    /// One wait/dispatch/tick cycle.
    pub fn poll_once(&mut self) -> Result<()> {
        let timeout = if self.accept_pending || !self.read_pending.is_empty() {
            Duration::ZERO
        } else {
            self.next_tick.saturating_duration_since(Instant::now())
        };

        if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
            retry_interrupted(err)?;
            self.events.clear();
        }

        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        for event in &self.events {
            if event.token() == LISTENER {
                ready.push(Readiness::Listener);
            } else if let Some(id) = client_id(event.token()) {
                ready.push(Readiness::Client {
                    id,
                    errored: event.is_error(),
                });
            }
        }
        if std::mem::take(&mut self.accept_pending) {
            ready.push(Readiness::Listener);
        }
        ready.extend(
            std::mem::take(&mut self.read_pending)
                .into_iter()
                .map(|id| Readiness::Client { id, errored: false }),
        );

        for readiness in ready.drain(..) {
            match readiness {
                Readiness::Listener => self.accept_ready(),
                Readiness::Client { id, errored } => self.client_ready(id, errored),
            }
        }
        self.ready = ready;
        self.reap_closing();

        let now = Instant::now();
        if now >= self.next_tick {
            self.tick(now)?;
            self.next_tick = now + self.settings.tick_interval;
        }
        Ok(())
    }

    /// Evaluate health as of `now` and pet the watchdog only if every client is
    /// within its deadline.
    pub fn tick(&mut self, now: Instant) -> Result<Verdict> {
        self.stats.ticks += 1;
        let verdict = self.registry.evaluate(now);
        match &verdict {
            Verdict::Healthy => {
                if !self.healthy {
                    info!("all clients healthy again, resuming keepalive");
                    self.healthy = true;
                }
                match self.controller.keepalive()? {
                    KeepaliveOutcome::Petted => self.stats.keepalives_sent += 1,
                    KeepaliveOutcome::Failed { .. } => self.stats.keepalives_failed += 1,
                }
            }
            Verdict::Unhealthy { offenders } => {
                self.stats.keepalives_withheld += 1;
                let names = offenders
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                if self.healthy {
                    warn!(offenders = %names, "client missed its deadline, withholding keepalive");
                    self.healthy = false;
                } else {
                    debug!(offenders = %names, "still withholding keepalive");
                }
            }
        }
        Ok(verdict)
    }

    /// Disarm the watchdog, drop every client and remove the socket path we
    /// created. Repeated calls do nothing further.
    pub fn shutdown(&mut self) -> Result<ReactorStats> {
        for (id, mut conn) in self.registry.drain() {
            if let Err(err) = self.poll.registry().deregister(&mut conn) {
                debug!(client = %id, error = %err, "deregister on shutdown");
            }
        }
        self.read_pending.clear();
        self.closing.clear();
        self.accept_pending = false;
        let disarmed = self.controller.disarm();
        drop(self.artifact.take());

        let stats = self.stats;
        info!(
            ticks = stats.ticks,
            keepalives_sent = stats.keepalives_sent,
            keepalives_failed = stats.keepalives_failed,
            keepalives_withheld = stats.keepalives_withheld,
            accepted = stats.accepted,
            rejected = stats.rejected,
            disconnected = stats.disconnected,
            "reactor stopped"
        );
        disarmed.map(|()| stats)
    }

    fn accept_ready(&mut self) {
        for _ in 0..self.settings.accept_batch {
            match self.listener.accept() {
                Ok((stream, _addr)) => self.admit(stream),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    return;
                }
            }
        }
        // batch used up; more connections may be queued
        self.accept_pending = true;
    }

    fn admit(&mut self, stream: UnixStream) {
        let id = match self.registry.register(stream, Instant::now()) {
            Ok(id) => id,
            Err(rejected) => {
                self.stats.rejected += 1;
                warn!(
                    capacity = rejected.capacity,
                    "client table full, refusing connection"
                );
                drop(rejected.connection);
                return;
            }
        };
        let Some(token) = token(id) else {
            self.registry.remove(id);
            return;
        };
        let registered = match self.registry.connection_mut(id) {
            Some(conn) => self
                .poll
                .registry()
                .register(conn, token, Interest::READABLE),
            None => return,
        };
        if let Err(err) = registered {
            warn!(client = %id, error = %err, "cannot watch connection, dropping it");
            self.registry.remove(id);
            return;
        }
        self.stats.accepted += 1;
        info!(client = %id, clients = self.registry.len(), "client connected");
    }

    fn client_ready(&mut self, id: ClientId, errored: bool) {
        if !self
            .registry
            .get(id)
            .is_some_and(|client| client.state() == ClientState::Active)
        {
            // stale token or already closing
            return;
        }
        let Some((conn, window)) = self.registry.io_parts_mut(id) else {
            return;
        };
        let outcome = drain_connection(conn, &mut self.scratch, self.settings.read_budget, window);

        if outcome.bytes > 0 {
            self.registry.heartbeat(id, Instant::now());
            trace!(client = %id, bytes = outcome.bytes, "heartbeat");
        }

        if let Some(first) = outcome.first {
            self.registry.close_control_window(id);
            match first {
                FirstMessage::SetDeadline(seconds) => {
                    match self.registry.set_deadline(id, seconds) {
                        Ok(effective) => info!(
                            client = %id,
                            requested_secs = seconds,
                            effective_secs = effective.as_secs(),
                            "client deadline set"
                        ),
                        Err(err) => {
                            warn!(client = %id, error = %err, "rejecting deadline");
                            self.close_client(id, "invalid deadline");
                            return;
                        }
                    }
                }
                FirstMessage::Malformed(reason) => {
                    warn!(client = %id, reason = %reason, "malformed control message");
                    self.close_client(id, "malformed control message");
                    return;
                }
                FirstMessage::Heartbeat => {}
            }
        }

        match outcome.end {
            DrainEnd::WouldBlock if errored => self.close_client(id, "socket error"),
            DrainEnd::WouldBlock => {}
            DrainEnd::Eof => self.close_client(id, "peer closed"),
            DrainEnd::Failed(err) => {
                warn!(client = %id, error = %err, "read failed");
                self.close_client(id, "read error");
            }
            DrainEnd::BudgetExhausted => {
                self.read_pending.insert(id);
            }
        }
    }

    /// Take a client out of the verdict now; it is removed after the pass.
    fn close_client(&mut self, id: ClientId, reason: &'static str) {
        self.registry.mark_closing(id);
        self.read_pending.remove(&id);
        self.closing.push((id, reason));
    }

    fn reap_closing(&mut self) {
        for (id, reason) in std::mem::take(&mut self.closing) {
            let Some(mut conn) = self.registry.remove(id) else {
                continue;
            };
            if let Err(err) = self.poll.registry().deregister(&mut conn) {
                debug!(client = %id, error = %err, "deregister failed");
            }
            self.stats.disconnected += 1;
            info!(client = %id, reason, clients = self.registry.len(), "client disconnected");
        }
    }

    /// Connected clients.
    #[must_use]
    pub fn registry(&self) -> &ClientRegistry<UnixStream> {
        &self.registry
    }

    /// The armed watchdog.
    #[must_use]
    pub fn controller(&self) -> &WatchdogController<D> {
        &self.controller
    }

    /// Mutable access to the armed watchdog.
    pub fn controller_mut(&mut self) -> &mut WatchdogController<D> {
        &mut self.controller
    }

    /// Settings in effect, after fitting to the applied timeout.
    #[must_use]
    pub fn settings(&self) -> &ReactorSettings {
        &self.settings
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> ReactorStats {
        self.stats
    }

    /// Socket path owned by this process, until shutdown removes it.
    #[must_use]
    pub fn socket_path(&self) -> Option<&Path> {
        self.artifact.as_ref().and_then(SocketArtifact::path)
    }
}

/// An interrupted wait counts as one that saw no events; any other failure is
/// fatal.
fn retry_interrupted(err: io::Error) -> Result<()> {
    if err.kind() == io::ErrorKind::Interrupted {
        trace!("wait interrupted");
        return Ok(());
    }
    Err(MuxError::Poll {
        context: "wait",
        source: err,
    })
}

fn token(id: ClientId) -> Option<Token> {
    usize::try_from(id.get())
        .ok()
        .filter(|raw| *raw != LISTENER.0 && *raw != usize::MAX)
        .map(Token)
}

fn client_id(token: Token) -> Option<ClientId> {
    u64::try_from(token.0).ok().map(ClientId::from_raw)
}

#[derive(Debug)]
enum DrainEnd {
    WouldBlock,
    Eof,
    Failed(io::Error),
    BudgetExhausted,
}

#[derive(Debug)]
struct DrainOutcome {
    bytes: usize,
    first: Option<FirstMessage>,
    end: DrainEnd,
}

/// Read until the socket would block, closes, fails, or `budget` reads were
/// made. While `window` is open, the bytes read are fed to it until they
/// resolve to the client's first message.
fn drain_connection<R: Read>(
    conn: &mut R,
    buf: &mut [u8],
    budget: usize,
    mut window: Option<&mut ControlWindow>,
) -> DrainOutcome {
    let mut bytes = 0;
    let mut first = None;
    let finish = |bytes, first, end| DrainOutcome { bytes, first, end };

    for _ in 0..budget {
        match conn.read(buf) {
            Ok(0) => return finish(bytes, first, DrainEnd::Eof),
            Ok(n) => {
                if first.is_none() {
                    first = window.as_deref_mut().and_then(|w| w.feed(&buf[..n]));
                }
                bytes += n;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return finish(bytes, first, DrainEnd::WouldBlock);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return finish(bytes, first, DrainEnd::Failed(err)),
        }
    }
    finish(bytes, first, DrainEnd::BudgetExhausted)
}
