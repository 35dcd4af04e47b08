//! Bounded client table and aggregate health verdict.
//!
//! The registry is generic over the connection type so the verdict logic can be
//! exercised without sockets. All time-dependent operations take `now`
//! explicitly; the reactor passes `Instant::now()`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::clients::protocol::ControlWindow;
use crate::core::errors::{MuxError, Result};

/// Registry key. Identifiers are handed out from a monotonic counter and are
/// never reused, so a stale id cannot alias a newer client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Wrap a raw id, e.g. one decoded from a poll token.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Lifecycle of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Counted by the verdict.
    Active,
    /// Peer hung up or errored; entry is about to be removed.
    Closing,
}

/// One connected client.
#[derive(Debug)]
pub struct Client<C> {
    connection: C,
    deadline: Duration,
    last_heartbeat: Instant,
    state: ClientState,
    /// Open until the leading bytes resolve to a heartbeat or control message.
    control: Option<ControlWindow>,
}

impl<C> Client<C> {
    /// Heartbeat deadline in effect for this client.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// When the client last sent anything.
    #[must_use]
    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Whether the client's leading bytes may still carry a control message.
    #[must_use]
    pub fn awaiting_first_message(&self) -> bool {
        self.control.is_some()
    }

    /// Whether the client checked in within its deadline as of `now`.
    #[must_use]
    pub fn is_healthy(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_heartbeat) < self.deadline
    }
}

/// Connection handed back when the registry is full; the caller closes it.
#[derive(Debug)]
pub struct Rejected<C> {
    /// The refused connection.
    pub connection: C,
    /// Capacity that was reached.
    pub capacity: usize,
}

/// Aggregate health verdict for one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Every active client is within its deadline.
    Healthy,
    /// At least one active client missed its deadline.
    Unhealthy {
        /// Late clients in id order; never empty.
        offenders: Vec<ClientId>,
    },
}

impl Verdict {
    /// `true` for [`Verdict::Healthy`].
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Bounded table of connected clients.
#[derive(Debug)]
pub struct ClientRegistry<C> {
    entries: BTreeMap<ClientId, Client<C>>,
    capacity: usize,
    default_deadline: Duration,
    min_deadline: Duration,
    next_id: u64,
}

impl<C> ClientRegistry<C> {
    /// Create an empty registry.
    ///
    /// `default_deadline` applies to clients that never send a control message;
    /// `min_deadline` is the floor requested deadlines are clamped to.
    #[must_use]
    pub fn new(capacity: usize, default_deadline: Duration, min_deadline: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
            default_deadline,
            min_deadline,
            next_id: 1,
        }
    }

    /// Insert a new client with `last_heartbeat = now`.
    ///
    /// The capacity check happens before insertion; on rejection the registry is
    /// left untouched and the connection is returned to the caller.
    pub fn register(
        &mut self,
        connection: C,
        now: Instant,
    ) -> std::result::Result<ClientId, Rejected<C>> {
        if self.entries.len() >= self.capacity {
            return Err(Rejected {
                connection,
                capacity: self.capacity,
            });
        }
        let id = ClientId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            Client {
                connection,
                deadline: self.default_deadline,
                last_heartbeat: now,
                state: ClientState::Active,
                control: Some(ControlWindow::default()),
            },
        );
        Ok(id)
    }

    /// Override one client's heartbeat deadline. Returns the effective deadline
    /// after clamping to the floor.
    pub fn set_deadline(&mut self, id: ClientId, seconds: u64) -> Result<Duration> {
        if seconds == 0 {
            return Err(MuxError::InvalidDeadline {
                client: id,
                details: "deadline must be positive".to_string(),
            });
        }
        let floor = self.min_deadline;
        let client = self
            .entries
            .get_mut(&id)
            .ok_or(MuxError::UnknownClient { client: id })?;
        client.deadline = Duration::from_secs(seconds).max(floor);
        Ok(client.deadline)
    }

    /// Record a heartbeat. Returns `false` for unknown ids.
    pub fn heartbeat(&mut self, id: ClientId, now: Instant) -> bool {
        match self.entries.get_mut(&id) {
            Some(client) => {
                client.last_heartbeat = now;
                true
            }
            None => false,
        }
    }

    /// The connection together with the client's control window, if still open.
    pub fn io_parts_mut(
        &mut self,
        id: ClientId,
    ) -> Option<(&mut C, Option<&mut ControlWindow>)> {
        self.entries
            .get_mut(&id)
            .map(|client| (&mut client.connection, client.control.as_mut()))
    }

    /// Stop looking for a control message from this client.
    pub fn close_control_window(&mut self, id: ClientId) {
        if let Some(client) = self.entries.get_mut(&id) {
            client.control = None;
        }
    }

    /// Flag a client for cleanup; it no longer counts towards the verdict.
    pub fn mark_closing(&mut self, id: ClientId) {
        if let Some(client) = self.entries.get_mut(&id) {
            client.state = ClientState::Closing;
        }
    }

    /// Delete an entry, handing back its connection. Unknown ids are a no-op.
    pub fn remove(&mut self, id: ClientId) -> Option<C> {
        self.entries.remove(&id).map(|client| client.connection)
    }

    /// Aggregate verdict: healthy iff every active client is within its
    /// deadline. An empty registry is healthy.
    #[must_use]
    pub fn evaluate(&self, now: Instant) -> Verdict {
        let offenders: Vec<ClientId> = self
            .entries
            .iter()
            .filter(|(_, client)| client.state == ClientState::Active && !client.is_healthy(now))
            .map(|(id, _)| *id)
            .collect();
        if offenders.is_empty() {
            Verdict::Healthy
        } else {
            Verdict::Unhealthy { offenders }
        }
    }

    /// Look up a client.
    #[must_use]
    pub fn get(&self, id: ClientId) -> Option<&Client<C>> {
        self.entries.get(&id)
    }

    /// Mutable access to a client's connection.
    pub fn connection_mut(&mut self, id: ClientId) -> Option<&mut C> {
        self.entries.get_mut(&id).map(|client| &mut client.connection)
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: ClientId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of registered clients, closing ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no client is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of clients.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Deadline given to clients that do not request one.
    #[must_use]
    pub fn default_deadline(&self) -> Duration {
        self.default_deadline
    }

    /// Ids of every registered client, in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.entries.keys().copied()
    }

    /// Remove every entry, handing back the connections.
    pub fn drain(&mut self) -> Vec<(ClientId, C)> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(id, client)| (id, client.connection))
            .collect()
    }
}
