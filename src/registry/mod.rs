use crate::arbiter::{DisconnectReport, SessionArbiter};
use crate::model::{ServerEvent, SessionId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};

pub type Outbox = mpsc::Sender<ServerEvent>;

#[derive(Debug, Clone)]
pub struct Connection {
    pub session_id: SessionId,
    pub outbox: Outbox,
    pub connected_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateSession(SessionId),
    InvalidSessionId,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateSession(id) => write!(f, "session {id} is already connected"),
            Self::InvalidSessionId => write!(f, "malformed session id"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Live client connections keyed by session id.
///
/// The map lock also orders fan-out: every broadcast and every greeting is
/// enqueued while holding it, so a newcomer's greeting is always the first
/// thing in its outbox and snapshots reach each outbox in publish order.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<SessionId, Connection>>,
    arbiter: Arc<SessionArbiter>,
}

impl ConnectionRegistry {
    pub fn new(arbiter: Arc<SessionArbiter>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            arbiter,
        }
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<SessionId, Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a connection. `greeting` runs under the registry lock and its
    /// events are queued before the connection becomes visible to broadcasts.
    pub fn register<G>(
        &self,
        requested: Option<SessionId>,
        outbox: Outbox,
        greeting: G,
    ) -> Result<SessionId, RegistryError>
    where
        G: FnOnce(&SessionId) -> Vec<ServerEvent>,
    {
        let session_id = requested.unwrap_or_else(SessionId::generate);
        if !session_id.is_well_formed() {
            return Err(RegistryError::InvalidSessionId);
        }

        let mut connections = self.guard();
        if connections.contains_key(&session_id) {
            return Err(RegistryError::DuplicateSession(session_id));
        }
        for event in greeting(&session_id) {
            deliver(&session_id, &outbox, event);
        }
        connections.insert(
            session_id.clone(),
            Connection {
                session_id: session_id.clone(),
                outbox,
                connected_at: Instant::now(),
            },
        );
        tracing::info!(session_id = %session_id, live = connections.len(), "session connected");
        Ok(session_id)
    }

    /// Removes the connection and releases its arbitration roles before
    /// returning. `None` if the session was not registered.
    ///
    /// The roles are released under the registry lock, so a reconnect with
    /// the same id cannot register until cleanup for the old connection is
    /// done.
    pub fn unregister(&self, session_id: &SessionId) -> Option<DisconnectReport> {
        let mut connections = self.guard();
        let removed = connections.remove(session_id)?;
        tracing::info!(
            session_id = %session_id,
            live = connections.len(),
            connected_ms = removed.connected_at.elapsed().as_millis() as u64,
            "session disconnected"
        );
        Some(self.arbiter.handle_disconnect(session_id))
    }

    pub fn lookup(&self, session_id: &SessionId) -> Option<Connection> {
        self.guard().get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    /// Best-effort delivery to every connection. Returns how many outboxes
    /// accepted the event.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        self.broadcast_with(|| (), |_, _| vec![event.clone()])
    }

    /// Like [`ConnectionRegistry::broadcast`], but builds each recipient's
    /// events from a value prepared under the registry lock. Returns how many
    /// recipients accepted everything rendered for them; recipients with
    /// nothing rendered are not counted.
    pub fn broadcast_with<S, P, R>(&self, prepare: P, render: R) -> usize
    where
        P: FnOnce() -> S,
        R: Fn(&S, &SessionId) -> Vec<ServerEvent>,
    {
        let connections = self.guard();
        let prepared = prepare();
        connections
            .values()
            .filter(|conn| {
                let events = render(&prepared, &conn.session_id);
                let rendered = !events.is_empty();
                events.into_iter().fold(rendered, |ok, event| {
                    let delivered = deliver(&conn.session_id, &conn.outbox, event);
                    ok && delivered
                })
            })
            .count()
    }
}

fn deliver(session_id: &SessionId, outbox: &Outbox, event: ServerEvent) -> bool {
    let name = event.event_name();
    match outbox.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!(session_id = %session_id, event = name, "outbox full, dropping event");
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(session_id = %session_id, event = name, "outbox closed");
            false
        }
    }
}
