use crate::model::ActuatorCommand;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Downstream sink for commands that passed the holder check.
pub trait ActuatorBus: Send + Sync {
    fn forward(&self, command: ActuatorCommand) -> Result<(), ActuatorError>;
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActuatorError {
    Disconnected,
    QueueFull,
    AlreadyAttached,
}

impl fmt::Display for ActuatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "actuator link is not connected"),
            Self::QueueFull => write!(f, "actuator link queue is full"),
            Self::AlreadyAttached => write!(f, "an actuator link is already attached"),
        }
    }
}

impl std::error::Error for ActuatorError {}

struct AttachedLink {
    id: Uuid,
    tx: mpsc::Sender<ActuatorCommand>,
}

/// Holds the single live actuator connection, if any.
pub struct ActuatorLink {
    slot: Mutex<Option<AttachedLink>>,
    queue: usize,
}

impl ActuatorLink {
    pub fn new(queue: usize) -> Self {
        Self {
            slot: Mutex::new(None),
            queue: queue.max(1),
        }
    }

    /// Claims the link. The returned receiver yields forwarded commands until
    /// [`ActuatorLink::detach`] is called with the same id.
    pub fn attach(&self) -> Result<(Uuid, mpsc::Receiver<ActuatorCommand>), ActuatorError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|link| !link.tx.is_closed()) {
            return Err(ActuatorError::AlreadyAttached);
        }
        let (tx, rx) = mpsc::channel(self.queue);
        let id = Uuid::new_v4();
        *slot = Some(AttachedLink { id, tx });
        Ok((id, rx))
    }

    /// Returns false when `id` is not the attached link (already replaced or
    /// detached).
    pub fn detach(&self, id: Uuid) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|link| link.id == id) {
            *slot = None;
            true
        } else {
            false
        }
    }
}

impl ActuatorBus for ActuatorLink {
    fn forward(&self, command: ActuatorCommand) -> Result<(), ActuatorError> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let link = slot.as_ref().ok_or(ActuatorError::Disconnected)?;
        link.tx.try_send(command).map_err(|err| match err {
            TrySendError::Full(_) => ActuatorError::QueueFull,
            TrySendError::Closed(_) => ActuatorError::Disconnected,
        })
    }

    fn is_connected(&self) -> bool {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().is_some_and(|link| !link.tx.is_closed())
    }
}
