use crate::actuator::{ActuatorBus, ActuatorError};
use crate::arbiter::{ArbiterError, SessionArbiter};
use crate::model::{ActuatorCommand, FixtureCommand, FixtureId, SessionId};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    UnknownFixture(FixtureId),
    NotAuthorized {
        fixture_id: FixtureId,
        session_id: SessionId,
    },
    EmptyTriggerable,
    Actuator(ActuatorError),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFixture(id) => write!(f, "unknown fixture {id}"),
            Self::NotAuthorized {
                fixture_id,
                session_id,
            } => write!(
                f,
                "session {session_id} does not hold fixture {fixture_id}"
            ),
            Self::EmptyTriggerable => write!(f, "triggerable name must not be empty"),
            Self::Actuator(err) => write!(f, "actuator: {err}"),
        }
    }
}

impl std::error::Error for RouteError {}

impl From<ArbiterError> for RouteError {
    fn from(err: ArbiterError) -> Self {
        match err {
            ArbiterError::UnknownFixture(id) => Self::UnknownFixture(id),
            ArbiterError::InvalidOfferTransition {
                fixture_id,
                session_id,
            } => Self::NotAuthorized {
                fixture_id,
                session_id,
            },
        }
    }
}

/// Gate between clients and the actuator bus. Holds no state of its own.
pub struct CommandRouter {
    arbiter: Arc<SessionArbiter>,
    bus: Arc<dyn ActuatorBus>,
}

impl CommandRouter {
    pub fn new(arbiter: Arc<SessionArbiter>, bus: Arc<dyn ActuatorBus>) -> Self {
        Self { arbiter, bus }
    }

    pub fn route_command(
        &self,
        session_id: &SessionId,
        fixture_id: &FixtureId,
        command: FixtureCommand,
    ) -> Result<(), RouteError> {
        if !self.arbiter.is_holder(fixture_id, session_id)? {
            return Err(RouteError::NotAuthorized {
                fixture_id: fixture_id.clone(),
                session_id: session_id.clone(),
            });
        }
        if let FixtureCommand::RunOneShotTriggerable { triggerable_name } = &command {
            if triggerable_name.trim().is_empty() {
                return Err(RouteError::EmptyTriggerable);
            }
        }

        let command = ActuatorCommand::new(fixture_id.clone(), command);
        tracing::info!(
            fixture_id = %fixture_id,
            session_id = %session_id,
            kind = ?command.command_kind,
            "forwarding command"
        );
        self.bus.forward(command).map_err(RouteError::Actuator)
    }
}
