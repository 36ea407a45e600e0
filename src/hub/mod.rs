//! Inbound dispatch: resolves the sender, applies the request to the arbiter
//! or the router, and publishes after every committed transition.

use crate::actuator::ActuatorBus;
use crate::arbiter::{ArbiterError, Outcome, SessionArbiter};
use crate::broadcast::StateBroadcaster;
use crate::catalog::FixtureCatalog;
use crate::global::GlobalState;
use crate::model::{ClientMessage, FixtureCommand, FixtureId, SessionId};
use crate::registry::{ConnectionRegistry, Outbox, RegistryError};
use crate::router::{CommandRouter, RouteError};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionOp {
    Activate,
    Deactivate,
    Accept,
    Decline,
}

pub struct FixtureHub {
    catalog: Arc<FixtureCatalog>,
    arbiter: Arc<SessionArbiter>,
    registry: Arc<ConnectionRegistry>,
    global: Arc<GlobalState>,
    broadcaster: StateBroadcaster,
    router: CommandRouter,
}

impl FixtureHub {
    pub fn new(
        catalog: Arc<FixtureCatalog>,
        bus: Arc<dyn ActuatorBus>,
        expose_holders: bool,
    ) -> Self {
        let arbiter = Arc::new(SessionArbiter::new(&catalog));
        let registry = Arc::new(ConnectionRegistry::new(arbiter.clone()));
        let global = Arc::new(GlobalState::new(
            catalog.clone(),
            arbiter.clone(),
            bus.clone(),
        ));
        let broadcaster = StateBroadcaster::new(global.clone(), registry.clone(), expose_holders);
        let router = CommandRouter::new(arbiter.clone(), bus);
        Self {
            catalog,
            arbiter,
            registry,
            global,
            broadcaster,
            router,
        }
    }

    pub fn catalog(&self) -> &FixtureCatalog {
        &self.catalog
    }

    #[cfg(test)]
    pub fn arbiter(&self) -> &SessionArbiter {
        &self.arbiter
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_session_live(&self, session_id: &SessionId) -> bool {
        self.registry.lookup(session_id).is_some()
    }

    pub fn actuator_connected(&self) -> bool {
        self.global.actuator_connected()
    }

    pub fn connect(
        &self,
        requested: Option<SessionId>,
        outbox: Outbox,
    ) -> Result<SessionId, RegistryError> {
        self.registry
            .register(requested, outbox, |viewer| self.broadcaster.greeting(viewer))
    }

    pub fn disconnect(&self, session_id: &SessionId) {
        let Some(report) = self.registry.unregister(session_id) else {
            return;
        };
        if report.is_empty() {
            return;
        }
        for (fixture_id, state) in &report.changed {
            tracing::info!(
                fixture_id = %fixture_id,
                session_id = %session_id,
                state = ?state.state(),
                holder = ?state.holder().map(SessionId::as_str),
                "released fixture after disconnect"
            );
        }
        self.broadcaster.publish_state();
    }

    /// Call after the actuator link attaches or detaches. Clients hear about
    /// it only if the link's state differs from what they were last told.
    pub fn actuator_link_changed(&self) {
        self.broadcaster.publish_actuator();
    }

    pub fn handle_message(&self, session_id: &SessionId, message: ClientMessage) {
        if self.registry.lookup(session_id).is_none() {
            tracing::warn!(
                session_id = %session_id,
                event = message.event_name(),
                "dropping message from unregistered session"
            );
            return;
        }

        match message {
            ClientMessage::ActivateSession(fixture_id) => {
                self.session_op(session_id, &fixture_id, SessionOp::Activate)
            }
            ClientMessage::DeactivateSession(fixture_id) => {
                self.session_op(session_id, &fixture_id, SessionOp::Deactivate)
            }
            ClientMessage::AcceptOfferedSession(fixture_id) => {
                self.session_op(session_id, &fixture_id, SessionOp::Accept)
            }
            ClientMessage::DeclineOfferedSession(fixture_id) => {
                self.session_op(session_id, &fixture_id, SessionOp::Decline)
            }
            ClientMessage::UpdateSetting(request) => {
                let (fixture_id, fields) = request.into_parts();
                self.command(session_id, &fixture_id, FixtureCommand::UpdateSetting(fields));
            }
            ClientMessage::RunOneShotTriggerable(request) => self.command(
                session_id,
                &request.fixture_id,
                FixtureCommand::RunOneShotTriggerable {
                    triggerable_name: request.triggerable_name,
                },
            ),
        }
    }

    fn session_op(&self, session_id: &SessionId, fixture_id: &FixtureId, op: SessionOp) {
        tracing::info!(session_id = %session_id, fixture_id = %fixture_id, op = ?op, "session request");
        let result = match op {
            SessionOp::Activate => self.arbiter.request_activate(fixture_id, session_id),
            SessionOp::Deactivate => self.arbiter.deactivate(fixture_id, session_id),
            SessionOp::Accept => self.arbiter.accept_offer(fixture_id, session_id),
            SessionOp::Decline => self.arbiter.decline_offer(fixture_id, session_id),
        };

        match result {
            Ok(Outcome::Changed {
                fixture_id,
                state,
                notices,
            }) => {
                let name = self
                    .catalog
                    .get(&fixture_id)
                    .and_then(|fixture| fixture.name.as_deref())
                    .unwrap_or("-");
                tracing::info!(
                    fixture_id = %fixture_id,
                    fixture = name,
                    state = ?state.state(),
                    "fixture session changed"
                );
                self.broadcaster.publish_change(&fixture_id, &notices);
            }
            Ok(Outcome::Unchanged) => {
                tracing::debug!(session_id = %session_id, fixture_id = %fixture_id, op = ?op, "no-op");
            }
            Err(err @ ArbiterError::UnknownFixture(_)) => {
                tracing::warn!(session_id = %session_id, error = %err, "ignoring session request");
            }
            Err(err @ ArbiterError::InvalidOfferTransition { .. }) => {
                tracing::warn!(error = %err, "ignoring offer answer");
            }
        }
    }

    fn command(&self, session_id: &SessionId, fixture_id: &FixtureId, command: FixtureCommand) {
        match self.router.route_command(session_id, fixture_id, command) {
            Ok(()) => {}
            Err(err @ RouteError::Actuator(_)) => {
                tracing::warn!(session_id = %session_id, fixture_id = %fixture_id, error = %err, "command not delivered");
            }
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "rejected command");
            }
        }
    }
}
