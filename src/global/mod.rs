use crate::actuator::ActuatorBus;
use crate::arbiter::{ControlState, SessionArbiter};
use crate::catalog::FixtureCatalog;
use crate::model::{FixtureId, FixtureView, SessionId, StateView};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct FixtureSnapshot {
    pub fixture: crate::catalog::Fixture,
    pub control: ControlState,
}

/// Viewer-independent state, rebuilt once per publish.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSnapshot {
    pub fixtures: Vec<FixtureSnapshot>,
    pub actuator_connected: bool,
}

impl GlobalSnapshot {
    pub fn control_of(&self, fixture_id: &FixtureId) -> Option<&ControlState> {
        self.fixtures
            .iter()
            .find(|snap| &snap.fixture.id == fixture_id)
            .map(|snap| &snap.control)
    }

    /// Renders the snapshot for one connection. Holder identities are only
    /// included when `expose_holders` is set; otherwise a viewer learns just
    /// whether it is the holder or requester itself.
    pub fn view_for(&self, viewer: &SessionId, expose_holders: bool) -> StateView {
        let fixtures = self
            .fixtures
            .iter()
            .map(|snap| {
                let holder = snap.control.holder();
                let requester = snap.control.pending_requester();
                FixtureView {
                    id: snap.fixture.id.clone(),
                    name: snap.fixture.name.clone(),
                    metadata: snap.fixture.metadata.clone(),
                    state: snap.control.state(),
                    controlled: holder.is_some(),
                    held_by_you: holder == Some(viewer),
                    offer_pending: requester.is_some(),
                    requested_by_you: requester == Some(viewer),
                    holder: holder.filter(|_| expose_holders).cloned(),
                    pending_requester: requester.filter(|_| expose_holders).cloned(),
                }
            })
            .collect();
        StateView {
            fixtures,
            actuator_connected: self.actuator_connected,
        }
    }
}

pub struct GlobalState {
    catalog: Arc<FixtureCatalog>,
    arbiter: Arc<SessionArbiter>,
    actuator: Arc<dyn ActuatorBus>,
    announced: AtomicBool,
}

impl GlobalState {
    pub fn new(
        catalog: Arc<FixtureCatalog>,
        arbiter: Arc<SessionArbiter>,
        actuator: Arc<dyn ActuatorBus>,
    ) -> Self {
        let announced = AtomicBool::new(actuator.is_connected());
        Self {
            catalog,
            arbiter,
            actuator,
            announced,
        }
    }

    pub fn rebuild(&self) -> GlobalSnapshot {
        let mut states = self.arbiter.snapshot();
        let fixtures = self
            .catalog
            .iter()
            .map(|fixture| FixtureSnapshot {
                fixture: fixture.clone(),
                control: states.remove(&fixture.id).unwrap_or_default(),
            })
            .collect();
        GlobalSnapshot {
            fixtures,
            actuator_connected: self.actuator_connected(),
        }
    }

    /// Read from the link itself, never cached.
    pub fn actuator_connected(&self) -> bool {
        self.actuator.is_connected()
    }

    /// Records the connectivity last announced to clients. Returns true if it
    /// differs from the previous announcement.
    pub fn mark_announced(&self, connected: bool) -> bool {
        self.announced.swap(connected, Ordering::SeqCst) != connected
    }
}
