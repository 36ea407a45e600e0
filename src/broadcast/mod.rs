use crate::arbiter::{ControlState, Notice};
use crate::global::{GlobalSnapshot, GlobalState};
use crate::model::{FixtureId, FixtureRef, ServerEvent, SessionId};
use crate::registry::ConnectionRegistry;
use std::sync::Arc;

/// Pushes state to connections. Every method enqueues through the registry,
/// which serializes publishes against each other and against new arrivals.
pub struct StateBroadcaster {
    global: Arc<GlobalState>,
    registry: Arc<ConnectionRegistry>,
    expose_holders: bool,
}

impl StateBroadcaster {
    pub fn new(
        global: Arc<GlobalState>,
        registry: Arc<ConnectionRegistry>,
        expose_holders: bool,
    ) -> Self {
        Self {
            global,
            registry,
            expose_holders,
        }
    }

    pub fn publish_state(&self) -> usize {
        let expose = self.expose_holders;
        let delivered = self.registry.broadcast_with(
            || self.global.rebuild(),
            |snapshot, viewer| vec![ServerEvent::StateUpdated(snapshot.view_for(viewer, expose))],
        );
        tracing::debug!(delivered, "state snapshot published");
        delivered
    }

    /// Publishes a snapshot after a transition on `fixture_id`, with each
    /// notice queued right behind its recipient's snapshot. A notice the
    /// snapshot already contradicts (the offer was answered or replaced in
    /// the meantime) is dropped.
    pub fn publish_change(&self, fixture_id: &FixtureId, notices: &[Notice]) -> usize {
        let expose = self.expose_holders;
        let delivered = self.registry.broadcast_with(
            || self.global.rebuild(),
            |snapshot, viewer| {
                let mut events =
                    vec![ServerEvent::StateUpdated(snapshot.view_for(viewer, expose))];
                events.extend(
                    notices
                        .iter()
                        .filter_map(|notice| notice_for(snapshot, viewer, fixture_id, notice)),
                );
                events
            },
        );
        tracing::debug!(
            delivered,
            fixture_id = %fixture_id,
            notices = notices.len(),
            "state change published"
        );
        delivered
    }

    /// Announces the actuator link's current state if it differs from the
    /// last announcement: the connectivity event, then a snapshot. The link
    /// is read under the registry lock, so late reports from a replaced link
    /// settle on whatever is attached now. Returns the announced state.
    pub fn publish_actuator(&self) -> Option<bool> {
        let expose = self.expose_holders;
        let mut announced = None;
        self.registry.broadcast_with(
            || {
                let snapshot = self.global.rebuild();
                let connected = snapshot.actuator_connected;
                if self.global.mark_announced(connected) {
                    announced = Some(connected);
                    Some(snapshot)
                } else {
                    None
                }
            },
            |snapshot, viewer| match snapshot {
                Some(snapshot) => vec![
                    ServerEvent::connectivity(snapshot.actuator_connected),
                    ServerEvent::StateUpdated(snapshot.view_for(viewer, expose)),
                ],
                None => Vec::new(),
            },
        );
        if let Some(connected) = announced {
            tracing::info!(connected, "notified clients of actuator link change");
        }
        announced
    }

    /// First events a new connection sees: the snapshot, then connectivity.
    pub fn greeting(&self, viewer: &SessionId) -> Vec<ServerEvent> {
        let snapshot = self.global.rebuild();
        vec![
            ServerEvent::StateUpdated(snapshot.view_for(viewer, self.expose_holders)),
            ServerEvent::connectivity(snapshot.actuator_connected),
        ]
    }
}

fn notice_for(
    snapshot: &GlobalSnapshot,
    viewer: &SessionId,
    fixture_id: &FixtureId,
    notice: &Notice,
) -> Option<ServerEvent> {
    let control = snapshot.control_of(fixture_id)?;
    let fixture = FixtureRef {
        fixture_id: fixture_id.clone(),
    };
    let pending_requester = control.pending_requester();
    let event = match notice {
        Notice::OfferPending { holder } if holder == viewer => {
            let still_pending =
                matches!(control, ControlState::OfferPending { holder: h, .. } if h == holder);
            if !still_pending {
                return None;
            }
            ServerEvent::OfferPending(fixture)
        }
        Notice::OfferSuperseded { requester }
            if requester == viewer && pending_requester != Some(requester) =>
        {
            ServerEvent::OfferSuperseded(fixture)
        }
        Notice::OfferDeclined { requester }
            if requester == viewer && pending_requester != Some(requester) =>
        {
            ServerEvent::OfferDeclined(fixture)
        }
        _ => return None,
    };
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::ActuatorLink;
    use crate::arbiter::SessionArbiter;
    use crate::catalog::test_catalog;
    use tokio::sync::mpsc;

    struct Setup {
        arbiter: Arc<SessionArbiter>,
        registry: Arc<ConnectionRegistry>,
        link: Arc<ActuatorLink>,
        broadcaster: StateBroadcaster,
    }

    fn setup() -> Setup {
        let catalog = Arc::new(test_catalog(&["1"]));
        let arbiter = Arc::new(SessionArbiter::new(&catalog));
        let registry = Arc::new(ConnectionRegistry::new(arbiter.clone()));
        let link = Arc::new(ActuatorLink::new(4));
        let global = Arc::new(GlobalState::new(catalog, arbiter.clone(), link.clone()));
        let broadcaster = StateBroadcaster::new(global, registry.clone(), false);
        Setup {
            arbiter,
            registry,
            link,
            broadcaster,
        }
    }

    fn connect(registry: &ConnectionRegistry, id: &str) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(8);
        registry
            .register(Some(SessionId::new(id)), tx, |_| Vec::new())
            .unwrap();
        rx
    }

    fn offer_pending(id: &str) -> ServerEvent {
        ServerEvent::OfferPending(FixtureRef {
            fixture_id: FixtureId::new(id),
        })
    }

    #[test]
    fn greeting_is_snapshot_then_connectivity() {
        let t = setup();
        let events = t.broadcaster.greeting(&SessionId::new("a"));
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ServerEvent::StateUpdated(_)));
        assert_eq!(events[1], ServerEvent::ActuatorDisconnected);
    }

    #[tokio::test]
    async fn actuator_change_sends_event_then_snapshot_once() {
        let t = setup();
        let mut rx = connect(&t.registry, "a");

        let (_id, _commands) = t.link.attach().unwrap();
        assert_eq!(t.broadcaster.publish_actuator(), Some(true));
        assert_eq!(t.broadcaster.publish_actuator(), None);

        assert_eq!(rx.recv().await, Some(ServerEvent::ActuatorConnected));
        match rx.recv().await {
            Some(ServerEvent::StateUpdated(view)) => assert!(view.actuator_connected),
            other => panic!("expected snapshot, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_report_from_replaced_link_is_ignored() {
        let t = setup();
        let mut rx = connect(&t.registry, "a");

        let (old, _old_commands) = t.link.attach().unwrap();
        assert_eq!(t.broadcaster.publish_actuator(), Some(true));
        assert!(t.link.detach(old));
        let (_new, _new_commands) = t.link.attach().unwrap();
        assert_eq!(t.broadcaster.publish_actuator(), None);
        // the old link's task reports its disconnect only now
        assert_eq!(t.broadcaster.publish_actuator(), None);

        rx.recv().await;
        rx.recv().await;
        assert!(rx.try_recv().is_err());
        assert!(t
            .broadcaster
            .greeting(&SessionId::new("b"))
            .contains(&ServerEvent::ActuatorConnected));
    }

    #[tokio::test]
    async fn notices_follow_their_recipients_snapshot() {
        let t = setup();
        let mut rx_a = connect(&t.registry, "a");
        let mut rx_b = connect(&t.registry, "b");
        let fixture = FixtureId::new("1");
        t.arbiter
            .request_activate(&fixture, &SessionId::new("a"))
            .unwrap();
        t.arbiter
            .request_activate(&fixture, &SessionId::new("b"))
            .unwrap();

        let delivered = t.broadcaster.publish_change(
            &fixture,
            &[Notice::OfferPending {
                holder: SessionId::new("a"),
            }],
        );
        assert_eq!(delivered, 2);
        assert!(matches!(rx_a.recv().await, Some(ServerEvent::StateUpdated(_))));
        assert_eq!(rx_a.recv().await, Some(offer_pending("1")));
        assert!(matches!(rx_b.recv().await, Some(ServerEvent::StateUpdated(_))));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn notice_contradicted_by_snapshot_is_dropped() {
        let t = setup();
        let mut rx_a = connect(&t.registry, "a");
        let fixture = FixtureId::new("1");
        t.arbiter
            .request_activate(&fixture, &SessionId::new("a"))
            .unwrap();
        t.arbiter
            .request_activate(&fixture, &SessionId::new("b"))
            .unwrap();
        // answered before the offer's publish got the registry lock
        t.arbiter
            .decline_offer(&fixture, &SessionId::new("a"))
            .unwrap();

        t.broadcaster.publish_change(
            &fixture,
            &[Notice::OfferPending {
                holder: SessionId::new("a"),
            }],
        );
        match rx_a.recv().await {
            Some(ServerEvent::StateUpdated(view)) => assert!(!view.fixtures[0].offer_pending),
            other => panic!("expected snapshot, got {other:?}"),
        }
        assert!(rx_a.try_recv().is_err());
    }
}
