//! Exclusive control sessions over catalog fixtures.
//!
//! Every fixture owns one [`ControlState`] behind its own mutex. Operations on
//! different fixtures never contend; operations on the same fixture (including
//! disconnect cleanup) serialize through that mutex.

use crate::catalog::FixtureCatalog;
use crate::model::{FixtureId, SessionId, SessionState};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ControlState {
    #[default]
    Idle,
    Active {
        holder: SessionId,
    },
    OfferPending {
        holder: SessionId,
        requester: SessionId,
    },
}

impl ControlState {
    pub fn state(&self) -> SessionState {
        match self {
            Self::Idle => SessionState::Idle,
            Self::Active { .. } => SessionState::Active,
            Self::OfferPending { .. } => SessionState::OfferPending,
        }
    }

    pub fn holder(&self) -> Option<&SessionId> {
        match self {
            Self::Idle => None,
            Self::Active { holder } | Self::OfferPending { holder, .. } => Some(holder),
        }
    }

    pub fn pending_requester(&self) -> Option<&SessionId> {
        match self {
            Self::OfferPending { requester, .. } => Some(requester),
            _ => None,
        }
    }
}

/// Targeted message produced by a negotiation step. Delivery is up to the
/// caller; the arbiter only decides who should hear about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The holder is asked to accept or decline a takeover.
    OfferPending { holder: SessionId },
    /// An earlier requester lost its place to a newer one.
    OfferSuperseded { requester: SessionId },
    /// The holder turned the requester down.
    OfferDeclined { requester: SessionId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    Changed {
        fixture_id: FixtureId,
        state: ControlState,
        notices: Vec<Notice>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectReport {
    pub changed: Vec<(FixtureId, ControlState)>,
}

impl DisconnectReport {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArbiterError {
    UnknownFixture(FixtureId),
    InvalidOfferTransition {
        fixture_id: FixtureId,
        session_id: SessionId,
    },
}

impl fmt::Display for ArbiterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFixture(id) => write!(f, "unknown fixture {id}"),
            Self::InvalidOfferTransition {
                fixture_id,
                session_id,
            } => write!(
                f,
                "session {session_id} cannot answer an offer on fixture {fixture_id}"
            ),
        }
    }
}

impl std::error::Error for ArbiterError {}

pub struct SessionArbiter {
    sessions: BTreeMap<FixtureId, Mutex<ControlState>>,
}

impl SessionArbiter {
    pub fn new(catalog: &FixtureCatalog) -> Self {
        let sessions = catalog
            .ids()
            .map(|id| (id.clone(), Mutex::new(ControlState::Idle)))
            .collect();
        Self { sessions }
    }

    fn lock(&self, fixture_id: &FixtureId) -> Result<MutexGuard<'_, ControlState>, ArbiterError> {
        self.sessions
            .get(fixture_id)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
            .ok_or_else(|| ArbiterError::UnknownFixture(fixture_id.clone()))
    }

    pub fn request_activate(
        &self,
        fixture_id: &FixtureId,
        session_id: &SessionId,
    ) -> Result<Outcome, ArbiterError> {
        let mut state = self.lock(fixture_id)?;
        let (next, notices) = match &*state {
            ControlState::Idle => (
                ControlState::Active {
                    holder: session_id.clone(),
                },
                Vec::new(),
            ),
            ControlState::Active { holder } if holder == session_id => {
                return Ok(Outcome::Unchanged)
            }
            ControlState::Active { holder } => (
                ControlState::OfferPending {
                    holder: holder.clone(),
                    requester: session_id.clone(),
                },
                vec![Notice::OfferPending {
                    holder: holder.clone(),
                }],
            ),
            ControlState::OfferPending { holder, requester }
                if holder == session_id || requester == session_id =>
            {
                return Ok(Outcome::Unchanged)
            }
            ControlState::OfferPending { holder, requester } => (
                ControlState::OfferPending {
                    holder: holder.clone(),
                    requester: session_id.clone(),
                },
                vec![
                    Notice::OfferSuperseded {
                        requester: requester.clone(),
                    },
                    Notice::OfferPending {
                        holder: holder.clone(),
                    },
                ],
            ),
        };
        Ok(commit(&mut state, fixture_id, next, notices))
    }

    pub fn deactivate(
        &self,
        fixture_id: &FixtureId,
        session_id: &SessionId,
    ) -> Result<Outcome, ArbiterError> {
        let mut state = self.lock(fixture_id)?;
        let is_holder =
            matches!(&*state, ControlState::Active { holder } if holder == session_id);
        if !is_holder {
            return Ok(Outcome::Unchanged);
        }
        Ok(commit(&mut state, fixture_id, ControlState::Idle, Vec::new()))
    }

    pub fn accept_offer(
        &self,
        fixture_id: &FixtureId,
        session_id: &SessionId,
    ) -> Result<Outcome, ArbiterError> {
        let mut state = self.lock(fixture_id)?;
        let next = match &*state {
            ControlState::OfferPending { holder, requester } if holder == session_id => {
                ControlState::Active {
                    holder: requester.clone(),
                }
            }
            _ => return Err(invalid_offer(fixture_id, session_id)),
        };
        Ok(commit(&mut state, fixture_id, next, Vec::new()))
    }

    pub fn decline_offer(
        &self,
        fixture_id: &FixtureId,
        session_id: &SessionId,
    ) -> Result<Outcome, ArbiterError> {
        let mut state = self.lock(fixture_id)?;
        let (next, notices) = match &*state {
            ControlState::OfferPending { holder, requester } if holder == session_id => (
                ControlState::Active {
                    holder: holder.clone(),
                },
                vec![Notice::OfferDeclined {
                    requester: requester.clone(),
                }],
            ),
            _ => return Err(invalid_offer(fixture_id, session_id)),
        };
        Ok(commit(&mut state, fixture_id, next, notices))
    }

    /// Releases every role `session_id` holds. A departing holder with a
    /// pending offer hands control to the requester.
    pub fn handle_disconnect(&self, session_id: &SessionId) -> DisconnectReport {
        let mut report = DisconnectReport::default();
        for (fixture_id, slot) in &self.sessions {
            let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let next = match &*state {
                ControlState::Active { holder } if holder == session_id => ControlState::Idle,
                ControlState::OfferPending { holder, requester } if holder == session_id => {
                    ControlState::Active {
                        holder: requester.clone(),
                    }
                }
                ControlState::OfferPending { holder, requester } if requester == session_id => {
                    ControlState::Active {
                        holder: holder.clone(),
                    }
                }
                _ => continue,
            };
            tracing::debug!(
                fixture_id = %fixture_id,
                session_id = %session_id,
                from = ?state.state(),
                to = ?next.state(),
                "released on disconnect"
            );
            *state = next.clone();
            report.changed.push((fixture_id.clone(), next));
        }
        report
    }

    pub fn is_holder(
        &self,
        fixture_id: &FixtureId,
        session_id: &SessionId,
    ) -> Result<bool, ArbiterError> {
        let state = self.lock(fixture_id)?;
        Ok(state.holder() == Some(session_id))
    }

    #[cfg(test)]
    pub(crate) fn lock_fixture(&self, fixture_id: &FixtureId) -> MutexGuard<'_, ControlState> {
        self.lock(fixture_id).unwrap()
    }

    #[cfg(test)]
    pub fn state_of(&self, fixture_id: &FixtureId) -> Result<ControlState, ArbiterError> {
        Ok(self.lock(fixture_id)?.clone())
    }

    /// Per-fixture copy of the current states. Each fixture is read under its
    /// own lock; there is no cross-fixture atomicity.
    pub fn snapshot(&self) -> BTreeMap<FixtureId, ControlState> {
        self.sessions
            .iter()
            .map(|(id, slot)| {
                let state = slot.lock().unwrap_or_else(PoisonError::into_inner);
                (id.clone(), state.clone())
            })
            .collect()
    }
}

fn commit(
    state: &mut ControlState,
    fixture_id: &FixtureId,
    next: ControlState,
    notices: Vec<Notice>,
) -> Outcome {
    tracing::debug!(
        fixture_id = %fixture_id,
        from = ?state.state(),
        to = ?next.state(),
        "session transition"
    );
    *state = next.clone();
    Outcome::Changed {
        fixture_id: fixture_id.clone(),
        state: next,
        notices,
    }
}

fn invalid_offer(fixture_id: &FixtureId, session_id: &SessionId) -> ArbiterError {
    ArbiterError::InvalidOfferTransition {
        fixture_id: fixture_id.clone(),
        session_id: session_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_catalog;

    fn f(id: &str) -> FixtureId {
        FixtureId::new(id)
    }

    fn s(id: &str) -> SessionId {
        SessionId::new(id)
    }

    fn arbiter() -> SessionArbiter {
        SessionArbiter::new(&test_catalog(&["1", "2"]))
    }

    fn active(holder: &str) -> ControlState {
        ControlState::Active { holder: s(holder) }
    }

    fn pending(holder: &str, requester: &str) -> ControlState {
        ControlState::OfferPending {
            holder: s(holder),
            requester: s(requester),
        }
    }

    #[test]
    fn starts_idle() {
        let arb = arbiter();
        assert_eq!(arb.state_of(&f("1")).unwrap(), ControlState::Idle);
        assert_eq!(arb.snapshot().len(), 2);
    }

    #[test]
    fn unknown_fixture_is_rejected_everywhere() {
        let arb = arbiter();
        let unknown = f("9");
        let a = s("a");
        let expected = ArbiterError::UnknownFixture(unknown.clone());
        assert_eq!(arb.request_activate(&unknown, &a).unwrap_err(), expected);
        assert_eq!(arb.deactivate(&unknown, &a).unwrap_err(), expected);
        assert_eq!(arb.accept_offer(&unknown, &a).unwrap_err(), expected);
        assert_eq!(arb.decline_offer(&unknown, &a).unwrap_err(), expected);
        assert_eq!(arb.is_holder(&unknown, &a).unwrap_err(), expected);
    }

    #[test]
    fn activate_from_idle_then_idempotent() {
        let arb = arbiter();
        let outcome = arb.request_activate(&f("1"), &s("a")).unwrap();
        assert_eq!(
            outcome,
            Outcome::Changed {
                fixture_id: f("1"),
                state: active("a"),
                notices: vec![],
            }
        );
        assert_eq!(
            arb.request_activate(&f("1"), &s("a")).unwrap(),
            Outcome::Unchanged
        );
        assert!(arb.is_holder(&f("1"), &s("a")).unwrap());
        assert!(!arb.is_holder(&f("2"), &s("a")).unwrap());
    }

    #[test]
    fn takeover_then_accept_hands_over() {
        let arb = arbiter();
        arb.request_activate(&f("1"), &s("a")).unwrap();

        let outcome = arb.request_activate(&f("1"), &s("b")).unwrap();
        assert_eq!(
            outcome,
            Outcome::Changed {
                fixture_id: f("1"),
                state: pending("a", "b"),
                notices: vec![Notice::OfferPending { holder: s("a") }],
            }
        );
        assert!(arb.is_holder(&f("1"), &s("a")).unwrap());
        assert!(!arb.is_holder(&f("1"), &s("b")).unwrap());

        let outcome = arb.accept_offer(&f("1"), &s("a")).unwrap();
        assert!(matches!(outcome, Outcome::Changed { .. }));
        assert_eq!(arb.state_of(&f("1")).unwrap(), active("b"));
    }

    #[test]
    fn takeover_then_decline_keeps_holder() {
        let arb = arbiter();
        arb.request_activate(&f("1"), &s("a")).unwrap();
        arb.request_activate(&f("1"), &s("b")).unwrap();

        let outcome = arb.decline_offer(&f("1"), &s("a")).unwrap();
        assert_eq!(
            outcome,
            Outcome::Changed {
                fixture_id: f("1"),
                state: active("a"),
                notices: vec![Notice::OfferDeclined { requester: s("b") }],
            }
        );
        let state = arb.state_of(&f("1")).unwrap();
        assert_eq!(state.pending_requester(), None);
    }

    #[test]
    fn newest_requester_wins() {
        let arb = arbiter();
        arb.request_activate(&f("1"), &s("a")).unwrap();
        arb.request_activate(&f("1"), &s("b")).unwrap();

        let outcome = arb.request_activate(&f("1"), &s("c")).unwrap();
        assert_eq!(
            outcome,
            Outcome::Changed {
                fixture_id: f("1"),
                state: pending("a", "c"),
                notices: vec![
                    Notice::OfferSuperseded { requester: s("b") },
                    Notice::OfferPending { holder: s("a") },
                ],
            }
        );
    }

    #[test]
    fn repeated_requests_during_offer_are_noops() {
        let arb = arbiter();
        arb.request_activate(&f("1"), &s("a")).unwrap();
        arb.request_activate(&f("1"), &s("b")).unwrap();
        assert_eq!(
            arb.request_activate(&f("1"), &s("b")).unwrap(),
            Outcome::Unchanged
        );
        assert_eq!(
            arb.request_activate(&f("1"), &s("a")).unwrap(),
            Outcome::Unchanged
        );
        assert_eq!(arb.state_of(&f("1")).unwrap(), pending("a", "b"));
    }

    #[test]
    fn deactivate_by_non_holder_is_noop() {
        let arb = arbiter();
        assert_eq!(arb.deactivate(&f("1"), &s("a")).unwrap(), Outcome::Unchanged);

        arb.request_activate(&f("1"), &s("a")).unwrap();
        assert_eq!(arb.deactivate(&f("1"), &s("b")).unwrap(), Outcome::Unchanged);
        assert_eq!(arb.state_of(&f("1")).unwrap(), active("a"));

        assert!(matches!(arb.deactivate(&f("1"), &s("a")).unwrap(), Outcome::Changed { .. }));
        assert_eq!(arb.state_of(&f("1")).unwrap(), ControlState::Idle);
    }

    #[test]
    fn deactivate_during_offer_is_noop() {
        let arb = arbiter();
        arb.request_activate(&f("1"), &s("a")).unwrap();
        arb.request_activate(&f("1"), &s("b")).unwrap();
        assert_eq!(arb.deactivate(&f("1"), &s("a")).unwrap(), Outcome::Unchanged);
        assert_eq!(arb.state_of(&f("1")).unwrap(), pending("a", "b"));
    }

    #[test]
    fn offer_answers_need_pending_offer_and_holder() {
        let arb = arbiter();
        assert!(matches!(
            arb.accept_offer(&f("1"), &s("a")),
            Err(ArbiterError::InvalidOfferTransition { .. })
        ));

        arb.request_activate(&f("1"), &s("a")).unwrap();
        assert!(arb.decline_offer(&f("1"), &s("a")).is_err());

        arb.request_activate(&f("1"), &s("b")).unwrap();
        // the requester cannot accept on the holder's behalf
        assert!(arb.accept_offer(&f("1"), &s("b")).is_err());
        assert!(arb.decline_offer(&f("1"), &s("c")).is_err());
        assert_eq!(arb.state_of(&f("1")).unwrap(), pending("a", "b"));
    }

    #[test]
    fn holder_disconnect_promotes_requester() {
        let arb = arbiter();
        arb.request_activate(&f("1"), &s("a")).unwrap();
        arb.request_activate(&f("1"), &s("b")).unwrap();
        arb.request_activate(&f("2"), &s("a")).unwrap();

        let report = arb.handle_disconnect(&s("a"));
        assert_eq!(
            report.changed,
            vec![(f("1"), active("b")), (f("2"), ControlState::Idle)]
        );
        assert_eq!(arb.state_of(&f("1")).unwrap(), active("b"));
        assert_eq!(arb.state_of(&f("2")).unwrap(), ControlState::Idle);
    }

    #[test]
    fn requester_disconnect_restores_holder() {
        let arb = arbiter();
        arb.request_activate(&f("1"), &s("a")).unwrap();
        arb.request_activate(&f("1"), &s("b")).unwrap();

        let report = arb.handle_disconnect(&s("b"));
        assert_eq!(report.changed, vec![(f("1"), active("a"))]);
    }

    #[test]
    fn disconnect_of_bystander_changes_nothing() {
        let arb = arbiter();
        arb.request_activate(&f("1"), &s("a")).unwrap();
        assert!(arb.handle_disconnect(&s("z")).is_empty());
        assert_eq!(arb.state_of(&f("1")).unwrap(), active("a"));
    }

    #[test]
    fn concurrent_activation_yields_single_holder() {
        use std::sync::Arc;

        let arb = Arc::new(arbiter());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let arb = arb.clone();
                std::thread::spawn(move || {
                    arb.request_activate(&f("1"), &s(&format!("s{i}"))).unwrap()
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let state = arb.state_of(&f("1")).unwrap();
        let holder = state.holder().cloned().unwrap();
        assert_eq!(state.state(), SessionState::OfferPending);
        assert_ne!(state.pending_requester(), Some(&holder));
        let holders = (0..16)
            .filter(|i| arb.is_holder(&f("1"), &s(&format!("s{i}"))).unwrap())
            .count();
        assert_eq!(holders, 1);
    }
}
