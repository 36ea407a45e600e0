use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_SESSION_ID_LEN: usize = 128;

/// Stable fixture identifier. Numeric ids (as found in older catalogs and
/// clients) are normalized to their shortest decimal string form, so `1`,
/// `1.0` and `"1"` name the same fixture.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawFixtureId")]
pub struct FixtureId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFixtureId {
    Text(String),
    Number(serde_json::Number),
}

impl From<RawFixtureId> for FixtureId {
    fn from(raw: RawFixtureId) -> Self {
        match raw {
            RawFixtureId::Text(s) => FixtureId(s),
            RawFixtureId::Number(n) => FixtureId(number_to_id(&n)),
        }
    }
}

fn number_to_id(n: &serde_json::Number) -> String {
    if n.is_f64() {
        // f64 Display drops a zero fraction ("1" for 1.0)
        if let Some(f) = n.as_f64() {
            return f.to_string();
        }
    }
    n.to_string()
}

impl FixtureId {
    #[cfg(test)]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FixtureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque per-connection session identifier, established before the hub sees
/// the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_SESSION_ID_LEN
            && !self.0.chars().any(char::is_control)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Active,
    OfferPending,
}

/// Setting fields a client may change on a fixture. Anything else is refused
/// at decode time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SettingFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hue_set: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saturation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_cloud: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SettingUpdateRequest {
    pub fixture_id: FixtureId,
    #[serde(default)]
    pub hue_set: Option<f64>,
    #[serde(default)]
    pub saturation: Option<f64>,
    #[serde(default)]
    pub brightness: Option<f64>,
    #[serde(default)]
    pub color_cloud: Option<f64>,
}

impl SettingUpdateRequest {
    pub fn into_parts(self) -> (FixtureId, SettingFields) {
        (
            self.fixture_id,
            SettingFields {
                hue_set: self.hue_set,
                saturation: self.saturation,
                brightness: self.brightness,
                color_cloud: self.color_cloud,
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TriggerableRequest {
    pub fixture_id: FixtureId,
    pub triggerable_name: String,
}

/// Frames a client may send, `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    ActivateSession(FixtureId),
    DeactivateSession(FixtureId),
    AcceptOfferedSession(FixtureId),
    DeclineOfferedSession(FixtureId),
    UpdateSetting(SettingUpdateRequest),
    RunOneShotTriggerable(TriggerableRequest),
}

impl ClientMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ActivateSession(_) => "activateSession",
            Self::DeactivateSession(_) => "deactivateSession",
            Self::AcceptOfferedSession(_) => "acceptOfferedSession",
            Self::DeclineOfferedSession(_) => "declineOfferedSession",
            Self::UpdateSetting(_) => "updateSetting",
            Self::RunOneShotTriggerable(_) => "runOneShotTriggerable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureView {
    pub id: FixtureId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub state: SessionState,
    pub controlled: bool,
    pub held_by_you: bool,
    pub offer_pending: bool,
    pub requested_by_you: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_requester: Option<SessionId>,
}

/// The snapshot as one particular connection sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateView {
    pub fixtures: Vec<FixtureView>,
    pub actuator_connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureRef {
    pub fixture_id: FixtureId,
}

/// Frames the hub sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    StateUpdated(StateView),
    ActuatorConnected,
    ActuatorDisconnected,
    OfferPending(FixtureRef),
    OfferSuperseded(FixtureRef),
    OfferDeclined(FixtureRef),
}

impl ServerEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StateUpdated(_) => "stateUpdated",
            Self::ActuatorConnected => "actuatorConnected",
            Self::ActuatorDisconnected => "actuatorDisconnected",
            Self::OfferPending(_) => "offerPending",
            Self::OfferSuperseded(_) => "offerSuperseded",
            Self::OfferDeclined(_) => "offerDeclined",
        }
    }

    pub fn connectivity(connected: bool) -> Self {
        if connected {
            Self::ActuatorConnected
        } else {
            Self::ActuatorDisconnected
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    UpdateSetting,
    RunOneShotTriggerable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FixtureCommand {
    UpdateSetting(SettingFields),
    RunOneShotTriggerable { triggerable_name: String },
}

impl FixtureCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::UpdateSetting(_) => CommandKind::UpdateSetting,
            Self::RunOneShotTriggerable { .. } => CommandKind::RunOneShotTriggerable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerablePayload {
    pub triggerable_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandPayload {
    Setting(SettingFields),
    Triggerable(TriggerablePayload),
}

/// What the actuator link receives for every authorized command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorCommand {
    pub fixture_id: FixtureId,
    pub command_kind: CommandKind,
    pub payload: CommandPayload,
}

impl ActuatorCommand {
    pub fn new(fixture_id: FixtureId, command: FixtureCommand) -> Self {
        let command_kind = command.kind();
        let payload = match command {
            FixtureCommand::UpdateSetting(fields) => CommandPayload::Setting(fields),
            FixtureCommand::RunOneShotTriggerable { triggerable_name } => {
                CommandPayload::Triggerable(TriggerablePayload { triggerable_name })
            }
        };
        Self {
            fixture_id,
            command_kind,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fixture_id_accepts_numbers_and_strings() {
        let a: FixtureId = serde_json::from_value(json!(7)).unwrap();
        let b: FixtureId = serde_json::from_value(json!("7")).unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_value(&a).unwrap(), json!("7"));
    }

    #[test]
    fn fixture_id_accepts_any_json_number() {
        let id = |v: serde_json::Value| serde_json::from_value::<FixtureId>(v).unwrap();
        assert_eq!(id(json!(1.0)), FixtureId::new("1"));
        assert_eq!(id(json!(2.5)), FixtureId::new("2.5"));
        assert_eq!(id(json!(u64::MAX)), FixtureId::new("18446744073709551615"));
        assert_eq!(id(json!(-3)), FixtureId::new("-3"));
    }

    #[test]
    fn decodes_session_frames() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"event":"acceptOfferedSession","data":3}"#).unwrap();
        assert_eq!(msg, ClientMessage::AcceptOfferedSession(FixtureId::new("3")));
    }

    #[test]
    fn setting_update_rejects_unknown_fields() {
        let ok = serde_json::from_value::<ClientMessage>(json!({
            "event": "updateSetting",
            "data": {"fixtureId": "1", "brightness": 0.5}
        }));
        assert!(ok.is_ok());

        let bad = serde_json::from_value::<ClientMessage>(json!({
            "event": "updateSetting",
            "data": {"fixtureId": "1", "brightness": 0.5, "strobe": true}
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn triggerable_requires_name() {
        let bad = serde_json::from_value::<ClientMessage>(json!({
            "event": "runOneShotTriggerable",
            "data": {"fixtureId": "1"}
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn server_events_use_event_data_envelope() {
        let v = serde_json::to_value(ServerEvent::OfferPending(FixtureRef {
            fixture_id: FixtureId::new("2"),
        }))
        .unwrap();
        assert_eq!(v, json!({"event": "offerPending", "data": {"fixtureId": "2"}}));

        let v = serde_json::to_value(ServerEvent::ActuatorConnected).unwrap();
        assert_eq!(v, json!({"event": "actuatorConnected"}));
    }

    #[test]
    fn actuator_command_carries_only_whitelisted_payload() {
        let cmd = ActuatorCommand::new(
            FixtureId::new("4"),
            FixtureCommand::UpdateSetting(SettingFields {
                saturation: Some(0.25),
                ..Default::default()
            }),
        );
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({
                "fixtureId": "4",
                "commandKind": "updateSetting",
                "payload": {"saturation": 0.25}
            })
        );
    }

    #[test]
    fn session_id_shape_checks() {
        assert!(SessionId::new("abc-123").is_well_formed());
        assert!(!SessionId::new("").is_well_formed());
        assert!(!SessionId::new("a\nb").is_well_formed());
        assert!(!SessionId::new("x".repeat(200)).is_well_formed());
        assert!(SessionId::generate().is_well_formed());
    }
}
