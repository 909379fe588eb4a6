// Typed message vocabulary.
//
// `MessageKind` is the envelope's `message` field. Each kind has a fixed set of
// request payloads, gathered in `Request`; responses are `Response`. The codec
// (`codec.rs`) is the only place that knows how these map onto the loosely
// shaped JSON envelope; everything above it matches on these enums.
//
// Payload structs use `deny_unknown_fields`, so a request with an extra or
// misspelled field is rejected when it is decoded instead of being silently
// ignored.
//
// Directions:
// - Sensor nodes send `status` (`SensorStatusRequest`), `statechange`
//   (`StateChangeReport`) and `sensoralert` (`SensorAlertReport`), keyed by
//   their client-local sensor ids.
// - The server sends managers `status` (`Snapshot`), `statechange`
//   (`StateChangeNotice`) and `sensoralert` (`SensorAlertNotice`), keyed by
//   server-wide ids. Alert nodes receive `sensoralert` and `sensoralertsoff`.
// - Managers send `option` (`OptionChange`).

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{
    AlertId, ClientAlertId, ClientSensorId, ManagerId, NodeId, NodeType, SensorData, SensorId,
    SensorState, Timestamp,
};

/// Value of the envelope's `message` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Authentication,
    Registration,
    Ping,
    Status,
    Option,
    SensorAlert,
    StateChange,
    SensorAlertsOff,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Authentication => "authentication",
            MessageKind::Registration => "registration",
            MessageKind::Ping => "ping",
            MessageKind::Status => "status",
            MessageKind::Option => "option",
            MessageKind::SensorAlert => "sensoralert",
            MessageKind::StateChange => "statechange",
            MessageKind::SensorAlertsOff => "sensoralertsoff",
        }
    }

    /// Whether exchanges of this kind are preceded by RTS/CTS.
    pub fn is_arbitrated(self) -> bool {
        self != MessageKind::Authentication
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// A registered client as listed in snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Node {
    pub id: NodeId,
    pub hostname: String,
    pub node_type: NodeType,
    pub connected: bool,
}

/// Authoritative sensor record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Sensor {
    pub node_id: NodeId,
    pub sensor_id: SensorId,
    pub client_sensor_id: ClientSensorId,
    /// Seconds the server waits before acting on a sensor alert.
    pub alert_delay: u32,
    pub alert_levels: BTreeSet<u32>,
    pub description: String,
    pub state: SensorState,
    pub last_state_updated: Timestamp,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub data: SensorData,
    #[serde(default)]
    pub optional_data: Option<serde_json::Value>,
}

/// Authoritative alert record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Alert {
    pub node_id: NodeId,
    pub alert_id: AlertId,
    pub client_alert_id: ClientAlertId,
    pub description: String,
    pub alert_levels: BTreeSet<u32>,
}

/// Named severity bucket shared by sensors and alerts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AlertLevel {
    pub level: u32,
    pub name: String,
    pub trigger_always: bool,
    pub smtp_activated: bool,
    pub to_addr: String,
}

/// Authoritative manager record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Manager {
    pub node_id: NodeId,
    pub manager_id: ManagerId,
    pub description: String,
}

/// Global configuration entry visible to all managers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptionEntry {
    #[serde(rename = "type")]
    pub option_type: String,
    pub value: f64,
}

/// Full state pushed to managers in a `status` request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Snapshot {
    pub options: Vec<OptionEntry>,
    pub nodes: Vec<Node>,
    pub sensors: Vec<Sensor>,
    pub managers: Vec<Manager>,
    pub alerts: Vec<Alert>,
    pub alert_levels: Vec<AlertLevel>,
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuthenticationRequest {
    pub version: f64,
    pub username: String,
    pub password: String,
}

/// One sensor entry of a sensor node's registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SensorRegistration {
    pub client_sensor_id: ClientSensorId,
    pub alert_delay: u32,
    pub alert_levels: BTreeSet<u32>,
    pub description: String,
}

/// One alert entry of an alert node's registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AlertRegistration {
    pub client_alert_id: ClientAlertId,
    pub description: String,
    pub alert_levels: BTreeSet<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ManagerRegistration {
    pub description: String,
}

/// Node-type-specific part of a registration.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeRegistration {
    Sensor(Vec<SensorRegistration>),
    Alert(Vec<AlertRegistration>),
    Manager(ManagerRegistration),
}

impl NodeRegistration {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeRegistration::Sensor(_) => NodeType::Sensor,
            NodeRegistration::Alert(_) => NodeType::Alert,
            NodeRegistration::Manager(_) => NodeType::Manager,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RegistrationRequest {
    pub hostname: String,
    pub node: NodeRegistration,
}

/// Current state of one sensor, reported by its node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SensorStatus {
    pub client_sensor_id: ClientSensorId,
    pub state: SensorState,
    #[serde(default)]
    pub data: SensorData,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SensorStatusRequest {
    pub sensors: Vec<SensorStatus>,
}

/// Manager asks the server to change an option after `time_delay` seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OptionChange {
    pub option_type: String,
    pub value: f64,
    #[serde(default)]
    pub time_delay: u32,
}

fn default_change_state() -> bool {
    true
}

/// Sensor node reports an alert-triggering transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SensorAlertReport {
    pub client_sensor_id: ClientSensorId,
    pub state: SensorState,
    /// Whether the alert also updates the stored sensor state.
    #[serde(default = "default_change_state")]
    pub change_state: bool,
    /// Whether `data` is the sensor's current data.
    #[serde(default)]
    pub has_latest_data: bool,
    #[serde(default)]
    pub data: SensorData,
    #[serde(default)]
    pub optional_data: Option<serde_json::Value>,
}

/// Server forwards a sensor alert to managers and alert nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SensorAlertNotice {
    pub sensor_id: SensorId,
    pub state: SensorState,
    pub alert_levels: BTreeSet<u32>,
    pub description: String,
    pub time_received: Timestamp,
    #[serde(default)]
    pub change_state: bool,
    #[serde(default)]
    pub data: SensorData,
    #[serde(default)]
    pub optional_data: Option<serde_json::Value>,
}

/// Sensor node reports a plain state change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StateChangeReport {
    pub client_sensor_id: ClientSensorId,
    pub state: SensorState,
    #[serde(default)]
    pub data: SensorData,
}

/// Server forwards a state change to managers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StateChangeNotice {
    pub sensor_id: SensorId,
    pub state: SensorState,
    #[serde(default)]
    pub data: SensorData,
}

/// Every request payload, one variant per request shape.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Authentication(AuthenticationRequest),
    Registration(RegistrationRequest),
    Ping,
    SensorStatus(SensorStatusRequest),
    Snapshot(Box<Snapshot>),
    Option(OptionChange),
    SensorAlertReport(SensorAlertReport),
    SensorAlertNotice(SensorAlertNotice),
    StateChangeReport(StateChangeReport),
    StateChangeNotice(StateChangeNotice),
    SensorAlertsOff,
}

impl Request {
    /// The envelope `message` this request travels under.
    pub fn kind(&self) -> MessageKind {
        match self {
            Request::Authentication(_) => MessageKind::Authentication,
            Request::Registration(_) => MessageKind::Registration,
            Request::Ping => MessageKind::Ping,
            Request::SensorStatus(_) | Request::Snapshot(_) => MessageKind::Status,
            Request::Option(_) => MessageKind::Option,
            Request::SensorAlertReport(_) | Request::SensorAlertNotice(_) => {
                MessageKind::SensorAlert
            }
            Request::StateChangeReport(_) | Request::StateChangeNotice(_) => {
                MessageKind::StateChange
            }
            Request::SensorAlertsOff => MessageKind::SensorAlertsOff,
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// A successful response. Failures travel as error envelopes instead.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// `{result: "ok"}`.
    Ok,
    /// Authentication accepted; carries the server's protocol version.
    Authenticated { version: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_wire_names() {
        for kind in [
            MessageKind::Authentication,
            MessageKind::Registration,
            MessageKind::Ping,
            MessageKind::Status,
            MessageKind::Option,
            MessageKind::SensorAlert,
            MessageKind::StateChange,
            MessageKind::SensorAlertsOff,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn only_authentication_skips_arbitration() {
        assert!(!MessageKind::Authentication.is_arbitrated());
        assert!(MessageKind::Registration.is_arbitrated());
        assert!(MessageKind::Ping.is_arbitrated());
    }

    #[test]
    fn request_kinds_share_message_names() {
        let status = Request::SensorStatus(SensorStatusRequest { sensors: vec![] });
        assert_eq!(status.kind(), MessageKind::Status);
        assert_eq!(
            Request::Snapshot(Box::default()).kind(),
            MessageKind::Status
        );
    }

    #[test]
    fn option_entry_uses_type_key() {
        let entry = OptionEntry {
            option_type: "alertSystemActive".into(),
            value: 1.0,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "alertSystemActive", "value": 1.0})
        );
    }

    #[test]
    fn sensor_alert_report_defaults() {
        let report: SensorAlertReport = serde_json::from_value(serde_json::json!({
            "clientSensorId": 4,
            "state": 1,
        }))
        .unwrap();
        assert!(report.change_state);
        assert!(!report.has_latest_data);
        assert_eq!(report.data, SensorData::None);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_value::<StateChangeReport>(serde_json::json!({
            "clientSensorId": 1,
            "state": 0,
            "colour": "red",
        }));
        assert!(result.is_err());
    }
}
