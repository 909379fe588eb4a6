// Envelope codec: typed `Envelope` <-> JSON bytes.
//
// On the wire every message is one JSON object:
//
//   {"clientTime"|"serverTime": <unix ts>, "message": "<kind>",
//    "payload": {"type": "request|response|rts|cts", ...}}
//
// or, for a failed exchange, the same envelope with an `error` string in place
// of `payload`. Decoding goes in two steps: the outer object is read into
// `RawEnvelope` (which rejects unknown keys), then the payload map has its
// `type` key removed and the remainder is decoded into the typed struct that
// `message` + `type` select. Messages used in both directions (`status`,
// `sensoralert`, `statechange`) are told apart by a field only one shape has.
//
// Encoding is the mirror image: the typed payload is serialized to a map and
// `type` (plus `nodeType` for registrations) is inserted.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::message::{
    AlertRegistration, AuthenticationRequest, ManagerRegistration, MessageKind, NodeRegistration,
    OptionChange, RegistrationRequest, Request, Response, SensorAlertNotice, SensorAlertReport,
    SensorRegistration, SensorStatusRequest, Snapshot, StateChangeNotice, StateChangeReport,
};
use crate::types::{ExchangeId, NodeType, Timestamp, unix_now};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope carries neither clientTime nor serverTime")]
    MissingTime,
    #[error("envelope carries both clientTime and serverTime")]
    AmbiguousTime,
    #[error("envelope carries neither payload nor error")]
    MissingPayload,
    #[error("envelope carries both payload and error")]
    PayloadAndError,
    #[error("payload has no type")]
    MissingType,
    #[error("unknown payload type {0:?}")]
    UnknownType(String),
    #[error("{message} registration has no usable nodeType")]
    MissingNodeType { message: MessageKind },
    #[error("invalid {message} payload: {source}")]
    Payload {
        message: MessageKind,
        source: serde_json::Error,
    },
    #[error("{message} response result is {result:?}, expected \"ok\"")]
    NotOk { message: MessageKind, result: String },
    #[error("{request} request cannot travel as {message}")]
    KindMismatch {
        message: MessageKind,
        request: MessageKind,
    },
}

/// Which side's clock stamped the envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Client,
    Server,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stamp {
    pub origin: Origin,
    pub time: Timestamp,
}

impl Stamp {
    pub fn now(origin: Origin) -> Self {
        Self {
            origin,
            time: unix_now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Rts(ExchangeId),
    Cts(ExchangeId),
    Request(Request),
    Response(Response),
    Error(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub stamp: Stamp,
    pub message: MessageKind,
    pub body: Body,
}

impl Envelope {
    pub fn request(origin: Origin, request: Request) -> Self {
        Self {
            stamp: Stamp::now(origin),
            message: request.kind(),
            body: Body::Request(request),
        }
    }

    pub fn response(origin: Origin, message: MessageKind, response: Response) -> Self {
        Self {
            stamp: Stamp::now(origin),
            message,
            body: Body::Response(response),
        }
    }

    pub fn error(origin: Origin, message: MessageKind, error: impl Into<String>) -> Self {
        Self {
            stamp: Stamp::now(origin),
            message,
            body: Body::Error(error.into()),
        }
    }

    pub fn rts(origin: Origin, message: MessageKind, id: ExchangeId) -> Self {
        Self {
            stamp: Stamp::now(origin),
            message,
            body: Body::Rts(id),
        }
    }

    pub fn cts(origin: Origin, message: MessageKind, id: ExchangeId) -> Self {
        Self {
            stamp: Stamp::now(origin),
            message,
            body: Body::Cts(id),
        }
    }

    /// Short human-readable label, e.g. `"status rts"`.
    pub fn describe(&self) -> String {
        let what = match self.body {
            Body::Rts(_) => "rts",
            Body::Cts(_) => "cts",
            Body::Request(_) => "request",
            Body::Response(_) => "response",
            Body::Error(_) => "error",
        };
        format!("{} {what}", self.message)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server_time: Option<Timestamp>,
    message: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExchangeWire {
    id: ExchangeId,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmptyWire {}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct AckWire {
    result: String,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct AuthenticatedWire {
    result: String,
    version: f64,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SensorNodeWire {
    hostname: String,
    sensors: Vec<SensorRegistration>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct AlertNodeWire {
    hostname: String,
    alerts: Vec<AlertRegistration>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManagerNodeWire {
    hostname: String,
    manager: ManagerRegistration,
}

const RESULT_OK: &str = "ok";

/// Serialize an envelope to JSON bytes.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let (client_time, server_time) = match envelope.stamp.origin {
        Origin::Client => (Some(envelope.stamp.time), None),
        Origin::Server => (None, Some(envelope.stamp.time)),
    };
    let (payload, error) = match &envelope.body {
        Body::Error(text) => (None, Some(text.clone())),
        body => (Some(encode_body(envelope.message, body)?), None),
    };
    let raw = RawEnvelope {
        client_time,
        server_time,
        message: envelope.message,
        payload,
        error,
    };
    Ok(serde_json::to_vec(&raw)?)
}

/// Parse and validate an envelope from JSON bytes.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let raw: RawEnvelope = serde_json::from_slice(bytes)?;
    let stamp = match (raw.client_time, raw.server_time) {
        (Some(time), None) => Stamp {
            origin: Origin::Client,
            time,
        },
        (None, Some(time)) => Stamp {
            origin: Origin::Server,
            time,
        },
        (None, None) => return Err(CodecError::MissingTime),
        (Some(_), Some(_)) => return Err(CodecError::AmbiguousTime),
    };
    let body = match (raw.payload, raw.error) {
        (Some(payload), None) => decode_body(raw.message, payload)?,
        (None, Some(error)) => Body::Error(error),
        (None, None) => return Err(CodecError::MissingPayload),
        (Some(_), Some(_)) => return Err(CodecError::PayloadAndError),
    };
    Ok(Envelope {
        stamp,
        message: raw.message,
        body,
    })
}

fn encode_body(message: MessageKind, body: &Body) -> Result<Map<String, Value>, CodecError> {
    let (kind, mut map) = match body {
        Body::Rts(id) => ("rts", to_map(message, &ExchangeWire { id: *id })?),
        Body::Cts(id) => ("cts", to_map(message, &ExchangeWire { id: *id })?),
        Body::Request(request) => {
            if request.kind() != message {
                return Err(CodecError::KindMismatch {
                    message,
                    request: request.kind(),
                });
            }
            ("request", encode_request(message, request)?)
        }
        Body::Response(Response::Ok) => (
            "response",
            to_map(
                message,
                &AckWire {
                    result: RESULT_OK.into(),
                },
            )?,
        ),
        Body::Response(Response::Authenticated { version }) => (
            "response",
            to_map(
                message,
                &AuthenticatedWire {
                    result: RESULT_OK.into(),
                    version: *version,
                },
            )?,
        ),
        Body::Error(_) => unreachable!("error envelopes carry no payload"),
    };
    map.insert("type".into(), Value::String(kind.into()));
    Ok(map)
}

fn encode_request(
    message: MessageKind,
    request: &Request,
) -> Result<Map<String, Value>, CodecError> {
    match request {
        Request::Authentication(auth) => to_map(message, auth),
        Request::Registration(registration) => {
            let (node_type, mut map) = match &registration.node {
                NodeRegistration::Sensor(sensors) => (
                    NodeType::Sensor,
                    to_map(
                        message,
                        &SensorNodeWire {
                            hostname: registration.hostname.clone(),
                            sensors: sensors.clone(),
                        },
                    )?,
                ),
                NodeRegistration::Alert(alerts) => (
                    NodeType::Alert,
                    to_map(
                        message,
                        &AlertNodeWire {
                            hostname: registration.hostname.clone(),
                            alerts: alerts.clone(),
                        },
                    )?,
                ),
                NodeRegistration::Manager(manager) => (
                    NodeType::Manager,
                    to_map(
                        message,
                        &ManagerNodeWire {
                            hostname: registration.hostname.clone(),
                            manager: manager.clone(),
                        },
                    )?,
                ),
            };
            map.insert("nodeType".into(), Value::String(node_type.as_str().into()));
            Ok(map)
        }
        Request::Ping | Request::SensorAlertsOff => to_map(message, &EmptyWire {}),
        Request::SensorStatus(status) => to_map(message, status),
        Request::Snapshot(snapshot) => to_map(message, snapshot.as_ref()),
        Request::Option(change) => to_map(message, change),
        Request::SensorAlertReport(report) => to_map(message, report),
        Request::SensorAlertNotice(notice) => to_map(message, notice),
        Request::StateChangeReport(report) => to_map(message, report),
        Request::StateChangeNotice(notice) => to_map(message, notice),
    }
}

fn decode_body(message: MessageKind, mut payload: Map<String, Value>) -> Result<Body, CodecError> {
    let kind = match payload.remove("type") {
        Some(Value::String(kind)) => kind,
        Some(other) => return Err(CodecError::UnknownType(other.to_string())),
        None => return Err(CodecError::MissingType),
    };
    match kind.as_str() {
        "rts" => Ok(Body::Rts(from_map::<ExchangeWire>(message, payload)?.id)),
        "cts" => Ok(Body::Cts(from_map::<ExchangeWire>(message, payload)?.id)),
        "request" => Ok(Body::Request(decode_request(message, payload)?)),
        "response" => Ok(Body::Response(decode_response(message, payload)?)),
        _ => Err(CodecError::UnknownType(kind)),
    }
}

fn decode_request(
    message: MessageKind,
    mut payload: Map<String, Value>,
) -> Result<Request, CodecError> {
    let request = match message {
        MessageKind::Authentication => {
            Request::Authentication(from_map::<AuthenticationRequest>(message, payload)?)
        }
        MessageKind::Registration => {
            let node_type = payload
                .remove("nodeType")
                .and_then(|value| serde_json::from_value::<NodeType>(value).ok())
                .ok_or(CodecError::MissingNodeType { message })?;
            Request::Registration(match node_type {
                NodeType::Sensor => {
                    let wire: SensorNodeWire = from_map(message, payload)?;
                    RegistrationRequest {
                        hostname: wire.hostname,
                        node: NodeRegistration::Sensor(wire.sensors),
                    }
                }
                NodeType::Alert => {
                    let wire: AlertNodeWire = from_map(message, payload)?;
                    RegistrationRequest {
                        hostname: wire.hostname,
                        node: NodeRegistration::Alert(wire.alerts),
                    }
                }
                NodeType::Manager => {
                    let wire: ManagerNodeWire = from_map(message, payload)?;
                    RegistrationRequest {
                        hostname: wire.hostname,
                        node: NodeRegistration::Manager(wire.manager),
                    }
                }
            })
        }
        MessageKind::Ping => {
            from_map::<EmptyWire>(message, payload)?;
            Request::Ping
        }
        MessageKind::Status => {
            if payload.contains_key("nodes") {
                Request::Snapshot(Box::new(from_map::<Snapshot>(message, payload)?))
            } else {
                Request::SensorStatus(from_map::<SensorStatusRequest>(message, payload)?)
            }
        }
        MessageKind::Option => Request::Option(from_map::<OptionChange>(message, payload)?),
        MessageKind::SensorAlert => {
            if payload.contains_key("clientSensorId") {
                Request::SensorAlertReport(from_map::<SensorAlertReport>(message, payload)?)
            } else {
                Request::SensorAlertNotice(from_map::<SensorAlertNotice>(message, payload)?)
            }
        }
        MessageKind::StateChange => {
            if payload.contains_key("clientSensorId") {
                Request::StateChangeReport(from_map::<StateChangeReport>(message, payload)?)
            } else {
                Request::StateChangeNotice(from_map::<StateChangeNotice>(message, payload)?)
            }
        }
        MessageKind::SensorAlertsOff => {
            from_map::<EmptyWire>(message, payload)?;
            Request::SensorAlertsOff
        }
    };
    Ok(request)
}

fn decode_response(
    message: MessageKind,
    payload: Map<String, Value>,
) -> Result<Response, CodecError> {
    if message == MessageKind::Authentication {
        let wire: AuthenticatedWire = from_map(message, payload)?;
        check_ok(message, wire.result)?;
        Ok(Response::Authenticated {
            version: wire.version,
        })
    } else {
        let wire: AckWire = from_map(message, payload)?;
        check_ok(message, wire.result)?;
        Ok(Response::Ok)
    }
}

fn check_ok(message: MessageKind, result: String) -> Result<(), CodecError> {
    if result == RESULT_OK {
        Ok(())
    } else {
        Err(CodecError::NotOk { message, result })
    }
}

fn to_map<T: Serialize>(message: MessageKind, value: &T) -> Result<Map<String, Value>, CodecError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Ok(Map::new()),
        Err(source) => Err(CodecError::Payload { message, source }),
    }
}

fn from_map<T: DeserializeOwned>(
    message: MessageKind,
    map: Map<String, Value>,
) -> Result<T, CodecError> {
    serde_json::from_value(Value::Object(map))
        .map_err(|source| CodecError::Payload { message, source })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::*;
    use crate::message::SensorStatus;
    use crate::types::{ClientSensorId, SensorData, SensorState};

    fn decode_json(value: Value) -> Result<Envelope, CodecError> {
        decode(&serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn decodes_sensor_status_request() {
        let env = decode_json(json!({
            "clientTime": 1_700_000_000,
            "message": "status",
            "payload": {
                "type": "request",
                "sensors": [{"clientSensorId": 1, "state": 1}],
            },
        }))
        .unwrap();
        assert_eq!(env.stamp.origin, Origin::Client);
        assert_eq!(env.message, MessageKind::Status);
        match env.body {
            Body::Request(Request::SensorStatus(status)) => {
                assert_eq!(status.sensors.len(), 1);
                assert_eq!(status.sensors[0].client_sensor_id, ClientSensorId(1));
                assert_eq!(status.sensors[0].state, SensorState::Triggered);
            }
            other => panic!("expected sensor status, got {other:?}"),
        }
    }

    #[test]
    fn status_with_nodes_is_a_snapshot() {
        let env = decode_json(json!({
            "serverTime": 5,
            "message": "status",
            "payload": {
                "type": "request",
                "options": [], "nodes": [], "sensors": [],
                "managers": [], "alerts": [], "alertLevels": [],
            },
        }))
        .unwrap();
        assert!(matches!(env.body, Body::Request(Request::Snapshot(_))));
    }

    #[test]
    fn encodes_rts_with_exchange_id() {
        let env = Envelope {
            stamp: Stamp {
                origin: Origin::Server,
                time: 42,
            },
            message: MessageKind::Ping,
            body: Body::Rts(ExchangeId(7)),
        };
        let value: Value = serde_json::from_slice(&encode(&env).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"serverTime": 42, "message": "ping", "payload": {"type": "rts", "id": 7}})
        );
    }

    #[test]
    fn encodes_registration_with_node_type() {
        let request = Request::Registration(RegistrationRequest {
            hostname: "porch".into(),
            node: NodeRegistration::Sensor(vec![SensorRegistration {
                client_sensor_id: ClientSensorId(3),
                alert_delay: 0,
                alert_levels: BTreeSet::from([1, 2]),
                description: "front door".into(),
            }]),
        });
        let env = Envelope::request(Origin::Client, request.clone());
        let value: Value = serde_json::from_slice(&encode(&env).unwrap()).unwrap();
        assert_eq!(value["payload"]["nodeType"], "sensor");
        assert_eq!(value["payload"]["sensors"][0]["alertLevels"], json!([1, 2]));

        let decoded = decode(&encode(&env).unwrap()).unwrap();
        assert_eq!(decoded.body, Body::Request(request));
    }

    #[test]
    fn error_envelope_has_no_payload() {
        let env = Envelope::error(Origin::Server, MessageKind::Authentication, "version mismatch");
        let value: Value = serde_json::from_slice(&encode(&env).unwrap()).unwrap();
        assert_eq!(value["message"], "authentication");
        assert_eq!(value["error"], "version mismatch");
        assert!(value.get("payload").is_none());
        let decoded = decode(&encode(&env).unwrap()).unwrap();
        assert_eq!(decoded.body, Body::Error("version mismatch".into()));
    }

    #[test]
    fn authentication_response_carries_version() {
        let env = decode_json(json!({
            "serverTime": 1,
            "message": "authentication",
            "payload": {"type": "response", "result": "ok", "version": 0.5},
        }))
        .unwrap();
        assert_eq!(
            env.body,
            Body::Response(Response::Authenticated { version: 0.5 })
        );
    }

    #[test]
    fn rejects_missing_and_doubled_timestamps() {
        let missing = decode_json(json!({
            "message": "ping",
            "payload": {"type": "request"},
        }));
        assert!(matches!(missing, Err(CodecError::MissingTime)));

        let doubled = decode_json(json!({
            "clientTime": 1, "serverTime": 1,
            "message": "ping",
            "payload": {"type": "request"},
        }));
        assert!(matches!(doubled, Err(CodecError::AmbiguousTime)));
    }

    #[test]
    fn rejects_extra_fields_at_decode_time() {
        let extra_outer = decode_json(json!({
            "clientTime": 1, "message": "ping", "payload": {"type": "request"}, "debug": true,
        }));
        assert!(matches!(extra_outer, Err(CodecError::Json(_))));

        let extra_payload = decode_json(json!({
            "clientTime": 1, "message": "ping", "payload": {"type": "request", "x": 1},
        }));
        assert!(matches!(extra_payload, Err(CodecError::Payload { .. })));
    }

    #[test]
    fn rejects_unknown_message_and_type() {
        let unknown = decode_json(json!({
            "clientTime": 1, "message": "reboot", "payload": {"type": "request"},
        }));
        assert!(unknown.is_err());
        let bad_type = decode_json(json!({
            "clientTime": 1, "message": "ping", "payload": {"type": "shout"},
        }));
        assert!(matches!(bad_type, Err(CodecError::UnknownType(t)) if t == "shout"));
    }

    #[test]
    fn rejects_non_ok_result() {
        let env = decode_json(json!({
            "clientTime": 1, "message": "ping", "payload": {"type": "response", "result": "maybe"},
        }));
        assert!(matches!(env, Err(CodecError::NotOk { .. })));
    }

    #[test]
    fn report_and_notice_are_told_apart() {
        let report = decode_json(json!({
            "clientTime": 1, "message": "statechange",
            "payload": {"type": "request", "clientSensorId": 2, "state": 0},
        }))
        .unwrap();
        assert!(matches!(report.body, Body::Request(Request::StateChangeReport(_))));

        let notice = decode_json(json!({
            "serverTime": 1, "message": "statechange",
            "payload": {
                "type": "request", "sensorId": 9, "state": 1,
                "data": {"type": "float", "value": 20.5},
            },
        }))
        .unwrap();
        match notice.body {
            Body::Request(Request::StateChangeNotice(n)) => {
                assert_eq!(n.data, SensorData::Float(20.5));
            }
            other => panic!("expected notice, got {other:?}"),
        }
    }

    #[test]
    fn encode_refuses_request_under_wrong_message() {
        let env = Envelope {
            stamp: Stamp::now(Origin::Client),
            message: MessageKind::Ping,
            body: Body::Request(Request::SensorStatus(SensorStatusRequest {
                sensors: vec![SensorStatus {
                    client_sensor_id: ClientSensorId(1),
                    state: SensorState::Normal,
                    data: SensorData::None,
                }],
            })),
        };
        assert!(matches!(encode(&env), Err(CodecError::KindMismatch { .. })));
    }
}
