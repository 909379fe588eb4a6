// Identifier newtypes and small enums shared by every message.
//
// Ids come in two flavors. Server-wide ids (`NodeId`, `SensorId`, `AlertId`,
// `ManagerId`) are assigned by the server's registry and are unique across the
// whole system. Client-local ids (`ClientSensorId`, `ClientAlertId`) are chosen
// by the node itself and only mean something inside that node's registration;
// the server maps them to server-wide ids (see `watchpost_server::sync`). The
// two are separate types so they cannot be mixed up.
//
// `SensorState` is binary on the wire (`0` = normal, `1` = triggered) and is
// serialized as a bare integer through `try_from`/`into`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Server-assigned node id, stable for the node's lifetime in the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

/// Server-wide sensor id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(pub u32);

/// Sensor id local to one sensor node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientSensorId(pub u32);

/// Server-wide alert id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(pub u32);

/// Alert id local to one alert node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientAlertId(pub u32);

/// Server-wide manager id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManagerId(pub u32);

/// Id of one RTS/CTS exchange. Only needs to be unique while the exchange is
/// open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(pub u32);

/// Unix timestamp in seconds, taken from the sender's clock.
pub type Timestamp = i64;

/// Current wall-clock time as a unix timestamp.
pub fn unix_now() -> Timestamp {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// The three kinds of client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Sensor,
    Alert,
    Manager,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Sensor => "sensor",
            NodeType::Alert => "alert",
            NodeType::Manager => "manager",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binary sensor state as seen by the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SensorState {
    #[default]
    Normal,
    Triggered,
}

impl From<SensorState> for u8 {
    fn from(state: SensorState) -> u8 {
        match state {
            SensorState::Normal => 0,
            SensorState::Triggered => 1,
        }
    }
}

impl TryFrom<u8> for SensorState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SensorState::Normal),
            1 => Ok(SensorState::Triggered),
            other => Err(format!("sensor state must be 0 or 1, got {other}")),
        }
    }
}

/// Data a sensor may carry alongside its state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SensorData {
    #[default]
    None,
    Int(i64),
    Float(f64),
}
