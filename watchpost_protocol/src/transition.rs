// Sensor-side transition classifier.
//
// A sensor node polls its local sensors and has to decide, for every change it
// observes, whether the server hears about it as a sensor alert, as a plain
// state change, or not at all. The decision depends only on the old and new
// local readings and the sensor's `SensorProfile`, so it lives here as a pure
// function and the node program just sends whatever `classify` returns.
//
// Local readings are raw 0/1 values. `trigger_state` says which of the two
// counts as "triggered"; everything sent to the server is already mapped to
// `SensorState`. A change produces at most one message: an alert-producing
// transition never also yields a state change.

use crate::message::{Request, SensorAlertReport, StateChangeReport};
use crate::types::{ClientSensorId, SensorData, SensorState};

/// How one local sensor reports its transitions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SensorProfile {
    /// Raw reading (0 or 1) that means "triggered".
    pub trigger_state: u8,
    /// Entering the triggered state raises a sensor alert.
    pub trigger_alert: bool,
    /// Returning to normal raises a sensor alert.
    pub trigger_alert_normal: bool,
    /// The sensor sends its own alerts and state changes; observed transitions
    /// are ignored.
    pub handles_state_msgs: bool,
    /// Copied into every alert this sensor raises.
    pub change_state: bool,
    pub has_latest_data: bool,
}

impl Default for SensorProfile {
    fn default() -> Self {
        Self {
            trigger_state: 1,
            trigger_alert: true,
            trigger_alert_normal: false,
            handles_state_msgs: false,
            change_state: true,
            has_latest_data: false,
        }
    }
}

impl SensorProfile {
    /// Map a raw reading onto the server's view.
    pub fn to_state(&self, raw: u8) -> SensorState {
        if raw == self.trigger_state {
            SensorState::Triggered
        } else {
            SensorState::Normal
        }
    }

    /// Decide what an `old -> new` change of the raw reading produces.
    pub fn classify(&self, old: u8, new: u8) -> Transition {
        if old == new || self.handles_state_msgs {
            return Transition::Ignore;
        }
        let state = self.to_state(new);
        let alerts = match state {
            SensorState::Triggered => self.trigger_alert,
            SensorState::Normal => self.trigger_alert_normal,
        };
        if alerts {
            Transition::Alert { state }
        } else {
            Transition::StateChange { state }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Alert { state: SensorState },
    StateChange { state: SensorState },
    Ignore,
}

impl Transition {
    /// Build the request reporting this transition, if any.
    pub fn into_request(
        self,
        profile: &SensorProfile,
        client_sensor_id: ClientSensorId,
        data: SensorData,
        optional_data: Option<serde_json::Value>,
    ) -> Option<Request> {
        match self {
            Transition::Alert { state } => Some(Request::SensorAlertReport(SensorAlertReport {
                client_sensor_id,
                state,
                change_state: profile.change_state,
                has_latest_data: profile.has_latest_data,
                data,
                optional_data,
            })),
            Transition::StateChange { state } => {
                Some(Request::StateChangeReport(StateChangeReport {
                    client_sensor_id,
                    state,
                    data,
                }))
            }
            Transition::Ignore => None,
        }
    }
}
