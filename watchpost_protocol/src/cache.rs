// Manager-side view of the alert system.
//
// A manager keeps a local copy of the server's state. The full snapshot it
// receives on registration (and after every option change or membership
// change) replaces the copy wholesale, so applying the same snapshot twice
// leaves the cache exactly as after the first time. Incremental `statechange`
// and `sensoralert` notices patch single sensors in between.

use std::collections::BTreeMap;

use crate::message::{
    Alert, AlertLevel, Manager, Node, OptionEntry, SensorAlertNotice, Sensor, Snapshot,
    StateChangeNotice,
};
use crate::types::{NodeId, SensorId, Timestamp};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ManagerCache {
    options: Vec<OptionEntry>,
    nodes: BTreeMap<NodeId, Node>,
    sensors: BTreeMap<SensorId, Sensor>,
    managers: Vec<Manager>,
    alerts: Vec<Alert>,
    alert_levels: Vec<AlertLevel>,
    /// Sensor alerts received since the last snapshot, oldest first.
    recent_alerts: Vec<SensorAlertNotice>,
}

impl ManagerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything with `snapshot`.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) {
        self.options = snapshot.options.clone();
        self.nodes = snapshot.nodes.iter().map(|n| (n.id, n.clone())).collect();
        self.sensors = snapshot
            .sensors
            .iter()
            .map(|s| (s.sensor_id, s.clone()))
            .collect();
        self.managers = snapshot.managers.clone();
        self.alerts = snapshot.alerts.clone();
        self.alert_levels = snapshot.alert_levels.clone();
        self.recent_alerts.clear();
    }

    /// Returns false when the sensor is unknown (the next snapshot will
    /// bring it).
    pub fn apply_state_change(&mut self, notice: &StateChangeNotice, received: Timestamp) -> bool {
        let Some(sensor) = self.sensors.get_mut(&notice.sensor_id) else {
            return false;
        };
        sensor.state = notice.state;
        sensor.data = notice.data.clone();
        sensor.last_state_updated = received;
        true
    }

    pub fn apply_sensor_alert(&mut self, notice: &SensorAlertNotice) -> bool {
        let known = match self.sensors.get_mut(&notice.sensor_id) {
            Some(sensor) => {
                if notice.change_state {
                    sensor.state = notice.state;
                    sensor.data = notice.data.clone();
                }
                sensor.last_state_updated = notice.time_received;
                true
            }
            None => false,
        };
        self.recent_alerts.push(notice.clone());
        known
    }

    pub fn option(&self, option_type: &str) -> Option<f64> {
        self.options
            .iter()
            .find(|o| o.option_type == option_type)
            .map(|o| o.value)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn sensor(&self, id: SensorId) -> Option<&Sensor> {
        self.sensors.get(&id)
    }

    pub fn sensors(&self) -> impl Iterator<Item = &Sensor> {
        self.sensors.values()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn recent_alerts(&self) -> &[SensorAlertNotice] {
        &self.recent_alerts
    }

    /// Current view as a snapshot.
    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            options: self.options.clone(),
            nodes: self.nodes.values().cloned().collect(),
            sensors: self.sensors.values().cloned().collect(),
            managers: self.managers.clone(),
            alerts: self.alerts.clone(),
            alert_levels: self.alert_levels.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::types::{ClientSensorId, NodeType, SensorData, SensorState};

    fn snapshot() -> Snapshot {
        Snapshot {
            options: vec![OptionEntry {
                option_type: "alertSystemActive".into(),
                value: 1.0,
            }],
            nodes: vec![Node {
                id: NodeId(1),
                hostname: "porch".into(),
                node_type: NodeType::Sensor,
                connected: true,
            }],
            sensors: vec![Sensor {
                node_id: NodeId(1),
                sensor_id: SensorId(10),
                client_sensor_id: ClientSensorId(0),
                alert_delay: 0,
                alert_levels: BTreeSet::from([1]),
                description: "front door".into(),
                state: SensorState::Normal,
                last_state_updated: 100,
                persistent: false,
                data: SensorData::None,
                optional_data: None,
            }],
            managers: vec![],
            alerts: vec![],
            alert_levels: vec![],
        }
    }

    #[test]
    fn applying_a_snapshot_twice_is_idempotent() {
        let mut once = ManagerCache::new();
        once.apply_snapshot(&snapshot());
        let mut twice = once.clone();
        twice.apply_snapshot(&snapshot());
        assert_eq!(once, twice);
        assert_eq!(twice.to_snapshot(), snapshot());
    }

    #[test]
    fn snapshot_replaces_instead_of_merging() {
        let mut cache = ManagerCache::new();
        cache.apply_snapshot(&snapshot());
        cache.apply_snapshot(&Snapshot::default());
        assert_eq!(cache.sensors().count(), 0);
        assert_eq!(cache.option("alertSystemActive"), None);
    }

    #[test]
    fn state_change_patches_one_sensor() {
        let mut cache = ManagerCache::new();
        cache.apply_snapshot(&snapshot());
        let notice = StateChangeNotice {
            sensor_id: SensorId(10),
            state: SensorState::Triggered,
            data: SensorData::Float(2.5),
        };
        assert!(cache.apply_state_change(&notice, 200));
        let sensor = cache.sensor(SensorId(10)).unwrap();
        assert_eq!(sensor.state, SensorState::Triggered);
        assert_eq!(sensor.last_state_updated, 200);

        let unknown = StateChangeNotice {
            sensor_id: SensorId(99),
            ..notice
        };
        assert!(!cache.apply_state_change(&unknown, 200));
    }

    #[test]
    fn sensor_alert_without_change_state_keeps_state() {
        let mut cache = ManagerCache::new();
        cache.apply_snapshot(&snapshot());
        let notice = SensorAlertNotice {
            sensor_id: SensorId(10),
            state: SensorState::Triggered,
            alert_levels: BTreeSet::from([1]),
            description: "front door".into(),
            time_received: 300,
            change_state: false,
            data: SensorData::None,
            optional_data: None,
        };
        assert!(cache.apply_sensor_alert(&notice));
        assert_eq!(
            cache.sensor(SensorId(10)).unwrap().state,
            SensorState::Normal
        );
        assert_eq!(cache.recent_alerts().len(), 1);
    }
}
