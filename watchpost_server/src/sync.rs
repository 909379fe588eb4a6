// Authoritative alert-system state and its fan-out.
//
// `AlertSystem` owns every node, sensor, alert, manager, alert level and
// option the server knows about. Sessions never touch the records directly;
// they call one of the mutation methods below while holding the shared lock
// (`SharedSystem`). Each mutation validates its whole input first and only
// then applies it, so a rejected request leaves no trace, and fans the
// resulting notices out to the affected connections before the lock is
// released. Serializing all mutations through one lock is stricter than
// per-record atomicity, but no mutation does more than a map lookup and a few
// channel sends.
//
// Fan-out goes through `Subscriber`, one per attached connection: delivering a
// request only enqueues it on that connection's session, which then runs the
// RTS/CTS exchange on its own thread.
//
// Routing rules:
// - Status entries whose state changed, and every `statechange` report,
//   become `statechange` notices for all connected managers.
// - A `sensoralert` report becomes a `sensoralert` notice for all connected
//   managers and for every connected alert node with an alert whose levels
//   intersect the sensor's. It never also produces a `statechange`.
// - While `alertSystemActive` is 0, alert nodes only receive sensor alerts
//   through levels marked `triggerAlways`; switching it to 0 sends
//   `sensoralertsoff` to every connected alert node.
// - Option changes and membership changes (registration, connect, disconnect)
//   push a fresh snapshot to every connected manager.
//
// Records of disconnected nodes are kept with `connected = false`; a node that
// registers again under the same username gets its old node id back, and
// sensors/alerts with the same client-local id keep their server-wide ids.
// If it reconnects before its old session has closed, the new connection takes
// over and the old session's eventual `detach` is a no-op.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::mpsc::Sender;

use parking_lot::Mutex;
use thiserror::Error;
use watchpost_protocol::message::{
    Alert, AlertLevel, Manager, Node, NodeRegistration, OptionChange, OptionEntry,
    RegistrationRequest, Request, Sensor, SensorAlertNotice, SensorAlertReport, SensorStatus,
    Snapshot, StateChangeNotice, StateChangeReport,
};
use watchpost_protocol::types::{
    AlertId, ClientAlertId, ClientSensorId, ManagerId, NodeId, NodeType, SensorData, SensorId,
    SensorState, Timestamp,
};

use crate::config::{ALERT_SYSTEM_ACTIVE, ServerConfig};

pub type SharedSystem = Arc<Mutex<AlertSystem>>;

/// Failures reported to the requesting node as an error envelope. None of
/// these changes any state.
#[derive(Debug, Error, PartialEq)]
pub enum ApplicationError {
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),
    #[error("node {node:?} has no sensor with clientSensorId {client_sensor_id}")]
    UnknownSensor {
        node: NodeId,
        client_sensor_id: u32,
    },
    #[error("alert level {0} does not exist")]
    UnknownAlertLevel(u32),
    #[error("{description:?} has no alert levels")]
    EmptyAlertLevels { description: String },
    #[error("client id {0} is registered twice")]
    DuplicateClientId(u32),
    #[error("{username} is registered as a {registered} node, not {requested}")]
    NodeTypeMismatch {
        username: String,
        registered: NodeType,
        requested: NodeType,
    },
    #[error("only {expected} nodes may send this request")]
    WrongNodeType { expected: NodeType },
    #[error("unknown option {0:?}")]
    UnknownOption(String),
    #[error("{message} requests are not handled by the server")]
    Unsupported { message: String },
}

/// Identifies one `attach` call. A node that reconnects before its old
/// session has noticed gets a new attachment, and only the holder of the
/// current one can detach it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attachment(u64);

/// One attached connection.
pub trait Subscriber: Send {
    /// Queue `request` for delivery. Returns false if the connection is gone.
    fn deliver(&self, request: Request) -> bool;
}

impl Subscriber for Sender<Request> {
    fn deliver(&self, request: Request) -> bool {
        self.send(request).is_ok()
    }
}

/// Outbound notification for alert levels with `smtpActivated`. Delivery
/// itself (SMTP or otherwise) belongs to the implementor.
pub trait Notifier: Send {
    fn notify(&self, level: &AlertLevel, alert: &SensorAlertNotice);
}

/// Default notifier: records the would-be notification in the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, level: &AlertLevel, alert: &SensorAlertNotice) {
        log::info!(
            "notify {} (level {} {:?}): sensor {:?} {:?}",
            level.to_addr,
            level.level,
            level.name,
            alert.sensor_id,
            alert.description
        );
    }
}

struct NodeRecord {
    node: Node,
    username: String,
    sensors: BTreeMap<ClientSensorId, SensorId>,
    alerts: BTreeMap<ClientAlertId, AlertId>,
    manager: Option<ManagerId>,
    subscriber: Option<(Attachment, Box<dyn Subscriber>)>,
}

struct Delayed<T> {
    due: Timestamp,
    item: T,
}

pub struct AlertSystem {
    nodes: BTreeMap<NodeId, NodeRecord>,
    by_username: BTreeMap<String, NodeId>,
    sensors: BTreeMap<SensorId, Sensor>,
    alerts: BTreeMap<AlertId, Alert>,
    managers: BTreeMap<ManagerId, Manager>,
    alert_levels: BTreeMap<u32, AlertLevel>,
    options: BTreeMap<String, f64>,
    next_node_id: u32,
    next_sensor_id: u32,
    next_alert_id: u32,
    next_manager_id: u32,
    next_attachment: u64,
    delayed_alerts: Vec<Delayed<SensorAlertNotice>>,
    delayed_options: Vec<Delayed<(String, f64)>>,
    notifier: Box<dyn Notifier>,
}

impl AlertSystem {
    pub fn new(alert_levels: Vec<AlertLevel>, options: Vec<OptionEntry>) -> Self {
        Self {
            nodes: BTreeMap::new(),
            by_username: BTreeMap::new(),
            sensors: BTreeMap::new(),
            alerts: BTreeMap::new(),
            managers: BTreeMap::new(),
            alert_levels: alert_levels.into_iter().map(|l| (l.level, l)).collect(),
            options: options
                .into_iter()
                .map(|o| (o.option_type, o.value))
                .collect(),
            next_node_id: 1,
            next_sensor_id: 1,
            next_alert_id: 1,
            next_manager_id: 1,
            next_attachment: 1,
            delayed_alerts: Vec::new(),
            delayed_options: Vec::new(),
            notifier: Box::new(LogNotifier),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.alert_levels.clone(), config.options.clone())
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn into_shared(self) -> SharedSystem {
        Arc::new(Mutex::new(self))
    }

    // -- Queries --------------------------------------------------------------

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id).map(|r| &r.node)
    }

    pub fn sensor(&self, id: SensorId) -> Option<&Sensor> {
        self.sensors.get(&id)
    }

    /// Server-wide id of a node's sensor.
    pub fn sensor_id(&self, node: NodeId, client_sensor_id: ClientSensorId) -> Option<SensorId> {
        self.nodes.get(&node)?.sensors.get(&client_sensor_id).copied()
    }

    pub fn option(&self, option_type: &str) -> Option<f64> {
        self.options.get(option_type).copied()
    }

    pub fn connected_count(&self) -> usize {
        self.nodes.values().filter(|r| r.node.connected).count()
    }

    fn alert_system_active(&self) -> bool {
        self.option(ALERT_SYSTEM_ACTIVE).is_none_or(|v| v != 0.0)
    }

    /// Full state for a manager.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            options: self
                .options
                .iter()
                .map(|(option_type, value)| OptionEntry {
                    option_type: option_type.clone(),
                    value: *value,
                })
                .collect(),
            nodes: self.nodes.values().map(|r| r.node.clone()).collect(),
            sensors: self.sensors.values().cloned().collect(),
            managers: self.managers.values().cloned().collect(),
            alerts: self.alerts.values().cloned().collect(),
            alert_levels: self.alert_levels.values().cloned().collect(),
        }
    }

    // -- Membership -----------------------------------------------------------

    /// Merge a registration into the registry and return the node's id.
    pub fn register(
        &mut self,
        username: &str,
        request: &RegistrationRequest,
        now: Timestamp,
    ) -> Result<NodeId, ApplicationError> {
        let requested = request.node.node_type();
        let existing = self.by_username.get(username).copied();
        let registered = existing
            .and_then(|id| self.nodes.get(&id))
            .map(|r| r.node.node_type);
        if let Some(registered) = registered.filter(|t| *t != requested) {
            return Err(ApplicationError::NodeTypeMismatch {
                username: username.into(),
                registered,
                requested,
            });
        }
        self.validate_registration(&request.node)?;

        let node_id = existing.unwrap_or_else(|| {
            let id = NodeId(self.next_node_id);
            self.next_node_id += 1;
            id
        });
        let record = self.nodes.entry(node_id).or_insert_with(|| NodeRecord {
            node: Node {
                id: node_id,
                hostname: request.hostname.clone(),
                node_type: requested,
                connected: false,
            },
            username: username.into(),
            sensors: BTreeMap::new(),
            alerts: BTreeMap::new(),
            manager: None,
            subscriber: None,
        });
        record.node.hostname = request.hostname.clone();
        self.by_username.insert(username.into(), node_id);

        match &request.node {
            NodeRegistration::Sensor(entries) => self.merge_sensors(node_id, entries, now),
            NodeRegistration::Alert(entries) => self.merge_alerts(node_id, entries),
            NodeRegistration::Manager(manager) => {
                self.merge_manager(node_id, &manager.description)
            }
        }
        log::info!(
            "registered {requested} node {node_id:?} ({username}@{})",
            request.hostname
        );
        Ok(node_id)
    }

    fn validate_registration(&self, node: &NodeRegistration) -> Result<(), ApplicationError> {
        let mut seen = BTreeSet::new();
        let mut check = |client_id: u32, description: &str, levels: &BTreeSet<u32>| {
            if !seen.insert(client_id) {
                return Err(ApplicationError::DuplicateClientId(client_id));
            }
            if levels.is_empty() {
                return Err(ApplicationError::EmptyAlertLevels {
                    description: description.into(),
                });
            }
            match levels.iter().find(|l| !self.alert_levels.contains_key(l)) {
                Some(level) => Err(ApplicationError::UnknownAlertLevel(*level)),
                None => Ok(()),
            }
        };
        match node {
            NodeRegistration::Sensor(entries) => {
                for e in entries {
                    check(e.client_sensor_id.0, &e.description, &e.alert_levels)?;
                }
            }
            NodeRegistration::Alert(entries) => {
                for e in entries {
                    check(e.client_alert_id.0, &e.description, &e.alert_levels)?;
                }
            }
            NodeRegistration::Manager(_) => {}
        }
        Ok(())
    }

    fn merge_sensors(
        &mut self,
        node_id: NodeId,
        entries: &[watchpost_protocol::message::SensorRegistration],
        now: Timestamp,
    ) {
        let Some(record) = self.nodes.get_mut(&node_id) else {
            return;
        };
        let mut mapping = BTreeMap::new();
        for entry in entries {
            let sensor_id = match record.sensors.get(&entry.client_sensor_id) {
                Some(id) => *id,
                None => {
                    let id = SensorId(self.next_sensor_id);
                    self.next_sensor_id += 1;
                    id
                }
            };
            mapping.insert(entry.client_sensor_id, sensor_id);
            let sensor = self.sensors.entry(sensor_id).or_insert_with(|| Sensor {
                node_id,
                sensor_id,
                client_sensor_id: entry.client_sensor_id,
                alert_delay: 0,
                alert_levels: BTreeSet::new(),
                description: String::new(),
                state: SensorState::Normal,
                last_state_updated: now,
                persistent: false,
                data: SensorData::None,
                optional_data: None,
            });
            sensor.alert_delay = entry.alert_delay;
            sensor.alert_levels = entry.alert_levels.clone();
            sensor.description = entry.description.clone();
        }
        for (_, dropped) in record
            .sensors
            .iter()
            .filter(|(client_id, _)| !mapping.contains_key(*client_id))
        {
            self.sensors.remove(dropped);
        }
        record.sensors = mapping;
    }

    fn merge_alerts(
        &mut self,
        node_id: NodeId,
        entries: &[watchpost_protocol::message::AlertRegistration],
    ) {
        let Some(record) = self.nodes.get_mut(&node_id) else {
            return;
        };
        let mut mapping = BTreeMap::new();
        for entry in entries {
            let alert_id = match record.alerts.get(&entry.client_alert_id) {
                Some(id) => *id,
                None => {
                    let id = AlertId(self.next_alert_id);
                    self.next_alert_id += 1;
                    id
                }
            };
            mapping.insert(entry.client_alert_id, alert_id);
            self.alerts.insert(
                alert_id,
                Alert {
                    node_id,
                    alert_id,
                    client_alert_id: entry.client_alert_id,
                    description: entry.description.clone(),
                    alert_levels: entry.alert_levels.clone(),
                },
            );
        }
        for (_, dropped) in record
            .alerts
            .iter()
            .filter(|(client_id, _)| !mapping.contains_key(*client_id))
        {
            self.alerts.remove(dropped);
        }
        record.alerts = mapping;
    }

    fn merge_manager(&mut self, node_id: NodeId, description: &str) {
        let Some(record) = self.nodes.get_mut(&node_id) else {
            return;
        };
        let manager_id = *record.manager.get_or_insert_with(|| {
            let id = ManagerId(self.next_manager_id);
            self.next_manager_id += 1;
            id
        });
        self.managers.insert(
            manager_id,
            Manager {
                node_id,
                manager_id,
                description: description.into(),
            },
        );
    }

    /// Mark a registered node connected and start delivering to it. Every
    /// connected manager, including this node if it is one, gets a fresh
    /// snapshot. The returned attachment is what `detach` needs later.
    pub fn attach(
        &mut self,
        node_id: NodeId,
        subscriber: Box<dyn Subscriber>,
    ) -> Result<Attachment, ApplicationError> {
        let record = self
            .nodes
            .get_mut(&node_id)
            .ok_or(ApplicationError::UnknownNode(node_id))?;
        if record.subscriber.is_some() {
            log::warn!(
                "node {node_id:?} ({}) attached twice; replacing the old connection",
                record.username
            );
        }
        let attachment = Attachment(self.next_attachment);
        self.next_attachment += 1;
        record.node.connected = true;
        record.subscriber = Some((attachment, subscriber));
        self.broadcast_snapshot();
        Ok(attachment)
    }

    /// Mark a node disconnected. Its records stay; other managers are told.
    /// A stale attachment (the node has since reconnected) changes nothing.
    pub fn detach(&mut self, node_id: NodeId, attachment: Attachment) {
        let Some(record) = self.nodes.get_mut(&node_id) else {
            return;
        };
        match &record.subscriber {
            Some((current, _)) if *current == attachment => {}
            _ => {
                log::debug!(
                    "node {node_id:?} ({}): ignoring detach of a replaced connection",
                    record.username
                );
                return;
            }
        }
        record.node.connected = false;
        record.subscriber = None;
        log::info!("node {node_id:?} ({}) disconnected", record.username);
        self.broadcast_snapshot();
    }

    // -- Sensor events --------------------------------------------------------

    fn resolve(
        &self,
        node_id: NodeId,
        client_sensor_id: ClientSensorId,
    ) -> Result<SensorId, ApplicationError> {
        let record = self
            .nodes
            .get(&node_id)
            .ok_or(ApplicationError::UnknownNode(node_id))?;
        if record.node.node_type != NodeType::Sensor {
            return Err(ApplicationError::WrongNodeType {
                expected: NodeType::Sensor,
            });
        }
        record
            .sensors
            .get(&client_sensor_id)
            .copied()
            .ok_or(ApplicationError::UnknownSensor {
                node: node_id,
                client_sensor_id: client_sensor_id.0,
            })
    }

    /// Full status list from a sensor node.
    pub fn apply_status_update(
        &mut self,
        node_id: NodeId,
        statuses: &[SensorStatus],
        now: Timestamp,
    ) -> Result<(), ApplicationError> {
        let resolved = statuses
            .iter()
            .map(|s| self.resolve(node_id, s.client_sensor_id).map(|id| (id, s)))
            .collect::<Result<Vec<_>, _>>()?;

        for (sensor_id, status) in resolved {
            let Some(sensor) = self.sensors.get_mut(&sensor_id) else {
                continue;
            };
            let changed = sensor.state != status.state;
            sensor.state = status.state;
            sensor.data = status.data.clone();
            sensor.last_state_updated = now;
            if changed {
                let notice = StateChangeNotice {
                    sensor_id,
                    state: status.state,
                    data: status.data.clone(),
                };
                self.to_managers(&Request::StateChangeNotice(notice));
            }
        }
        Ok(())
    }

    pub fn apply_state_change(
        &mut self,
        node_id: NodeId,
        report: &StateChangeReport,
        now: Timestamp,
    ) -> Result<(), ApplicationError> {
        let sensor_id = self.resolve(node_id, report.client_sensor_id)?;
        if let Some(sensor) = self.sensors.get_mut(&sensor_id) {
            sensor.state = report.state;
            sensor.data = report.data.clone();
            sensor.last_state_updated = now;
        }
        let notice = StateChangeNotice {
            sensor_id,
            state: report.state,
            data: report.data.clone(),
        };
        self.to_managers(&Request::StateChangeNotice(notice));
        Ok(())
    }

    /// A sensor raised an alert. Sensors with an alert delay have the alert
    /// held until `release_due` passes its due time.
    pub fn apply_sensor_alert(
        &mut self,
        node_id: NodeId,
        report: &SensorAlertReport,
        now: Timestamp,
    ) -> Result<(), ApplicationError> {
        let sensor_id = self.resolve(node_id, report.client_sensor_id)?;
        let Some(sensor) = self.sensors.get_mut(&sensor_id) else {
            return Err(ApplicationError::UnknownSensor {
                node: node_id,
                client_sensor_id: report.client_sensor_id.0,
            });
        };
        if report.change_state {
            sensor.state = report.state;
        }
        if report.has_latest_data {
            sensor.data = report.data.clone();
        }
        sensor.last_state_updated = now;
        if report.optional_data.is_some() {
            sensor.optional_data = report.optional_data.clone();
        }

        let notice = SensorAlertNotice {
            sensor_id,
            state: report.state,
            alert_levels: sensor.alert_levels.clone(),
            description: sensor.description.clone(),
            time_received: now,
            change_state: report.change_state,
            data: report.data.clone(),
            optional_data: report.optional_data.clone(),
        };
        let delay = sensor.alert_delay;
        if delay > 0 {
            log::debug!("holding sensor alert for {sensor_id:?} for {delay}s");
            self.delayed_alerts.push(Delayed {
                due: now + i64::from(delay),
                item: notice,
            });
            return Ok(());
        }
        self.dispatch_alert(&notice);
        Ok(())
    }

    fn dispatch_alert(&self, notice: &SensorAlertNotice) {
        let request = Request::SensorAlertNotice(notice.clone());
        self.to_managers(&request);

        let active = self.alert_system_active();
        let routed: BTreeSet<u32> = notice
            .alert_levels
            .iter()
            .copied()
            .filter(|l| {
                self.alert_levels
                    .get(l)
                    .is_some_and(|level| active || level.trigger_always)
            })
            .collect();
        if routed.is_empty() {
            return;
        }

        for record in self.nodes.values() {
            if record.node.node_type != NodeType::Alert {
                continue;
            }
            let listens = record
                .alerts
                .values()
                .filter_map(|id| self.alerts.get(id))
                .any(|alert| !alert.alert_levels.is_disjoint(&routed));
            if listens {
                deliver(record, request.clone());
            }
        }

        for level in routed.iter().filter_map(|l| self.alert_levels.get(l)) {
            if level.smtp_activated {
                self.notifier.notify(level, notice);
            }
        }
    }

    /// Tell every connected alert node to clear its triggered state.
    pub fn sensor_alerts_off(&self) {
        for record in self.nodes.values() {
            if record.node.node_type == NodeType::Alert {
                deliver(record, Request::SensorAlertsOff);
            }
        }
    }

    // -- Options --------------------------------------------------------------

    pub fn apply_option_change(
        &mut self,
        node_id: NodeId,
        change: &OptionChange,
        now: Timestamp,
    ) -> Result<(), ApplicationError> {
        let record = self
            .nodes
            .get(&node_id)
            .ok_or(ApplicationError::UnknownNode(node_id))?;
        if record.node.node_type != NodeType::Manager {
            return Err(ApplicationError::WrongNodeType {
                expected: NodeType::Manager,
            });
        }
        if !self.options.contains_key(&change.option_type) {
            return Err(ApplicationError::UnknownOption(change.option_type.clone()));
        }
        if change.time_delay > 0 {
            self.delayed_options.push(Delayed {
                due: now + i64::from(change.time_delay),
                item: (change.option_type.clone(), change.value),
            });
            return Ok(());
        }
        self.set_option(&change.option_type, change.value);
        Ok(())
    }

    fn set_option(&mut self, option_type: &str, value: f64) {
        let Some(slot) = self.options.get_mut(option_type) else {
            return;
        };
        let previous = std::mem::replace(slot, value);
        log::info!("option {option_type} {previous} -> {value}");
        if option_type == ALERT_SYSTEM_ACTIVE && previous != 0.0 && value == 0.0 {
            self.sensor_alerts_off();
        }
        self.broadcast_snapshot();
    }

    // -- Timers ---------------------------------------------------------------

    /// Release delayed sensor alerts and option changes that are due.
    pub fn release_due(&mut self, now: Timestamp) {
        let (due, held): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed_alerts)
            .into_iter()
            .partition(|d| d.due <= now);
        self.delayed_alerts = held;
        for delayed in due {
            self.dispatch_alert(&delayed.item);
        }

        let (due, held): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed_options)
            .into_iter()
            .partition(|d| d.due <= now);
        self.delayed_options = held;
        for delayed in due {
            let (option_type, value) = delayed.item;
            self.set_option(&option_type, value);
        }
    }

    // -- Fan-out --------------------------------------------------------------

    /// Send the current snapshot to one node.
    pub fn push_snapshot(&self, node_id: NodeId) {
        if let Some(record) = self.nodes.get(&node_id) {
            deliver(record, Request::Snapshot(Box::new(self.snapshot())));
        }
    }

    fn broadcast_snapshot(&self) {
        let has_managers = self
            .nodes
            .values()
            .any(|r| r.node.node_type == NodeType::Manager && r.subscriber.is_some());
        if !has_managers {
            return;
        }
        let request = Request::Snapshot(Box::new(self.snapshot()));
        self.to_managers(&request);
    }

    fn to_managers(&self, request: &Request) {
        for record in self.nodes.values() {
            if record.node.node_type == NodeType::Manager {
                deliver(record, request.clone());
            }
        }
    }
}

fn deliver(record: &NodeRecord, request: Request) {
    let Some((_, subscriber)) = &record.subscriber else {
        return;
    };
    if !subscriber.deliver(request) {
        log::debug!("node {:?} is gone, dropping delivery", record.node.id);
    }
}
