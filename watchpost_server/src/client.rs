// TCP client for sensor, alert and manager nodes.
//
// Gives node programs (and the integration tests) a blocking request API and
// a non-blocking event inbox on top of the connection core. Architecture:
// - `connect()` authenticates with a plain request/response on the calling
//   thread, then starts the reader thread and runs the registration through a
//   `Driver` until the handshake is `Active` (a manager also waits for its
//   initial snapshot).
// - The reader thread calls `read_envelope()` in a loop and pushes every
//   envelope into the driver's `mpsc` channel.
// - The driver thread owns the `Link` and is the only writer to the socket.
//   Requests from `NodeClient` methods arrive on the same channel together
//   with a reply channel; replies are handed back in queue order, since the
//   link carries one exchange at a time. When quiet, the driver pings the
//   server every `ping_interval` and resends the last sensor status every
//   `status_interval`.
// - Requests from the server (snapshots, notices, alerts-off) are answered by
//   the driver and surface as `ClientEvent`s; a manager also folds them into
//   its `ManagerCache`.
//
// `poll()` drains the event inbox without blocking.

use std::collections::VecDeque;
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use watchpost_protocol::arbiter::{Arbiter, BackoffPolicy};
use watchpost_protocol::cache::ManagerCache;
use watchpost_protocol::codec::{Envelope, Origin};
use watchpost_protocol::correlator::{self, Correlator};
use watchpost_protocol::error::{Error, ProtocolError, TimeoutKind};
use watchpost_protocol::framing::read_envelope;
use watchpost_protocol::handshake::{Handshake, HandshakeState, PROTOCOL_VERSION, Role};
use watchpost_protocol::jitter::Jitter;
use watchpost_protocol::link::{Link, LinkEvent};
use watchpost_protocol::message::{
    AuthenticationRequest, MessageKind, NodeRegistration, OptionChange, RegistrationRequest,
    Request, Response, SensorAlertNotice, SensorAlertReport, SensorStatus, SensorStatusRequest,
    Snapshot, StateChangeNotice, StateChangeReport,
};
use watchpost_protocol::transition::SensorProfile;
use watchpost_protocol::types::{ClientSensorId, NodeType, SensorData, Timestamp};

use crate::config::Timeouts;

/// Longest the driver sleeps before rechecking its timers.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Everything needed to connect and register one node.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub addr: String,
    pub username: String,
    pub password: String,
    pub version: f64,
    pub hostname: String,
    pub registration: NodeRegistration,
    pub timeouts: Timeouts,
    pub backoff: BackoffPolicy,
    /// Resend the last sensor status this often. Sensor nodes only.
    pub status_interval: Option<Duration>,
}

impl ClientConfig {
    pub fn new(addr: &str, username: &str, password: &str, registration: NodeRegistration) -> Self {
        Self {
            addr: addr.into(),
            username: username.into(),
            password: password.into(),
            version: PROTOCOL_VERSION,
            hostname: "localhost".into(),
            registration,
            timeouts: Timeouts::default(),
            backoff: BackoffPolicy::default(),
            status_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// Something the server pushed to this node.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    Snapshot(Box<Snapshot>),
    StateChange(StateChangeNotice),
    SensorAlert(SensorAlertNotice),
    SensorAlertsOff,
    /// The connection is gone; carries the reason when it was not a plain
    /// disconnect.
    Closed(Option<String>),
}

type ReplyTx = Sender<Result<Response, Error>>;

enum DriverInput {
    Inbound(Envelope),
    ReadFailed(Error),
    Send {
        request: Request,
        reply: Option<ReplyTx>,
    },
    Disconnect,
}

/// A connected, registered node.
pub struct NodeClient {
    node_type: NodeType,
    server_version: f64,
    inputs: Sender<DriverInput>,
    events: Receiver<ClientEvent>,
    cache: Arc<Mutex<ManagerCache>>,
    driver_thread: Option<JoinHandle<()>>,
}

impl NodeClient {
    /// Connect, authenticate and register. Returns once the node is active.
    pub fn connect(config: ClientConfig) -> Result<Self, Error> {
        let now = Instant::now();
        let timeouts = config.timeouts;
        let node_type = config.registration.node_type();
        let mut handshake = Handshake::new(Role::Client, now, timeouts.handshake);

        let stream = TcpStream::connect(config.addr.as_str())?;
        stream.set_read_timeout(Some(timeouts.handshake))?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream.try_clone()?);

        handshake.authentication_sent()?;
        let authentication = Request::Authentication(AuthenticationRequest {
            version: config.version,
            username: config.username.clone(),
            password: config.password.clone(),
        });
        let server_version =
            match correlator::call(&mut reader, &mut writer, Origin::Client, authentication) {
                Ok(Response::Authenticated { version }) => version,
                Ok(other) => {
                    return Err(ProtocolError::OutOfOrder {
                        expected: MessageKind::Authentication,
                        got: format!("{other:?}"),
                    }
                    .into());
                }
                Err(Error::Rejected { error, .. }) => {
                    return Err(Error::AuthenticationFailure(error));
                }
                Err(Error::Timeout(_)) => return Err(Error::Timeout(TimeoutKind::Handshake)),
                Err(err) => return Err(err),
            };
        handshake.authentication_accepted()?;
        log::info!(
            "authenticated with {} as {} (server version {server_version})",
            config.addr,
            config.username
        );

        stream.set_read_timeout(None)?;
        let (tx, inputs) = mpsc::channel();
        let reader_tx = tx.clone();
        thread::spawn(move || reader_loop(reader, reader_tx));

        let (events_tx, events) = mpsc::channel();
        let cache = Arc::new(Mutex::new(ManagerCache::new()));
        let mut driver = Driver {
            stream,
            node_type,
            handshake,
            link: Link::new(
                writer,
                Origin::Client,
                Arbiter::new(config.backoff, timeouts.exchange, Jitter::from_entropy()),
                Correlator::new(timeouts.exchange),
            ),
            inputs,
            events: events_tx,
            cache: cache.clone(),
            pending: VecDeque::new(),
            timeouts,
            status_interval: config.status_interval,
            last_status: None,
            last_status_sent: now,
            last_traffic: now,
        };

        driver.enqueue(
            Request::Registration(RegistrationRequest {
                hostname: config.hostname,
                node: config.registration,
            }),
            None,
        );
        driver.handshake.registration_sent()?;
        if let Err(err) = driver.register() {
            driver.shut_down();
            return Err(err);
        }
        log::info!("registered as {node_type} node");

        let driver_thread = thread::spawn(move || driver.run());
        Ok(Self {
            node_type,
            server_version,
            inputs: tx,
            events,
            cache,
            driver_thread: Some(driver_thread),
        })
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// Protocol version the server announced during authentication.
    pub fn server_version(&self) -> f64 {
        self.server_version
    }

    /// Send one request through the RTS/CTS discipline and wait for its
    /// answer. An error envelope from the server comes back as
    /// `Error::Rejected` and leaves the connection up.
    pub fn request(&self, request: Request) -> Result<Response, Error> {
        let message = request.kind();
        if !may_send(self.node_type, message) {
            return Err(ProtocolError::Misdirected {
                message,
                sender: self.node_type.as_str(),
            }
            .into());
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        self.inputs
            .send(DriverInput::Send {
                request,
                reply: Some(reply_tx),
            })
            .map_err(|_| Error::Closed)?;
        reply_rx.recv().map_err(|_| Error::Closed)?
    }

    pub fn ping(&self) -> Result<Response, Error> {
        self.request(Request::Ping)
    }

    /// Report the current state of every local sensor. The driver resends the
    /// last report every `status_interval`.
    pub fn send_status(&self, sensors: Vec<SensorStatus>) -> Result<Response, Error> {
        self.request(Request::SensorStatus(SensorStatusRequest { sensors }))
    }

    pub fn send_state_change(&self, report: StateChangeReport) -> Result<Response, Error> {
        self.request(Request::StateChangeReport(report))
    }

    pub fn send_sensor_alert(&self, report: SensorAlertReport) -> Result<Response, Error> {
        self.request(Request::SensorAlertReport(report))
    }

    /// Classify an observed `old -> new` change of a local sensor and send
    /// whatever it produces. `None` when the change is not reported.
    pub fn report_transition(
        &self,
        profile: &SensorProfile,
        client_sensor_id: ClientSensorId,
        old: u8,
        new: u8,
        data: SensorData,
    ) -> Result<Option<Response>, Error> {
        let Some(request) =
            profile
                .classify(old, new)
                .into_request(profile, client_sensor_id, data, None)
        else {
            return Ok(None);
        };
        self.request(request).map(Some)
    }

    /// Manager only: change an option, `time_delay` seconds from now.
    pub fn send_option(
        &self,
        option_type: &str,
        value: f64,
        time_delay: u32,
    ) -> Result<Response, Error> {
        self.request(Request::Option(OptionChange {
            option_type: option_type.into(),
            value,
            time_delay,
        }))
    }

    /// Drain all queued events (non-blocking).
    pub fn poll(&self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Block for the next event, up to `timeout`.
    pub fn wait_event(&self, timeout: Duration) -> Option<ClientEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    /// Manager only: the local copy of the server's state.
    pub fn cache(&self) -> ManagerCache {
        self.cache.lock().clone()
    }

    /// Close the connection and wait for the driver to finish.
    pub fn disconnect(&mut self) {
        let _ = self.inputs.send(DriverInput::Disconnect);
        if let Some(handle) = self.driver_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NodeClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Which exchanges a node of `node_type` may start.
fn may_send(node_type: NodeType, message: MessageKind) -> bool {
    use MessageKind as M;
    match node_type {
        NodeType::Sensor => matches!(
            message,
            M::Ping | M::Status | M::StateChange | M::SensorAlert
        ),
        NodeType::Manager => matches!(message, M::Ping | M::Option),
        NodeType::Alert => message == M::Ping,
    }
}

/// A request of ours on the link, waiting for its answer.
struct Pending {
    message: MessageKind,
    reply: Option<ReplyTx>,
}

enum Flow {
    Continue,
    Close,
}

struct Driver {
    stream: TcpStream,
    node_type: NodeType,
    handshake: Handshake,
    link: Link<BufWriter<TcpStream>>,
    inputs: Receiver<DriverInput>,
    events: Sender<ClientEvent>,
    cache: Arc<Mutex<ManagerCache>>,
    /// One entry per queued request, in queue order.
    pending: VecDeque<Pending>,
    timeouts: Timeouts,
    status_interval: Option<Duration>,
    last_status: Option<SensorStatusRequest>,
    last_status_sent: Instant,
    last_traffic: Instant,
}

impl Driver {
    /// Step until the handshake is active.
    fn register(&mut self) -> Result<(), Error> {
        while !self.handshake.is_active() {
            if let Flow::Close = self.step()? {
                return Err(Error::Closed);
            }
        }
        Ok(())
    }

    fn run(mut self) {
        let result = loop {
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        let reason = match result {
            Ok(()) => {
                log::info!("disconnected");
                None
            }
            Err(err) => {
                log::warn!("connection lost: {err}");
                Some(err.to_string())
            }
        };
        self.shut_down();
        let _ = self.events.send(ClientEvent::Closed(reason));
    }

    fn shut_down(&mut self) {
        for pending in self.pending.drain(..) {
            if let Some(reply) = pending.reply {
                let _ = reply.send(Err(Error::Closed));
            }
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn step(&mut self) -> Result<Flow, Error> {
        let now = Instant::now();
        self.handshake.check(now)?;
        self.link.check_timeouts(now)?;
        if self.handshake.is_active() {
            self.keep_alive(now);
        }
        self.link.pump(now)?;

        let wait = self
            .link
            .next_wakeup()
            .map_or(POLL_INTERVAL, |at| at.saturating_duration_since(now))
            .min(POLL_INTERVAL);
        match self.inputs.recv_timeout(wait) {
            Ok(DriverInput::Inbound(envelope)) => {
                self.last_traffic = Instant::now();
                self.on_envelope(envelope)?;
            }
            Ok(DriverInput::ReadFailed(err)) => return Err(err),
            Ok(DriverInput::Send { request, reply }) => self.enqueue(request, reply),
            Ok(DriverInput::Disconnect) => return Ok(Flow::Close),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Err(Error::Closed),
        }
        Ok(Flow::Continue)
    }

    /// Queue the periodic ping and status resend once the link is quiet.
    fn keep_alive(&mut self, now: Instant) {
        if !self.link.is_quiet() {
            return;
        }
        if let (Some(interval), Some(status)) = (self.status_interval, &self.last_status) {
            if now.duration_since(self.last_status_sent) >= interval {
                let request = Request::SensorStatus(status.clone());
                self.enqueue(request, None);
                return;
            }
        }
        if now.duration_since(self.last_traffic) >= self.timeouts.ping_interval {
            self.enqueue(Request::Ping, None);
        }
    }

    fn enqueue(&mut self, request: Request, reply: Option<ReplyTx>) {
        if let Request::SensorStatus(status) = &request {
            self.last_status = Some(status.clone());
            self.last_status_sent = Instant::now();
        }
        self.pending.push_back(Pending {
            message: request.kind(),
            reply,
        });
        self.link.queue(request);
    }

    fn on_envelope(&mut self, envelope: Envelope) -> Result<(), Error> {
        self.handshake.admit(&envelope)?;
        let server_time = envelope.stamp.time;
        let Some(event) = self.link.handle(envelope, Instant::now())? else {
            return Ok(());
        };
        match event {
            LinkEvent::Request(request) => self.on_request(request, server_time),
            LinkEvent::Response { message, response } => self.settle(message, Ok(response)),
            LinkEvent::Rejected { message, error } => {
                log::warn!("server rejected {message}: {error}");
                self.settle(message, Err(Error::Rejected { message, error }))
            }
        }
    }

    /// Hand the answer of the oldest outstanding request back to its caller.
    fn settle(
        &mut self,
        message: MessageKind,
        reply: Result<Response, Error>,
    ) -> Result<(), Error> {
        let Some(pending) = self.pending.pop_front() else {
            return Err(ProtocolError::Unsolicited {
                message,
                what: "response",
            }
            .into());
        };
        if pending.message != message {
            return Err(ProtocolError::OutOfOrder {
                expected: pending.message,
                got: message.to_string(),
            }
            .into());
        }
        let registering = self.handshake.state() == HandshakeState::Registering;
        if message == MessageKind::Registration && registering {
            // A refused registration leaves nothing to do on this connection.
            reply?;
            self.handshake.registered(self.node_type)?;
            return Ok(());
        }
        if let Some(tx) = pending.reply {
            let _ = tx.send(reply);
        }
        Ok(())
    }

    /// `server_time` is the stamp of the envelope that carried `request`.
    fn on_request(&mut self, request: Request, server_time: Timestamp) -> Result<(), Error> {
        let message = request.kind();
        if self.node_type == NodeType::Manager {
            update_cache(&mut self.cache.lock(), &request, server_time);
        }
        let event = match request {
            Request::Ping => None,
            Request::Snapshot(snapshot) => Some(ClientEvent::Snapshot(snapshot)),
            Request::StateChangeNotice(notice) => Some(ClientEvent::StateChange(notice)),
            Request::SensorAlertNotice(notice) => Some(ClientEvent::SensorAlert(notice)),
            Request::SensorAlertsOff => Some(ClientEvent::SensorAlertsOff),
            other => {
                let error = format!(
                    "{} is not accepted by a {} node",
                    other.kind(),
                    self.node_type
                );
                return self.link.respond(message, Err(error));
            }
        };
        self.link.respond(message, Ok(Response::Ok))?;
        if message == MessageKind::Status && self.handshake.state() == HandshakeState::Registered {
            self.handshake.snapshot_acknowledged()?;
        }
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        Ok(())
    }
}

/// Patch a manager's replica with a server push. State changes are stamped
/// with the server's time, not this node's clock.
fn update_cache(cache: &mut ManagerCache, request: &Request, server_time: Timestamp) {
    match request {
        Request::Snapshot(snapshot) => cache.apply_snapshot(snapshot),
        Request::StateChangeNotice(notice) => {
            cache.apply_state_change(notice, server_time);
        }
        Request::SensorAlertNotice(notice) => {
            cache.apply_sensor_alert(notice);
        }
        _ => {}
    }
}

/// Reader thread: decode envelopes until the stream ends or breaks.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: Sender<DriverInput>) {
    loop {
        match read_envelope(&mut reader) {
            Ok(envelope) => {
                log::debug!("<- {}", envelope.describe());
                if tx.send(DriverInput::Inbound(envelope)).is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = tx.send(DriverInput::ReadFailed(err));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use watchpost_protocol::message::Sensor;
    use watchpost_protocol::types::{NodeId, SensorId, SensorState};

    use super::*;

    #[test]
    fn node_types_start_only_their_own_exchanges() {
        assert!(may_send(NodeType::Sensor, MessageKind::SensorAlert));
        assert!(!may_send(NodeType::Sensor, MessageKind::Option));
        assert!(may_send(NodeType::Manager, MessageKind::Option));
        assert!(!may_send(NodeType::Manager, MessageKind::Status));
        assert!(may_send(NodeType::Alert, MessageKind::Ping));
        assert!(!may_send(NodeType::Alert, MessageKind::SensorAlert));
    }

    #[test]
    fn cached_state_changes_carry_the_server_time() {
        let sensor = Sensor {
            node_id: NodeId(1),
            sensor_id: SensorId(7),
            client_sensor_id: ClientSensorId(1),
            alert_delay: 0,
            alert_levels: [0].into(),
            description: "porch".into(),
            state: SensorState::Normal,
            last_state_updated: 10,
            persistent: false,
            data: SensorData::None,
            optional_data: None,
        };
        let mut cache = ManagerCache::new();
        let snapshot = Snapshot {
            sensors: vec![sensor],
            ..Snapshot::default()
        };
        update_cache(&mut cache, &Request::Snapshot(Box::new(snapshot)), 50);

        let notice = StateChangeNotice {
            sensor_id: SensorId(7),
            state: SensorState::Triggered,
            data: SensorData::None,
        };
        update_cache(&mut cache, &Request::StateChangeNotice(notice), 1_234);
        let cached = cache.sensor(SensorId(7)).unwrap();
        assert_eq!(cached.state, SensorState::Triggered);
        assert_eq!(cached.last_state_updated, 1_234);
    }

    #[test]
    fn default_config_uses_current_protocol_version() {
        let config = ClientConfig::new(
            "127.0.0.1:44556",
            "sensor1",
            "pw",
            NodeRegistration::Sensor(Vec::new()),
        );
        assert_eq!(config.version, PROTOCOL_VERSION);
        assert_eq!(config.status_interval, Some(Duration::from_secs(60)));
    }
}
