// Socket-level smoke test for the alert system server.
//
// Starts a server on localhost and talks to it with plain TCP sockets using
// the protocol crate's framing and envelopes, no `NodeClient` involved. This
// pins the wire behaviour of the handshake and the RTS/CTS exchange from the
// outside: authentication refusals, a sensor's registration and status
// update, the connection being dropped on a protocol violation, and shutdown
// with a peer that never authenticates.

use std::collections::BTreeSet;
use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use watchpost_protocol::codec::{Body, Envelope, Origin};
use watchpost_protocol::error::Error;
use watchpost_protocol::framing::{read_envelope, write_envelope};
use watchpost_protocol::message::{
    AuthenticationRequest, MessageKind, NodeRegistration, OptionChange, RegistrationRequest,
    Request, Response, SensorRegistration, SensorStatus, SensorStatusRequest,
};
use watchpost_protocol::types::{ClientSensorId, ExchangeId, SensorData, SensorState};
use watchpost_server::auth::StaticCredentials;
use watchpost_server::config::ServerConfig;
use watchpost_server::server::{ServerHandle, start_server};

struct RawNode {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl RawNode {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self {
            reader,
            writer: BufWriter::new(stream),
        }
    }

    fn send(&mut self, envelope: &Envelope) {
        write_envelope(&mut self.writer, envelope).unwrap();
    }

    fn recv(&mut self) -> Envelope {
        read_envelope(&mut self.reader).unwrap()
    }

    fn authenticate(&mut self, version: f64, username: &str, password: &str) -> Envelope {
        self.send(&Envelope::request(
            Origin::Client,
            Request::Authentication(AuthenticationRequest {
                version,
                username: username.into(),
                password: password.into(),
            }),
        ));
        self.recv()
    }

    /// One complete client-initiated exchange; returns the server's answer.
    fn exchange(&mut self, id: u32, request: Request) -> Envelope {
        let message = request.kind();
        self.send(&Envelope::rts(Origin::Client, message, ExchangeId(id)));
        let cts = self.recv();
        assert_eq!(cts.message, message);
        assert_eq!(cts.body, Body::Cts(ExchangeId(id)));
        self.send(&Envelope::request(Origin::Client, request));
        self.recv()
    }

    /// True once the server has closed the connection (after draining
    /// anything still in flight).
    fn is_closed(&mut self) -> bool {
        loop {
            match read_envelope(&mut self.reader) {
                Ok(_) => continue,
                Err(Error::Closed) => return true,
                Err(Error::Io(e)) => {
                    return !matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    );
                }
                Err(_) => return false,
            }
        }
    }
}

fn start() -> (ServerHandle, SocketAddr) {
    let config = ServerConfig {
        port: 0, // OS picks a free port
        ..ServerConfig::default()
    };
    let credentials = StaticCredentials::new()
        .with_user("sensor1", "pw1")
        .with_user("manager1", "pw2");
    let (handle, addr) = start_server(config, credentials).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    (handle, addr)
}

fn door_sensor() -> Request {
    Request::Registration(RegistrationRequest {
        hostname: "gate".into(),
        node: NodeRegistration::Sensor(vec![SensorRegistration {
            client_sensor_id: ClientSensorId(1),
            alert_delay: 0,
            alert_levels: BTreeSet::from([0]),
            description: "front door".into(),
        }]),
    })
}

#[test]
fn old_client_version_is_refused() {
    let (handle, addr) = start();
    let mut node = RawNode::connect(addr);

    let reply = node.authenticate(0.4, "sensor1", "pw1");
    assert_eq!(reply.message, MessageKind::Authentication);
    match &reply.body {
        Body::Error(text) => assert!(text.contains("version mismatch"), "got {text}"),
        other => panic!("expected error envelope, got {other:?}"),
    }
    assert!(node.is_closed());

    handle.stop();
}

#[test]
fn wrong_password_is_refused() {
    let (handle, addr) = start();
    let mut node = RawNode::connect(addr);

    let reply = node.authenticate(0.5, "sensor1", "nope");
    assert!(matches!(reply.body, Body::Error(_)), "got {reply:?}");
    assert!(node.is_closed());

    handle.stop();
}

#[test]
fn sensor_registers_and_reports_status() {
    let (handle, addr) = start();
    let mut node = RawNode::connect(addr);

    let reply = node.authenticate(0.5, "sensor1", "pw1");
    assert!(
        matches!(reply.body, Body::Response(Response::Authenticated { .. })),
        "got {reply:?}"
    );

    let reply = node.exchange(1, door_sensor());
    assert_eq!(reply.message, MessageKind::Registration);
    assert_eq!(reply.body, Body::Response(Response::Ok));

    let reply = node.exchange(
        2,
        Request::SensorStatus(SensorStatusRequest {
            sensors: vec![SensorStatus {
                client_sensor_id: ClientSensorId(1),
                state: SensorState::Triggered,
                data: SensorData::None,
            }],
        }),
    );
    assert_eq!(reply.body, Body::Response(Response::Ok));

    let system = handle.system();
    {
        let system = system.lock();
        assert_eq!(system.connected_count(), 1);
        let node_id = system.snapshot().nodes[0].id;
        let sensor_id = system.sensor_id(node_id, ClientSensorId(1)).unwrap();
        assert_eq!(system.sensor(sensor_id).unwrap().state, SensorState::Triggered);
    }

    // Unknown client sensor id: rejected, connection stays up.
    let reply = node.exchange(
        3,
        Request::SensorStatus(SensorStatusRequest {
            sensors: vec![SensorStatus {
                client_sensor_id: ClientSensorId(9),
                state: SensorState::Normal,
                data: SensorData::None,
            }],
        }),
    );
    assert!(matches!(reply.body, Body::Error(_)), "got {reply:?}");
    let reply = node.exchange(4, Request::Ping);
    assert_eq!(reply.body, Body::Response(Response::Ok));

    handle.stop();
}

#[test]
fn sensor_sending_an_option_is_disconnected() {
    let (handle, addr) = start();
    let mut node = RawNode::connect(addr);
    node.authenticate(0.5, "sensor1", "pw1");
    node.exchange(1, door_sensor());

    node.send(&Envelope::rts(Origin::Client, MessageKind::Option, ExchangeId(2)));
    assert!(node.is_closed());

    // The node's records survive its connection.
    std::thread::sleep(Duration::from_millis(100));
    let system = handle.system();
    assert_eq!(system.lock().connected_count(), 0);
    assert_eq!(system.lock().snapshot().sensors.len(), 1);

    handle.stop();
}

#[test]
fn request_before_registration_is_a_protocol_error() {
    let (handle, addr) = start();
    let mut node = RawNode::connect(addr);
    node.authenticate(0.5, "manager1", "pw2");

    node.send(&Envelope::rts(Origin::Client, MessageKind::Option, ExchangeId(1)));
    // The error envelope names the offending message, then the socket closes.
    let reply = node.recv();
    assert_eq!(reply.message, MessageKind::Option);
    assert!(matches!(reply.body, Body::Error(_)), "got {reply:?}");
    assert!(node.is_closed());

    handle.stop();
}

#[test]
fn skipping_rts_is_a_protocol_error() {
    let (handle, addr) = start();
    let mut node = RawNode::connect(addr);
    node.authenticate(0.5, "manager1", "pw2");
    node.exchange(
        1,
        Request::Registration(RegistrationRequest {
            hostname: "desk".into(),
            node: NodeRegistration::Manager(
                watchpost_protocol::message::ManagerRegistration {
                    description: "front desk".into(),
                },
            ),
        }),
    );

    // Answer the initial snapshot exchange first.
    let rts = node.recv();
    let Body::Rts(id) = rts.body else {
        panic!("expected snapshot RTS, got {rts:?}");
    };
    node.send(&Envelope::cts(Origin::Client, MessageKind::Status, id));
    let snapshot = node.recv();
    assert!(matches!(snapshot.body, Body::Request(Request::Snapshot(_))));
    node.send(&Envelope::response(Origin::Client, MessageKind::Status, Response::Ok));

    // An option request with no RTS before it.
    node.send(&Envelope::request(
        Origin::Client,
        Request::Option(OptionChange {
            option_type: "alertSystemActive".into(),
            value: 0.0,
            time_delay: 0,
        }),
    ));
    assert!(node.is_closed());
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(handle.system().lock().option("alertSystemActive"), Some(1.0));

    handle.stop();
}

#[test]
fn stop_does_not_wait_for_silent_peers() {
    let (handle, addr) = start();
    let mut node = RawNode::connect(addr);
    // Give the server time to accept and start waiting for authentication.
    std::thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    handle.stop();
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "stop took {:?}",
        started.elapsed()
    );
    assert!(node.is_closed());
}
