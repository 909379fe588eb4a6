// Connection handshake: authentication, registration, and the manager's
// initial snapshot.
//
//   Unauthenticated -> Authenticating -> Authenticated -> Registering
//        -> Registered -> Active
//
// Both ends run a `Handshake`; `Role` selects which side of each step the
// local end plays. `admit` is the gate every inbound envelope passes before
// anything else looks at it: it only lets through the envelope the current
// step expects and reports anything else as `ProtocolError::UnexpectedMessage`,
// which closes the connection.
//
// Step by step:
// - Authentication (no RTS/CTS). The client sends the request; the server
//   answers with `{result: "ok", version}` or an error envelope.
// - Registration (RTS/CTS). Once the server acknowledges it, sensor and alert
//   nodes are `Active`. Managers are `Registered` until they have acknowledged
//   the full snapshot the server pushes straight after registration.
// - Active. Requests are further filtered by direction and node type, e.g. an
//   alert node never receives `statechange` and only managers send `option`.

use std::time::{Duration, Instant};

use crate::codec::{Body, Envelope};
use crate::error::{Error, ProtocolError, TimeoutKind};
use crate::message::{MessageKind, Request};
use crate::types::NodeType;

/// Protocol version this build speaks.
pub const PROTOCOL_VERSION: f64 = 0.5;

/// Oldest client version a server accepts by default.
pub const MIN_CLIENT_VERSION: f64 = 0.5;

/// Which end of the connection we are.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    fn peer_name(self) -> &'static str {
        match self {
            Role::Server => "client",
            Role::Client => "server",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Registering,
    Registered,
    Active,
}

impl HandshakeState {
    pub fn name(self) -> &'static str {
        match self {
            HandshakeState::Unauthenticated => "unauthenticated",
            HandshakeState::Authenticating => "authenticating",
            HandshakeState::Authenticated => "authenticated",
            HandshakeState::Registering => "registering",
            HandshakeState::Registered => "registered",
            HandshakeState::Active => "active",
        }
    }
}

/// Whether a client version is acceptable to a server requiring `min`.
pub fn version_supported(version: f64, min: f64) -> bool {
    version >= min
}

/// Requests only the server originates.
pub fn is_server_request(request: &Request) -> bool {
    matches!(
        request,
        Request::Snapshot(_)
            | Request::SensorAlertNotice(_)
            | Request::StateChangeNotice(_)
            | Request::SensorAlertsOff
    )
}

pub struct Handshake {
    role: Role,
    state: HandshakeState,
    node_type: Option<NodeType>,
    deadline: Instant,
}

impl Handshake {
    /// Start a handshake that must reach `Active` within `timeout`.
    pub fn new(role: Role, now: Instant, timeout: Duration) -> Self {
        Self {
            role,
            state: HandshakeState::Unauthenticated,
            node_type: None,
            deadline: now + timeout,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == HandshakeState::Active
    }

    pub fn node_type(&self) -> Option<NodeType> {
        self.node_type
    }

    pub fn check(&self, now: Instant) -> Result<(), Error> {
        if !self.is_active() && now >= self.deadline {
            return Err(Error::Timeout(TimeoutKind::Handshake));
        }
        Ok(())
    }

    /// Gate an inbound envelope. Advances the state where receiving the
    /// envelope is itself the transition.
    pub fn admit(&mut self, envelope: &Envelope) -> Result<(), Error> {
        let allowed = match self.role {
            Role::Server => self.server_admits(envelope)?,
            Role::Client => self.client_admits(envelope)?,
        };
        if !allowed {
            return Err(ProtocolError::UnexpectedMessage {
                state: self.state.name(),
                got: envelope.describe(),
            }
            .into());
        }
        Ok(())
    }

    fn server_admits(&mut self, envelope: &Envelope) -> Result<bool, Error> {
        use HandshakeState as S;
        let message = envelope.message;
        let allowed = match (self.state, &envelope.body) {
            (S::Unauthenticated, Body::Request(Request::Authentication(_))) => {
                self.state = S::Authenticating;
                true
            }
            (S::Authenticated, Body::Rts(_)) => message == MessageKind::Registration,
            (S::Authenticated, Body::Request(Request::Registration(_))) => {
                self.state = S::Registering;
                true
            }
            // The manager acknowledging (or refusing) the initial snapshot.
            (S::Registered, Body::Cts(_) | Body::Response(_) | Body::Error(_)) => {
                message == MessageKind::Status
            }
            (S::Active, Body::Rts(_)) => {
                self.check_sender(message)?;
                true
            }
            (S::Active, Body::Request(request)) => {
                self.check_sender(message)?;
                !is_server_request(request)
            }
            (S::Active, Body::Cts(_) | Body::Response(_) | Body::Error(_)) => {
                message.is_arbitrated() && message != MessageKind::Registration
            }
            _ => false,
        };
        Ok(allowed)
    }

    fn check_sender(&self, message: MessageKind) -> Result<(), Error> {
        if self.may_receive(message) {
            return Ok(());
        }
        let sender = self.node_type.map_or("unregistered", NodeType::as_str);
        Err(ProtocolError::Misdirected { message, sender }.into())
    }

    fn client_admits(&mut self, envelope: &Envelope) -> Result<bool, Error> {
        use HandshakeState as S;
        let message = envelope.message;
        let allowed = match (self.state, &envelope.body) {
            (S::Authenticating, Body::Response(_)) => {
                if message == MessageKind::Authentication {
                    self.state = S::Authenticated;
                }
                message == MessageKind::Authentication
            }
            (S::Authenticating, Body::Error(text)) if message == MessageKind::Authentication => {
                return Err(Error::AuthenticationFailure(text.clone()));
            }
            (S::Registering, Body::Cts(_) | Body::Response(_) | Body::Error(_)) => {
                message == MessageKind::Registration
            }
            (S::Registered, Body::Rts(_)) => message == MessageKind::Status,
            (S::Registered, Body::Request(Request::Snapshot(_))) => true,
            (S::Active, Body::Rts(_)) => self.may_receive(message),
            (S::Active, Body::Request(request)) => {
                (is_server_request(request) || *request == Request::Ping)
                    && self.may_receive(message)
            }
            (S::Active, Body::Cts(_) | Body::Response(_) | Body::Error(_)) => {
                message.is_arbitrated() && message != MessageKind::Registration
            }
            _ => false,
        };
        Ok(allowed)
    }

    /// Whether the peer may start an exchange of `message` once active.
    fn may_receive(&self, message: MessageKind) -> bool {
        use MessageKind as M;
        if message == M::Ping {
            return true;
        }
        match (self.role, self.node_type) {
            (Role::Server, Some(NodeType::Sensor)) => {
                matches!(message, M::Status | M::StateChange | M::SensorAlert)
            }
            (Role::Server, Some(NodeType::Manager)) => message == M::Option,
            (Role::Server, Some(NodeType::Alert)) => false,
            (Role::Client, Some(NodeType::Manager)) => {
                matches!(message, M::Status | M::StateChange | M::SensorAlert)
            }
            (Role::Client, Some(NodeType::Alert)) => {
                matches!(message, M::SensorAlert | M::SensorAlertsOff)
            }
            (Role::Client, Some(NodeType::Sensor)) => false,
            (_, None) => false,
        }
    }

    /// What to call the other end in log lines.
    pub fn peer_name(&self) -> &'static str {
        self.role.peer_name()
    }

    // -- Local transitions ---------------------------------------------------

    /// Client: the authentication request has been sent.
    pub fn authentication_sent(&mut self) -> Result<(), Error> {
        self.advance(HandshakeState::Unauthenticated, HandshakeState::Authenticating)
    }

    /// Both sides: credentials and version were accepted.
    pub fn authentication_accepted(&mut self) -> Result<(), Error> {
        self.advance(HandshakeState::Authenticating, HandshakeState::Authenticated)
    }

    /// Client: RTS for the registration is on its way.
    pub fn registration_sent(&mut self) -> Result<(), Error> {
        self.advance(HandshakeState::Authenticated, HandshakeState::Registering)
    }

    /// Both sides: the registration was acknowledged.
    pub fn registered(&mut self, node_type: NodeType) -> Result<(), Error> {
        let next = match node_type {
            NodeType::Manager => HandshakeState::Registered,
            NodeType::Sensor | NodeType::Alert => HandshakeState::Active,
        };
        self.advance(HandshakeState::Registering, next)?;
        self.node_type = Some(node_type);
        Ok(())
    }

    /// Both sides: the manager acknowledged its initial snapshot.
    pub fn snapshot_acknowledged(&mut self) -> Result<(), Error> {
        self.advance(HandshakeState::Registered, HandshakeState::Active)
    }

    fn advance(&mut self, from: HandshakeState, to: HandshakeState) -> Result<(), Error> {
        if self.state != from {
            return Err(ProtocolError::UnexpectedMessage {
                state: self.state.name(),
                got: format!("local transition to {}", to.name()),
            }
            .into());
        }
        log::debug!("handshake {} -> {}", from.name(), to.name());
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Origin;
    use crate::message::{
        AuthenticationRequest, ManagerRegistration, NodeRegistration, OptionChange,
        RegistrationRequest, Response, Snapshot, StateChangeNotice,
    };
    use crate::types::{ExchangeId, SensorData, SensorId, SensorState};

    fn server() -> Handshake {
        Handshake::new(Role::Server, Instant::now(), Duration::from_secs(30))
    }

    fn client() -> Handshake {
        Handshake::new(Role::Client, Instant::now(), Duration::from_secs(30))
    }

    fn auth() -> Envelope {
        Envelope::request(
            Origin::Client,
            Request::Authentication(AuthenticationRequest {
                version: 0.5,
                username: "mgr".into(),
                password: "pw".into(),
            }),
        )
    }

    fn manager_registration() -> Envelope {
        Envelope::request(
            Origin::Client,
            Request::Registration(RegistrationRequest {
                hostname: "desk".into(),
                node: NodeRegistration::Manager(ManagerRegistration {
                    description: "desk".into(),
                }),
            }),
        )
    }

    fn is_unexpected(result: Result<(), Error>) -> bool {
        matches!(
            result,
            Err(Error::Protocol(ProtocolError::UnexpectedMessage { .. }))
        )
    }

    #[test]
    fn server_walks_a_manager_through_the_handshake() {
        let mut hs = server();
        hs.admit(&auth()).unwrap();
        assert_eq!(hs.state(), HandshakeState::Authenticating);
        hs.authentication_accepted().unwrap();

        let rts = Envelope::rts(Origin::Client, MessageKind::Registration, ExchangeId(1));
        hs.admit(&rts).unwrap();
        hs.admit(&manager_registration()).unwrap();
        assert_eq!(hs.state(), HandshakeState::Registering);
        hs.registered(NodeType::Manager).unwrap();
        assert_eq!(hs.state(), HandshakeState::Registered);

        let cts = Envelope::cts(Origin::Client, MessageKind::Status, ExchangeId(2));
        hs.admit(&cts).unwrap();
        let ack = Envelope::response(Origin::Client, MessageKind::Status, Response::Ok);
        hs.admit(&ack).unwrap();
        hs.snapshot_acknowledged().unwrap();
        assert!(hs.is_active());
    }

    #[test]
    fn server_requires_authentication_first() {
        let mut hs = server();
        let ping = Envelope::rts(Origin::Client, MessageKind::Ping, ExchangeId(1));
        assert!(is_unexpected(hs.admit(&ping)));
        assert!(is_unexpected(hs.admit(&manager_registration())));
    }

    #[test]
    fn server_refuses_second_authentication() {
        let mut hs = server();
        hs.admit(&auth()).unwrap();
        hs.authentication_accepted().unwrap();
        assert!(is_unexpected(hs.admit(&auth())));
    }

    #[test]
    fn active_server_filters_by_node_type() {
        let mut hs = server();
        hs.admit(&auth()).unwrap();
        hs.authentication_accepted().unwrap();
        hs.admit(&manager_registration()).unwrap();
        hs.registered(NodeType::Manager).unwrap();
        hs.snapshot_acknowledged().unwrap();

        let option = Envelope::rts(Origin::Client, MessageKind::Option, ExchangeId(3));
        hs.admit(&option).unwrap();
        let request = Envelope::request(
            Origin::Client,
            Request::Option(OptionChange {
                option_type: "alertSystemActive".into(),
                value: 0.0,
                time_delay: 0,
            }),
        );
        hs.admit(&request).unwrap();

        // Managers do not report sensor state, and nobody re-registers.
        for message in [MessageKind::Status, MessageKind::Registration] {
            let rts = Envelope::rts(Origin::Client, message, ExchangeId(4));
            assert!(matches!(
                hs.admit(&rts),
                Err(Error::Protocol(ProtocolError::Misdirected { sender: "manager", .. }))
            ));
        }
    }

    #[test]
    fn client_sees_authentication_failure() {
        let mut hs = client();
        hs.authentication_sent().unwrap();
        let refused = Envelope::error(Origin::Server, MessageKind::Authentication, "bad password");
        assert!(matches!(
            hs.admit(&refused),
            Err(Error::AuthenticationFailure(text)) if text == "bad password"
        ));
    }

    #[test]
    fn client_manager_receives_snapshot_then_notices() {
        let mut hs = client();
        hs.authentication_sent().unwrap();
        let ok = Envelope::response(
            Origin::Server,
            MessageKind::Authentication,
            Response::Authenticated { version: 0.5 },
        );
        hs.admit(&ok).unwrap();
        hs.registration_sent().unwrap();
        let ack = Envelope::response(Origin::Server, MessageKind::Registration, Response::Ok);
        hs.admit(&ack).unwrap();
        hs.registered(NodeType::Manager).unwrap();

        // Only the snapshot may arrive before the manager is active.
        let early = Envelope::rts(Origin::Server, MessageKind::StateChange, ExchangeId(1));
        assert!(is_unexpected(hs.admit(&early)));
        let rts = Envelope::rts(Origin::Server, MessageKind::Status, ExchangeId(2));
        hs.admit(&rts).unwrap();
        let snapshot = Envelope::request(
            Origin::Server,
            Request::Snapshot(Box::<Snapshot>::default()),
        );
        hs.admit(&snapshot).unwrap();
        hs.snapshot_acknowledged().unwrap();

        let notice = Envelope::request(
            Origin::Server,
            Request::StateChangeNotice(StateChangeNotice {
                sensor_id: SensorId(1),
                state: SensorState::Triggered,
                data: SensorData::None,
            }),
        );
        hs.admit(&notice).unwrap();
    }

    #[test]
    fn client_alert_node_never_gets_state_changes() {
        let mut hs = client();
        hs.authentication_sent().unwrap();
        hs.admit(&Envelope::response(
            Origin::Server,
            MessageKind::Authentication,
            Response::Authenticated { version: 0.5 },
        ))
        .unwrap();
        hs.registration_sent().unwrap();
        hs.registered(NodeType::Alert).unwrap();
        assert!(hs.is_active());

        let rts = Envelope::rts(Origin::Server, MessageKind::StateChange, ExchangeId(1));
        assert!(is_unexpected(hs.admit(&rts)));
        let off = Envelope::rts(Origin::Server, MessageKind::SensorAlertsOff, ExchangeId(2));
        hs.admit(&off).unwrap();
    }

    #[test]
    fn local_transitions_must_be_in_order() {
        let mut hs = client();
        assert!(hs.registration_sent().is_err());
        assert!(hs.snapshot_acknowledged().is_err());
    }

    #[test]
    fn handshake_deadline() {
        let now = Instant::now();
        let hs = Handshake::new(Role::Server, now, Duration::from_secs(5));
        assert!(hs.check(now).is_ok());
        assert!(matches!(
            hs.check(now + Duration::from_secs(5)),
            Err(Error::Timeout(TimeoutKind::Handshake))
        ));
    }

    #[test]
    fn version_policy() {
        assert!(version_supported(PROTOCOL_VERSION, MIN_CLIENT_VERSION));
        assert!(version_supported(0.6, 0.5));
        assert!(!version_supported(0.4, 0.5));
    }
}
