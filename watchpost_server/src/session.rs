// One server-side connection, from accept to close.
//
// Each accepted socket gets a session thread plus a reader thread. The reader
// blocks on `read_envelope` and forwards every decoded envelope (or the error
// that ended the stream) into the session's bounded `mpsc` channel. The same
// channel carries `Input::Deliver` from the alert system when another
// connection's event has to reach this node. Deliveries never block the alert
// system: a node too slow to keep its queue below `INPUT_QUEUE` is
// disconnected. The session thread is the only writer to the socket.
//
// Lifecycle:
// 1. Authentication, synchronously with a read timeout: the very first
//    envelope must be the authentication request. Version and credentials are
//    checked; failure sends an error envelope and closes.
// 2. Registration and everything after it run through a `Link` driven by the
//    session loop, which uses `recv_timeout` up to the link's next deadline as
//    its timer.
// 3. Any fatal error, EOF, idle timeout, queue overflow or server stop ends the
//    loop. The node is detached from the alert system (records stay,
//    `connected` drops) unless it has reconnected on another socket in the
//    meantime, and the socket is shut down, which also ends the reader thread.
//
// Application errors (unknown sensor, option from a non-manager...) are
// answered with an error envelope and the connection stays up, except during
// registration where there is nothing useful left to do with the connection.

use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread;
use std::time::{Duration, Instant};

use watchpost_protocol::arbiter::Arbiter;
use watchpost_protocol::codec::{Body, Envelope, Origin};
use watchpost_protocol::correlator::Correlator;
use watchpost_protocol::error::{Error, TimeoutKind};
use watchpost_protocol::framing::{read_envelope, write_envelope};
use watchpost_protocol::handshake::{Handshake, HandshakeState, Role, version_supported};
use watchpost_protocol::jitter::Jitter;
use watchpost_protocol::link::{Link, LinkEvent};
use watchpost_protocol::message::{MessageKind, RegistrationRequest, Request, Response};
use watchpost_protocol::types::{NodeId, unix_now};

use crate::auth::CredentialStore;
use crate::config::ServerConfig;
use crate::sync::{ApplicationError, Attachment, SharedSystem, Subscriber};

/// Longest the session loop sleeps before rechecking the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Inputs a session may have waiting before deliveries to it are refused.
const INPUT_QUEUE: usize = 1024;

/// Everything the session thread reacts to.
pub(crate) enum Input {
    Inbound(Envelope),
    Deliver(Request),
    ReadFailed(Error),
}

/// Alert-system deliveries land in the session's own input channel. A full
/// channel raises `overflowed`, which the session loop turns into a close.
struct SessionSubscriber {
    tx: SyncSender<Input>,
    overflowed: Arc<AtomicBool>,
}

impl Subscriber for SessionSubscriber {
    fn deliver(&self, request: Request) -> bool {
        match self.tx.try_send(Input::Deliver(request)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.overflowed.store(true, Ordering::SeqCst);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// What the session needs from the server.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub config: Arc<ServerConfig>,
    pub credentials: Arc<dyn CredentialStore>,
    pub system: SharedSystem,
    pub keep_running: Arc<AtomicBool>,
}

enum Flow {
    Continue,
    Close,
}

pub(crate) struct Session {
    peer: SocketAddr,
    ctx: SessionContext,
    stream: TcpStream,
    handshake: Handshake,
    link: Link<BufWriter<TcpStream>>,
    inputs: Receiver<Input>,
    tx: SyncSender<Input>,
    overflowed: Arc<AtomicBool>,
    username: String,
    node: Option<(NodeId, Attachment)>,
    last_inbound: Instant,
    /// Message of the last inbound envelope, for the error envelope sent
    /// when it turns out to be fatal.
    last_message: Option<MessageKind>,
}

/// Serve one connection to completion. Runs on its own thread.
pub(crate) fn serve(stream: TcpStream, peer: SocketAddr, ctx: SessionContext) {
    let result = Session::open(stream, peer, ctx).and_then(|mut session| {
        let result = session.run();
        session.close(&result);
        result
    });
    match result {
        Ok(()) | Err(Error::Closed) => log::info!("{peer}: connection closed"),
        Err(Error::Timeout(kind)) => log::warn!("{peer}: closing, timed out waiting for {kind}"),
        Err(err) => log::warn!("{peer}: closing: {err}"),
    }
}

impl Session {
    /// Authenticate the peer and start its reader thread.
    fn open(stream: TcpStream, peer: SocketAddr, ctx: SessionContext) -> Result<Self, Error> {
        let now = Instant::now();
        let timeouts = ctx.config.timeouts;
        let mut handshake = Handshake::new(Role::Server, now, timeouts.handshake);

        stream.set_read_timeout(Some(timeouts.handshake))?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream.try_clone()?);

        let envelope = read_envelope(&mut reader).map_err(|err| match err {
            Error::Io(io) if is_timeout(&io) => Error::Timeout(TimeoutKind::Handshake),
            other => other,
        })?;
        if let Err(err) = handshake.admit(&envelope) {
            let _ = write_envelope(
                &mut writer,
                &Envelope::error(Origin::Server, envelope.message, err.to_string()),
            );
            let _ = stream.shutdown(Shutdown::Both);
            return Err(err);
        }
        let Body::Request(Request::Authentication(auth)) = envelope.body else {
            return Err(Error::Closed);
        };

        let refusal = if !version_supported(auth.version, ctx.config.min_client_version) {
            Some(format!(
                "version mismatch: client {:.3}, server requires {:.3}",
                auth.version, ctx.config.min_client_version
            ))
        } else if !ctx.credentials.verify(&auth.username, &auth.password) {
            Some("invalid username or password".to_string())
        } else {
            None
        };
        if let Some(reason) = refusal {
            let _ = write_envelope(
                &mut writer,
                &Envelope::error(Origin::Server, MessageKind::Authentication, reason.as_str()),
            );
            let _ = stream.shutdown(Shutdown::Both);
            return Err(Error::AuthenticationFailure(reason));
        }

        write_envelope(
            &mut writer,
            &Envelope::response(
                Origin::Server,
                MessageKind::Authentication,
                Response::Authenticated {
                    version: ctx.config.server_version,
                },
            ),
        )?;
        handshake.authentication_accepted()?;
        log::info!("{peer}: authenticated as {}", auth.username);

        // Long-lived reader; the handshake deadline is enforced by the loop.
        stream.set_read_timeout(None)?;
        let (tx, inputs) = mpsc::sync_channel(INPUT_QUEUE);
        let reader_tx = tx.clone();
        thread::spawn(move || reader_loop(reader, reader_tx));

        let link = Link::new(
            writer,
            Origin::Server,
            Arbiter::new(ctx.config.backoff, timeouts.exchange, Jitter::from_entropy()),
            Correlator::new(timeouts.exchange),
        );
        Ok(Self {
            peer,
            ctx,
            stream,
            handshake,
            link,
            inputs,
            tx,
            overflowed: Arc::new(AtomicBool::new(false)),
            username: auth.username,
            node: None,
            last_inbound: now,
            last_message: None,
        })
    }

    fn run(&mut self) -> Result<(), Error> {
        let idle = self.ctx.config.timeouts.idle;
        while self.ctx.keep_running.load(Ordering::SeqCst) {
            let now = Instant::now();
            self.handshake.check(now)?;
            self.link.check_timeouts(now)?;
            if now.duration_since(self.last_inbound) >= idle {
                return Err(Error::Timeout(TimeoutKind::Idle));
            }
            if self.overflowed.load(Ordering::SeqCst) {
                log::warn!("{}: delivery queue full, dropping slow node", self.peer);
                return Ok(());
            }
            self.link.pump(now)?;

            let wake = self
                .link
                .next_wakeup()
                .map_or(POLL_INTERVAL, |at| at.saturating_duration_since(now))
                .min(POLL_INTERVAL);
            match self.inputs.recv_timeout(wake) {
                Ok(Input::Inbound(envelope)) => {
                    self.last_inbound = Instant::now();
                    self.last_message = Some(envelope.message);
                    if let Flow::Close = self.on_envelope(envelope)? {
                        return Ok(());
                    }
                }
                Ok(Input::Deliver(request)) => self.link.queue(request),
                Ok(Input::ReadFailed(err)) => return Err(err),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Closed),
            }
        }
        Ok(())
    }

    fn on_envelope(&mut self, envelope: Envelope) -> Result<Flow, Error> {
        self.handshake.admit(&envelope)?;
        let Some(event) = self.link.handle(envelope, Instant::now())? else {
            return Ok(Flow::Continue);
        };
        match event {
            LinkEvent::Request(Request::Registration(registration)) => {
                self.register(&registration)
            }
            LinkEvent::Request(request) => {
                let message = request.kind();
                let reply = self.apply(request).map_err(|err| {
                    log::warn!("{}: rejected {message}: {err}", self.peer);
                    err.to_string()
                });
                self.link.respond(message, reply)?;
                Ok(Flow::Continue)
            }
            LinkEvent::Response { message, .. } => {
                if self.handshake.state() == HandshakeState::Registered
                    && message == MessageKind::Status
                {
                    self.handshake.snapshot_acknowledged()?;
                    log::info!("{}: manager is active", self.peer);
                }
                Ok(Flow::Continue)
            }
            LinkEvent::Rejected { message, error } => {
                log::warn!("{}: peer rejected {message}: {error}", self.peer);
                if self.handshake.state() == HandshakeState::Registered {
                    return Ok(Flow::Close);
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn register(&mut self, registration: &RegistrationRequest) -> Result<Flow, Error> {
        let node_type = registration.node.node_type();
        let registered = self
            .ctx
            .system
            .lock()
            .register(&self.username, registration, unix_now());
        let node = match registered {
            Ok(node) => node,
            Err(err) => {
                log::warn!("{}: registration refused: {err}", self.peer);
                self.link
                    .respond(MessageKind::Registration, Err(err.to_string()))?;
                return Ok(Flow::Close);
            }
        };
        self.link.respond(MessageKind::Registration, Ok(Response::Ok))?;
        self.handshake.registered(node_type)?;
        // Attaching pushes the initial snapshot when this is a manager, so it
        // is queued right behind the registration acknowledgement.
        let subscriber = SessionSubscriber {
            tx: self.tx.clone(),
            overflowed: self.overflowed.clone(),
        };
        let attachment = self
            .ctx
            .system
            .lock()
            .attach(node, Box::new(subscriber))
            .map_err(|err| Error::Rejected {
                message: MessageKind::Registration,
                error: err.to_string(),
            })?;
        self.node = Some((node, attachment));
        Ok(Flow::Continue)
    }

    fn apply(&self, request: Request) -> Result<Response, ApplicationError> {
        let Some((node, _)) = self.node else {
            return Err(ApplicationError::Unsupported {
                message: request.kind().to_string(),
            });
        };
        let now = unix_now();
        let mut system = self.ctx.system.lock();
        match request {
            Request::Ping => {}
            Request::SensorStatus(status) => {
                system.apply_status_update(node, &status.sensors, now)?;
            }
            Request::StateChangeReport(report) => system.apply_state_change(node, &report, now)?,
            Request::SensorAlertReport(report) => system.apply_sensor_alert(node, &report, now)?,
            Request::Option(change) => system.apply_option_change(node, &change, now)?,
            other => {
                return Err(ApplicationError::Unsupported {
                    message: other.kind().to_string(),
                });
            }
        }
        Ok(Response::Ok)
    }

    /// Tear down after `run` returns.
    fn close(&mut self, result: &Result<(), Error>) {
        if let (Err(err @ Error::Protocol(_)), Some(message)) = (result, self.last_message) {
            let _ = self.link.send_error(message, &err.to_string());
        }
        if let Some((node, attachment)) = self.node.take() {
            self.ctx.system.lock().detach(node, attachment);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Reader thread: decode envelopes until the stream ends or breaks.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: SyncSender<Input>) {
    loop {
        match read_envelope(&mut reader) {
            Ok(envelope) => {
                log::debug!("<- {}", envelope.describe());
                if tx.send(Input::Inbound(envelope)).is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = tx.send(Input::ReadFailed(err));
                break;
            }
        }
    }
}
