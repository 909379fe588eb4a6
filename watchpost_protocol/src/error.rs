// Error taxonomy for the connection core.
//
// - `ProtocolError`: the peer broke the protocol (malformed envelope, message
//   out of order, RTS while an exchange is open...). Always fatal to the
//   connection.
// - `Error`: everything that can end an operation on a connection. Protocol
//   violations, authentication failures, timeouts, error envelopes from the
//   peer, and transport failures.
//
// Application-level failures (unknown client sensor id and the like) are not
// here: the server reports them to the peer as error envelopes and keeps the
// connection (see `watchpost_server::sync::ApplicationError`).

use std::fmt;
use std::io;

use thiserror::Error;

use crate::codec::CodecError;
use crate::message::MessageKind;
use crate::types::ExchangeId;

/// The peer (or local caller) broke the exchange discipline.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] CodecError),
    #[error("unexpected {got} in handshake state {state}")]
    UnexpectedMessage { state: &'static str, got: String },
    #[error("received {got} while waiting for the {expected} response")]
    OutOfOrder { expected: MessageKind, got: String },
    #[error("{message} RTS while a {open} exchange is open")]
    ExchangeOpen {
        message: MessageKind,
        open: MessageKind,
    },
    #[error("{message} exchange started while another is outstanding")]
    DuplicateExchange { message: MessageKind },
    #[error("CTS for {message}/{id:?} does not match the open RTS")]
    StrayCts { message: MessageKind, id: ExchangeId },
    #[error("{got} request does not match the granted {expected} exchange")]
    RequestMismatch {
        expected: MessageKind,
        got: MessageKind,
    },
    #[error("unsolicited {message} {what}")]
    Unsolicited {
        message: MessageKind,
        what: &'static str,
    },
    #[error("{message} is not accepted from a {sender} node")]
    Misdirected {
        message: MessageKind,
        sender: &'static str,
    },
}

/// Which wait ran out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    Handshake,
    ClearToSend,
    Request,
    Response,
    Idle,
    Collisions,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TimeoutKind::Handshake => "handshake",
            TimeoutKind::ClearToSend => "clear-to-send",
            TimeoutKind::Request => "request after clear-to-send",
            TimeoutKind::Response => "response",
            TimeoutKind::Idle => "idle connection",
            TimeoutKind::Collisions => "repeated RTS collisions",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),
    #[error("timed out waiting for {0}")]
    Timeout(TimeoutKind),
    #[error("peer rejected {message}: {error}")]
    Rejected { message: MessageKind, error: String },
    #[error("connection closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True for errors after which the connection must be closed.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Rejected { .. })
    }
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        Error::Protocol(ProtocolError::Malformed(err))
    }
}
