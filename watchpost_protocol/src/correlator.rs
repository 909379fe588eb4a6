// Request/response pairing for one connection.
//
// The arbiter decides *who* may use the channel; the correlator checks *what*
// comes back. While one of our requests is outstanding the very next envelope
// from the peer must be its response (or an error envelope for the same
// `message`). Anything else, including a response for a different message, is
// `ProtocolError::OutOfOrder` and kills the connection. On the inbound side the
// correlator remembers the request we still owe an answer to, so a second one
// cannot overlap it.
//
// Authentication is the one exchange without RTS/CTS; `call` runs such an
// exchange synchronously on a blocking stream.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use crate::codec::{Body, Envelope, Origin};
use crate::error::{Error, ProtocolError, TimeoutKind};
use crate::framing::{read_envelope, write_envelope};
use crate::message::{MessageKind, Request, Response};

/// Outcome of an exchange as seen by the side that sent the request: the
/// peer's response, or the text of its error envelope.
pub type Reply = Result<Response, String>;

#[derive(Clone, Copy, Debug)]
struct Outstanding {
    message: MessageKind,
    since: Instant,
}

/// What `Correlator::accept` made of an envelope.
#[derive(Clone, Debug, PartialEq)]
pub enum Correlation {
    /// Nothing outstanding; the envelope is for the caller to interpret.
    Unrelated,
    /// The outstanding request has been answered.
    Answered { message: MessageKind, reply: Reply },
}

pub struct Correlator {
    outbound: Option<Outstanding>,
    inbound: Option<MessageKind>,
    timeout: Duration,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            outbound: None,
            inbound: None,
            timeout,
        }
    }

    /// Message of the request we are waiting on, if any.
    pub fn awaiting(&self) -> Option<MessageKind> {
        self.outbound.map(|o| o.message)
    }

    /// Message of the inbound request we still have to answer, if any.
    pub fn owing(&self) -> Option<MessageKind> {
        self.inbound
    }

    /// Record that a request has just been sent.
    pub fn expect_response(&mut self, message: MessageKind, now: Instant) -> Result<(), Error> {
        if self.outbound.is_some() {
            return Err(ProtocolError::DuplicateExchange { message }.into());
        }
        self.outbound = Some(Outstanding { message, since: now });
        Ok(())
    }

    /// Check an inbound envelope against the outstanding request.
    pub fn accept(&mut self, envelope: &Envelope) -> Result<Correlation, Error> {
        let Some(outstanding) = self.outbound else {
            return Ok(Correlation::Unrelated);
        };
        let reply = match &envelope.body {
            Body::Response(response) if envelope.message == outstanding.message => {
                Ok(response.clone())
            }
            Body::Error(text) if envelope.message == outstanding.message => Err(text.clone()),
            _ => {
                return Err(ProtocolError::OutOfOrder {
                    expected: outstanding.message,
                    got: envelope.describe(),
                }
                .into());
            }
        };
        self.outbound = None;
        Ok(Correlation::Answered {
            message: outstanding.message,
            reply,
        })
    }

    /// Record an inbound request we now owe a response to.
    pub fn accept_request(&mut self, message: MessageKind) -> Result<(), Error> {
        if self.inbound.is_some() {
            return Err(ProtocolError::DuplicateExchange { message }.into());
        }
        self.inbound = Some(message);
        Ok(())
    }

    /// Record that the owed response has been sent.
    pub fn complete_request(&mut self, message: MessageKind) -> Result<(), Error> {
        match self.inbound {
            Some(owed) if owed == message => {
                self.inbound = None;
                Ok(())
            }
            _ => Err(ProtocolError::Unsolicited {
                message,
                what: "response",
            }
            .into()),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.outbound.map(|o| o.since + self.timeout)
    }

    pub fn check(&self, now: Instant) -> Result<(), Error> {
        match self.deadline() {
            Some(deadline) if now >= deadline => Err(Error::Timeout(TimeoutKind::Response)),
            _ => Ok(()),
        }
    }
}

/// Send one request and block for its answer, without RTS/CTS.
///
/// The caller bounds the wait by setting a read timeout on the underlying
/// socket; a read that times out is reported as `Timeout(Response)`. An error
/// envelope from the peer comes back as `Error::Rejected`.
pub fn call<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    origin: Origin,
    request: Request,
) -> Result<Response, Error> {
    let message = request.kind();
    let mut correlator = Correlator::new(Duration::MAX);
    write_envelope(writer, &Envelope::request(origin, request))?;
    correlator.expect_response(message, Instant::now())?;

    let envelope = match read_envelope(reader) {
        Ok(envelope) => envelope,
        Err(Error::Io(err))
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ) =>
        {
            return Err(Error::Timeout(TimeoutKind::Response));
        }
        Err(err) => return Err(err),
    };
    match correlator.accept(&envelope)? {
        Correlation::Answered { reply: Ok(response), .. } => Ok(response),
        Correlation::Answered { reply: Err(error), .. } => Err(Error::Rejected { message, error }),
        Correlation::Unrelated => Err(ProtocolError::OutOfOrder {
            expected: message,
            got: envelope.describe(),
        }
        .into()),
    }
}
