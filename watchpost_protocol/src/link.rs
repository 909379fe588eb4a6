// Exchange driver: arbiter + correlator + outbox over one writer.
//
// `Link` is what a session or client loop actually talks to once the
// connection is authenticated. Outgoing requests are queued; `pump` opens an
// exchange for the head of the queue whenever the arbiter allows it, and the
// request itself goes out when the peer's CTS arrives. Inbound envelopes go
// through `handle`, which answers RTS with CTS, pairs responses with the
// outstanding request and hands peer requests to the caller, who must answer
// each with `respond` before the link can carry anything else.
//
// The link never reads. Callers own the read side (a reader thread feeding a
// channel, in practice) and decide when to call `pump` and `check_timeouts`,
// using `next_wakeup` as the timer.

use std::collections::VecDeque;
use std::io::Write;
use std::time::Instant;

use crate::arbiter::{Arbiter, ArbiterState, RtsOutcome};
use crate::codec::{Body, Envelope, Origin};
use crate::correlator::{Correlation, Correlator, Reply};
use crate::error::{Error, ProtocolError};
use crate::framing::write_envelope;
use crate::message::{MessageKind, Request, Response};

/// Something the caller has to act on.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkEvent {
    /// The peer's request; answer it with `Link::respond`.
    Request(Request),
    /// One of our requests was answered.
    Response {
        message: MessageKind,
        response: Response,
    },
    /// One of our requests (or its RTS) was answered with an error envelope.
    Rejected { message: MessageKind, error: String },
}

pub struct Link<W: Write> {
    writer: W,
    origin: Origin,
    arbiter: Arbiter,
    correlator: Correlator,
    /// Requests waiting for the channel. The head stays here until its CTS
    /// arrives, so a collision leaves it in place for the retry.
    outbox: VecDeque<Request>,
}

impl<W: Write> Link<W> {
    pub fn new(writer: W, origin: Origin, arbiter: Arbiter, correlator: Correlator) -> Self {
        Self {
            writer,
            origin,
            arbiter,
            correlator,
            outbox: VecDeque::new(),
        }
    }

    pub fn arbiter(&self) -> &Arbiter {
        &self.arbiter
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Requests not yet sent, including one whose RTS is in flight.
    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// No exchange open and nothing waiting to be sent.
    pub fn is_quiet(&self) -> bool {
        self.arbiter.is_idle() && self.outbox.is_empty()
    }

    pub fn queue(&mut self, request: Request) {
        self.outbox.push_back(request);
    }

    /// Open an exchange for the next queued request if the channel is free.
    pub fn pump(&mut self, now: Instant) -> Result<(), Error> {
        if !self.arbiter.can_open(now) {
            return Ok(());
        }
        let Some(message) = self.outbox.front().map(Request::kind) else {
            return Ok(());
        };
        let id = self.arbiter.open(message, now)?;
        log::debug!("-> {message} rts {id:?}");
        self.send(&Envelope::rts(self.origin, message, id))
    }

    /// Feed one inbound envelope through the exchange discipline.
    pub fn handle(&mut self, envelope: Envelope, now: Instant) -> Result<Option<LinkEvent>, Error> {
        let message = envelope.message;
        if let Correlation::Answered { message, reply } = self.correlator.accept(&envelope)? {
            let event = match reply {
                Ok(response) => {
                    self.arbiter.on_response(message)?;
                    LinkEvent::Response { message, response }
                }
                Err(error) => {
                    self.arbiter.on_rejected(message)?;
                    LinkEvent::Rejected { message, error }
                }
            };
            return Ok(Some(event));
        }

        match envelope.body {
            Body::Rts(id) => {
                match self.arbiter.on_rts(message, id, now)? {
                    RtsOutcome::Grant => {
                        log::debug!("<- {message} rts {id:?}, granting");
                        self.send(&Envelope::cts(self.origin, message, id))?;
                    }
                    RtsOutcome::Collision { delay } => {
                        log::debug!("<- {message} rts {id:?} collided, retry in {delay:?}");
                    }
                }
                Ok(None)
            }
            Body::Cts(id) => {
                self.arbiter.on_cts(message, id, now)?;
                let request = self
                    .outbox
                    .pop_front()
                    .ok_or(ProtocolError::StrayCts { message, id })?;
                self.correlator.expect_response(message, now)?;
                self.send(&Envelope::request(self.origin, request))?;
                Ok(None)
            }
            Body::Request(request) => {
                self.arbiter.on_request(message, now)?;
                self.correlator.accept_request(message)?;
                Ok(Some(LinkEvent::Request(request)))
            }
            Body::Error(error) if self.is_refusing_rts(message) => {
                // Error in place of CTS: the request is dropped unsent.
                self.arbiter.on_rejected(message)?;
                self.outbox.pop_front();
                Ok(Some(LinkEvent::Rejected { message, error }))
            }
            Body::Response(_) | Body::Error(_) => Err(ProtocolError::Unsolicited {
                message,
                what: "response",
            }
            .into()),
        }
    }

    fn is_refusing_rts(&self, message: MessageKind) -> bool {
        matches!(self.arbiter.state(), ArbiterState::RtsSent(ex) if ex.message == message)
    }

    /// Answer the peer's request delivered by the last `LinkEvent::Request`.
    pub fn respond(&mut self, message: MessageKind, reply: Reply) -> Result<(), Error> {
        self.correlator.complete_request(message)?;
        self.arbiter.response_sent(message)?;
        let envelope = match reply {
            Ok(response) => Envelope::response(self.origin, message, response),
            Err(error) => {
                log::debug!("-> {message} error: {error}");
                Envelope::error(self.origin, message, error)
            }
        };
        self.send(&envelope)
    }

    /// Send an error envelope outside any exchange, just before closing the
    /// connection over a fatal error.
    pub fn send_error(&mut self, message: MessageKind, error: &str) -> Result<(), Error> {
        self.send(&Envelope::error(self.origin, message, error))
    }

    /// Earliest instant at which `pump` or `check_timeouts` has work to do.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let backoff = if self.outbox.is_empty() {
            None
        } else {
            self.arbiter.backoff_until()
        };
        [
            self.arbiter.deadline().map(|(at, _)| at),
            self.correlator.deadline(),
            backoff,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn check_timeouts(&self, now: Instant) -> Result<(), Error> {
        self.arbiter.check(now)?;
        self.correlator.check(now)
    }

    fn send(&mut self, envelope: &Envelope) -> Result<(), Error> {
        write_envelope(&mut self.writer, envelope)
    }
}
