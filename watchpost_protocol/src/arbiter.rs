// RTS/CTS channel arbitration for one connection.
//
// Both ends of a connection may want to start an exchange at any time, but the
// channel carries one exchange at a time. Before sending a request the
// initiator sends RTS(id); the peer, if idle, answers CTS(id); the initiator
// then sends exactly one request and the peer exactly one response, which
// closes the exchange.
//
// State machine (per connection):
//
//   Idle --open()--> RtsSent --on_cts()--> ResponsePending --on_response()--> Idle
//   Idle --on_rts()--> CtsSent --on_request()--> RequestPending --response_sent()--> Idle
//
// Collision: if an RTS arrives while our own RTS is unanswered, both RTS are
// void. Each side returns to Idle and schedules a retry after a delay drawn
// uniformly from `[0, max_backoff]`. While backing off a side still grants the
// peer's RTS, so whoever retries first wins. Repeated collisions become
// geometrically unlikely; `BackoffPolicy::max_collisions` turns the
// pathological tail into a `Timeout` instead of an unbounded live-lock.
//
// Any RTS that arrives while an exchange is open (other than the collision
// case) is a protocol violation.
//
// The arbiter is a pure state machine: it never touches the transport, and
// every method takes `now` so tests can drive it with a virtual clock. `Link`
// (`link.rs`) performs the actual sends.

use std::time::{Duration, Instant};

use crate::error::{Error, ProtocolError, TimeoutKind};
use crate::jitter::Jitter;
use crate::message::MessageKind;
use crate::types::ExchangeId;

/// Which end started an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Initiator {
    Local,
    Remote,
}

/// One in-flight RTS/CTS/request/response cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Exchange {
    pub id: ExchangeId,
    pub message: MessageKind,
    pub initiator: Initiator,
    /// When the current step started; deadlines are measured from here.
    pub since: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArbiterState {
    Idle,
    RtsSent(Exchange),
    CtsSent(Exchange),
    RequestPending(Exchange),
    ResponsePending(Exchange),
}

impl ArbiterState {
    pub fn name(&self) -> &'static str {
        match self {
            ArbiterState::Idle => "idle",
            ArbiterState::RtsSent(_) => "rts-sent",
            ArbiterState::CtsSent(_) => "cts-sent",
            ArbiterState::RequestPending(_) => "request-pending",
            ArbiterState::ResponsePending(_) => "response-pending",
        }
    }

    pub fn exchange(&self) -> Option<&Exchange> {
        match self {
            ArbiterState::Idle => None,
            ArbiterState::RtsSent(ex)
            | ArbiterState::CtsSent(ex)
            | ArbiterState::RequestPending(ex)
            | ArbiterState::ResponsePending(ex) => Some(ex),
        }
    }
}

/// Collision backoff policy. The retry bound is a local policy, not part of
/// the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_backoff: Duration,
    pub max_collisions: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_backoff: Duration::from_millis(1000),
            max_collisions: 10,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Retry {
    collisions: u32,
    not_before: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RtsOutcome {
    /// Send CTS echoing the id.
    Grant,
    /// Both sides sent RTS; retry no earlier than `delay` from now.
    Collision { delay: Duration },
}

pub struct Arbiter {
    state: ArbiterState,
    retry: Option<Retry>,
    policy: BackoffPolicy,
    step_timeout: Duration,
    rng: Jitter,
}

impl Arbiter {
    pub fn new(policy: BackoffPolicy, step_timeout: Duration, rng: Jitter) -> Self {
        Self {
            state: ArbiterState::Idle,
            retry: None,
            policy,
            step_timeout,
            rng,
        }
    }

    pub fn state(&self) -> &ArbiterState {
        &self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == ArbiterState::Idle
    }

    /// Consecutive collisions since our last granted RTS.
    pub fn collisions(&self) -> u32 {
        self.retry.map_or(0, |r| r.collisions)
    }

    /// End of the current backoff window, if one is pending.
    pub fn backoff_until(&self) -> Option<Instant> {
        self.retry.map(|r| r.not_before)
    }

    /// Whether `open` may be called: idle and not backing off.
    pub fn can_open(&self, now: Instant) -> bool {
        self.is_idle() && self.retry.is_none_or(|r| now >= r.not_before)
    }

    /// Start an exchange as initiator. Returns the id to put in the RTS.
    pub fn open(&mut self, message: MessageKind, now: Instant) -> Result<ExchangeId, Error> {
        if !self.is_idle() {
            return Err(ProtocolError::DuplicateExchange { message }.into());
        }
        let id = ExchangeId(self.rng.next_u32());
        self.state = ArbiterState::RtsSent(Exchange {
            id,
            message,
            initiator: Initiator::Local,
            since: now,
        });
        Ok(id)
    }

    /// The peer sent RTS.
    pub fn on_rts(
        &mut self,
        message: MessageKind,
        id: ExchangeId,
        now: Instant,
    ) -> Result<RtsOutcome, Error> {
        match self.state {
            ArbiterState::Idle => {
                self.state = ArbiterState::CtsSent(Exchange {
                    id,
                    message,
                    initiator: Initiator::Remote,
                    since: now,
                });
                Ok(RtsOutcome::Grant)
            }
            ArbiterState::RtsSent(ours) => {
                let collisions = self.collisions() + 1;
                if collisions > self.policy.max_collisions {
                    return Err(Error::Timeout(TimeoutKind::Collisions));
                }
                let delay = self.rng.delay_up_to(self.policy.max_backoff);
                log::debug!(
                    "RTS collision #{collisions} ({} vs {message}), backing off {delay:?}",
                    ours.message
                );
                self.retry = Some(Retry {
                    collisions,
                    not_before: now + delay,
                });
                self.state = ArbiterState::Idle;
                Ok(RtsOutcome::Collision { delay })
            }
            ArbiterState::CtsSent(open)
            | ArbiterState::RequestPending(open)
            | ArbiterState::ResponsePending(open) => Err(ProtocolError::ExchangeOpen {
                message,
                open: open.message,
            }
            .into()),
        }
    }

    /// The peer answered our RTS. The caller must send the request now.
    pub fn on_cts(
        &mut self,
        message: MessageKind,
        id: ExchangeId,
        now: Instant,
    ) -> Result<(), Error> {
        match self.state {
            ArbiterState::RtsSent(ours) if ours.id == id && ours.message == message => {
                self.retry = None;
                self.state = ArbiterState::ResponsePending(Exchange { since: now, ..ours });
                Ok(())
            }
            _ => Err(ProtocolError::StrayCts { message, id }.into()),
        }
    }

    /// The peer sent the request for the exchange we granted.
    pub fn on_request(&mut self, message: MessageKind, now: Instant) -> Result<(), Error> {
        match self.state {
            ArbiterState::CtsSent(granted) if granted.message == message => {
                self.state = ArbiterState::RequestPending(Exchange {
                    since: now,
                    ..granted
                });
                Ok(())
            }
            ArbiterState::CtsSent(granted) => Err(ProtocolError::RequestMismatch {
                expected: granted.message,
                got: message,
            }
            .into()),
            _ => Err(ProtocolError::Unsolicited {
                message,
                what: "request",
            }
            .into()),
        }
    }

    /// We answered the peer's request; the exchange is closed.
    pub fn response_sent(&mut self, message: MessageKind) -> Result<(), Error> {
        match self.state {
            ArbiterState::RequestPending(ex) if ex.message == message => {
                self.state = ArbiterState::Idle;
                Ok(())
            }
            _ => Err(ProtocolError::Unsolicited {
                message,
                what: "response",
            }
            .into()),
        }
    }

    /// The peer answered our request; the exchange is closed.
    pub fn on_response(&mut self, message: MessageKind) -> Result<(), Error> {
        match self.state {
            ArbiterState::ResponsePending(ex) if ex.message == message => {
                self.state = ArbiterState::Idle;
                Ok(())
            }
            _ => Err(ProtocolError::Unsolicited {
                message,
                what: "response",
            }
            .into()),
        }
    }

    /// The peer answered our RTS or our request with an error envelope; the
    /// exchange is closed.
    pub fn on_rejected(&mut self, message: MessageKind) -> Result<(), Error> {
        match self.state {
            ArbiterState::RtsSent(ex) | ArbiterState::ResponsePending(ex)
                if ex.message == message =>
            {
                self.state = ArbiterState::Idle;
                Ok(())
            }
            _ => Err(ProtocolError::Unsolicited {
                message,
                what: "error",
            }
            .into()),
        }
    }

    /// Deadline of the step we are currently waiting on, if any.
    pub fn deadline(&self) -> Option<(Instant, TimeoutKind)> {
        match self.state {
            ArbiterState::RtsSent(ex) => {
                Some((ex.since + self.step_timeout, TimeoutKind::ClearToSend))
            }
            ArbiterState::CtsSent(ex) => Some((ex.since + self.step_timeout, TimeoutKind::Request)),
            ArbiterState::ResponsePending(ex) => {
                Some((ex.since + self.step_timeout, TimeoutKind::Response))
            }
            ArbiterState::Idle | ArbiterState::RequestPending(_) => None,
        }
    }

    pub fn check(&self, now: Instant) -> Result<(), Error> {
        match self.deadline() {
            Some((deadline, kind)) if now >= deadline => Err(Error::Timeout(kind)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    const STEP: Duration = Duration::from_secs(5);

    fn arbiter(seed: u64) -> Arbiter {
        Arbiter::new(BackoffPolicy::default(), STEP, Jitter::new(seed))
    }

    #[test]
    fn full_exchange_as_initiator() {
        let now = Instant::now();
        let mut arb = arbiter(1);
        let id = arb.open(MessageKind::Ping, now).unwrap();
        assert_eq!(arb.state().name(), "rts-sent");
        arb.on_cts(MessageKind::Ping, id, now).unwrap();
        assert_eq!(arb.state().name(), "response-pending");
        arb.on_response(MessageKind::Ping).unwrap();
        assert!(arb.is_idle());
    }

    #[test]
    fn full_exchange_as_responder() {
        let now = Instant::now();
        let mut arb = arbiter(1);
        let outcome = arb.on_rts(MessageKind::Status, ExchangeId(5), now).unwrap();
        assert_eq!(outcome, RtsOutcome::Grant);
        arb.on_request(MessageKind::Status, now).unwrap();
        assert_eq!(arb.state().name(), "request-pending");
        arb.response_sent(MessageKind::Status).unwrap();
        assert!(arb.is_idle());
    }

    #[test]
    fn cts_must_echo_the_id() {
        let now = Instant::now();
        let mut arb = arbiter(2);
        let id = arb.open(MessageKind::Ping, now).unwrap();
        let wrong = ExchangeId(id.0.wrapping_add(1));
        assert!(arb.on_cts(MessageKind::Ping, wrong, now).is_err());
    }

    #[test]
    fn rts_during_open_exchange_is_a_violation() {
        let now = Instant::now();
        let mut arb = arbiter(3);
        arb.on_rts(MessageKind::Ping, ExchangeId(1), now).unwrap();
        let err = arb.on_rts(MessageKind::Status, ExchangeId(2), now).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::ExchangeOpen { .. })
        ));
    }

    #[test]
    fn request_for_a_different_message_is_rejected() {
        let now = Instant::now();
        let mut arb = arbiter(3);
        arb.on_rts(MessageKind::Ping, ExchangeId(1), now).unwrap();
        assert!(arb.on_request(MessageKind::Status, now).is_err());
    }

    #[test]
    fn collision_backs_off_and_still_grants_peer() {
        let now = Instant::now();
        let mut arb = arbiter(4);
        arb.open(MessageKind::Ping, now).unwrap();
        let outcome = arb.on_rts(MessageKind::Ping, ExchangeId(77), now).unwrap();
        let RtsOutcome::Collision { delay } = outcome else {
            panic!("expected collision, got {outcome:?}");
        };
        assert!(delay <= Duration::from_millis(1000));
        assert!(arb.is_idle());
        assert_eq!(arb.collisions(), 1);
        assert!(!arb.can_open(now) || delay.is_zero());
        assert!(arb.can_open(now + delay));

        // Peer retries first: we grant it even though we are backing off.
        let outcome = arb.on_rts(MessageKind::Ping, ExchangeId(78), now).unwrap();
        assert_eq!(outcome, RtsOutcome::Grant);
    }

    #[test]
    fn granted_cts_resets_the_collision_count() {
        let now = Instant::now();
        let mut arb = arbiter(5);
        arb.open(MessageKind::Ping, now).unwrap();
        arb.on_rts(MessageKind::Ping, ExchangeId(1), now).unwrap();
        let later = now + Duration::from_secs(2);
        let id = arb.open(MessageKind::Ping, later).unwrap();
        arb.on_cts(MessageKind::Ping, id, later).unwrap();
        assert_eq!(arb.collisions(), 0);
        assert_eq!(arb.backoff_until(), None);
    }

    #[test]
    fn too_many_collisions_time_out() {
        let policy = BackoffPolicy {
            max_backoff: Duration::from_millis(10),
            max_collisions: 3,
        };
        let mut arb = Arbiter::new(policy, STEP, Jitter::new(6));
        let mut now = Instant::now();
        for _ in 0..3 {
            arb.open(MessageKind::Ping, now).unwrap();
            arb.on_rts(MessageKind::Ping, ExchangeId(9), now).unwrap();
            now += Duration::from_millis(20);
        }
        arb.open(MessageKind::Ping, now).unwrap();
        let err = arb.on_rts(MessageKind::Ping, ExchangeId(9), now).unwrap_err();
        assert!(matches!(err, Error::Timeout(TimeoutKind::Collisions)));
    }

    #[test]
    fn waiting_states_carry_deadlines() {
        let now = Instant::now();
        let mut arb = arbiter(7);
        assert_eq!(arb.deadline(), None);
        arb.open(MessageKind::Ping, now).unwrap();
        assert_eq!(arb.deadline(), Some((now + STEP, TimeoutKind::ClearToSend)));
        assert!(arb.check(now + STEP - Duration::from_millis(1)).is_ok());
        assert!(matches!(
            arb.check(now + STEP),
            Err(Error::Timeout(TimeoutKind::ClearToSend))
        ));
    }

    // -- Collision convergence ------------------------------------------------

    #[derive(Clone, Copy)]
    enum Wire {
        Rts(ExchangeId),
        Cts(ExchangeId),
    }

    /// Two arbiters that both want to send, connected by a link with fixed
    /// one-way latency. Returns (winner, collisions) once one side holds CTS.
    fn race(seed: u64, latency: Duration) -> Result<(usize, u32), Error> {
        let start = Instant::now();
        let mut sides = [arbiter(seed), arbiter(seed.wrapping_mul(31).wrapping_add(17))];
        // (arrival, sequence) -> (destination, message)
        let mut in_flight: BTreeMap<(Instant, u64), (usize, Wire)> = BTreeMap::new();
        let mut seq = 0u64;

        for (side, arb) in sides.iter_mut().enumerate() {
            let id = arb.open(MessageKind::Ping, start)?;
            in_flight.insert((start + latency, seq), (1 - side, Wire::Rts(id)));
            seq += 1;
        }

        loop {
            let next_msg = in_flight.keys().next().copied();
            let next_wake = (0..2)
                .filter(|&s| sides[s].is_idle())
                .filter_map(|s| sides[s].backoff_until().map(|t| (t, s)))
                .min();

            match (next_msg, next_wake) {
                (Some((at, key)), wake) if wake.is_none_or(|(t, _)| at <= t) => {
                    let (to, wire) = in_flight.remove(&(at, key)).expect("present");
                    match wire {
                        Wire::Rts(id) => {
                            if sides[to].on_rts(MessageKind::Ping, id, at)? == RtsOutcome::Grant {
                                in_flight.insert((at + latency, seq), (1 - to, Wire::Cts(id)));
                                seq += 1;
                            }
                        }
                        Wire::Cts(id) => {
                            let collisions = sides[to].collisions();
                            sides[to].on_cts(MessageKind::Ping, id, at)?;
                            return Ok((to, collisions));
                        }
                    }
                }
                (_, Some((t, side))) => {
                    let id = sides[side].open(MessageKind::Ping, t)?;
                    in_flight.insert((t + latency, seq), (1 - side, Wire::Rts(id)));
                    seq += 1;
                }
                (None, None) => panic!("deadlock: nothing in flight and nobody waiting"),
                (Some(_), None) => unreachable!("guard covers a missing wake-up"),
            }
        }
    }

    #[test]
    fn simultaneous_rts_always_resolves() {
        let latency = Duration::from_millis(5);
        let mut wins = [0u32; 2];
        let mut worst = 0;
        for seed in 0..2_000 {
            let (winner, collisions) =
                race(seed, latency).unwrap_or_else(|e| panic!("seed {seed}: {e}"));
            wins[winner] += 1;
            worst = worst.max(collisions);
        }
        // Every race collides at least once, and neither side is favored.
        assert!(worst >= 1);
        assert!(wins[0] > 700 && wins[1] > 700, "unbalanced wins: {wins:?}");
    }
}
