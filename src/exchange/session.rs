#[cfg(feature = "defmt")]
use defmt::Format;

use super::Error;
use crate::{
    configs::{Protocol, Role},
    frame::{MessageType, RangingMessage},
    ranging::Timestamps,
};

/// Where an exchange stands within a ranging cycle
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum State {
    /// No cycle is running
    Idle,
    /// Initiator, the Poll is being sent
    AwaitingPollTx,
    /// Responder, waiting for a Poll
    AwaitingPollRx,
    /// Responder, the Resp is being sent
    AwaitingRespTx,
    /// Initiator, waiting for the Resp
    AwaitingRespRx,
    /// Initiator, the Final is being sent
    AwaitingFinalTx,
    /// Responder, waiting for the Final
    AwaitingFinalRx,
    /// The cycle produced its outcome
    Complete,
    /// The radio failed, see [`Exchange::reinitialize`](super::Exchange::reinitialize)
    Error,
}

impl State {
    /// Name used in log output
    pub fn name(&self) -> &'static str {
        match self {
            State::Idle => "Idle",
            State::AwaitingPollTx => "AwaitingPollTx",
            State::AwaitingPollRx => "AwaitingPollRx",
            State::AwaitingRespTx => "AwaitingRespTx",
            State::AwaitingRespRx => "AwaitingRespRx",
            State::AwaitingFinalTx => "AwaitingFinalTx",
            State::AwaitingFinalRx => "AwaitingFinalRx",
            State::Complete => "Complete",
            State::Error => "Error",
        }
    }
}

/// What is awaited from the next received frame
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Expectation {
    /// Required message type, any if `None`
    pub kind: Option<MessageType>,
    /// Required sequence number, any if `None`
    pub seq: Option<u8>,
}

/// The state of one ranging cycle
///
/// Timestamps are kept after the cycle ends and are cleared when the next one
/// begins.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct Session {
    role: Role,
    protocol: Protocol,
    seq: u8,
    state: State,
    pub(crate) timestamps: Timestamps,
}

impl Session {
    pub(crate) fn new(role: Role, protocol: Protocol) -> Self {
        Session {
            role,
            protocol,
            seq: 0,
            state: State::Idle,
            timestamps: Timestamps::default(),
        }
    }

    /// The side this radio plays
    pub fn role(&self) -> Role {
        self.role
    }

    /// The exchange variant
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The sequence number of the current or last cycle
    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// The current state
    pub fn state(&self) -> State {
        self.state
    }

    /// Timestamps collected by the current or last cycle
    pub fn timestamps(&self) -> &Timestamps {
        &self.timestamps
    }

    pub(crate) fn begin(&mut self, seq: u8, state: State) {
        self.seq = seq;
        self.timestamps = Timestamps::default();
        self.enter(state);
    }

    pub(crate) fn adopt_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    pub(crate) fn enter(&mut self, state: State) {
        if self.state != state {
            trace!("session {}: {} -> {}", self.seq, self.state.name(), state.name());
        }
        self.state = state;
    }

    /// Decides whether `message` is the one awaited
    ///
    /// Rejected frames must be discarded without touching the session.
    pub(crate) fn check<E>(
        &self,
        message: &RangingMessage,
        expectation: Expectation,
    ) -> Result<(), Error<E>> {
        if let Some(kind) = expectation.kind {
            if message.message_type() != kind {
                return Err(Error::UnexpectedMessage(message.message_type()));
            }
        }

        match expectation.seq {
            Some(expected) if !message.matches_sequence(expected) => {
                Err(Error::SequenceMismatch {
                    expected,
                    received: message.seq(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::time::Instant;

    fn resp(seq: u8) -> RangingMessage {
        RangingMessage::Resp {
            seq,
            poll_rx: Instant::wrapping(1),
            resp_tx: Instant::wrapping(2),
        }
    }

    #[test]
    fn begin_clears_timestamps() {
        let mut session = Session::new(Role::Responder, Protocol::DoubleSided);
        session.timestamps.t1 = Some(Instant::wrapping(100));

        session.begin(4, State::AwaitingPollTx);

        assert_eq!(session.seq(), 4);
        assert_eq!(session.role(), Role::Responder);
        assert_eq!(session.protocol(), Protocol::DoubleSided);
        assert_eq!(session.state(), State::AwaitingPollTx);
        assert_eq!(session.timestamps(), &Timestamps::default());
    }

    #[test]
    fn check_rejects_stale_and_unexpected_frames() {
        let mut session = Session::new(Role::Initiator, Protocol::SingleSided);
        session.begin(7, State::AwaitingRespRx);
        let awaiting_resp = Expectation {
            kind: Some(MessageType::Resp),
            seq: Some(7),
        };

        assert!(session.check::<()>(&resp(7), awaiting_resp).is_ok());
        assert!(matches!(
            session.check::<()>(&resp(6), awaiting_resp),
            Err(Error::SequenceMismatch {
                expected: 7,
                received: 6
            })
        ));
        assert!(matches!(
            session.check::<()>(&RangingMessage::Poll { seq: 7 }, awaiting_resp),
            Err(Error::UnexpectedMessage(MessageType::Poll))
        ));

        let anything = Expectation {
            kind: None,
            seq: None,
        };
        assert!(session.check::<()>(&resp(200), anything).is_ok());
    }
}
