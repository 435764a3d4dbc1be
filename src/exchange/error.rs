use core::fmt::{self, Display, Formatter};

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::{
    configs::InvalidConfiguration,
    frame::{FrameError, MessageType},
    ranging::RangingError,
    scheduler::ScheduleError,
};

/// Why a ranging cycle did not produce an outcome
///
/// `E` is the error type of the radio port. Only [`Error::RadioFault`] and
/// [`Error::Halted`] are fatal; the exchange is back in
/// [`State::Idle`](super::State::Idle) after every other error and the next
/// cycle may simply be started.
pub enum Error<E> {
    /// The radio port failed
    RadioFault(E),

    /// A frame could not be parsed
    MalformedFrame(FrameError),

    /// A frame of an earlier or foreign exchange was received
    SequenceMismatch {
        /// The sequence number of the running exchange
        expected: u8,
        /// The sequence number in the frame
        received: u8,
    },

    /// A valid frame of the wrong type was received
    UnexpectedMessage(MessageType),

    /// The radio reported a receive error (FCS, PHY header, ...)
    ReceiveFailed,

    /// An awaited event did not happen within its poll budget
    Timeout,

    /// A delayed transmission could not be submitted in time
    ///
    /// Nothing was transmitted.
    SchedulingTooLate,

    /// The configuration was rejected
    InvalidConfiguration,

    /// A distance could not be computed from the collected timestamps
    Ranging(RangingError),

    /// The exchange is in the error state and needs to be reinitialized
    Halted,
}

impl<E> Error<E> {
    /// Whether the exchange needs to be reinitialized
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::RadioFault(_) | Error::Halted)
    }

    /// Name of the variant, for log output
    pub fn name(&self) -> &'static str {
        match self {
            Error::RadioFault(_) => "RadioFault",
            Error::MalformedFrame(_) => "MalformedFrame",
            Error::SequenceMismatch { .. } => "SequenceMismatch",
            Error::UnexpectedMessage(_) => "UnexpectedMessage",
            Error::ReceiveFailed => "ReceiveFailed",
            Error::Timeout => "Timeout",
            Error::SchedulingTooLate => "SchedulingTooLate",
            Error::InvalidConfiguration => "InvalidConfiguration",
            Error::Ranging(_) => "Ranging",
            Error::Halted => "Halted",
        }
    }
}

impl<E> From<FrameError> for Error<E> {
    fn from(error: FrameError) -> Self {
        Error::MalformedFrame(error)
    }
}

impl<E> From<RangingError> for Error<E> {
    fn from(error: RangingError) -> Self {
        Error::Ranging(error)
    }
}

impl<E> From<ScheduleError> for Error<E> {
    fn from(error: ScheduleError) -> Self {
        match error {
            ScheduleError::TooLate { .. } => Error::SchedulingTooLate,
            // A delay the 40-bit time base can't express
            ScheduleError::DelayOutOfRange => Error::InvalidConfiguration,
        }
    }
}

impl<E> From<InvalidConfiguration> for Error<E> {
    fn from(_: InvalidConfiguration) -> Self {
        Error::InvalidConfiguration
    }
}

// Not derived, so `Error<E>` is only `Debug` when the port error is.
impl<E> fmt::Debug for Error<E>
where
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Error::RadioFault(error) => write!(f, "RadioFault({:?})", error),
            Error::MalformedFrame(error) => write!(f, "MalformedFrame({:?})", error),
            Error::SequenceMismatch { expected, received } => write!(
                f,
                "SequenceMismatch {{ expected: {}, received: {} }}",
                expected, received
            ),
            Error::UnexpectedMessage(kind) => write!(f, "UnexpectedMessage({:?})", kind),
            Error::Ranging(error) => write!(f, "Ranging({:?})", error),
            other => f.write_str(other.name()),
        }
    }
}

impl<E> Display for Error<E>
where
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl<E> std::error::Error for Error<E> where E: fmt::Debug {}

#[cfg(feature = "defmt")]
impl<E> Format for Error<E>
where
    E: fmt::Debug,
{
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::RadioFault(error) => {
                defmt::write!(f, "RadioFault({:?})", defmt::Debug2Format(error))
            }
            Error::MalformedFrame(error) => defmt::write!(f, "MalformedFrame({:?})", error),
            Error::SequenceMismatch { expected, received } => defmt::write!(
                f,
                "SequenceMismatch {{ expected: {}, received: {} }}",
                expected,
                received
            ),
            Error::UnexpectedMessage(kind) => defmt::write!(f, "UnexpectedMessage({:?})", kind),
            Error::Ranging(error) => defmt::write!(f, "Ranging({:?})", error),
            other => defmt::write!(f, "{=str}", other.name()),
        }
    }
}
