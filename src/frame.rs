//! Wire format of the ranging messages
//!
//! Every message starts with a one-byte type tag and a one-byte sequence
//! number, followed by zero to three 5-byte little-endian timestamps:
//!
//! | Message | Layout                                   | Length |
//! |---------|------------------------------------------|--------|
//! | Poll    | `0x01, seq`                              | 2      |
//! | Resp    | `0x02, seq, poll_rx, resp_tx`            | 12     |
//! | Final   | `0x03, seq, poll_tx, resp_rx, final_tx`  | 17     |
//!
//! The radio appends and checks its own FCS, which is not part of these
//! buffers.

use core::fmt;

use byte::{BytesExt as _, TryRead, TryWrite};

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::time::{Instant, TIMESTAMP_LEN};

/// Length of a Poll message
pub const POLL_LEN: usize = 2;
/// Length of a Resp message
pub const RESP_LEN: usize = 2 + 2 * TIMESTAMP_LEN;
/// Length of a Final message
pub const FINAL_LEN: usize = 2 + 3 * TIMESTAMP_LEN;
/// Length of the longest message, use this to size receive buffers
pub const MAX_LEN: usize = FINAL_LEN;

const HEADER_LEN: usize = 2;

/// The type tag in the first byte of every message
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum MessageType {
    /// Sent by the initiator to start an exchange
    Poll = 0x01,
    /// Reply of the responder
    Resp = 0x02,
    /// Third message of a double-sided exchange
    Final = 0x03,
}

impl MessageType {
    /// Maps a tag byte to a message type
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(MessageType::Poll),
            0x02 => Some(MessageType::Resp),
            0x03 => Some(MessageType::Final),
            _ => None,
        }
    }

    /// Exact length of messages of this type
    pub fn encoded_len(self) -> usize {
        match self {
            MessageType::Poll => POLL_LEN,
            MessageType::Resp => RESP_LEN,
            MessageType::Final => FINAL_LEN,
        }
    }

    /// Name used in log output
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Poll => "Poll",
            MessageType::Resp => "Resp",
            MessageType::Final => "Final",
        }
    }
}

/// A decoded ranging message
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RangingMessage {
    /// Starts an exchange
    Poll {
        /// Sequence number of the exchange
        seq: u8,
    },
    /// Answer to a Poll
    Resp {
        /// Sequence number copied from the Poll
        seq: u8,
        /// When the responder received the Poll (t2)
        poll_rx: Instant,
        /// When the responder transmits this message (t3)
        resp_tx: Instant,
    },
    /// Closes a double-sided exchange
    Final {
        /// Sequence number of the exchange
        seq: u8,
        /// When the initiator sent the Poll (t1)
        poll_tx: Instant,
        /// When the initiator received the Resp (t4)
        resp_rx: Instant,
        /// When the initiator transmits this message (t5)
        final_tx: Instant,
    },
}

impl RangingMessage {
    /// The type of this message
    pub fn message_type(&self) -> MessageType {
        match self {
            RangingMessage::Poll { .. } => MessageType::Poll,
            RangingMessage::Resp { .. } => MessageType::Resp,
            RangingMessage::Final { .. } => MessageType::Final,
        }
    }

    /// The sequence number of this message
    pub fn seq(&self) -> u8 {
        match *self {
            RangingMessage::Poll { seq }
            | RangingMessage::Resp { seq, .. }
            | RangingMessage::Final { seq, .. } => seq,
        }
    }

    /// Whether this message belongs to the exchange with sequence number `seq`
    pub fn matches_sequence(&self, seq: u8) -> bool {
        self.seq() == seq
    }

    /// Encoded length of this message
    pub fn encoded_len(&self) -> usize {
        self.message_type().encoded_len()
    }

    /// Writes the message into `buf` and returns the number of bytes written
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, FrameError> {
        let len = self.encoded_len();
        if buf.len() < len {
            return Err(FrameError::BufferTooSmall { required_len: len });
        }

        match *self {
            RangingMessage::Poll { seq } => buf[..len].copy_from_slice(&build_poll(seq)),
            RangingMessage::Resp {
                seq,
                poll_rx,
                resp_tx,
            } => buf[..len].copy_from_slice(&build_resp(seq, poll_rx, resp_tx)),
            RangingMessage::Final {
                seq,
                poll_tx,
                resp_rx,
                final_tx,
            } => buf[..len].copy_from_slice(&build_final(seq, poll_tx, resp_rx, final_tx)),
        }

        Ok(len)
    }
}

impl TryWrite for RangingMessage {
    fn try_write(self, bytes: &mut [u8], _: ()) -> byte::Result<usize> {
        byte::check_len(bytes, self.encoded_len())?;
        self.encode(bytes).map_err(|_| byte::Error::Incomplete)
    }
}

impl<'a> TryRead<'a> for RangingMessage {
    /// Reads a message from the start of `bytes`
    ///
    /// Trailing bytes are left alone. Use [`parse`] to require an exact
    /// length.
    fn try_read(bytes: &'a [u8], _: ()) -> byte::Result<(Self, usize)> {
        byte::check_len(bytes, HEADER_LEN)?;

        let kind = MessageType::from_tag(bytes[0]).ok_or(byte::Error::BadInput {
            err: "unknown message type",
        })?;
        let seq = bytes[1];
        let mut offset = HEADER_LEN;
        let offset = &mut offset;

        let message = match kind {
            MessageType::Poll => RangingMessage::Poll { seq },
            MessageType::Resp => RangingMessage::Resp {
                seq,
                poll_rx: bytes.read_with(offset, ())?,
                resp_tx: bytes.read_with(offset, ())?,
            },
            MessageType::Final => RangingMessage::Final {
                seq,
                poll_tx: bytes.read_with(offset, ())?,
                resp_rx: bytes.read_with(offset, ())?,
                final_tx: bytes.read_with(offset, ())?,
            },
        };

        Ok((message, *offset))
    }
}

/// Builds a Poll message
pub fn build_poll(seq: u8) -> [u8; POLL_LEN] {
    [MessageType::Poll as u8, seq]
}

/// Builds a Resp message carrying t2 and t3
pub fn build_resp(seq: u8, poll_rx: Instant, resp_tx: Instant) -> [u8; RESP_LEN] {
    let mut buf = [0; RESP_LEN];
    buf[0] = MessageType::Resp as u8;
    buf[1] = seq;
    buf[2..7].copy_from_slice(&poll_rx.to_bytes());
    buf[7..12].copy_from_slice(&resp_tx.to_bytes());
    buf
}

/// Builds a Final message carrying t1, t4 and t5
pub fn build_final(
    seq: u8,
    poll_tx: Instant,
    resp_rx: Instant,
    final_tx: Instant,
) -> [u8; FINAL_LEN] {
    let mut buf = [0; FINAL_LEN];
    buf[0] = MessageType::Final as u8;
    buf[1] = seq;
    buf[2..7].copy_from_slice(&poll_tx.to_bytes());
    buf[7..12].copy_from_slice(&resp_rx.to_bytes());
    buf[12..17].copy_from_slice(&final_tx.to_bytes());
    buf
}

/// Decodes a received buffer
///
/// The buffer must hold exactly one message: a known tag and the length that
/// goes with it. Anything else is reported as an error, never a panic.
pub fn parse(bytes: &[u8]) -> Result<RangingMessage, FrameError> {
    let tag = *bytes.first().ok_or(FrameError::Empty)?;
    let kind = MessageType::from_tag(tag).ok_or(FrameError::UnknownType(tag))?;

    if bytes.len() != kind.encoded_len() {
        return Err(FrameError::Length {
            expected: kind.encoded_len(),
            actual: bytes.len(),
        });
    }

    let (message, _) = RangingMessage::try_read(bytes, ())?;
    Ok(message)
}

/// A received buffer is not a valid ranging message
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum FrameError {
    /// The buffer was empty
    Empty,

    /// The first byte is not a known message type
    UnknownType(u8),

    /// The length does not match the message type
    Length {
        /// Length of this message type
        expected: usize,
        /// Length of the buffer
        actual: usize,
    },

    /// Buffer too small
    BufferTooSmall {
        /// Indicates how large a buffer would have been required
        required_len: usize,
    },
}

impl FrameError {
    /// Name of the variant, for log output
    pub fn name(&self) -> &'static str {
        match self {
            FrameError::Empty => "Empty",
            FrameError::UnknownType(_) => "UnknownType",
            FrameError::Length { .. } => "Length",
            FrameError::BufferTooSmall { .. } => "BufferTooSmall",
        }
    }
}

impl From<byte::Error> for FrameError {
    fn from(error: byte::Error) -> Self {
        match error {
            byte::Error::BadInput { .. } => FrameError::UnknownType(0),
            byte::Error::Incomplete | byte::Error::BadOffset(_) => {
                FrameError::BufferTooSmall { required_len: MAX_LEN }
            }
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FrameError {}

#[cfg(test)]
mod tests {
    use super::*;

    use byte::BytesExt as _;

    fn ts(value: u64) -> Instant {
        Instant::new(value).unwrap()
    }

    #[test]
    fn poll_round_trip_for_every_sequence_number() {
        for seq in 0..=255u8 {
            assert_eq!(parse(&build_poll(seq)), Ok(RangingMessage::Poll { seq }));
        }
    }

    #[test]
    fn resp_layout() {
        let bytes = build_resp(7, ts(0x01_0203_0405), ts(0xff_0000_0001));

        assert_eq!(
            bytes,
            [0x02, 7, 0x05, 0x04, 0x03, 0x02, 0x01, 0x01, 0x00, 0x00, 0x00, 0xff]
        );
        assert_eq!(
            parse(&bytes),
            Ok(RangingMessage::Resp {
                seq: 7,
                poll_rx: ts(0x01_0203_0405),
                resp_tx: ts(0xff_0000_0001),
            })
        );
    }

    #[test]
    fn final_layout() {
        let bytes = build_final(0xfe, ts(1), ts(2), ts(3));

        assert_eq!(bytes.len(), FINAL_LEN);
        assert_eq!(&bytes[..2], &[0x03, 0xfe]);
        assert_eq!(&bytes[2..7], &[1, 0, 0, 0, 0]);
        assert_eq!(&bytes[7..12], &[2, 0, 0, 0, 0]);
        assert_eq!(&bytes[12..17], &[3, 0, 0, 0, 0]);

        let message = parse(&bytes).unwrap();
        assert_eq!(message.message_type(), MessageType::Final);
        assert_eq!(message.encoded_len(), FINAL_LEN);
        assert_eq!(MessageType::Poll.encoded_len(), POLL_LEN);
        assert_eq!(message.seq(), 0xfe);
        assert!(message.matches_sequence(0xfe));
        assert!(!message.matches_sequence(0xff));
    }

    #[test]
    fn parse_rejects_malformed_buffers() {
        assert_eq!(parse(&[]), Err(FrameError::Empty));
        assert_eq!(parse(&[0x04, 0]), Err(FrameError::UnknownType(0x04)));
        assert_eq!(parse(&[0x00]), Err(FrameError::UnknownType(0x00)));
        assert_eq!(
            parse(&[0x01]),
            Err(FrameError::Length {
                expected: POLL_LEN,
                actual: 1
            })
        );
        assert_eq!(
            parse(&[0x01, 0, 0]),
            Err(FrameError::Length {
                expected: POLL_LEN,
                actual: 3
            })
        );

        let resp = build_resp(1, ts(1), ts(2));
        assert_eq!(
            parse(&resp[..RESP_LEN - 1]),
            Err(FrameError::Length {
                expected: RESP_LEN,
                actual: RESP_LEN - 1
            })
        );
    }

    #[test]
    fn encode_into_buffer() {
        let message = RangingMessage::Resp {
            seq: 3,
            poll_rx: ts(10),
            resp_tx: ts(20),
        };

        let mut buf = [0; MAX_LEN];
        assert_eq!(message.encode(&mut buf), Ok(RESP_LEN));
        assert_eq!(&buf[..RESP_LEN], &build_resp(3, ts(10), ts(20)));

        let mut short = [0; RESP_LEN - 1];
        assert_eq!(
            message.encode(&mut short),
            Err(FrameError::BufferTooSmall {
                required_len: RESP_LEN
            })
        );
    }

    #[test]
    fn read_and_write_through_byte() {
        let message = RangingMessage::Final {
            seq: 9,
            poll_tx: ts(100),
            resp_rx: ts(200),
            final_tx: ts(300),
        };

        let mut buf = [0; MAX_LEN + 3];
        let offset = &mut 0;
        buf.write_with(offset, message, ()).unwrap();
        assert_eq!(*offset, FINAL_LEN);

        let offset = &mut 0;
        let read: RangingMessage = buf.read_with(offset, ()).unwrap();
        assert_eq!(read, message);
        assert_eq!(*offset, FINAL_LEN);
    }
}
