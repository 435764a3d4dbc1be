//! The radio capabilities the exchange relies on
//!
//! [`RadioPort`] is a narrow, register-free view of a UWB transceiver. Every
//! call completes as soon as the underlying bus transaction does; waiting for
//! protocol events is done by the caller through [`RadioPort::poll_status`].
//!
//! Implementations:
//! - [`dw3000::Dw3000Port`] drives a DW3000 over SPI
//! - `sim::SimRadio` (feature `std`) simulates a radio and its peer

use core::{fmt, ops};

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::{configs::Config, maybe_async_attr, time::TIMESTAMP_LEN};

pub mod dw3000;
#[cfg(any(test, feature = "std"))]
pub mod sim;

/// When to start a transmission
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum TxMode {
    /// As fast as possible
    Immediate,
    /// At the time set through [`RadioPort::set_delayed_start_time`]
    Delayed,
}

/// When to start receiving
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum RxMode {
    /// As fast as possible
    Immediate,
}

/// The most relevant pending event
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum Status {
    /// A transmission completed
    TxDone,
    /// A frame with a valid FCS was received
    RxFrameGood,
    /// Reception failed (FCS, PHY header, sync loss, ...)
    RxError,
    /// The receiver gave up waiting
    Timeout,
    /// A delayed transmission was armed after its start time
    ///
    /// The radio keeps it pending until [`RadioPort::force_idle`].
    TxLate,
    /// Nothing happened yet
    None,
}

impl Status {
    /// Decodes latched status flags
    ///
    /// Receive events take precedence over a transmit completion that was not
    /// cleared yet.
    pub fn from_flags(flags: StatusFlags) -> Self {
        if flags.contains(StatusFlags::RX_GOOD) {
            Status::RxFrameGood
        } else if flags.contains(StatusFlags::RX_ERROR) {
            Status::RxError
        } else if flags.contains(StatusFlags::RX_TIMEOUT) {
            Status::Timeout
        } else if flags.contains(StatusFlags::TX_LATE) {
            Status::TxLate
        } else if flags.contains(StatusFlags::TX_DONE) {
            Status::TxDone
        } else {
            Status::None
        }
    }

    /// Name used in log output
    pub fn name(&self) -> &'static str {
        match self {
            Status::TxDone => "TxDone",
            Status::RxFrameGood => "RxFrameGood",
            Status::RxError => "RxError",
            Status::Timeout => "Timeout",
            Status::TxLate => "TxLate",
            Status::None => "None",
        }
    }
}

/// A set of status flags, for [`RadioPort::clear_status_flags`]
#[derive(Copy, Clone, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct StatusFlags(u8);

impl StatusFlags {
    /// No flags
    pub const NONE: Self = StatusFlags(0);
    /// Transmission complete
    pub const TX_DONE: Self = StatusFlags(0b0001);
    /// Good frame received
    pub const RX_GOOD: Self = StatusFlags(0b0010);
    /// Any receive error
    pub const RX_ERROR: Self = StatusFlags(0b0100);
    /// Any receive timeout
    pub const RX_TIMEOUT: Self = StatusFlags(0b1000);
    /// Delayed start time already passed when armed
    pub const TX_LATE: Self = StatusFlags(0b1_0000);
    /// Every flag the exchange uses
    pub const ALL: Self = StatusFlags(0b1_1111);

    /// Whether every flag of `other` is set in `self`
    pub fn contains(self, other: StatusFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Raw bits
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl ops::BitOr for StatusFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        StatusFlags(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for StatusFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl ops::Not for StatusFlags {
    type Output = Self;

    fn not(self) -> Self {
        StatusFlags(!self.0 & Self::ALL.0)
    }
}

impl ops::BitAnd for StatusFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        StatusFlags(self.0 & rhs.0)
    }
}

impl fmt::Debug for StatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusFlags({:#07b})", self.0)
    }
}

/// The radio as seen by the exchange
///
/// Calls must not block on protocol timing. Each one returns after the bus
/// transaction it needs. The port is exclusively owned by one exchange.
#[allow(async_fn_in_trait)]
#[maybe_async_attr(AFIT)]
pub trait RadioPort {
    /// Error reported by the hardware or the bus
    type Error: fmt::Debug;

    /// Applies the PHY configuration
    async fn configure(&mut self, config: &Config) -> Result<(), Self::Error>;

    /// Sets the TX and RX antenna delay, in ticks
    async fn set_antenna_delay(&mut self, ticks: u16) -> Result<(), Self::Error>;

    /// Loads the next frame to transmit
    async fn write_tx_payload(&mut self, payload: &[u8]) -> Result<(), Self::Error>;

    /// Starts the transmission of the loaded frame
    async fn arm_tx(&mut self, mode: TxMode) -> Result<(), Self::Error>;

    /// Sets the delayed-start register, bits 8..40 of the start time
    async fn set_delayed_start_time(&mut self, value: u32) -> Result<(), Self::Error>;

    /// Turns the receiver on
    async fn enable_rx(&mut self, mode: RxMode) -> Result<(), Self::Error>;

    /// Aborts any pending or ongoing transmission or reception
    ///
    /// Status flags are left as they are.
    async fn force_idle(&mut self) -> Result<(), Self::Error>;

    /// Reads the pending event, without clearing it
    async fn poll_status(&mut self) -> Result<Status, Self::Error>;

    /// Clears the given status flags
    async fn clear_status_flags(&mut self, flags: StatusFlags) -> Result<(), Self::Error>;

    /// Timestamp of the last transmission, least significant byte first
    async fn read_tx_timestamp(&mut self) -> Result<[u8; TIMESTAMP_LEN], Self::Error>;

    /// Timestamp of the last reception, least significant byte first
    async fn read_rx_timestamp(&mut self) -> Result<[u8; TIMESTAMP_LEN], Self::Error>;

    /// Copies up to `buffer.len()` bytes of the last received frame
    ///
    /// Returns the full length of the frame, without FCS. A return value
    /// larger than `buffer.len()` means the frame was truncated.
    async fn read_rx_payload(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error>;

    /// Current system time, least significant byte first
    async fn read_system_time(&mut self) -> Result<[u8; TIMESTAMP_LEN], Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_priority() {
        assert_eq!(Status::from_flags(StatusFlags::NONE), Status::None);
        assert_eq!(Status::from_flags(StatusFlags::TX_DONE), Status::TxDone);
        assert_eq!(
            Status::from_flags(StatusFlags::TX_DONE | StatusFlags::RX_GOOD),
            Status::RxFrameGood
        );
        assert_eq!(
            Status::from_flags(StatusFlags::RX_ERROR | StatusFlags::RX_TIMEOUT),
            Status::RxError
        );
        assert_eq!(Status::from_flags(StatusFlags::RX_TIMEOUT), Status::Timeout);
        assert_eq!(
            Status::from_flags(StatusFlags::TX_LATE | StatusFlags::TX_DONE),
            Status::TxLate
        );
    }

    #[test]
    fn flag_set_operations() {
        let mut flags = StatusFlags::TX_DONE;
        flags |= StatusFlags::RX_GOOD;

        assert!(flags.contains(StatusFlags::TX_DONE));
        assert!(!flags.contains(StatusFlags::NONE));
        assert_eq!(flags & !StatusFlags::TX_DONE, StatusFlags::RX_GOOD);
        assert_eq!(!StatusFlags::ALL, StatusFlags::NONE);
        assert_eq!(flags.bits(), 0b0011);
    }
}
