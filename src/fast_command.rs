//! Single-byte SPI commands

#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// The fast commands the radio port issues
pub enum FastCommand {
    /// Abort any transmission or reception and return to idle
    CMD_TXRXOFF = 0x0,
    /// Transmit now
    CMD_TX = 0x1,
    /// Turn the receiver on now
    CMD_RX = 0x2,
    /// Transmit at the time in DX_TIME
    CMD_DTX = 0x3,
}

impl FastCommand {
    /// The single-byte SPI header carrying this command
    pub const fn header(self) -> u8 {
        0x80 | (((self as u8) << 1) & 0x3e) | 0x01
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers() {
        assert_eq!(FastCommand::CMD_TXRXOFF.header(), 0x81);
        assert_eq!(FastCommand::CMD_TX.header(), 0x83);
        assert_eq!(FastCommand::CMD_RX.header(), 0x85);
        assert_eq!(FastCommand::CMD_DTX.header(), 0x87);
    }
}
