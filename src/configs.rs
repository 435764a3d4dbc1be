//! Configuration structs for the radio and the ranging exchange
//!
//! [`Config`] holds the PHY parameters that both radios must agree on.
//! [`RangingConfig`] wraps it together with everything the exchange needs:
//! role, protocol, reply delays, timeouts and the antenna delay calibration.
//! Both are plain values handed to the exchange at construction.

use core::fmt;

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::scheduler::AntennaDelayPlacement;

/// PHY configuration
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// UWB channel, 5 or 9
    pub channel: UwbChannel,
    /// Data rate of the PHY payload
    pub bitrate: BitRate,
    /// Preamble length, also sets the TX_FCTRL preamble bits
    pub preamble_length: PreambleLength,
    /// The PAC size used by the receiver.
    ///
    /// Should be chosen according to [`PreambleLength::get_recommended_pac_size`].
    pub pac_size: PacSize,
    /// The preamble code, used for both TX and RX.
    pub preamble_code: u8,
    /// Start-of-frame delimiter, same on both sides
    pub sfd_sequence: SfdSequence,
    /// SFD timeout in symbols: preamble length + 1 + SFD length - PAC size.
    pub sfd_timeout: u16,
    /// Whether the receiver drops frames not addressed to it
    ///
    /// Ranging messages carry no addresses, so this defaults to `false`.
    pub frame_filtering: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            channel: Default::default(),
            bitrate: Default::default(),
            preamble_length: Default::default(),
            pac_size: Default::default(),
            preamble_code: 9,
            sfd_sequence: Default::default(),
            sfd_timeout: 129,
            frame_filtering: false,
        }
    }
}

impl Config {
    /// Checks the combinations of settings the radio does not allow
    pub fn validate(&self) -> Result<(), InvalidConfiguration> {
        if !matches!(self.preamble_code, 3 | 4 | 9..=12) {
            return Err(InvalidConfiguration {
                reason: "preamble code not supported on this channel",
            });
        }
        if self.sfd_timeout == 0 {
            return Err(InvalidConfiguration {
                reason: "SFD timeout must not be zero",
            });
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// PHY data rate, the TXBR bit of TX_FCTRL
pub enum BitRate {
    /// 850 kilobits per second.
    Kbps850 = 0b0,
    /// 6.8 megabits per second.
    #[default]
    Kbps6800 = 0b1,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Preamble length in symbols
///
/// Longer preambles extend the range but also the airtime of every frame,
/// which eats into the reply delays. The discriminant is the TXPSR/PE bit
/// pattern of TX_FCTRL.
pub enum PreambleLength {
    /// 32 symbols
    Symbols32 = 0x04,
    /// 64 symbols
    Symbols64 = 0x01,
    /// 72 symbols
    Symbols72 = 0x07,
    /// 128 symbols
    #[default]
    Symbols128 = 0x05,
    /// 256 symbols
    Symbols256 = 0x09,
    /// 512 symbols
    Symbols512 = 0x0D,
    /// 1024 symbols
    Symbols1024 = 0x02,
    /// 1536 symbols
    Symbols1536 = 0x06,
    /// 2048 symbols
    Symbols2048 = 0x0A,
    /// 4096 symbols
    Symbols4096 = 0x03,
}

impl PreambleLength {
    /// The PAC size the user manual recommends for this length
    pub fn get_recommended_pac_size(&self) -> PacSize {
        match self {
            PreambleLength::Symbols32 => PacSize::Four,
            PreambleLength::Symbols64 | PreambleLength::Symbols72 | PreambleLength::Symbols128 => {
                PacSize::Eight
            }
            PreambleLength::Symbols256 | PreambleLength::Symbols512 => PacSize::Sixteen,
            _ => PacSize::ThirtyTwo,
        }
    }

    /// Number of preamble symbols
    pub fn symbols(&self) -> u16 {
        match self {
            PreambleLength::Symbols32 => 32,
            PreambleLength::Symbols64 => 64,
            PreambleLength::Symbols72 => 72,
            PreambleLength::Symbols128 => 128,
            PreambleLength::Symbols256 => 256,
            PreambleLength::Symbols512 => 512,
            PreambleLength::Symbols1024 => 1024,
            PreambleLength::Symbols1536 => 1536,
            PreambleLength::Symbols2048 => 2048,
            PreambleLength::Symbols4096 => 4096,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Preamble acquisition chunk size, the DTUNE0 PAC field
pub enum PacSize {
    /// 8 symbols, for preambles of 128 or less
    #[default]
    Eight = 0b00,
    /// 16 symbols, for 256 symbol preambles
    Sixteen = 0b01,
    /// 32 symbols, for 512 symbol preambles
    ThirtyTwo = 0b10,
    /// 4 symbols, for 32 symbol preambles
    Four = 0b11,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Start-of-frame delimiter sequence, the SFD_TYPE field of CHAN_CTRL
pub enum SfdSequence {
    /// The standard sequence defined by the IEEE 802.15.4a standard.
    IeeeShort = 0b00,
    /// Decawave-defined 8 symbol sequence.
    #[default]
    Decawave8 = 0b01,
    /// Decawave-defined 16 symbol sequence.
    Decawave16 = 0b10,
    /// 8 symbol sequence defined by the IEEE 802.15.4z standard.
    Ieee = 0b11,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// UWB channel, the RF_CHAN bit of CHAN_CTRL
pub enum UwbChannel {
    /// Channel 5
    ///
    /// 6489.6 MHz center, 499.2 MHz wide
    Channel5 = 0,
    /// Channel 9
    ///
    /// 7987.2 MHz center, 499.2 MHz wide
    #[default]
    Channel9 = 1,
}

/// Which side of the exchange this radio plays
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Role {
    /// Sends the Poll and, for DS-TWR, the Final
    #[default]
    Initiator,
    /// Listens for Polls and replies
    Responder,
}

/// The exchange variant
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Protocol {
    /// Poll and Resp, the initiator computes the distance
    SingleSided,
    /// Poll, Resp and Final, the responder computes the distance
    #[default]
    DoubleSided,
    /// A single Poll with no reply, useful for link checks
    Beacon,
}

/// Everything an exchange needs to know
///
/// The defaults match the timings of the DW3000 sample firmware. Both radios
/// must agree on the PHY configuration, the protocol and the reply delays.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RangingConfig {
    /// Initiator or responder
    pub role: Role,
    /// SS-TWR, DS-TWR or beacon
    pub protocol: Protocol,
    /// Antenna delay in ticks, applied to both TX and RX
    pub antenna_delay: u16,
    /// Delay from Poll reception to Resp transmission
    pub reply_delay_us: u32,
    /// Delay from Resp reception to Final transmission
    pub final_delay_us: u32,
    /// Conversion factor from microseconds to timestamp ticks
    pub ticks_per_us: u32,
    /// Minimum time a delayed transmission must lie in the future
    pub min_lead_us: u32,
    /// How long to wait for a transmission to complete
    pub tx_timeout_us: u32,
    /// How long to wait for a Resp or a Final
    pub rx_timeout_us: u32,
    /// How long a responder waits for a Poll
    pub listen_timeout_us: u32,
    /// Time between two polls of the radio status
    pub poll_interval_us: u32,
    /// How the antenna delay enters the planned transmission time
    pub antenna_delay_placement: AntennaDelayPlacement,
    /// Known clock offset of this radio against its peer, in ppm
    ///
    /// Positive when the local clock runs fast. Used to correct SS-TWR.
    pub clock_offset_ppm: Option<f64>,
    /// PHY configuration
    pub phy: Config,
}

impl Default for RangingConfig {
    fn default() -> Self {
        RangingConfig {
            role: Default::default(),
            protocol: Default::default(),
            antenna_delay: 16385,
            reply_delay_us: 900,
            final_delay_us: 900,
            ticks_per_us: 63898,
            min_lead_us: 200,
            tx_timeout_us: 5_000,
            rx_timeout_us: 10_000,
            listen_timeout_us: 1_000_000,
            poll_interval_us: 10,
            antenna_delay_placement: Default::default(),
            clock_offset_ppm: None,
            phy: Default::default(),
        }
    }
}

impl RangingConfig {
    /// Default configuration for the given role and protocol
    pub fn new(role: Role, protocol: Protocol) -> Self {
        RangingConfig {
            role,
            protocol,
            ..Default::default()
        }
    }

    /// Rejects configurations the exchange can't run with
    pub fn validate(&self) -> Result<(), InvalidConfiguration> {
        if self.poll_interval_us == 0 {
            return Err(InvalidConfiguration {
                reason: "poll interval must not be zero",
            });
        }
        if self.ticks_per_us == 0 {
            return Err(InvalidConfiguration {
                reason: "ticks per microsecond must not be zero",
            });
        }
        if self.reply_delay_us < self.min_lead_us {
            return Err(InvalidConfiguration {
                reason: "reply delay is shorter than the minimum lead",
            });
        }
        if self.protocol == Protocol::DoubleSided && self.final_delay_us < self.min_lead_us {
            return Err(InvalidConfiguration {
                reason: "final delay is shorter than the minimum lead",
            });
        }
        if let Some(ppm) = self.clock_offset_ppm {
            if !ppm.is_finite() {
                return Err(InvalidConfiguration {
                    reason: "clock offset must be finite",
                });
            }
        }
        self.phy.validate()
    }

    /// Number of status polls that fit into `timeout_us`, at least one
    pub fn poll_budget(&self, timeout_us: u32) -> u32 {
        match self.poll_interval_us {
            0 => 1,
            interval => (timeout_us / interval).max(1),
        }
    }
}

/// A configuration value was rejected
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct InvalidConfiguration {
    /// What is wrong with it
    pub reason: &'static str,
}

impl fmt::Display for InvalidConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.reason)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for InvalidConfiguration {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_firmware() {
        let config = RangingConfig::default();

        assert_eq!(config.phy.channel, UwbChannel::Channel9);
        assert_eq!(config.phy.preamble_length, PreambleLength::Symbols128);
        assert_eq!(
            config.phy.preamble_length.get_recommended_pac_size(),
            config.phy.pac_size
        );
        assert_eq!(config.phy.sfd_timeout, 128 + 1 + 8 - 8);
        assert_eq!(config.antenna_delay, 16385);
        assert_eq!(config.ticks_per_us, 63898);
        assert_eq!(
            config.antenna_delay_placement,
            AntennaDelayPlacement::AfterTruncation
        );
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let config = RangingConfig {
            poll_interval_us: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RangingConfig {
            ticks_per_us: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RangingConfig {
            reply_delay_us: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        // The final delay only matters for DS-TWR
        let config = RangingConfig {
            protocol: Protocol::SingleSided,
            final_delay_us: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Ok(()));

        let mut config = RangingConfig::default();
        config.phy.preamble_code = 42;
        assert!(config.validate().is_err());
    }

    #[test]
    fn poll_budget_is_at_least_one() {
        let config = RangingConfig::default();

        assert_eq!(config.poll_budget(10_000), 1_000);
        assert_eq!(config.poll_budget(5), 1);
        assert_eq!(config.poll_budget(0), 1);
    }
}
