//! Low-level interface to the DW3000
//!
//! This module implements register-level access to the handful of DW3000
//! registers the ranging exchange needs. It is used by the [radio port] and
//! should rarely be needed directly.
//!
//! Registers are described by their base address (`ID`), sub-address
//! (`SUB_ID`) and length. Field accessors work on the little-endian register
//! value loaded into a `u64`.
//!
//! [radio port]: ../port/dw3000/index.html

use core::fmt;

use crate::{fast_command::FastCommand, hal, maybe_async_attr};

use hal::spi::Operation;

/// Address and length of a register
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Register {
    /// The register index
    pub id: u8,
    /// The register's sub-index
    pub sub_id: u8,
    /// The length of the register, zero for the frame buffers
    pub len: usize,
}

/// A bit field within a register
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Field {
    /// Lowest bit of the field
    pub first_bit: u8,
    /// Highest bit of the field
    pub last_bit: u8,
}

impl Field {
    /// Creates a field spanning `first_bit..=last_bit`
    pub const fn new(first_bit: u8, last_bit: u8) -> Self {
        Field {
            first_bit,
            last_bit,
        }
    }

    /// The field's mask, not shifted
    pub const fn mask(&self) -> u64 {
        let width = (self.last_bit - self.first_bit + 1) as u32;
        if width >= 64 {
            u64::MAX
        } else {
            (1 << width) - 1
        }
    }

    /// Extracts the field from a register value
    #[inline(always)]
    pub const fn get(&self, register: u64) -> u64 {
        (register >> self.first_bit) & self.mask()
    }

    /// Whether any bit of the field is set
    #[inline(always)]
    pub const fn is_set(&self, register: u64) -> bool {
        self.get(register) != 0
    }

    /// Returns `register` with the field replaced by `value`
    ///
    /// Values too large for the field are silently truncated.
    #[inline(always)]
    pub const fn set(&self, register: u64, value: u64) -> u64 {
        (register & !(self.mask() << self.first_bit)) | ((value & self.mask()) << self.first_bit)
    }

    /// The field's mask, shifted into place
    pub const fn bits(&self) -> u64 {
        self.mask() << self.first_bit
    }
}

/// Generates register descriptions
macro_rules! impl_register {
    (
        $(
            $id:expr,
            $sub_id:expr,
            $len:expr,
            $name:ident {
            #[$doc:meta]
            $(
                $field:ident,
                $first_bit:expr,
                $last_bit:expr;
                #[$field_doc:meta]
            )*
            }
        )*
    ) => {
        $(
            #[$doc]
            pub mod $name {
                #[allow(unused_imports)]
                use super::{Field, Register};

                /// Address and length
                pub const REGISTER: Register = Register {
                    id: $id,
                    sub_id: $sub_id,
                    len: $len,
                };

                $(
                    #[$field_doc]
                    pub const $field: Field = Field::new($first_bit, $last_bit);
                )*
            }
        )*
    };
}

impl_register! {
    0x00, 0x10, 4, sys_cfg {
        /// System configuration
        FFEN, 0, 0;
        /// Frame filtering enable
    }
    0x00, 0x1C, 4, sys_time {
        /// System time counter, bits 8..40 of the 40-bit time
        VALUE, 0, 31;
        /// System time
    }
    0x00, 0x24, 6, tx_fctrl {
        /// TX frame control
        TXFLEN, 0, 9;
        /// TX frame length, including the 2-byte FCS
        TXBR, 10, 10;
        /// Transmit bit rate
        TR, 11, 11;
        /// Transmit ranging enable
        TXPSR, 12, 15;
        /// Transmit preamble symbol repetitions
        TXB_OFFSET, 16, 25;
        /// Offset into the transmit buffer
        FINE_PLEN, 40, 47;
        /// Fine preamble length
    }
    0x00, 0x2C, 4, dx_time {
        /// Delayed send or receive time
        VALUE, 0, 31;
        /// Bits 8..40 of the start time, the lowest bit is ignored
    }
    0x00, 0x44, 6, sys_status {
        /// System event status
        TXFRS, 7, 7;
        /// Transmit frame sent
        RXPHE, 12, 12;
        /// Receiver PHY header error
        RXFCG, 14, 14;
        /// Receiver FCS good
        RXFCE, 15, 15;
        /// Receiver FCS error
        RXFSL, 16, 16;
        /// Receiver Reed Solomon frame sync loss
        RXFTO, 17, 17;
        /// Receive frame wait timeout
        CIAERR, 18, 18;
        /// Leading edge detection processing error
        RXOVRR, 20, 20;
        /// Receiver overrun
        RXPTO, 21, 21;
        /// Preamble detection timeout
        RXSTO, 26, 26;
        /// Receiver SFD timeout
        HPDWARN, 27, 27;
        /// Half period delay warning
        ARFE, 29, 29;
        /// Automatic frame filtering rejection
    }
    0x00, 0x4C, 4, rx_finfo {
        /// RX frame information
        RXFLEN, 0, 9;
        /// Receive frame length, including the FCS
    }
    0x00, 0x64, 5, rx_time {
        /// Receive time stamp, the adjusted 40-bit part of RX_TIME
        RX_STAMP, 0, 39;
        /// Fully adjusted time of reception
    }
    0x00, 0x74, 5, tx_time {
        /// Transmit time stamp
        TX_STAMP, 0, 39;
        /// Fully adjusted time of transmission
    }
    0x01, 0x04, 2, tx_antd {
        /// TX antenna delay
        VALUE, 0, 15;
        /// Delay added to the TX timestamp
    }
    0x01, 0x14, 2, chan_ctrl {
        /// Channel control
        RF_CHAN, 0, 0;
        /// Channel 5 (0) or 9 (1)
        SFD_TYPE, 1, 2;
        /// SFD type
        TX_PCODE, 3, 7;
        /// Transmit preamble code
        RX_PCODE, 8, 12;
        /// Receive preamble code
    }
    0x06, 0x00, 2, dtune0 {
        /// Digital receiver tuning 0
        PAC, 0, 1;
        /// Preamble acquisition chunk size
    }
    0x06, 0x02, 2, rx_sfd_toc {
        /// SFD detection timeout
        VALUE, 0, 15;
        /// Timeout in symbols
    }
    0x0E, 0x00, 4, cia_conf {
        /// CIA configuration
        RXANTD, 0, 15;
        /// RX antenna delay, subtracted from the RX timestamp
    }
    0x12, 0x00, 0, rx_buffer_0 {
        /// Receive data buffer 0
    }
    0x14, 0x00, 0, tx_buffer {
        /// Transmit data buffer
    }
}

/// Entry point to the DW3000 register interface
pub struct DW3000<SPI> {
    spi: SPI,
}

impl<SPI> DW3000<SPI> {
    /// Create a new instance of `DW3000`
    ///
    /// Requires the SPI device connected to the DW3000.
    pub fn new(spi: SPI) -> Self {
        DW3000 { spi }
    }

    /// Allow access to the SPI bus
    pub fn bus(&mut self) -> &mut SPI {
        &mut self.spi
    }

    /// Releases the SPI device
    pub fn release(self) -> SPI {
        self.spi
    }
}

impl<SPI> DW3000<SPI>
where
    SPI: hal::spi::SpiDevice<u8>,
{
    /// Reads `data.len()` bytes starting at `register`
    #[maybe_async_attr]
    pub async fn read(&mut self, register: Register, data: &mut [u8]) -> Result<(), Error<SPI>> {
        let header = init_header(false, register);
        self.spi
            .transaction(&mut [Operation::Write(&header), Operation::Read(data)])
            .await
            .map_err(Error)
    }

    /// Writes `data` starting at `register`
    #[maybe_async_attr]
    pub async fn write(&mut self, register: Register, data: &[u8]) -> Result<(), Error<SPI>> {
        let header = init_header(true, register);
        self.spi
            .transaction(&mut [Operation::Write(&header), Operation::Write(data)])
            .await
            .map_err(Error)
    }

    /// Reads a register of up to 8 bytes as a little-endian value
    #[maybe_async_attr]
    pub async fn read_u64(&mut self, register: Register) -> Result<u64, Error<SPI>> {
        let mut buffer = [0; 8];
        let len = register.len.min(buffer.len());
        self.read(register, &mut buffer[..len]).await?;

        Ok(u64::from_le_bytes(buffer))
    }

    /// Writes the low `register.len` bytes of `value`
    #[maybe_async_attr]
    pub async fn write_u64(&mut self, register: Register, value: u64) -> Result<(), Error<SPI>> {
        let buffer = value.to_le_bytes();
        let len = register.len.min(buffer.len());
        self.write(register, &buffer[..len]).await
    }

    /// Read-modify-write of a register of up to 8 bytes
    #[maybe_async_attr]
    pub async fn modify<F>(&mut self, register: Register, f: F) -> Result<(), Error<SPI>>
    where
        F: FnOnce(u64) -> u64,
    {
        let value = self.read_u64(register).await?;
        self.write_u64(register, f(value)).await
    }

    /// Sends a fast command
    #[maybe_async_attr]
    pub async fn fast_command(&mut self, command: FastCommand) -> Result<(), Error<SPI>> {
        let buffer = [command.header()];
        self.spi
            .transaction(&mut [Operation::Write(&buffer)])
            .await
            .map_err(Error)
    }
}

/// Initializes the SPI message header
///
/// Always uses the full two-octet addressing mode.
#[inline(always)]
fn init_header(write: bool, register: Register) -> [u8; 2] {
    [
        (((write as u8) << 7) & 0x80)
            | 0x40 // 2-octet addressing
            | ((register.id << 1) & 0x3e) // 5-bit base address
            | ((register.sub_id >> 6) & 0x01), // MSB of the 7-bit sub-address
        register.sub_id << 2, // last two bits M1 M0 are always 0
    ]
}

/// An SPI error that can occur when communicating with the DW3000
pub struct Error<SPI>(pub SPI::Error)
where
    SPI: hal::spi::ErrorType;

// We can't derive this implementation, as the compiler will complain that the
// associated error type doesn't implement `Debug`.
impl<SPI> fmt::Debug for Error<SPI>
where
    SPI: hal::spi::ErrorType,
    SPI::Error: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error({:?})", self.0)
    }
}

#[cfg(feature = "defmt")]
impl<SPI> defmt::Format for Error<SPI>
where
    SPI: hal::spi::ErrorType,
{
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Error()")
    }
}
