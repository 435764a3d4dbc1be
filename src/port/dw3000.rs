//! [`RadioPort`] implementation for the DW3000
//!
//! Chip bring-up (PLL lock, LDO and PGF calibration, OTP loading) is expected
//! to have happened before the port is created. The port only touches the
//! registers that differ between ranging configurations and the ones needed
//! to send, receive and timestamp frames.

use core::fmt;

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::{
    configs::Config,
    fast_command::FastCommand,
    hal,
    ll::{self, DW3000},
    maybe_async_attr,
    port::{RadioPort, RxMode, Status, StatusFlags, TxMode},
    time::{Instant, TIMESTAMP_LEN},
};

/// Length of the FCS the radio appends to every frame
const FCS_LEN: usize = 2;

/// Longest frame in standard PHR mode, including the FCS
const MAX_FRAME_LEN: usize = 127;

const RX_ERROR_BITS: [ll::Field; 5] = [
    ll::sys_status::RXPHE,
    ll::sys_status::RXFCE,
    ll::sys_status::RXFSL,
    ll::sys_status::RXOVRR,
    ll::sys_status::ARFE,
];

const RX_TIMEOUT_BITS: [ll::Field; 3] = [
    ll::sys_status::RXFTO,
    ll::sys_status::RXPTO,
    ll::sys_status::RXSTO,
];

/// A DW3000 driven over SPI
pub struct Dw3000Port<SPI> {
    ll: DW3000<SPI>,
    config: Config,
}

impl<SPI> Dw3000Port<SPI>
where
    SPI: hal::spi::SpiDevice<u8>,
{
    /// Wraps an initialized DW3000
    ///
    /// The PHY configuration is applied by [`RadioPort::configure`].
    pub fn new(spi: SPI) -> Self {
        Dw3000Port {
            ll: DW3000::new(spi),
            config: Config::default(),
        }
    }

    /// Provides direct access to the register-level API
    pub fn ll(&mut self) -> &mut DW3000<SPI> {
        &mut self.ll
    }

    /// Releases the SPI device
    pub fn release(self) -> SPI {
        self.ll.release()
    }
}

fn any_set(fields: &[ll::Field], status: u64) -> bool {
    fields.iter().any(|field| field.is_set(status))
}

fn mask_of(fields: &[ll::Field]) -> u64 {
    fields.iter().fold(0, |mask, field| mask | field.bits())
}

/// Decodes SYS_STATUS into the flags the exchange cares about
pub fn status_flags(status: u64) -> StatusFlags {
    let mut flags = StatusFlags::NONE;
    if ll::sys_status::TXFRS.is_set(status) {
        flags |= StatusFlags::TX_DONE;
    }
    if ll::sys_status::RXFCG.is_set(status) {
        flags |= StatusFlags::RX_GOOD;
    }
    if any_set(&RX_ERROR_BITS, status) {
        flags |= StatusFlags::RX_ERROR;
    }
    if any_set(&RX_TIMEOUT_BITS, status) {
        flags |= StatusFlags::RX_TIMEOUT;
    }
    if ll::sys_status::HPDWARN.is_set(status) {
        flags |= StatusFlags::TX_LATE;
    }
    flags
}

/// The SYS_STATUS bits to write for clearing `flags`
pub fn status_mask(flags: StatusFlags) -> u64 {
    let mut mask = 0;
    if flags.contains(StatusFlags::TX_DONE) {
        mask |= ll::sys_status::TXFRS.bits();
    }
    if flags.contains(StatusFlags::RX_GOOD) {
        mask |= ll::sys_status::RXFCG.bits();
    }
    if flags.contains(StatusFlags::RX_ERROR) {
        mask |= mask_of(&RX_ERROR_BITS);
    }
    if flags.contains(StatusFlags::RX_TIMEOUT) {
        mask |= mask_of(&RX_TIMEOUT_BITS);
    }
    if flags.contains(StatusFlags::TX_LATE) {
        mask |= ll::sys_status::HPDWARN.bits();
    }
    mask
}

#[maybe_async_attr(AFIT)]
impl<SPI> RadioPort for Dw3000Port<SPI>
where
    SPI: hal::spi::SpiDevice<u8>,
{
    type Error = Error<SPI>;

    async fn configure(&mut self, config: &Config) -> Result<(), Self::Error> {
        config
            .validate()
            .map_err(|_| Error::InvalidConfiguration)?;

        self.ll
            .modify(ll::chan_ctrl::REGISTER, |value| {
                let value = ll::chan_ctrl::RF_CHAN.set(value, config.channel as u64);
                let value = ll::chan_ctrl::SFD_TYPE.set(value, config.sfd_sequence as u64);
                let value = ll::chan_ctrl::TX_PCODE.set(value, config.preamble_code as u64);
                ll::chan_ctrl::RX_PCODE.set(value, config.preamble_code as u64)
            })
            .await?;
        self.ll
            .modify(ll::dtune0::REGISTER, |value| {
                ll::dtune0::PAC.set(value, config.pac_size as u64)
            })
            .await?;
        self.ll
            .write_u64(ll::rx_sfd_toc::REGISTER, config.sfd_timeout as u64)
            .await?;
        self.ll
            .modify(ll::sys_cfg::REGISTER, |value| {
                ll::sys_cfg::FFEN.set(value, config.frame_filtering as u64)
            })
            .await?;

        self.config = *config;
        Ok(())
    }

    async fn set_antenna_delay(&mut self, ticks: u16) -> Result<(), Self::Error> {
        self.ll
            .write_u64(ll::tx_antd::REGISTER, ticks as u64)
            .await?;
        self.ll
            .modify(ll::cia_conf::REGISTER, |value| {
                ll::cia_conf::RXANTD.set(value, ticks as u64)
            })
            .await?;

        Ok(())
    }

    async fn write_tx_payload(&mut self, payload: &[u8]) -> Result<(), Self::Error> {
        let frame_len = payload.len() + FCS_LEN;
        if frame_len > MAX_FRAME_LEN {
            return Err(Error::BufferTooSmall {
                required_len: frame_len,
            });
        }

        self.ll.write(ll::tx_buffer::REGISTER, payload).await?;

        let config = self.config;
        self.ll
            .modify(ll::tx_fctrl::REGISTER, |value| {
                let value = ll::tx_fctrl::TXFLEN.set(value, frame_len as u64);
                let value = ll::tx_fctrl::TXBR.set(value, config.bitrate as u64);
                let value = ll::tx_fctrl::TR.set(value, 1);
                let value = ll::tx_fctrl::TXPSR.set(value, config.preamble_length as u64);
                ll::tx_fctrl::TXB_OFFSET.set(value, 0)
            })
            .await?;

        Ok(())
    }

    async fn arm_tx(&mut self, mode: TxMode) -> Result<(), Self::Error> {
        let command = match mode {
            TxMode::Immediate => FastCommand::CMD_TX,
            TxMode::Delayed => FastCommand::CMD_DTX,
        };
        self.ll.fast_command(command).await?;

        Ok(())
    }

    async fn set_delayed_start_time(&mut self, value: u32) -> Result<(), Self::Error> {
        self.ll
            .write_u64(ll::dx_time::REGISTER, value as u64)
            .await?;

        Ok(())
    }

    async fn enable_rx(&mut self, mode: RxMode) -> Result<(), Self::Error> {
        match mode {
            RxMode::Immediate => self.ll.fast_command(FastCommand::CMD_RX).await?,
        }

        Ok(())
    }

    async fn force_idle(&mut self) -> Result<(), Self::Error> {
        // Also cancels a delayed transmission still waiting for DX_TIME
        self.ll.fast_command(FastCommand::CMD_TXRXOFF).await?;

        Ok(())
    }

    async fn poll_status(&mut self) -> Result<Status, Self::Error> {
        let status = self.ll.read_u64(ll::sys_status::REGISTER).await?;

        Ok(Status::from_flags(status_flags(status)))
    }

    async fn clear_status_flags(&mut self, flags: StatusFlags) -> Result<(), Self::Error> {
        let mask = status_mask(flags);
        if mask != 0 {
            // Write 1 to clear
            self.ll.write_u64(ll::sys_status::REGISTER, mask).await?;
        }

        Ok(())
    }

    async fn read_tx_timestamp(&mut self) -> Result<[u8; TIMESTAMP_LEN], Self::Error> {
        let mut raw = [0; TIMESTAMP_LEN];
        self.ll.read(ll::tx_time::REGISTER, &mut raw).await?;

        Ok(raw)
    }

    async fn read_rx_timestamp(&mut self) -> Result<[u8; TIMESTAMP_LEN], Self::Error> {
        let mut raw = [0; TIMESTAMP_LEN];
        self.ll.read(ll::rx_time::REGISTER, &mut raw).await?;

        Ok(raw)
    }

    async fn read_rx_payload(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error> {
        let info = self.ll.read_u64(ll::rx_finfo::REGISTER).await?;
        let len = (ll::rx_finfo::RXFLEN.get(info) as usize).saturating_sub(FCS_LEN);

        let copied = len.min(buffer.len());
        if copied > 0 {
            self.ll
                .read(ll::rx_buffer_0::REGISTER, &mut buffer[..copied])
                .await?;
        }

        Ok(len)
    }

    async fn read_system_time(&mut self) -> Result<[u8; TIMESTAMP_LEN], Self::Error> {
        let value = self.ll.read_u64(ll::sys_time::REGISTER).await?;

        // SYS_TIME holds the upper 32 bits of the 40-bit counter
        Ok(Instant::wrapping(value << 8).to_bytes())
    }
}

/// An error that can occur when driving the DW3000
pub enum Error<SPI>
where
    SPI: hal::spi::ErrorType,
{
    /// Error occured while using SPI bus
    Spi(ll::Error<SPI>),

    /// The frame does not fit into a standard PHY frame
    BufferTooSmall {
        /// Indicates how large a buffer would have been required
        required_len: usize,
    },

    /// The configuration was not valid. Some combinations of settings are not
    /// allowed.
    InvalidConfiguration,
}

impl<SPI> From<ll::Error<SPI>> for Error<SPI>
where
    SPI: hal::spi::ErrorType,
{
    fn from(error: ll::Error<SPI>) -> Self {
        Error::Spi(error)
    }
}

// We can't derive this implementation, as `Debug` is only implemented
// conditionally for `ll::Debug`.
impl<SPI> fmt::Debug for Error<SPI>
where
    SPI: hal::spi::ErrorType,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Spi(error) => write!(f, "Spi({:?})", error),
            Error::BufferTooSmall { required_len } => {
                write!(f, "BufferTooSmall {{ required_len: {:?} }}", required_len)
            }
            Error::InvalidConfiguration => write!(f, "InvalidConfiguration"),
        }
    }
}

impl<SPI> fmt::Display for Error<SPI>
where
    SPI: hal::spi::ErrorType,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl<SPI> std::error::Error for Error<SPI> where SPI: hal::spi::ErrorType {}

#[cfg(feature = "defmt")]
impl<SPI> Format for Error<SPI>
where
    SPI: hal::spi::ErrorType,
{
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::Spi(error) => defmt::write!(f, "Spi({:?})", error),
            Error::BufferTooSmall { required_len } => {
                defmt::write!(f, "BufferTooSmall {{ required_len: {:?} }}", required_len)
            }
            Error::InvalidConfiguration => defmt::write!(f, "InvalidConfiguration"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use embedded_hal_mock::eh1::spi::{Mock as SpiMock, Transaction as SpiTransaction};

    use crate::frame;

    fn read(header: [u8; 2], data: Vec<u8>) -> [SpiTransaction<u8>; 4] {
        [
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(header.to_vec()),
            SpiTransaction::read_vec(data),
            SpiTransaction::transaction_end(),
        ]
    }

    fn write(header: [u8; 2], data: Vec<u8>) -> [SpiTransaction<u8>; 4] {
        [
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(header.to_vec()),
            SpiTransaction::write_vec(data),
            SpiTransaction::transaction_end(),
        ]
    }

    fn command(byte: u8) -> [SpiTransaction<u8>; 3] {
        [
            SpiTransaction::transaction_start(),
            SpiTransaction::write_vec(vec![byte]),
            SpiTransaction::transaction_end(),
        ]
    }

    #[maybe_async::test(not(feature = "async"), async(feature = "async", tokio::test))]
    async fn configure_default_phy() {
        let mut expectations = vec![];
        // CHAN_CTRL: channel 9, Decawave 8 SFD, preamble code 9
        expectations.extend(read([0x42, 0x50], vec![0x00, 0x00]));
        expectations.extend(write([0xC2, 0x50], vec![0x4B, 0x09]));
        // DTUNE0: PAC 8
        expectations.extend(read([0x4C, 0x00], vec![0x03, 0x10]));
        expectations.extend(write([0xCC, 0x00], vec![0x00, 0x10]));
        // RX_SFD_TOC
        expectations.extend(write([0xCC, 0x08], vec![0x81, 0x00]));
        // SYS_CFG: frame filtering off
        expectations.extend(read([0x40, 0x40], vec![0x01, 0x00, 0x00, 0x00]));
        expectations.extend(write([0xC0, 0x40], vec![0x00, 0x00, 0x00, 0x00]));

        let spi = SpiMock::new(&expectations);
        let mut port = Dw3000Port::new(spi);

        port.configure(&Config::default()).await.unwrap();

        port.release().done();
    }

    #[maybe_async::test(not(feature = "async"), async(feature = "async", tokio::test))]
    async fn configure_rejects_invalid() {
        let expectations: [SpiTransaction<u8>; 0] = [];
        let spi = SpiMock::new(&expectations);
        let mut port = Dw3000Port::new(spi);

        let config = Config {
            preamble_code: 0,
            ..Default::default()
        };
        assert!(matches!(
            port.configure(&config).await,
            Err(Error::InvalidConfiguration)
        ));

        port.release().done();
    }

    #[maybe_async::test(not(feature = "async"), async(feature = "async", tokio::test))]
    async fn antenna_delay() {
        let mut expectations = vec![];
        expectations.extend(write([0xC2, 0x10], vec![0x01, 0x40]));
        expectations.extend(read([0x5C, 0x00], vec![0x00, 0x00, 0x0F, 0x00]));
        expectations.extend(write([0xDC, 0x00], vec![0x01, 0x40, 0x0F, 0x00]));

        let spi = SpiMock::new(&expectations);
        let mut port = Dw3000Port::new(spi);

        port.set_antenna_delay(16385).await.unwrap();

        port.release().done();
    }

    #[maybe_async::test(not(feature = "async"), async(feature = "async", tokio::test))]
    async fn transmit_delayed() {
        let mut expectations = vec![];
        expectations.extend(write([0xE8, 0x00], vec![0x01, 0x05]));
        expectations.extend(read([0x40, 0x90], vec![0x00; 6]));
        // 4 bytes incl. FCS, 6.8 Mbps, ranging bit, 128 symbol preamble
        expectations.extend(write(
            [0xC0, 0x90],
            vec![0x04, 0x5C, 0x00, 0x00, 0x00, 0x00],
        ));
        expectations.extend(write([0xC0, 0xB0], vec![0x78, 0x56, 0x34, 0x12]));
        expectations.extend(command(0x87));

        let spi = SpiMock::new(&expectations);
        let mut port = Dw3000Port::new(spi);

        port.write_tx_payload(&frame::build_poll(5)).await.unwrap();
        port.set_delayed_start_time(0x1234_5678).await.unwrap();
        port.arm_tx(TxMode::Delayed).await.unwrap();

        port.release().done();
    }

    #[maybe_async::test(not(feature = "async"), async(feature = "async", tokio::test))]
    async fn payload_too_long() {
        let expectations: [SpiTransaction<u8>; 0] = [];
        let spi = SpiMock::new(&expectations);
        let mut port = Dw3000Port::new(spi);

        let result = port.write_tx_payload(&[0; 126]).await;
        assert!(matches!(
            result,
            Err(Error::BufferTooSmall { required_len: 128 })
        ));

        port.release().done();
    }

    #[maybe_async::test(not(feature = "async"), async(feature = "async", tokio::test))]
    async fn poll_and_clear_status() {
        let mut expectations = vec![];
        expectations.extend(read([0x41, 0x10], vec![0x00, 0x40, 0x00, 0x00, 0x00, 0x00]));
        expectations.extend(read([0x41, 0x10], vec![0x00, 0x80, 0x00, 0x00, 0x00, 0x00]));
        expectations.extend(read([0x41, 0x10], vec![0x00, 0x00, 0x02, 0x00, 0x00, 0x00]));
        expectations.extend(read([0x41, 0x10], vec![0x80, 0x00, 0x00, 0x00, 0x00, 0x00]));
        expectations.extend(read([0x41, 0x10], vec![0x00; 6]));
        expectations.extend(write([0xC1, 0x10], vec![0x80, 0x00, 0x00, 0x00, 0x00, 0x00]));
        expectations.extend(command(0x85));

        let spi = SpiMock::new(&expectations);
        let mut port = Dw3000Port::new(spi);

        assert_eq!(port.poll_status().await.unwrap(), Status::RxFrameGood);
        assert_eq!(port.poll_status().await.unwrap(), Status::RxError);
        assert_eq!(port.poll_status().await.unwrap(), Status::Timeout);
        assert_eq!(port.poll_status().await.unwrap(), Status::TxDone);
        assert_eq!(port.poll_status().await.unwrap(), Status::None);
        port.clear_status_flags(StatusFlags::TX_DONE).await.unwrap();
        // Nothing to clear, no bus access
        port.clear_status_flags(StatusFlags::NONE).await.unwrap();
        port.enable_rx(RxMode::Immediate).await.unwrap();

        port.release().done();
    }

    #[maybe_async::test(not(feature = "async"), async(feature = "async", tokio::test))]
    async fn timestamps_and_payload() {
        let resp = frame::build_resp(
            3,
            Instant::new(0x01_0203_0405).unwrap(),
            Instant::new(0x06_0708_090a).unwrap(),
        );

        let mut expectations = vec![];
        expectations.extend(read([0x41, 0xD0], vec![0x05, 0x04, 0x03, 0x02, 0x01]));
        expectations.extend(read([0x41, 0x90], vec![0xaa, 0xbb, 0xcc, 0xdd, 0xee]));
        expectations.extend(read([0x40, 0x70], vec![0x78, 0x56, 0x34, 0x12]));
        expectations.extend(read([0x41, 0x30], vec![0x0E, 0x00, 0x00, 0x00]));
        expectations.extend(read([0x64, 0x00], resp.to_vec()));

        let spi = SpiMock::new(&expectations);
        let mut port = Dw3000Port::new(spi);

        assert_eq!(
            port.read_tx_timestamp().await.unwrap(),
            [0x05, 0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(
            port.read_rx_timestamp().await.unwrap(),
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee]
        );
        assert_eq!(
            port.read_system_time().await.unwrap(),
            [0x00, 0x78, 0x56, 0x34, 0x12]
        );

        let mut buffer = [0; frame::MAX_LEN];
        let len = port.read_rx_payload(&mut buffer).await.unwrap();
        assert_eq!(len, frame::RESP_LEN);
        assert_eq!(&buffer[..len], &resp);

        port.release().done();
    }

    #[maybe_async::test(not(feature = "async"), async(feature = "async", tokio::test))]
    async fn late_delayed_transmission_is_aborted() {
        let mut expectations = vec![];
        expectations.extend(write([0xC0, 0xB0], vec![0x00, 0x00, 0x00, 0x00]));
        expectations.extend(command(0x87));
        // HPDWARN, the start time is half a wrap period away
        expectations.extend(read([0x41, 0x10], vec![0x00, 0x00, 0x00, 0x08, 0x00, 0x00]));
        expectations.extend(command(0x81));
        expectations.extend(write([0xC1, 0x10], vec![0x00, 0x00, 0x00, 0x08, 0x00, 0x00]));

        let spi = SpiMock::new(&expectations);
        let mut port = Dw3000Port::new(spi);

        port.set_delayed_start_time(0).await.unwrap();
        port.arm_tx(TxMode::Delayed).await.unwrap();
        assert_eq!(port.poll_status().await.unwrap(), Status::TxLate);
        port.force_idle().await.unwrap();
        port.clear_status_flags(StatusFlags::TX_LATE).await.unwrap();

        port.release().done();
    }

    #[maybe_async::test(not(feature = "async"), async(feature = "async", tokio::test))]
    async fn receiver_is_turned_off() {
        let mut expectations = vec![];
        expectations.extend(command(0x85));
        expectations.extend(read([0x41, 0x10], vec![0x00; 6]));
        expectations.extend(command(0x81));

        let spi = SpiMock::new(&expectations);
        let mut port = Dw3000Port::new(spi);

        port.enable_rx(RxMode::Immediate).await.unwrap();
        assert_eq!(port.poll_status().await.unwrap(), Status::None);
        port.force_idle().await.unwrap();

        port.release().done();
    }

    #[test]
    fn status_mask_covers_errors() {
        let mask = status_mask(StatusFlags::ALL);

        assert_eq!(status_flags(mask), StatusFlags::ALL);
        assert_eq!(mask & ll::sys_status::CIAERR.bits(), 0);
    }
}
