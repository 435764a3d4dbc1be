//! The ranging exchange state machine
//!
//! An [`Exchange`] owns a [`RadioPort`] and runs one ranging cycle per call
//! to [`Exchange::run_cycle`]:
//!
//! - The initiator sends a Poll, waits for the Resp and, for double-sided
//!   ranging, answers with a delayed Final. Single-sided results are computed
//!   here, double-sided ones by the responder.
//! - The responder waits for a Poll and answers with a delayed Resp. For
//!   double-sided ranging it then waits for the Final and computes the result.
//!
//! Every wait polls the radio at the configured interval and gives up once
//! its poll budget is spent. A cycle that fails because of a timeout, a bad
//! frame or a missed deadline leaves the exchange idle, ready for the next
//! cycle. The radio is forced idle as well, which turns the receiver off and
//! cancels a delayed transmission that is still pending. Only radio faults stop it, until [`Exchange::reinitialize`] is
//! called.
//!
//! ```no_run
//! # #[cfg(not(feature = "async"))]
//! # fn example<PORT, DELAY>(port: PORT, delay: DELAY) -> Result<(), dw3000_twr::Error<PORT::Error>>
//! # where
//! #     PORT: dw3000_twr::RadioPort,
//! #     DELAY: embedded_hal::delay::DelayNs,
//! # {
//! use dw3000_twr::{Exchange, Outcome, Protocol, RangingConfig, Role};
//!
//! let config = RangingConfig::new(Role::Initiator, Protocol::SingleSided);
//! let mut exchange = Exchange::new(port, delay, config)?;
//! exchange.init()?;
//!
//! loop {
//!     match exchange.run_cycle() {
//!         Ok(Outcome::Ranged(result)) => println!("{} m", result.distance_m),
//!         Ok(_) => {}
//!         Err(error) if error.is_fatal() => exchange.reinitialize()?,
//!         Err(_) => {}
//!     }
//! }
//! # }
//! ```

use core::{fmt, num::Wrapping};

#[cfg(feature = "defmt")]
use defmt::Format;

pub use error::Error;
pub use session::{Session, State};

use self::session::Expectation;
use crate::{
    configs::{Protocol, RangingConfig, Role},
    frame::{self, FrameError, MessageType, RangingMessage},
    hal, maybe_async_attr,
    port::{RadioPort, RxMode, Status, StatusFlags, TxMode},
    ranging::RangingResult,
    scheduler::{DelayedTx, Scheduler},
    time::Instant,
};

mod error;
mod session;

/// What a successful cycle produced
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum Outcome {
    /// A distance was measured on this side
    Ranged(RangingResult),
    /// This side completed its part, the peer computes the distance
    Replied {
        /// Sequence number of the exchange
        seq: u8,
    },
    /// A beacon was sent
    BeaconSent {
        /// Sequence number of the beacon
        seq: u8,
        /// When it left the antenna
        tx_time: Instant,
    },
    /// A ranging frame was received in beacon mode
    BeaconReceived {
        /// Sequence number of the frame
        seq: u8,
        /// When it reached the antenna
        rx_time: Instant,
    },
}

/// Counters kept across cycles
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Statistics {
    /// Cycles that produced an [`Outcome`]
    pub completed: u32,
    /// Cycles that ended because an event did not happen in time
    pub timeouts: u32,
    /// Receive errors reported by the radio
    pub receive_errors: u32,
    /// Discarded frames that could not be parsed
    pub malformed_frames: u32,
    /// Discarded frames with a foreign or stale sequence number
    pub stale_frames: u32,
    /// Discarded frames of the wrong message type
    pub unexpected_frames: u32,
    /// Delayed transmissions that were abandoned
    pub scheduling_aborts: u32,
    /// Radio faults
    pub faults: u32,
}

/// Runs ranging cycles on a radio
///
/// See the [module documentation](self) for an overview.
pub struct Exchange<PORT, DELAY> {
    port: PORT,
    delay: DELAY,
    config: RangingConfig,
    scheduler: Scheduler,
    seq: Wrapping<u8>,
    session: Session,
    stats: Statistics,
    buffer: [u8; frame::MAX_LEN],
}

impl<PORT, DELAY> Exchange<PORT, DELAY>
where
    PORT: RadioPort,
    DELAY: hal::delay::DelayNs,
{
    /// Creates an exchange
    ///
    /// Fails if `config` is invalid. The radio is not touched until
    /// [`Exchange::init`] is called.
    pub fn new(port: PORT, delay: DELAY, config: RangingConfig) -> Result<Self, Error<PORT::Error>> {
        config.validate()?;

        Ok(Exchange {
            port,
            delay,
            scheduler: Scheduler::from_config(&config),
            config,
            seq: Wrapping(0),
            session: Session::new(config.role, config.protocol),
            stats: Statistics::default(),
            buffer: [0; frame::MAX_LEN],
        })
    }

    /// Configures the radio
    #[maybe_async_attr]
    pub async fn init(&mut self) -> Result<(), Error<PORT::Error>> {
        match self.configure_radio().await {
            Ok(()) => {
                debug!(
                    "radio configured, antenna delay {}",
                    self.config.antenna_delay
                );
                self.session.enter(State::Idle);
                Ok(())
            }
            Err(error) => Err(self.halt(error)),
        }
    }

    /// Configures the radio again and leaves the error state
    #[maybe_async_attr]
    pub async fn reinitialize(&mut self) -> Result<(), Error<PORT::Error>> {
        info!("reinitializing after {} faults", self.stats.faults);
        self.session.enter(State::Idle);
        self.init().await
    }

    /// Runs one ranging cycle
    ///
    /// The exchange is [`State::Idle`] afterwards, unless the radio failed.
    /// The initiator's sequence number advances with every cycle, whatever its
    /// outcome.
    #[maybe_async_attr]
    pub async fn run_cycle(&mut self) -> Result<Outcome, Error<PORT::Error>> {
        if self.session.state() == State::Error {
            return Err(Error::Halted);
        }

        let result = match self.config.role {
            Role::Initiator => {
                let result = self.run_initiator().await;
                self.seq += 1;
                result
            }
            Role::Responder => self.run_responder().await,
        };

        // An aborted cycle may leave the receiver on or a transmission pending
        let result = match result {
            Ok(outcome) => Ok(outcome),
            Err(error) => match self.port.force_idle().await {
                Ok(()) => Err(error),
                Err(_) if error.is_fatal() => {
                    debug!("radio not idled after {}", error.name());
                    Err(error)
                }
                Err(fault) => Err(Error::RadioFault(fault)),
            },
        };

        // Leave no event behind for the next cycle
        let result = match self.port.clear_status_flags(StatusFlags::ALL).await {
            Ok(()) => result,
            Err(error) => result.and(Err(Error::RadioFault(error))),
        };

        match result {
            Ok(outcome) => {
                count(&mut self.stats.completed);
                self.session.enter(State::Complete);
                self.session.enter(State::Idle);
                Ok(outcome)
            }
            Err(error) if error.is_fatal() => Err(self.halt(error)),
            Err(error) => {
                match error {
                    Error::Timeout => {
                        count(&mut self.stats.timeouts);
                        warn!(
                            "exchange {} timed out in {}",
                            self.session.seq(),
                            self.session.state().name()
                        );
                    }
                    Error::SchedulingTooLate => {
                        count(&mut self.stats.scheduling_aborts);
                        warn!(
                            "exchange {} aborted, too late to schedule in {}",
                            self.session.seq(),
                            self.session.state().name()
                        );
                    }
                    Error::ReceiveFailed => count(&mut self.stats.receive_errors),
                    _ => debug!("exchange {} failed: {}", self.session.seq(), error.name()),
                }
                self.session.enter(State::Idle);
                Err(error)
            }
        }
    }

    /// Reads the radio's system time
    #[maybe_async_attr]
    pub async fn system_time(&mut self) -> Result<Instant, Error<PORT::Error>> {
        let raw = self
            .port
            .read_system_time()
            .await
            .map_err(Error::RadioFault)?;
        Ok(Instant::from_bytes(raw))
    }

    /// The current state
    pub fn state(&self) -> State {
        self.session.state()
    }

    /// The current or last cycle
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Sequence number of the next Poll (initiator) or the last one received
    /// (responder)
    pub fn sequence(&self) -> u8 {
        self.seq.0
    }

    /// Counters since the exchange was created
    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    /// The configuration
    pub fn config(&self) -> &RangingConfig {
        &self.config
    }

    /// The radio
    pub fn port(&self) -> &PORT {
        &self.port
    }

    /// The radio, mutably
    ///
    /// Must not be used to start operations on the radio while a cycle runs.
    pub fn port_mut(&mut self) -> &mut PORT {
        &mut self.port
    }

    /// Releases the radio and the delay
    pub fn release(self) -> (PORT, DELAY) {
        (self.port, self.delay)
    }

    #[maybe_async_attr]
    async fn configure_radio(&mut self) -> Result<(), Error<PORT::Error>> {
        self.port
            .configure(&self.config.phy)
            .await
            .map_err(Error::RadioFault)?;
        self.port
            .set_antenna_delay(self.config.antenna_delay)
            .await
            .map_err(Error::RadioFault)?;
        self.port
            .clear_status_flags(StatusFlags::ALL)
            .await
            .map_err(Error::RadioFault)?;
        Ok(())
    }

    fn halt(&mut self, error: Error<PORT::Error>) -> Error<PORT::Error> {
        if let Error::RadioFault(ref fault) = error {
            #[cfg(feature = "defmt")]
            defmt::error!(
                "radio fault in {}: {:?}",
                self.session.state().name(),
                defmt::Debug2Format(fault)
            );
            #[cfg(not(feature = "defmt"))]
            error!("radio fault in {}: {:?}", self.session.state().name(), fault);
            count(&mut self.stats.faults);
            self.session.enter(State::Error);
        }
        error
    }

    #[maybe_async_attr]
    async fn run_initiator(&mut self) -> Result<Outcome, Error<PORT::Error>> {
        let seq = self.seq.0;
        self.session.begin(seq, State::AwaitingPollTx);

        let poll_tx = self.transmit_now(&frame::build_poll(seq)).await?;
        self.session.timestamps.t1 = Some(poll_tx);

        if self.config.protocol == Protocol::Beacon {
            debug!("beacon {} sent at {}", seq, poll_tx.value());
            return Ok(Outcome::BeaconSent {
                seq,
                tx_time: poll_tx,
            });
        }

        self.session.enter(State::AwaitingRespRx);
        let expectation = Expectation {
            kind: Some(MessageType::Resp),
            seq: Some(seq),
        };
        let (message, resp_rx) = self
            .await_message(expectation, self.config.rx_timeout_us)
            .await?;
        let RangingMessage::Resp {
            poll_rx, resp_tx, ..
        } = message
        else {
            return Err(Error::UnexpectedMessage(message.message_type()));
        };

        let timestamps = &mut self.session.timestamps;
        timestamps.t2 = Some(poll_rx);
        timestamps.t3 = Some(resp_tx);
        timestamps.t4 = Some(resp_rx);

        if self.config.protocol == Protocol::SingleSided {
            let result = RangingResult::from_timestamps(
                seq,
                Protocol::SingleSided,
                *timestamps,
                self.config.clock_offset_ppm,
            )?;
            info!("exchange {}: {} m", seq, result.distance_m);
            return Ok(Outcome::Ranged(result));
        }

        self.session.enter(State::AwaitingFinalTx);
        let plan = self
            .plan_delayed(resp_rx, self.config.final_delay_us)
            .await?;
        let payload = frame::build_final(seq, poll_tx, resp_rx, plan.planned_tx);
        self.submit_delayed(&plan, &payload).await?;
        self.session.timestamps.t5 = Some(plan.planned_tx);

        debug!("exchange {}: final sent", seq);
        Ok(Outcome::Replied { seq })
    }

    #[maybe_async_attr]
    async fn run_responder(&mut self) -> Result<Outcome, Error<PORT::Error>> {
        self.session.begin(self.seq.0, State::AwaitingPollRx);

        let beacon = self.config.protocol == Protocol::Beacon;
        let expectation = Expectation {
            kind: if beacon { None } else { Some(MessageType::Poll) },
            seq: None,
        };
        let (poll, poll_rx) = self
            .await_message(expectation, self.config.listen_timeout_us)
            .await?;

        let seq = poll.seq();
        self.seq = Wrapping(seq);
        self.session.adopt_seq(seq);
        self.session.timestamps.t2 = Some(poll_rx);

        if beacon {
            debug!(
                "beacon {} ({}) received at {}",
                seq,
                poll.message_type().name(),
                poll_rx.value()
            );
            return Ok(Outcome::BeaconReceived {
                seq,
                rx_time: poll_rx,
            });
        }

        self.session.enter(State::AwaitingRespTx);
        let plan = self
            .plan_delayed(poll_rx, self.config.reply_delay_us)
            .await?;
        let payload = frame::build_resp(seq, poll_rx, plan.planned_tx);
        self.submit_delayed(&plan, &payload).await?;
        self.session.timestamps.t3 = Some(plan.planned_tx);

        if self.config.protocol == Protocol::SingleSided {
            debug!("exchange {}: response sent", seq);
            return Ok(Outcome::Replied { seq });
        }

        self.session.enter(State::AwaitingFinalRx);
        let expectation = Expectation {
            kind: Some(MessageType::Final),
            seq: Some(seq),
        };
        let (message, final_rx) = self
            .await_message(expectation, self.config.rx_timeout_us)
            .await?;
        let RangingMessage::Final {
            poll_tx,
            resp_rx,
            final_tx,
            ..
        } = message
        else {
            return Err(Error::UnexpectedMessage(message.message_type()));
        };

        let timestamps = &mut self.session.timestamps;
        timestamps.t1 = Some(poll_tx);
        timestamps.t4 = Some(resp_rx);
        timestamps.t5 = Some(final_tx);
        timestamps.t6 = Some(final_rx);

        let result =
            RangingResult::from_timestamps(seq, Protocol::DoubleSided, *timestamps, None)?;
        info!("exchange {}: {} m", seq, result.distance_m);
        Ok(Outcome::Ranged(result))
    }

    /// Sends `payload` right away, returns its TX timestamp
    #[maybe_async_attr]
    async fn transmit_now(&mut self, payload: &[u8]) -> Result<Instant, Error<PORT::Error>> {
        self.port
            .write_tx_payload(payload)
            .await
            .map_err(Error::RadioFault)?;
        self.port
            .arm_tx(TxMode::Immediate)
            .await
            .map_err(Error::RadioFault)?;
        self.wait_tx().await
    }

    /// Plans a transmission `delay_us` after `reference`
    #[maybe_async_attr]
    async fn plan_delayed(
        &mut self,
        reference: Instant,
        delay_us: u32,
    ) -> Result<DelayedTx, Error<PORT::Error>> {
        let now = self.system_time().await?;
        let plan = self.scheduler.schedule_after(
            reference,
            delay_us,
            self.config.ticks_per_us,
            now,
        )?;

        trace!(
            "planned tx at {} (register {:#x})",
            plan.planned_tx.value(),
            plan.register
        );
        Ok(plan)
    }

    /// Submits a planned transmission, returns the TX timestamp the radio
    /// reports
    ///
    /// The lead is checked once more right before arming. Nothing is sent if
    /// it dropped below the minimum.
    #[maybe_async_attr]
    async fn submit_delayed(
        &mut self,
        plan: &DelayedTx,
        payload: &[u8],
    ) -> Result<Instant, Error<PORT::Error>> {
        self.port
            .write_tx_payload(payload)
            .await
            .map_err(Error::RadioFault)?;
        self.port
            .set_delayed_start_time(plan.register)
            .await
            .map_err(Error::RadioFault)?;

        let now = self.system_time().await?;
        self.scheduler.check_lead(plan, now)?;

        self.port
            .arm_tx(TxMode::Delayed)
            .await
            .map_err(Error::RadioFault)?;
        self.wait_tx().await
    }

    #[maybe_async_attr]
    async fn wait_tx(&mut self) -> Result<Instant, Error<PORT::Error>> {
        let mut budget = self.config.poll_budget(self.config.tx_timeout_us);

        loop {
            match self.wait_event(&mut budget).await? {
                Status::TxDone => {
                    self.clear(StatusFlags::TX_DONE).await?;
                    let raw = self
                        .port
                        .read_tx_timestamp()
                        .await
                        .map_err(Error::RadioFault)?;
                    return Ok(Instant::from_bytes(raw));
                }
                // The frame stays pending until the radio is idled
                Status::TxLate => {
                    self.clear(StatusFlags::TX_LATE).await?;
                    return Err(Error::SchedulingTooLate);
                }
                // Receive events can't belong to this transmission
                status => self.clear(flags_of(status)).await?,
            }
        }
    }

    /// Receives until a frame meets `expectation` or the budget is spent
    ///
    /// Frames that don't are discarded and the receiver is turned on again.
    #[maybe_async_attr]
    async fn await_message(
        &mut self,
        expectation: Expectation,
        timeout_us: u32,
    ) -> Result<(RangingMessage, Instant), Error<PORT::Error>> {
        let mut budget = self.config.poll_budget(timeout_us);
        self.port
            .enable_rx(RxMode::Immediate)
            .await
            .map_err(Error::RadioFault)?;

        loop {
            match self.wait_event(&mut budget).await? {
                Status::RxFrameGood => {
                    let len = self
                        .port
                        .read_rx_payload(&mut self.buffer)
                        .await
                        .map_err(Error::RadioFault)?;
                    self.clear(StatusFlags::RX_GOOD).await?;

                    let accepted = decode(&self.buffer, len)
                        .map_err(Error::MalformedFrame)
                        .and_then(|message| {
                            self.session.check(&message, expectation).map(|()| message)
                        });

                    match accepted {
                        Ok(message) => {
                            let raw = self
                                .port
                                .read_rx_timestamp()
                                .await
                                .map_err(Error::RadioFault)?;
                            return Ok((message, Instant::from_bytes(raw)));
                        }
                        Err(error) => {
                            self.discard(&error);
                            self.port
                                .enable_rx(RxMode::Immediate)
                                .await
                                .map_err(Error::RadioFault)?;
                        }
                    }
                }
                Status::RxError => {
                    self.clear(StatusFlags::RX_ERROR).await?;
                    return Err(Error::ReceiveFailed);
                }
                Status::Timeout => {
                    self.clear(StatusFlags::RX_TIMEOUT).await?;
                    return Err(Error::Timeout);
                }
                status => self.clear(flags_of(status)).await?,
            }
        }
    }

    fn discard(&mut self, error: &Error<PORT::Error>) {
        match error {
            Error::MalformedFrame(_) => count(&mut self.stats.malformed_frames),
            Error::SequenceMismatch { .. } => count(&mut self.stats.stale_frames),
            Error::UnexpectedMessage(_) => count(&mut self.stats.unexpected_frames),
            _ => {}
        }
        debug!(
            "discarded frame in {}: {}",
            self.session.state().name(),
            error.name()
        );
    }

    /// Waits for the next event, spending one unit of `budget` per poll
    #[maybe_async_attr]
    async fn wait_event(&mut self, budget: &mut u32) -> Result<Status, Error<PORT::Error>> {
        loop {
            if *budget == 0 {
                return Err(Error::Timeout);
            }
            *budget -= 1;

            match self.poll_event().await {
                Ok(status) => return Ok(status),
                Err(nb::Error::WouldBlock) => {
                    self.delay.delay_us(self.config.poll_interval_us).await
                }
                Err(nb::Error::Other(error)) => return Err(error),
            }
        }
    }

    /// Polls the radio once
    ///
    /// This method returns an `nb::Result` to indicate whether an event is
    /// pending. `WouldBlock` means nothing happened yet.
    #[maybe_async_attr]
    async fn poll_event(&mut self) -> nb::Result<Status, Error<PORT::Error>> {
        let status = self
            .port
            .poll_status()
            .await
            .map_err(|error| nb::Error::Other(Error::RadioFault(error)))?;

        match status {
            Status::None => Err(nb::Error::WouldBlock),
            status => Ok(status),
        }
    }

    #[maybe_async_attr]
    async fn clear(&mut self, flags: StatusFlags) -> Result<(), Error<PORT::Error>> {
        self.port
            .clear_status_flags(flags)
            .await
            .map_err(Error::RadioFault)
    }
}

// Can't be derived without putting requirements on `PORT` and `DELAY`.
impl<PORT, DELAY> fmt::Debug for Exchange<PORT, DELAY> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Exchange {{ role: {:?}, protocol: {:?}, state: {:?}, seq: {}, .. }}",
            self.config.role,
            self.config.protocol,
            self.session.state(),
            self.seq.0
        )
    }
}

fn count(counter: &mut u32) {
    *counter = counter.saturating_add(1);
}

fn flags_of(status: Status) -> StatusFlags {
    match status {
        Status::TxDone => StatusFlags::TX_DONE,
        Status::RxFrameGood => StatusFlags::RX_GOOD,
        Status::RxError => StatusFlags::RX_ERROR,
        Status::Timeout => StatusFlags::RX_TIMEOUT,
        Status::TxLate => StatusFlags::TX_LATE,
        Status::None => StatusFlags::NONE,
    }
}

/// Parses the first `len` bytes of `buffer`
///
/// `len` is the full frame length reported by the radio. Frames longer than
/// the buffer are too long for any ranging message.
fn decode(buffer: &[u8], len: usize) -> Result<RangingMessage, FrameError> {
    if len > buffer.len() {
        let tag = buffer.first().copied().unwrap_or_default();
        let expected = MessageType::from_tag(tag).ok_or(FrameError::UnknownType(tag))?;
        return Err(FrameError::Length {
            expected: expected.encoded_len(),
            actual: len,
        });
    }

    frame::parse(&buffer[..len])
}
