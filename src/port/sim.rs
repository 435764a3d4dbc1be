//! A simulated radio and the peer it talks to
//!
//! [`SimRadio`] implements [`RadioPort`] on top of a simple event model. The
//! simulation runs on a global time base, in ticks, that only moves when the
//! radio is used: every status poll advances it by the poll step, every other
//! call by the bus latency. Each radio has its own 40-bit clock with an
//! offset and a drift, and its own antenna latency.
//!
//! The peer runs the ranging protocol itself. As a responder it answers Polls
//! and computes DS-TWR results from Finals; as an initiator it sends a Poll
//! whenever the local receiver is turned on and nothing else is in flight.
//! Its replies are scheduled with the same [`Scheduler`] the exchange uses.

use std::{collections::VecDeque, fmt, num::Wrapping, vec::Vec};

use crate::{
    configs::{Config, Protocol, RangingConfig, Role},
    frame::{self, RangingMessage},
    hal, maybe_async_attr,
    port::{RadioPort, RxMode, Status, StatusFlags, TxMode},
    ranging::{RangingResult, Timestamps, SPEED_OF_LIGHT},
    scheduler::Scheduler,
    time::{Duration, Instant, TICK_SECONDS, TIMESTAMP_LEN},
};

/// Ticks per microsecond of the physical clock
pub const TICKS_PER_US: f64 = 63_897.6;

/// A free-running 40-bit clock
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Clock {
    /// Clock value at global time zero
    pub offset: u64,
    /// Rate error against global time, positive when running fast
    pub drift_ppm: f64,
}

impl Clock {
    /// Creates a clock
    pub fn new(offset: u64, drift_ppm: f64) -> Self {
        Clock { offset, drift_ppm }
    }

    fn rate(&self) -> f64 {
        1.0 + self.drift_ppm * 1e-6
    }

    /// The clock's reading at global time `global`
    pub fn local(&self, global: f64) -> Instant {
        let elapsed = (global * self.rate()).floor() as u64;
        Instant::wrapping(self.offset.wrapping_add(elapsed))
    }

    /// The global time at which the clock reads `local`
    ///
    /// `near` must be within half a wrap period of the answer.
    pub fn global(&self, local: Instant, near: f64) -> f64 {
        let offset = local.signed_offset_from(self.local(near));
        near + offset as f64 / self.rate()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new(0, 0.0)
    }
}

/// What the remote radio does
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PeerRole {
    /// Never transmits
    Silent,
    /// Answers Polls
    Responder,
    /// Sends Polls while the local receiver is on
    Initiator,
}

/// Parameters of a simulation
#[derive(Clone, Debug, PartialEq)]
pub struct SimConfig {
    /// Distance between the antennas
    pub distance_m: f64,
    /// Global time advanced by one status poll
    pub poll_step_us: f64,
    /// Global time advanced by any other call
    pub bus_latency_us: f64,
    /// Extra time until an armed transmission takes effect
    pub arm_latency_us: f64,
    /// Time from the start of a frame until its end
    pub airtime_us: f64,
    /// Clock of the local radio
    pub local_clock: Clock,
    /// Internal latency of the local radio, one way, in ticks
    pub local_latency: f64,
    /// Role of the remote radio
    pub peer_role: PeerRole,
    /// Configuration the remote radio runs with
    ///
    /// Its antenna delay is also its true latency.
    pub peer_config: RangingConfig,
    /// Clock of the remote radio
    pub peer_clock: Clock,
    /// Time between the local receiver turning on and a Poll of the peer
    pub peer_poll_gap_us: f64,
    /// Minimum time between two Polls of the peer
    pub peer_poll_period_us: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        let peer_config = RangingConfig::new(Role::Responder, Protocol::DoubleSided);
        SimConfig {
            distance_m: 10.0,
            poll_step_us: 10.0,
            bus_latency_us: 1.0,
            arm_latency_us: 0.0,
            airtime_us: 150.0,
            local_clock: Clock::default(),
            local_latency: peer_config.antenna_delay as f64,
            peer_role: PeerRole::Responder,
            peer_config,
            peer_clock: Clock::new(0x12_3456_7890, 0.0),
            peer_poll_gap_us: 50.0,
            peer_poll_period_us: 2_000.0,
        }
    }
}

/// Radio operations, for fault injection
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SimOp {
    /// [`RadioPort::configure`]
    Configure,
    /// [`RadioPort::set_antenna_delay`]
    SetAntennaDelay,
    /// [`RadioPort::write_tx_payload`]
    WriteTxPayload,
    /// [`RadioPort::arm_tx`]
    ArmTx,
    /// [`RadioPort::set_delayed_start_time`]
    SetDelayedStartTime,
    /// [`RadioPort::enable_rx`]
    EnableRx,
    /// [`RadioPort::force_idle`]
    ForceIdle,
    /// [`RadioPort::poll_status`]
    PollStatus,
    /// [`RadioPort::clear_status_flags`]
    ClearStatusFlags,
    /// [`RadioPort::read_tx_timestamp`]
    ReadTxTimestamp,
    /// [`RadioPort::read_rx_timestamp`]
    ReadRxTimestamp,
    /// [`RadioPort::read_rx_payload`]
    ReadRxPayload,
    /// [`RadioPort::read_system_time`]
    ReadSystemTime,
}

/// The simulated hardware failed
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SimError {
    /// A fault injected with [`SimRadio::fail_on`]
    Injected(SimOp),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for SimError {}

/// A frame sent by the local radio
#[derive(Clone, Debug, PartialEq)]
pub struct Transmission {
    /// The frame
    pub payload: Vec<u8>,
    /// The TX timestamp the radio reported
    pub timestamp: Instant,
    /// Whether it was a delayed transmission
    pub delayed: bool,
}

#[derive(Clone, Debug)]
struct InFlight {
    /// Global time the frame reaches the local antenna
    arrival: f64,
    payload: Vec<u8>,
    corrupt: bool,
    from_peer: bool,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum PeerState {
    Idle,
    AwaitingResp { seq: u8, poll_tx: Instant },
    AwaitingFinal { seq: u8, poll_rx: Instant, resp_tx: Instant },
}

struct Peer {
    role: PeerRole,
    config: RangingConfig,
    scheduler: Scheduler,
    clock: Clock,
    latency: f64,
    seq: Wrapping<u8>,
    state: PeerState,
    last_poll: Option<f64>,
    results: Vec<RangingResult>,
    received: Vec<RangingMessage>,
}

impl Peer {
    fn antenna_delay(&self) -> Duration {
        Duration::from_ticks(self.config.antenna_delay as u32)
    }

    /// Starts a Poll no earlier than `earliest`, returns it with its emission time
    fn start_poll(&mut self, earliest: f64, period: f64) -> (Vec<u8>, f64) {
        let start = match self.last_poll {
            Some(last) => earliest.max(last + period),
            None => earliest,
        };
        self.last_poll = Some(start);

        let seq = self.seq.0;
        self.seq += 1;

        let poll_tx = self.clock.local(start) + self.antenna_delay();
        self.state = match self.config.protocol {
            Protocol::Beacon => PeerState::Idle,
            _ => PeerState::AwaitingResp { seq, poll_tx },
        };

        (frame::build_poll(seq).to_vec(), start + self.latency)
    }

    /// Handles a frame reaching the peer's antenna at `arrival`
    ///
    /// Returns the reply and the global time it leaves the peer's antenna.
    fn receive(&mut self, payload: &[u8], arrival: f64, airtime: f64) -> Option<(Vec<u8>, f64)> {
        let message = frame::parse(payload).ok()?;
        self.received.push(message);

        let digital = arrival + self.latency;
        let rx_stamp = self.clock.local(digital) - self.antenna_delay();
        let ready = self.clock.local(digital + airtime);

        match (self.role, message, self.state) {
            (PeerRole::Responder, RangingMessage::Poll { seq }, _) => {
                if self.config.protocol == Protocol::Beacon {
                    return None;
                }

                let plan = self
                    .scheduler
                    .schedule_after(
                        rx_stamp,
                        self.config.reply_delay_us,
                        self.config.ticks_per_us,
                        ready,
                    )
                    .ok()?;

                self.state = match self.config.protocol {
                    Protocol::DoubleSided => PeerState::AwaitingFinal {
                        seq,
                        poll_rx: rx_stamp,
                        resp_tx: plan.planned_tx,
                    },
                    _ => PeerState::Idle,
                };

                let emission = self.clock.global(plan.start, digital) + self.latency;
                Some((
                    frame::build_resp(seq, rx_stamp, plan.planned_tx).to_vec(),
                    emission,
                ))
            }
            (
                PeerRole::Responder,
                RangingMessage::Final {
                    seq,
                    poll_tx,
                    resp_rx,
                    final_tx,
                },
                PeerState::AwaitingFinal {
                    seq: expected,
                    poll_rx,
                    resp_tx,
                },
            ) if seq == expected => {
                self.state = PeerState::Idle;
                let timestamps = Timestamps {
                    t1: Some(poll_tx),
                    t2: Some(poll_rx),
                    t3: Some(resp_tx),
                    t4: Some(resp_rx),
                    t5: Some(final_tx),
                    t6: Some(rx_stamp),
                };
                self.record(seq, Protocol::DoubleSided, timestamps);
                None
            }
            (
                PeerRole::Initiator,
                RangingMessage::Resp {
                    seq,
                    poll_rx,
                    resp_tx,
                },
                PeerState::AwaitingResp {
                    seq: expected,
                    poll_tx,
                },
            ) if seq == expected => {
                self.state = PeerState::Idle;
                let mut timestamps = Timestamps {
                    t1: Some(poll_tx),
                    t2: Some(poll_rx),
                    t3: Some(resp_tx),
                    t4: Some(rx_stamp),
                    ..Default::default()
                };

                if self.config.protocol != Protocol::DoubleSided {
                    self.record(seq, Protocol::SingleSided, timestamps);
                    return None;
                }

                let plan = self
                    .scheduler
                    .schedule_after(
                        rx_stamp,
                        self.config.final_delay_us,
                        self.config.ticks_per_us,
                        ready,
                    )
                    .ok()?;
                timestamps.t5 = Some(plan.planned_tx);

                let emission = self.clock.global(plan.start, digital) + self.latency;
                Some((
                    frame::build_final(seq, poll_tx, rx_stamp, plan.planned_tx).to_vec(),
                    emission,
                ))
            }
            _ => None,
        }
    }

    fn record(&mut self, seq: u8, protocol: Protocol, timestamps: Timestamps) {
        let offset = match protocol {
            Protocol::SingleSided => self.config.clock_offset_ppm,
            _ => None,
        };
        if let Ok(result) = RangingResult::from_timestamps(seq, protocol, timestamps, offset) {
            self.results.push(result);
        }
    }
}

/// A simulated radio, see the module documentation
pub struct SimRadio {
    now: f64,
    poll_step: f64,
    bus_latency: f64,
    arm_latency: f64,
    airtime: f64,
    tof: f64,
    clock: Clock,
    latency: f64,
    peer_poll_gap: f64,
    peer_poll_period: f64,

    configured: Option<Config>,
    antenna_delay: u16,
    tx_buffer: Vec<u8>,
    dx_time: u32,
    tx_stamp: Instant,
    tx_done_at: Option<f64>,
    tx_late: bool,
    rx_enabled_at: Option<f64>,
    rx_stamp: Instant,
    rx_payload: Vec<u8>,
    flags: StatusFlags,

    inbox: VecDeque<InFlight>,
    peer: Peer,
    fault: Option<SimOp>,
    pass_next: usize,
    drop_next: usize,

    transmissions: Vec<Transmission>,
    late_arms: usize,
}

impl SimRadio {
    /// Creates a simulation
    pub fn new(config: SimConfig) -> Self {
        let tof = config.distance_m / SPEED_OF_LIGHT / TICK_SECONDS;
        let peer = Peer {
            role: config.peer_role,
            scheduler: Scheduler::from_config(&config.peer_config),
            latency: config.peer_config.antenna_delay as f64,
            config: config.peer_config,
            clock: config.peer_clock,
            seq: Wrapping(0),
            state: PeerState::Idle,
            last_poll: None,
            results: Vec::new(),
            received: Vec::new(),
        };

        SimRadio {
            now: 0.0,
            poll_step: config.poll_step_us * TICKS_PER_US,
            bus_latency: config.bus_latency_us * TICKS_PER_US,
            arm_latency: config.arm_latency_us * TICKS_PER_US,
            airtime: config.airtime_us * TICKS_PER_US,
            tof,
            clock: config.local_clock,
            latency: config.local_latency,
            peer_poll_gap: config.peer_poll_gap_us * TICKS_PER_US,
            peer_poll_period: config.peer_poll_period_us * TICKS_PER_US,
            configured: None,
            antenna_delay: 0,
            tx_buffer: Vec::new(),
            dx_time: 0,
            tx_stamp: Instant::wrapping(0),
            tx_done_at: None,
            tx_late: false,
            rx_enabled_at: None,
            rx_stamp: Instant::wrapping(0),
            rx_payload: Vec::new(),
            flags: StatusFlags::NONE,
            inbox: VecDeque::new(),
            peer,
            fault: None,
            pass_next: 0,
            drop_next: 0,
            transmissions: Vec::new(),
            late_arms: 0,
        }
    }

    /// Makes every call of `op` fail until [`SimRadio::clear_fault`]
    pub fn fail_on(&mut self, op: SimOp) {
        self.fault = Some(op);
    }

    /// Removes an injected fault
    pub fn clear_fault(&mut self) {
        self.fault = None;
    }

    /// Loses the next `count` frames, in either direction
    pub fn drop_frames(&mut self, count: usize) {
        self.drop_frames_after(0, count);
    }

    /// Lets `pass` frames through, then loses the next `count`
    ///
    /// Frames are counted in the order they are put on the air, in either
    /// direction, injected ones included.
    pub fn drop_frames_after(&mut self, pass: usize, count: usize) {
        self.pass_next = pass;
        self.drop_next += count;
    }

    /// Makes `payload` reach the local antenna `after_us` from now
    pub fn inject_frame(&mut self, payload: &[u8], after_us: f64) {
        let arrival = self.now + after_us * TICKS_PER_US;
        self.enqueue(arrival, payload.to_vec(), false, false);
    }

    /// Makes a frame with a bad FCS reach the local antenna `after_us` from now
    pub fn inject_corrupt_frame(&mut self, after_us: f64) {
        let arrival = self.now + after_us * TICKS_PER_US;
        self.enqueue(arrival, Vec::new(), true, false);
    }

    /// Lets global time pass without touching the radio
    pub fn advance_us(&mut self, us: f64) {
        self.advance(us * TICKS_PER_US);
    }

    /// Current global time in ticks
    pub fn global_time(&self) -> f64 {
        self.now
    }

    /// Reading of the peer's clock right now
    pub fn peer_time(&self) -> Instant {
        self.peer.clock.local(self.now)
    }

    /// The antenna delay last set, zero before
    pub fn antenna_delay(&self) -> u16 {
        self.antenna_delay
    }

    /// The configuration last applied
    pub fn configuration(&self) -> Option<Config> {
        self.configured
    }

    /// Frames sent by the local radio
    pub fn transmissions(&self) -> &[Transmission] {
        &self.transmissions
    }

    /// Delayed transmissions that were armed after their start time
    pub fn late_arms(&self) -> usize {
        self.late_arms
    }

    /// Results computed by the peer
    pub fn peer_results(&self) -> &[RangingResult] {
        &self.peer.results
    }

    /// Valid frames the peer received
    pub fn peer_received(&self) -> &[RangingMessage] {
        &self.peer.received
    }

    /// Whether the local receiver is on
    pub fn is_receiving(&self) -> bool {
        self.rx_enabled_at.is_some()
    }

    /// Whether a transmission is ongoing or waiting for its start time
    pub fn is_transmitting(&self) -> bool {
        self.tx_done_at.is_some() || self.tx_late
    }

    fn begin(&mut self, op: SimOp) -> Result<(), SimError> {
        if self.fault == Some(op) {
            return Err(SimError::Injected(op));
        }

        self.advance(self.bus_latency);
        Ok(())
    }

    fn advance(&mut self, ticks: f64) {
        self.now += ticks;

        if let Some(done) = self.tx_done_at {
            if self.now >= done {
                self.tx_done_at = None;
                self.flags |= StatusFlags::TX_DONE;
            }
        }

        let Some(enabled_at) = self.rx_enabled_at else {
            return;
        };

        // Frames that arrived while the receiver was off are lost
        while self
            .inbox
            .front()
            .is_some_and(|frame| frame.arrival < enabled_at)
        {
            self.inbox.pop_front();
        }

        let complete = self
            .inbox
            .front()
            .is_some_and(|frame| self.now >= frame.arrival + self.latency + self.airtime);
        if !complete {
            return;
        }

        if let Some(frame) = self.inbox.pop_front() {
            self.rx_enabled_at = None;
            if frame.corrupt {
                self.flags |= StatusFlags::RX_ERROR;
            } else {
                let antenna_delay = Duration::from_ticks(self.antenna_delay as u32);
                self.rx_stamp = self.clock.local(frame.arrival + self.latency) - antenna_delay;
                self.rx_payload = frame.payload;
                self.flags |= StatusFlags::RX_GOOD;
            }
        }
    }

    /// Whether the frame put on the air now gets lost
    fn lost(&mut self) -> bool {
        if self.drop_next == 0 {
            return false;
        }
        if self.pass_next > 0 {
            self.pass_next -= 1;
            return false;
        }

        self.drop_next -= 1;
        true
    }

    fn enqueue(&mut self, arrival: f64, payload: Vec<u8>, corrupt: bool, from_peer: bool) {
        if self.lost() {
            return;
        }

        let index = self
            .inbox
            .iter()
            .position(|frame| frame.arrival > arrival)
            .unwrap_or(self.inbox.len());
        self.inbox.insert(
            index,
            InFlight {
                arrival,
                payload,
                corrupt,
                from_peer,
            },
        );
    }

    fn transmit(&mut self, start: f64, timestamp: Instant, delayed: bool) {
        let payload = self.tx_buffer.clone();
        self.tx_stamp = timestamp;
        self.tx_done_at = Some(start + self.airtime);
        self.rx_enabled_at = None;
        self.transmissions.push(Transmission {
            payload: payload.clone(),
            timestamp,
            delayed,
        });

        if self.lost() {
            return;
        }

        let arrival = start + self.latency + self.tof;
        if let Some((reply, emission)) = self.peer.receive(&payload, arrival, self.airtime) {
            self.enqueue(emission + self.tof, reply, false, true);
        }
    }
}

#[maybe_async_attr(AFIT)]
impl RadioPort for SimRadio {
    type Error = SimError;

    async fn configure(&mut self, config: &Config) -> Result<(), Self::Error> {
        self.begin(SimOp::Configure)?;
        self.configured = Some(*config);
        Ok(())
    }

    async fn set_antenna_delay(&mut self, ticks: u16) -> Result<(), Self::Error> {
        self.begin(SimOp::SetAntennaDelay)?;
        self.antenna_delay = ticks;
        Ok(())
    }

    async fn write_tx_payload(&mut self, payload: &[u8]) -> Result<(), Self::Error> {
        self.begin(SimOp::WriteTxPayload)?;
        self.tx_buffer = payload.to_vec();
        Ok(())
    }

    async fn arm_tx(&mut self, mode: TxMode) -> Result<(), Self::Error> {
        self.begin(SimOp::ArmTx)?;
        self.advance(self.arm_latency);
        let antenna_delay = Duration::from_ticks(self.antenna_delay as u32);

        match mode {
            TxMode::Immediate => {
                let timestamp = self.clock.local(self.now) + antenna_delay;
                self.transmit(self.now, timestamp, false);
            }
            TxMode::Delayed => {
                let start = Instant::wrapping(((self.dx_time & !1) as u64) << 8);
                let lead = start.signed_offset_from(self.clock.local(self.now));
                if lead > 0 {
                    let start_global = self.clock.global(start, self.now);
                    self.transmit(start_global, start + antenna_delay, true);
                } else {
                    // Pending until the counter wraps back to the start time
                    self.late_arms += 1;
                    self.tx_late = true;
                    self.rx_enabled_at = None;
                    self.flags |= StatusFlags::TX_LATE;
                }
            }
        }

        Ok(())
    }

    async fn set_delayed_start_time(&mut self, value: u32) -> Result<(), Self::Error> {
        self.begin(SimOp::SetDelayedStartTime)?;
        self.dx_time = value;
        Ok(())
    }

    async fn enable_rx(&mut self, mode: RxMode) -> Result<(), Self::Error> {
        self.begin(SimOp::EnableRx)?;
        match mode {
            RxMode::Immediate => self.rx_enabled_at = Some(self.now),
        }

        // Injected frames don't keep the peer from polling
        let peer_may_poll = match self.peer.state {
            PeerState::Idle | PeerState::AwaitingResp { .. } => {
                !self.inbox.iter().any(|frame| frame.from_peer)
            }
            PeerState::AwaitingFinal { .. } => false,
        };
        if self.peer.role == PeerRole::Initiator && peer_may_poll {
            let (poll, emission) = self
                .peer
                .start_poll(self.now + self.peer_poll_gap, self.peer_poll_period);
            self.enqueue(emission + self.tof, poll, false, true);
        }

        Ok(())
    }

    async fn force_idle(&mut self) -> Result<(), Self::Error> {
        self.begin(SimOp::ForceIdle)?;
        self.tx_done_at = None;
        self.tx_late = false;
        self.rx_enabled_at = None;
        Ok(())
    }

    async fn poll_status(&mut self) -> Result<Status, Self::Error> {
        if self.fault == Some(SimOp::PollStatus) {
            return Err(SimError::Injected(SimOp::PollStatus));
        }

        self.advance(self.poll_step);
        Ok(Status::from_flags(self.flags))
    }

    async fn clear_status_flags(&mut self, flags: StatusFlags) -> Result<(), Self::Error> {
        self.begin(SimOp::ClearStatusFlags)?;
        self.flags = self.flags & !flags;
        Ok(())
    }

    async fn read_tx_timestamp(&mut self) -> Result<[u8; TIMESTAMP_LEN], Self::Error> {
        self.begin(SimOp::ReadTxTimestamp)?;
        Ok(self.tx_stamp.to_bytes())
    }

    async fn read_rx_timestamp(&mut self) -> Result<[u8; TIMESTAMP_LEN], Self::Error> {
        self.begin(SimOp::ReadRxTimestamp)?;
        Ok(self.rx_stamp.to_bytes())
    }

    async fn read_rx_payload(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error> {
        self.begin(SimOp::ReadRxPayload)?;
        let copied = self.rx_payload.len().min(buffer.len());
        buffer[..copied].copy_from_slice(&self.rx_payload[..copied]);
        Ok(self.rx_payload.len())
    }

    async fn read_system_time(&mut self) -> Result<[u8; TIMESTAMP_LEN], Self::Error> {
        self.begin(SimOp::ReadSystemTime)?;
        // The system time register has no sub-8-bit resolution
        let now = self.clock.local(self.now).value() & !0xff;
        Ok(Instant::wrapping(now).to_bytes())
    }
}

/// A delay that returns immediately
///
/// Simulated time only advances through the radio, so waiting is pointless.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopDelay;

#[maybe_async_attr(AFIT)]
impl hal::delay::DelayNs for NoopDelay {
    async fn delay_ns(&mut self, _ns: u32) {}
}
