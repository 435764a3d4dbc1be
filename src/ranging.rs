//! Time of flight and distance from a set of exchange timestamps
//!
//! Timestamp naming follows the order of events in a double-sided exchange:
//!
//! ```text
//!  Initiator            Responder
//!     t1  ---- Poll --->   t2
//!     t4  <--- Resp ----   t3
//!     t5  ---- Final -->   t6
//! ```
//!
//! `t1`, `t4` and `t5` are taken by the initiator's clock, the others by the
//! responder's. Only differences between timestamps of the same clock are
//! ever formed.

use core::fmt;

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::configs::Protocol;
use crate::time::{elapsed, Instant, TICK_SECONDS};

/// Speed of light in air, in meters per second
pub const SPEED_OF_LIGHT: f64 = 299_702_547.0;

/// The timestamps collected during one exchange
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timestamps {
    /// Initiator sends Poll
    pub t1: Option<Instant>,
    /// Responder receives Poll
    pub t2: Option<Instant>,
    /// Responder sends Resp
    pub t3: Option<Instant>,
    /// Initiator receives Resp
    pub t4: Option<Instant>,
    /// Initiator sends Final
    pub t5: Option<Instant>,
    /// Responder receives Final
    pub t6: Option<Instant>,
}

impl Timestamps {
    /// Whether everything `protocol` needs has been collected
    pub fn is_complete(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::SingleSided => self.single_sided().is_some(),
            Protocol::DoubleSided => self.double_sided().is_some(),
            Protocol::Beacon => false,
        }
    }

    fn single_sided(&self) -> Option<(Instant, Instant, Instant, Instant)> {
        Some((self.t1?, self.t2?, self.t3?, self.t4?))
    }

    #[allow(clippy::type_complexity)]
    fn double_sided(&self) -> Option<(Instant, Instant, Instant, Instant, Instant, Instant)> {
        Some((self.t1?, self.t2?, self.t3?, self.t4?, self.t5?, self.t6?))
    }
}

/// SS-TWR time of flight in ticks
///
/// `(round trip - reply time) / 2`. The subtraction is done on integers, so
/// negative results are possible and returned as such.
pub fn single_sided_tof(t1: Instant, t2: Instant, t3: Instant, t4: Instant) -> f64 {
    let round_trip = elapsed(t1, t4).value() as i64;
    let reply = elapsed(t2, t3).value() as i64;

    (round_trip - reply) as f64 / 2.0
}

/// SS-TWR time of flight in ticks, corrected for a known clock offset
///
/// `clock_offset_ppm` is the offset of the initiator's clock against the
/// responder's, positive when the initiator runs fast. The responder's reply
/// time is converted into initiator ticks before it is subtracted.
pub fn single_sided_tof_corrected(
    t1: Instant,
    t2: Instant,
    t3: Instant,
    t4: Instant,
    clock_offset_ppm: f64,
) -> f64 {
    let round_trip = elapsed(t1, t4).value() as f64;
    let reply = elapsed(t2, t3).value() as f64 * (1.0 + clock_offset_ppm * 1e-6);

    (round_trip - reply) / 2.0
}

/// DS-TWR time of flight in ticks
///
/// `(Ra * Rb - Da * Db) / (Ra + Rb + Da + Db)`, which cancels linear drift
/// between the two clocks. Products are formed in 128-bit integers.
pub fn double_sided_tof(
    t1: Instant,
    t2: Instant,
    t3: Instant,
    t4: Instant,
    t5: Instant,
    t6: Instant,
) -> Result<f64, RangingError> {
    let round_a = elapsed(t1, t4).value() as u128;
    let round_b = elapsed(t3, t6).value() as u128;
    let reply_a = elapsed(t4, t5).value() as u128;
    let reply_b = elapsed(t2, t3).value() as u128;

    let numerator = (round_a * round_b) as i128 - (reply_a * reply_b) as i128;
    let denominator = round_a + round_b + reply_a + reply_b;
    if denominator == 0 {
        return Err(RangingError::Degenerate);
    }

    Ok(numerator as f64 / denominator as f64)
}

/// Converts a time of flight in ticks to meters
pub fn tof_to_meters(tof_ticks: f64) -> f64 {
    tof_ticks * TICK_SECONDS * SPEED_OF_LIGHT
}

/// Time of flight in ticks for `protocol`
pub fn compute(
    protocol: Protocol,
    timestamps: &Timestamps,
    clock_offset_ppm: Option<f64>,
) -> Result<f64, RangingError> {
    match protocol {
        Protocol::SingleSided => {
            let (t1, t2, t3, t4) = timestamps.single_sided().ok_or(RangingError::Incomplete)?;
            Ok(match clock_offset_ppm {
                Some(ppm) => single_sided_tof_corrected(t1, t2, t3, t4, ppm),
                None => single_sided_tof(t1, t2, t3, t4),
            })
        }
        Protocol::DoubleSided => {
            let (t1, t2, t3, t4, t5, t6) =
                timestamps.double_sided().ok_or(RangingError::Incomplete)?;
            double_sided_tof(t1, t2, t3, t4, t5, t6)
        }
        Protocol::Beacon => Err(RangingError::Incomplete),
    }
}

/// The outcome of one successful exchange
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RangingResult {
    /// Sequence number of the exchange
    pub seq: u8,
    /// Distance in meters, not clamped
    pub distance_m: f64,
    /// Time of flight in ticks
    pub tof_ticks: f64,
    /// How the result was computed
    pub protocol: Protocol,
    /// The timestamps it was computed from
    pub timestamps: Timestamps,
}

impl RangingResult {
    /// Computes the result of exchange `seq`
    pub fn from_timestamps(
        seq: u8,
        protocol: Protocol,
        timestamps: Timestamps,
        clock_offset_ppm: Option<f64>,
    ) -> Result<Self, RangingError> {
        let tof_ticks = compute(protocol, &timestamps, clock_offset_ppm)?;

        Ok(RangingResult {
            seq,
            distance_m: tof_to_meters(tof_ticks),
            tof_ticks,
            protocol,
            timestamps,
        })
    }

    /// Whether the distance is finite and within `0..=max_range_m`
    ///
    /// Stale timestamps or clock glitches produce negative or huge distances.
    /// Those are reported unchanged; this is for callers that want to drop
    /// them.
    pub fn is_plausible(&self, max_range_m: f64) -> bool {
        self.distance_m.is_finite() && self.distance_m >= 0.0 && self.distance_m <= max_range_m
    }
}

/// A distance could not be computed
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum RangingError {
    /// Timestamps required by the protocol are missing
    Incomplete,
    /// All DS-TWR intervals are zero
    Degenerate,
}

impl fmt::Display for RangingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RangingError {}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::time::TIME_MAX;

    const REPLY: u64 = 57_508_200;

    fn ts(value: u64) -> Instant {
        Instant::wrapping(value)
    }

    #[test]
    fn single_sided_synthetic() {
        let tof = single_sided_tof(ts(0), ts(0), ts(19_000), ts(20_000));

        assert_eq!(tof, 500.0);
        assert!((tof_to_meters(tof) - 500.0 * TICK_SECONDS * SPEED_OF_LIGHT).abs() < 1e-12);
        assert!((tof_to_meters(2.0 * tof) - 2.0 * tof_to_meters(tof)).abs() < 1e-12);
    }

    #[test]
    fn single_sided_across_wraparound() {
        let t1 = ts(TIME_MAX - 100);
        let t4 = ts(19_899);
        let t2 = ts(TIME_MAX - 5_000);
        let t3 = ts(13_999);

        assert_eq!(single_sided_tof(t1, t2, t3, t4), 500.0);
    }

    #[test]
    fn single_sided_negative_is_reported() {
        let tof = single_sided_tof(ts(0), ts(0), ts(21_000), ts(20_000));

        assert_eq!(tof, -500.0);

        let result = RangingResult::from_timestamps(
            1,
            Protocol::SingleSided,
            Timestamps {
                t1: Some(ts(0)),
                t2: Some(ts(0)),
                t3: Some(ts(21_000)),
                t4: Some(ts(20_000)),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        assert!(result.distance_m < 0.0);
        assert!(!result.is_plausible(100.0));
    }

    #[test]
    fn double_sided_symmetric_reference() {
        let ra = 1_000_000u64;
        let da = 999_000u64;
        let t1 = ts(0);
        let t4 = ts(ra);
        let t5 = ts(ra + da);
        let t2 = ts(TIME_MAX - 300);
        let t3 = t2 + crate::time::Duration::new(da).unwrap();
        let t6 = t3 + crate::time::Duration::new(ra).unwrap();

        let tof = double_sided_tof(t1, t2, t3, t4, t5, t6).unwrap();

        // Ra = Rb and Da = Db
        let (ra_f, da_f) = (ra as f64, da as f64);
        let reference = (ra_f * ra_f - da_f * da_f) / (2.0 * ra_f + 2.0 * da_f);
        assert!(((tof - reference) / reference).abs() < 1e-9);
        assert!((tof - 500.0).abs() < 1e-9);
    }

    #[test]
    fn double_sided_cancels_drift() {
        let tof_true = 500.0;
        let rate = 1.0 + 20e-6;

        let t1 = 0u64;
        let t4 = (2.0 * tof_true) as u64 + REPLY;
        let t5 = t4 + REPLY;
        let t2 = 1_000u64;
        let t3 = t2 + (REPLY as f64 * rate).round() as u64;
        let t6 = t3 + ((2.0 * tof_true + REPLY as f64) * rate).round() as u64;

        let ds = double_sided_tof(ts(t1), ts(t2), ts(t3), ts(t4), ts(t5), ts(t6)).unwrap();
        assert!((ds - tof_true).abs() < 1.0);

        // The same drift throws a single-sided measurement off by hundreds of ticks
        let ss = single_sided_tof(ts(t1), ts(t2), ts(t3), ts(t4));
        assert!((ss - tof_true).abs() > 100.0);

        // unless the offset is known
        let corrected = single_sided_tof_corrected(ts(t1), ts(t2), ts(t3), ts(t4), -20.0);
        assert!((corrected - tof_true).abs() < 1.0);
    }

    #[test]
    fn double_sided_degenerate() {
        let t = ts(42);

        assert_eq!(
            double_sided_tof(t, t, t, t, t, t),
            Err(RangingError::Degenerate)
        );
    }

    #[test]
    fn compute_requires_timestamps() {
        let mut timestamps = Timestamps {
            t1: Some(ts(0)),
            t2: Some(ts(0)),
            t3: Some(ts(19_000)),
            ..Default::default()
        };

        assert_eq!(
            compute(Protocol::SingleSided, &timestamps, None),
            Err(RangingError::Incomplete)
        );
        assert!(!timestamps.is_complete(Protocol::SingleSided));

        timestamps.t4 = Some(ts(20_000));
        assert!(timestamps.is_complete(Protocol::SingleSided));
        assert!(!timestamps.is_complete(Protocol::DoubleSided));
        assert_eq!(compute(Protocol::SingleSided, &timestamps, None), Ok(500.0));
        assert_eq!(
            compute(Protocol::DoubleSided, &timestamps, None),
            Err(RangingError::Incomplete)
        );
        assert_eq!(
            compute(Protocol::Beacon, &timestamps, None),
            Err(RangingError::Incomplete)
        );
    }

    #[test]
    fn plausibility() {
        let result = RangingResult {
            seq: 0,
            distance_m: 12.5,
            tof_ticks: 0.0,
            protocol: Protocol::DoubleSided,
            timestamps: Default::default(),
        };

        assert!(result.is_plausible(100.0));
        assert!(!result.is_plausible(10.0));
        assert!(!RangingResult {
            distance_m: f64::NAN,
            ..result
        }
        .is_plausible(100.0));
    }
}
