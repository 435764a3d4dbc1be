//! 40-bit radio timestamps
//!
//! Every timestamp the radio produces is a 40-bit tick counter that wraps
//! around roughly every 17.2 seconds. Differences between two timestamps are
//! only meaningful if both were captured within one wrap period, which is
//! always the case within a single ranging exchange.

use core::ops::{Add, Sub};

#[cfg(feature = "defmt")]
use defmt::Format;

/// Largest representable tick count, 2^40 - 1
pub const TIME_MAX: u64 = 0xff_ffff_ffff;

/// Number of bytes a timestamp occupies on the wire and in the registers
pub const TIMESTAMP_LEN: usize = 5;

/// Half of the wrap period
///
/// A forward distance at or above this value is read as "behind" when a signed
/// offset is requested.
pub const HALF_WRAP: u64 = 1 << 39;

/// Duration of one tick in seconds, 1 / (128 * 499.2 MHz) or about 15.65 ps
pub const TICK_SECONDS: f64 = 1.0 / 499.2e6 / 128.0;

/// A point on the radio's 40-bit time base
///
/// Instants have no meaningful order. Use [`Instant::duration_since`] or
/// [`Instant::signed_offset_from`] to relate two of them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(C)]
pub struct Instant(u64);

impl Instant {
    /// Wraps a tick count, `None` if it needs more than 40 bits
    ///
    /// ``` rust
    /// use dw3000_twr::time::{Instant, TIME_MAX};
    ///
    /// assert!(Instant::new(TIME_MAX).is_some());
    /// assert!(Instant::new(1 << 40).is_none());
    /// ```
    pub fn new(value: u64) -> Option<Self> {
        (value <= TIME_MAX).then_some(Instant(value))
    }

    /// Creates an `Instant` from the low 40 bits of `value`
    pub const fn wrapping(value: u64) -> Self {
        Instant(value & TIME_MAX)
    }

    /// The tick count, never above [`TIME_MAX`]
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Reconstructs a timestamp from its 5-byte register representation
    ///
    /// The least significant byte comes first.
    pub fn from_bytes(raw: [u8; TIMESTAMP_LEN]) -> Self {
        let value = raw
            .iter()
            .rev()
            .fold(0u64, |value, &byte| (value << 8) | byte as u64);

        Instant(value)
    }

    /// Returns the 5-byte representation, least significant byte first
    pub fn to_bytes(self) -> [u8; TIMESTAMP_LEN] {
        let mut raw = [0; TIMESTAMP_LEN];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = (self.0 >> (8 * i)) as u8;
        }

        raw
    }

    /// Ticks from `earlier` forward to `self`, modulo 2^40
    ///
    /// `earlier` must really be the earlier of the two. A counter wrap in
    /// between is handled:
    ///
    /// ``` rust
    /// use dw3000_twr::time::{Instant, TIME_MAX};
    ///
    /// let before_wrap = Instant::new(TIME_MAX - 9).unwrap();
    /// let after_wrap = Instant::new(15).unwrap();
    ///
    /// assert_eq!(after_wrap.duration_since(before_wrap).value(), 25);
    /// ```
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration(self.0.wrapping_sub(earlier.0) & TIME_MAX)
    }

    /// Returns the signed offset of `self` relative to `other`, in ticks
    ///
    /// Forward distances below half the wrap period are positive, everything
    /// else is read as `self` lying before `other`.
    pub fn signed_offset_from(&self, other: Instant) -> i64 {
        let forward = self.duration_since(other).value();
        if forward < HALF_WRAP {
            forward as i64
        } else {
            forward as i64 - (TIME_MAX as i64 + 1)
        }
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        // 41 bits at most
        Instant::wrapping(self.0 + rhs.0)
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Instant {
        Instant::wrapping(self.0.wrapping_sub(rhs.0))
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, earlier: Instant) -> Duration {
        self.duration_since(earlier)
    }
}

impl<'a> byte::TryRead<'a> for Instant {
    fn try_read(bytes: &'a [u8], _: ()) -> byte::Result<(Self, usize)> {
        byte::check_len(bytes, TIMESTAMP_LEN)?;

        let mut raw = [0; TIMESTAMP_LEN];
        raw.copy_from_slice(&bytes[..TIMESTAMP_LEN]);

        Ok((Instant::from_bytes(raw), TIMESTAMP_LEN))
    }
}

/// A number of ticks, below 2^40
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(C)]
pub struct Duration(u64);

impl Duration {
    /// Wraps a tick count, `None` if it needs more than 40 bits
    pub fn new(value: u64) -> Option<Self> {
        (value <= TIME_MAX).then_some(Duration(value))
    }

    /// Creates a `Duration` from a tick count that always fits in 40 bits
    pub const fn from_ticks(ticks: u32) -> Self {
        Duration(ticks as u64)
    }

    /// Creates a `Duration` of `micros` microseconds at `ticks_per_us` ticks each
    ///
    /// Returns `None` if the result does not fit in 40 bits.
    pub fn from_micros(micros: u32, ticks_per_us: u32) -> Option<Self> {
        Duration::new(micros as u64 * ticks_per_us as u64)
    }

    /// The tick count
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the duration in seconds
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 * TICK_SECONDS
    }
}

/// Reconstructs a timestamp from the raw bytes read out of the radio
pub fn decode(raw: [u8; TIMESTAMP_LEN]) -> Instant {
    Instant::from_bytes(raw)
}

/// Serializes a timestamp into its 5-byte little-endian form
pub fn encode(timestamp: Instant) -> [u8; TIMESTAMP_LEN] {
    timestamp.to_bytes()
}

/// Forward distance from `a` to `b`, modulo 2^40
///
/// The caller guarantees that `b` happened after `a`, within one wrap period.
pub fn elapsed(a: Instant, b: Instant) -> Duration {
    b.duration_since(a)
}

#[cfg(test)]
mod tests {
    use super::*;

    use byte::BytesExt as _;
    use proptest::prelude::*;

    fn at(ticks: u64) -> Instant {
        Instant::wrapping(ticks)
    }

    #[test]
    fn construction_rejects_wide_values() {
        assert_eq!(Instant::new(TIME_MAX), Some(at(TIME_MAX)));
        assert_eq!(Instant::new(TIME_MAX + 1), None);
        assert_eq!(Duration::new(TIME_MAX + 1), None);
        assert_eq!(at(TIME_MAX + 6).value(), 5);
    }

    #[test]
    fn arithmetic_wraps() {
        let one = Duration::from_ticks(1);

        assert_eq!(at(41) + one, at(42));
        assert_eq!(at(TIME_MAX) + Duration::from_ticks(2), at(1));
        assert_eq!(at(0) - one, at(TIME_MAX));
        assert_eq!((at(3) - at(TIME_MAX)).value(), 4);
    }

    #[test]
    fn signed_offset() {
        let a = at(10);
        let b = at(TIME_MAX - 9);

        assert_eq!(a.signed_offset_from(b), 20);
        assert_eq!(b.signed_offset_from(a), -20);
        assert_eq!(a.signed_offset_from(a), 0);
    }

    #[test]
    fn bytes_are_little_endian() {
        let instant = at(0x01_0203_0405);

        assert_eq!(encode(instant), [0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(decode([0x05, 0x04, 0x03, 0x02, 0x01]), instant);
    }

    #[test]
    fn read_from_byte_slice() {
        let bytes = [0xaa, 0x05, 0x04, 0x03, 0x02, 0x01];
        let offset = &mut 1;

        let instant: Instant = bytes.read_with(offset, ()).unwrap();

        assert_eq!(instant.value(), 0x01_0203_0405);
        assert_eq!(*offset, 6);

        let offset = &mut 2;
        assert!(bytes.read_with::<Instant>(offset, ()).is_err());
    }

    #[test]
    fn duration_from_micros() {
        assert_eq!(Duration::from_micros(900, 63898).unwrap().value(), 57_508_200);
        assert!(Duration::from_micros(u32::MAX, u32::MAX).is_none());
    }

    #[test]
    fn duration_in_seconds() {
        let one_us = Duration::from_ticks(63898);

        assert!((one_us.as_secs_f64() - 1.0e-6).abs() < 1.0e-9);
    }

    proptest! {
        #[test]
        fn decode_encode_round_trip(value in 0..=TIME_MAX) {
            let instant = at(value);

            prop_assert_eq!(decode(encode(instant)), instant);
        }

        #[test]
        fn elapsed_across_wraparound(start in 0..=TIME_MAX, distance in 0..=HALF_WRAP) {
            let a = at(start);
            let b = a + Duration::new(distance).unwrap();

            prop_assert_eq!(elapsed(a, b).value(), distance);
        }
    }
}
