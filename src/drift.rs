//! Clock drift between two radios
//!
//! Sample the system time of both radios (see [`Exchange::system_time`]),
//! wait a few seconds, then sample both again in the same order. The two
//! periods differ by the drift of the local clock against the remote one.
//!
//! [`Exchange::system_time`]: crate::exchange::Exchange::system_time

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::time::{elapsed, Duration, Instant, TICK_SECONDS};

/// Drift of the local clock against a remote one
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClockDrift {
    /// Ticks counted by the local clock between its two samples
    pub local_period: Duration,
    /// Ticks counted by the remote clock between its two samples
    pub remote_period: Duration,
}

impl ClockDrift {
    /// Builds an estimate from `(first, second)` samples of each clock
    ///
    /// Returns `None` if the remote clock did not advance.
    pub fn from_samples(local: (Instant, Instant), remote: (Instant, Instant)) -> Option<Self> {
        let drift = ClockDrift {
            local_period: elapsed(local.0, local.1),
            remote_period: elapsed(remote.0, remote.1),
        };

        if drift.remote_period.value() == 0 {
            return None;
        }

        Some(drift)
    }

    /// Local period minus remote period, positive when the local clock runs fast
    pub fn drift_ticks(&self) -> i64 {
        self.local_period.value() as i64 - self.remote_period.value() as i64
    }

    /// Drift in parts per million of the remote period
    pub fn ppm(&self) -> f64 {
        self.drift_ticks() as f64 / self.remote_period.value() as f64 * 1e6
    }

    /// Drift in microseconds per second of wall time
    ///
    /// `wall_seconds` is the time between the two rounds of samples as seen
    /// by the host. Returns `None` for a non-positive or non-finite interval.
    pub fn us_per_s(&self, wall_seconds: f64) -> Option<f64> {
        if !wall_seconds.is_finite() || wall_seconds <= 0.0 {
            return None;
        }

        Some(self.drift_ticks() as f64 * TICK_SECONDS / wall_seconds * 1e6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::time::TIME_MAX;

    const TICKS_PER_SECOND: u64 = 63_897_600_000;

    #[test]
    fn local_clock_fast() {
        // 5 s of remote time, the local clock gains 10 ppm
        let remote_period = 5 * TICKS_PER_SECOND;
        let local_period = remote_period + remote_period / 100_000;

        let local = (Instant::wrapping(1_000), Instant::wrapping(1_000 + local_period));
        let remote = (
            Instant::wrapping(TIME_MAX - 42),
            Instant::wrapping(TIME_MAX - 42 + remote_period),
        );

        let drift = ClockDrift::from_samples(local, remote).unwrap();

        assert_eq!(drift.remote_period.value(), remote_period);
        assert_eq!(drift.drift_ticks(), (remote_period / 100_000) as i64);
        assert!((drift.ppm() - 10.0).abs() < 1e-6);
        assert!((drift.us_per_s(5.0).unwrap() - 10.0).abs() < 1e-3);
    }

    #[test]
    fn local_clock_slow() {
        let local = (Instant::wrapping(0), Instant::wrapping(999_000));
        let remote = (Instant::wrapping(0), Instant::wrapping(1_000_000));

        let drift = ClockDrift::from_samples(local, remote).unwrap();

        assert_eq!(drift.drift_ticks(), -1_000);
        assert!((drift.ppm() + 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_samples() {
        let now = Instant::wrapping(5);

        assert!(ClockDrift::from_samples((now, now), (now, now)).is_none());

        let drift = ClockDrift::from_samples((now, now), (now, Instant::wrapping(6))).unwrap();
        assert!(drift.us_per_s(0.0).is_none());
        assert!(drift.us_per_s(f64::NAN).is_none());
    }
}
