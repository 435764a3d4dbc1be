//! Delayed transmission planning
//!
//! A reply has to leave the antenna a fixed time after the frame it answers
//! arrived, and it has to carry its own transmission time. The radio takes the
//! start time with the low 9 bits cleared (the register holds bits 8..40 of the
//! timestamp and ignores its own lowest bit), so the timestamp embedded in the
//! reply must be computed from that truncated value and not from the requested
//! one.

use core::fmt;

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::configs::RangingConfig;
use crate::time::{Duration, Instant, HALF_WRAP};

/// Bits of the timestamp dropped by the delayed-start register
pub const REGISTER_SHIFT: u32 = 8;

/// How the antenna delay enters the planned transmission time
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AntennaDelayPlacement {
    /// Truncate first, then add the antenna delay
    ///
    /// Matches the TX timestamp the radio itself reports.
    #[default]
    AfterTruncation,
    /// Add the antenna delay to the target, then truncate
    BeforeTruncation,
    /// Use the truncated start time as is
    Omitted,
}

/// A planned delayed transmission
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct DelayedTx {
    /// Value for the delayed-start register
    pub register: u32,
    /// The start time the radio will actually use
    pub start: Instant,
    /// The timestamp to embed in the transmitted frame
    pub planned_tx: Instant,
}

/// The requested transmission time can't be met
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum ScheduleError {
    /// The start time lies in the past or closer than the minimum lead
    TooLate {
        /// Remaining time until the start, negative if already passed
        lead_ticks: i64,
    },
    /// The delay is longer than half the timestamp wrap period
    DelayOutOfRange,
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ScheduleError {}

/// Plans delayed transmissions
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct Scheduler {
    /// Minimum time between "now" and the start time, in ticks
    pub min_lead_ticks: u64,
    /// Clear the lowest register bit, as the DW3000 ignores it
    pub even_align: bool,
    /// Antenna delay of this radio
    pub antenna_delay: Duration,
    /// Where the antenna delay is applied
    pub placement: AntennaDelayPlacement,
}

impl Scheduler {
    /// Creates a scheduler from the ranging configuration
    pub fn from_config(config: &RangingConfig) -> Self {
        Scheduler {
            min_lead_ticks: config.min_lead_us as u64 * config.ticks_per_us as u64,
            even_align: true,
            antenna_delay: Duration::from_ticks(config.antenna_delay as u32),
            placement: config.antenna_delay_placement,
        }
    }

    /// Plans a transmission `delay_us` after `reference`
    ///
    /// `now` is the current system time of the radio. The plan is rejected
    /// if its start time lies less than the minimum lead after `now`; the
    /// caller must then abort instead of sending immediately.
    pub fn schedule_after(
        &self,
        reference: Instant,
        delay_us: u32,
        ticks_per_us: u32,
        now: Instant,
    ) -> Result<DelayedTx, ScheduleError> {
        let delay = delay_us as u64 * ticks_per_us as u64;
        if delay >= HALF_WRAP {
            return Err(ScheduleError::DelayOutOfRange);
        }

        let target = Instant::wrapping(reference.value() + delay);
        let register = self.register_for(target);
        let start = Instant::wrapping((register as u64) << REGISTER_SHIFT);

        let planned_tx = match self.placement {
            AntennaDelayPlacement::AfterTruncation => start + self.antenna_delay,
            AntennaDelayPlacement::BeforeTruncation => {
                let shifted = self.register_for(target + self.antenna_delay);
                Instant::wrapping((shifted as u64) << REGISTER_SHIFT)
            }
            AntennaDelayPlacement::Omitted => start,
        };

        let plan = DelayedTx {
            register,
            start,
            planned_tx,
        };
        self.check_lead(&plan, now)?;

        Ok(plan)
    }

    /// Checks that `plan` still lies far enough in the future
    pub fn check_lead(&self, plan: &DelayedTx, now: Instant) -> Result<(), ScheduleError> {
        let lead_ticks = plan.start.signed_offset_from(now);
        if lead_ticks < 0 || (lead_ticks as u64) < self.min_lead_ticks {
            return Err(ScheduleError::TooLate { lead_ticks });
        }

        Ok(())
    }

    fn register_for(&self, target: Instant) -> u32 {
        let register = (target.value() >> REGISTER_SHIFT) as u32;
        if self.even_align {
            register & !1
        } else {
            register
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::time::TIME_MAX;

    const TICKS_PER_US: u32 = 63898;

    fn scheduler(placement: AntennaDelayPlacement) -> Scheduler {
        Scheduler::from_config(&RangingConfig {
            antenna_delay: 16385,
            antenna_delay_placement: placement,
            ..Default::default()
        })
    }

    fn ts(value: u64) -> Instant {
        Instant::new(value).unwrap()
    }

    #[test]
    fn register_drops_low_bits_and_aligns() {
        let scheduler = scheduler(AntennaDelayPlacement::Omitted);
        let reference = ts(1_000_000);

        let plan = scheduler
            .schedule_after(reference, 900, TICKS_PER_US, reference)
            .unwrap();

        let target = 1_000_000 + 900 * TICKS_PER_US as u64;
        assert_eq!(plan.register, ((target >> 8) as u32) & 0xFFFF_FFFE);
        assert_eq!(plan.start.value(), (plan.register as u64) << 8);
        assert_eq!(plan.planned_tx, plan.start);
        assert!(plan.start.value() <= target);
        assert!(target - plan.start.value() < 512);
    }

    #[test]
    fn antenna_delay_placements() {
        let reference = ts(0x12_3456_789a);
        let target = reference.value() + 900 * TICKS_PER_US as u64;
        let truncated = (target >> 9) << 9;

        let after = scheduler(AntennaDelayPlacement::AfterTruncation)
            .schedule_after(reference, 900, TICKS_PER_US, reference)
            .unwrap();
        assert_eq!(after.planned_tx.value(), truncated + 16385);

        let before = scheduler(AntennaDelayPlacement::BeforeTruncation)
            .schedule_after(reference, 900, TICKS_PER_US, reference)
            .unwrap();
        assert_eq!(before.planned_tx.value(), ((target + 16385) >> 9) << 9);
        assert_eq!(before.register, after.register);

        let omitted = scheduler(AntennaDelayPlacement::Omitted)
            .schedule_after(reference, 900, TICKS_PER_US, reference)
            .unwrap();
        assert_eq!(omitted.planned_tx.value(), truncated);
    }

    #[test]
    fn target_wraps_around() {
        let scheduler = scheduler(AntennaDelayPlacement::AfterTruncation);
        let reference = ts(TIME_MAX - 1000);

        let plan = scheduler
            .schedule_after(reference, 900, TICKS_PER_US, reference)
            .unwrap();

        let target = (reference.value() + 900 * TICKS_PER_US as u64) & TIME_MAX;
        assert_eq!(plan.start.value(), (target >> 9) << 9);
        assert!(plan.start.signed_offset_from(reference) > 0);
    }

    #[test]
    fn too_late_when_lead_below_minimum() {
        let scheduler = scheduler(AntennaDelayPlacement::AfterTruncation);
        let reference = ts(5_000_000);

        // Shorter than the 200 us minimum lead
        let result = scheduler.schedule_after(reference, 150, TICKS_PER_US, reference);
        assert!(matches!(result, Err(ScheduleError::TooLate { lead_ticks }) if lead_ticks > 0));

        // Long enough, but the reference is too far in the past
        let now = reference + Duration::from_micros(800, TICKS_PER_US).unwrap();
        let result = scheduler.schedule_after(reference, 900, TICKS_PER_US, now);
        assert!(matches!(result, Err(ScheduleError::TooLate { .. })));

        // Already passed
        let now = reference + Duration::from_micros(1_000, TICKS_PER_US).unwrap();
        let result = scheduler.schedule_after(reference, 900, TICKS_PER_US, now);
        assert!(matches!(result, Err(ScheduleError::TooLate { lead_ticks }) if lead_ticks < 0));
    }

    #[test]
    fn check_lead_after_planning() {
        let scheduler = scheduler(AntennaDelayPlacement::AfterTruncation);
        let reference = ts(0);

        let plan = scheduler
            .schedule_after(reference, 900, TICKS_PER_US, reference)
            .unwrap();

        let later = reference + Duration::from_micros(650, TICKS_PER_US).unwrap();
        assert_eq!(scheduler.check_lead(&plan, later), Ok(()));

        let too_late = reference + Duration::from_micros(750, TICKS_PER_US).unwrap();
        assert!(scheduler.check_lead(&plan, too_late).is_err());
    }

    #[test]
    fn delay_out_of_range() {
        let scheduler = scheduler(AntennaDelayPlacement::AfterTruncation);

        let result = scheduler.schedule_after(ts(0), u32::MAX, TICKS_PER_US, ts(0));
        assert_eq!(result, Err(ScheduleError::DelayOutOfRange));
    }
}
