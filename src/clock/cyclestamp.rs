use anyhow::bail;
use tracing::debug;

use crate::clock::source::ClockSource;
use crate::util::safe_converter::PrecheckedCast;

/// The raw counter must count through at least this many values before it wraps
pub const MIN_OVERFLOW_VALUE: u32 = 0xFF;
/// Overflows are only detected when [CycleTracker::observe] runs between two of them, so the
///  counter must not wrap faster than the scheduler can be expected to call back
pub const MIN_ROLLOVER_PERIOD_US: u64 = 32_000;

/// Overflow tracking on top of a raw [ClockSource]: turns raw readings into a 32-bit
///  'cyclestamp' that keeps counting across source overflows, wrapping only at 2^32.
///
/// Cyclestamps are only comparable through wrap-safe differences, see
///  [CycleTracker::duration_cyclestamp].
pub struct CycleTracker {
    overflow_value: u32,
    cycles_per_second: u32,
    overflows: u64,
    last_raw: u32,
}
impl CycleTracker {
    pub fn new() -> CycleTracker {
        CycleTracker {
            overflow_value: u32::MAX,
            cycles_per_second: 1_000_000,
            overflows: 0,
            last_raw: 0,
        }
    }

    pub fn setup(&mut self, source: &dyn ClockSource) -> anyhow::Result<()> {
        let cycles_per_second = source.cycles_per_second();
        let overflow_value = source.overflow_value();

        if cycles_per_second == 0 {
            bail!("clock source reports zero cycles per second");
        }
        if overflow_value < MIN_OVERFLOW_VALUE {
            bail!("clock source overflows at {} which is below the minimum of {}", overflow_value, MIN_OVERFLOW_VALUE);
        }
        let rollover_us = (overflow_value as u64 + 1) * 1_000_000 / cycles_per_second as u64;
        if rollover_us < MIN_ROLLOVER_PERIOD_US {
            bail!("clock source rolls over every {}us, the minimum is {}us", rollover_us, MIN_ROLLOVER_PERIOD_US);
        }

        self.overflow_value = overflow_value;
        self.cycles_per_second = cycles_per_second;
        self.overflows = 0;
        self.last_raw = source.raw_cycles();
        debug!("cycle tracker set up: {} cycles per second, rollover every {}us", cycles_per_second, rollover_us);
        Ok(())
    }

    pub fn cycles_per_second(&self) -> u32 {
        self.cycles_per_second
    }

    fn period_cycles(&self) -> u64 {
        self.overflow_value as u64 + 1
    }

    /// Registers a fresh raw reading, counting an overflow if the counter wrapped since the
    ///  previous one
    pub fn observe(&mut self, raw: u32) {
        if raw < self.last_raw {
            self.overflows = self.overflows.wrapping_add(1);
        }
        self.last_raw = raw;
    }

    /// Converts a current raw reading, counting a pending overflow if the counter wrapped since
    ///  the last observation
    pub fn cyclestamp_of_raw(&self, raw: u32) -> u32 {
        if self.overflow_value == u32::MAX {
            return raw;
        }

        let overflows = if raw < self.last_raw {
            self.overflows.wrapping_add(1)
        }
        else {
            self.overflows
        };
        overflows
            .wrapping_mul(self.period_cycles())
            .wrapping_add(raw as u64) as u32
    }

    /// Converts a raw value captured in the past (e.g. a receive timestamp), given the current
    ///  raw reading. The capture must be less than one overflow period old.
    pub fn cyclestamp_of_capture(&self, captured_raw: u32, now_raw: u32) -> u32 {
        let period = self.period_cycles();
        let age = (now_raw as u64 + period - captured_raw as u64) % period;
        self.cyclestamp_of_raw(now_raw).wrapping_sub(age as u32)
    }

    pub fn cyclestamp(&self, source: &dyn ClockSource) -> u32 {
        self.cyclestamp_of_raw(source.raw_cycles())
    }

    /// Wrap-safe cycle count from `start` to `end`
    pub fn duration_cyclestamp(start: u32, end: u32) -> u32 {
        end.wrapping_sub(start)
    }

    pub fn cycles_to_micros(&self, cycles: u32) -> u32 {
        let micros = cycles as u64 * 1_000_000 / self.cycles_per_second as u64;
        micros.min(u32::MAX as u64).prechecked_cast()
    }

    pub fn elapsed_duration(&self, source: &dyn ClockSource, start: u32) -> u32 {
        self.cycles_to_micros(Self::duration_cyclestamp(start, self.cyclestamp(source)))
    }

    /// Delay until just before the next source overflow, so that the caller can observe the
    ///  counter once per overflow period
    pub fn next_check_delay_us(&self, raw: u32) -> u32 {
        let period_us = self.period_cycles() * 1_000_000 / self.cycles_per_second as u64;
        let margin = period_us / 8;

        let cycles_to_overflow = self.period_cycles() - raw.min(self.overflow_value) as u64;
        let remaining_us = cycles_to_overflow * 1_000_000 / self.cycles_per_second as u64;

        let delay = if remaining_us > margin {
            remaining_us - margin
        }
        else {
            // we are already inside the margin: this overflow gets observed by the next call
            remaining_us + period_us - margin
        };
        delay.min(u32::MAX as u64).prechecked_cast()
    }
}

impl Default for CycleTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::source::MockClockSource;
    use rstest::rstest;

    fn source(overflow_value: u32, cycles_per_second: u32, raw: u32) -> MockClockSource {
        let mut source = MockClockSource::new();
        source.expect_overflow_value().return_const(overflow_value);
        source.expect_cycles_per_second().return_const(cycles_per_second);
        source.expect_raw_cycles().return_const(raw);
        source
    }

    #[rstest]
    #[case::forward(10, 25, 15)]
    #[case::same(7, 7, 0)]
    #[case::wrap(u32::MAX - 4, 5, 10)]
    #[case::wrap_from_max(u32::MAX, 0, 1)]
    #[case::full_wrap(1, 0, u32::MAX)]
    fn test_duration_cyclestamp(#[case] start: u32, #[case] end: u32, #[case] expected: u32) {
        assert_eq!(CycleTracker::duration_cyclestamp(start, end), expected);
        if end < start {
            assert_eq!(expected as u64, (1u64 << 32) - start as u64 + end as u64);
        }
    }

    #[rstest]
    #[case::zero_frequency(u32::MAX, 0, "zero cycles")]
    #[case::tiny_counter(0x7F, 1_000, "below the minimum")]
    #[case::fast_rollover(0xFFFF, 16_000_000, "rolls over")]
    fn test_setup_rejects(#[case] overflow_value: u32, #[case] cycles_per_second: u32, #[case] msg: &str) {
        let mut tracker = CycleTracker::new();
        let err = tracker.setup(&source(overflow_value, cycles_per_second, 0)).unwrap_err();
        assert!(err.to_string().contains(msg), "{}", err);
    }

    #[test]
    fn test_overflow_tracking() {
        // 16 bit counter at 1MHz: rolls over every 65.536ms
        let mut tracker = CycleTracker::new();
        tracker.setup(&source(0xFFFF, 1_000_000, 60_000)).unwrap();
        assert_eq!(tracker.cyclestamp_of_raw(61_000), 61_000);

        // wrapped, not yet observed
        assert_eq!(tracker.cyclestamp_of_raw(100), 65_636);

        tracker.observe(100);
        assert_eq!(tracker.cyclestamp_of_raw(200), 65_736);
        // captured shortly before the wrap that was just observed
        assert_eq!(tracker.cyclestamp_of_capture(65_000, 200), 65_000);
        assert_eq!(tracker.cyclestamp_of_capture(150, 200), 65_686);

        tracker.observe(40_000);
        tracker.observe(10);
        assert_eq!(tracker.cyclestamp_of_raw(10), 2 * 65_536 + 10);
    }

    #[test]
    fn test_full_width_counter_is_raw() {
        let mut tracker = CycleTracker::new();
        tracker.setup(&source(u32::MAX, 1_000_000, 5)).unwrap();
        tracker.observe(u32::MAX - 3);
        tracker.observe(2);
        assert_eq!(tracker.cyclestamp_of_raw(2), 2);
        assert_eq!(tracker.cyclestamp_of_raw(u32::MAX), u32::MAX);
    }

    #[test]
    fn test_elapsed_duration() {
        let mut tracker = CycleTracker::new();
        tracker.setup(&source(u32::MAX, 8_000_000, 80_000)).unwrap();
        assert_eq!(tracker.elapsed_duration(&source(u32::MAX, 8_000_000, 80_000), 8_000), 9_000);
        assert_eq!(tracker.cycles_to_micros(u32::MAX), 536_870_911);
    }

    #[rstest]
    #[case::early(0, 65_536 - 8_192)]
    #[case::mid(32_768, 32_768 - 8_192)]
    #[case::inside_margin(60_000, 5_536 + 65_536 - 8_192)]
    fn test_next_check_delay(#[case] raw: u32, #[case] expected: u32) {
        let mut tracker = CycleTracker::new();
        tracker.setup(&source(0xFFFF, 1_000_000, 0)).unwrap();
        assert_eq!(tracker.next_check_delay_us(raw), expected);
    }
}
