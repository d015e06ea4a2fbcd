//! The link's notion of time, built from a raw cycle counter in layers:
//!
//! * [cyclestamp::CycleTracker] tracks source overflows
//! * the monotonic time base accumulates cycles into microseconds. It is never shifted and is
//!   used for every local deadline.
//! * a signed offset on top of the time base gives link time ([timestamp::Timestamp]), which is
//!   what the partners synchronize
//! * [tuner::ClockTuner] smears a drift correction into that offset

pub mod cyclestamp;
pub mod source;
pub mod timestamp;
pub mod tuner;

use tracing::{debug, trace};

use crate::clock::cyclestamp::CycleTracker;
use crate::clock::source::ClockSource;
use crate::clock::timestamp::{Timestamp, MICROS_PER_SECOND};
use crate::clock::tuner::ClockTuner;
use crate::util::safe_converter::PrecheckedCast;

pub struct LinkClock {
    source: Box<dyn ClockSource>,
    cycles: CycleTracker,
    running: bool,

    last_cyclestamp: u32,
    total_cycles: u64,

    offset_us: i64,
    tuner: ClockTuner,
}
impl LinkClock {
    pub fn new(source: Box<dyn ClockSource>, tune_tolerance_ppm: u32) -> LinkClock {
        LinkClock {
            source,
            cycles: CycleTracker::new(),
            running: false,
            last_cyclestamp: 0,
            total_cycles: 0,
            offset_us: 0,
            tuner: ClockTuner::new(tune_tolerance_ppm),
        }
    }

    pub fn setup(&mut self) -> anyhow::Result<()> {
        self.cycles.setup(self.source.as_ref())?;
        self.last_cyclestamp = self.cycles.cyclestamp(self.source.as_ref());
        // the time base starts at the source's current reading rather than at zero
        self.total_cycles = self.last_cyclestamp as u64;
        Ok(())
    }

    pub fn start(&mut self) {
        if !self.running {
            self.source.start();
            self.running = true;
        }
    }

    pub fn stop(&mut self) {
        if self.running {
            self.source.stop();
            self.running = false;
        }
    }

    pub fn cyclestamp(&self) -> u32 {
        self.cycles.cyclestamp(self.source.as_ref())
    }

    pub fn elapsed_duration(&self, start_cyclestamp: u32) -> u32 {
        self.cycles.elapsed_duration(self.source.as_ref(), start_cyclestamp)
    }

    /// nanosecond resolution for measuring short operations
    pub fn elapsed_nanos(&self, start_cyclestamp: u32) -> u64 {
        let cycles = CycleTracker::duration_cyclestamp(start_cyclestamp, self.cyclestamp());
        (cycles as u128 * 1_000_000_000 / self.cycles.cycles_per_second() as u128) as u64
    }

    fn cycles_to_micros(&self, cycles: u64) -> u64 {
        let micros = cycles as u128 * MICROS_PER_SECOND as u128 / self.cycles.cycles_per_second() as u128;
        micros.min(u64::MAX as u128) as u64
    }

    fn update(&mut self) -> u32 {
        let raw = self.source.raw_cycles();
        self.cycles.observe(raw);
        let cyclestamp = self.cycles.cyclestamp_of_raw(raw);
        self.total_cycles += CycleTracker::duration_cyclestamp(self.last_cyclestamp, cyclestamp) as u64;
        self.last_cyclestamp = cyclestamp;
        raw
    }

    /// microseconds on the local, never-adjusted timeline
    pub fn monotonic_us(&self) -> u64 {
        let cyclestamp = self.cycles.cyclestamp(self.source.as_ref());
        let delta = CycleTracker::duration_cyclestamp(self.last_cyclestamp, cyclestamp);
        self.cycles_to_micros(self.total_cycles + delta as u64)
    }

    /// Converts a raw reading captured in the recent past to the monotonic timeline
    pub fn monotonic_at_raw(&self, raw: u32) -> u64 {
        let cyclestamp = self.cycles.cyclestamp_of_capture(raw, self.source.raw_cycles());
        let delta = cyclestamp.wrapping_sub(self.last_cyclestamp) as i32;
        let cycles = self.total_cycles.saturating_add_signed(delta as i64);
        self.cycles_to_micros(cycles)
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp_at_monotonic(self.monotonic_us())
    }

    pub fn timestamp_at_monotonic(&self, monotonic_us: u64) -> Timestamp {
        Timestamp::from_micros(monotonic_us as i64 + self.offset_us)
    }

    pub fn timestamp_at_raw(&self, raw: u32) -> Timestamp {
        self.timestamp_at_monotonic(self.monotonic_at_raw(raw))
    }

    pub fn shift_seconds(&mut self, seconds: i32) {
        debug!("shifting link clock by {}s", seconds);
        self.offset_us += seconds as i64 * MICROS_PER_SECOND as i64;
    }

    pub fn shift_sub_seconds(&mut self, micros: i64) {
        trace!("shifting link clock by {}us", micros);
        self.offset_us += micros;
    }

    pub fn tune_ppm(&self) -> i32 {
        self.tuner.tune_ppm()
    }

    pub fn set_tune(&mut self, tune_ppm: i32) -> i32 {
        let now = self.monotonic_us();
        self.tuner.set_tune(tune_ppm, now)
    }

    /// Periodic housekeeping: observes the source for overflows and applies due tune steps.
    ///  Returns the delay in microseconds after which this must run again.
    pub fn run_check(&mut self) -> u32 {
        let raw = self.update();
        let now = self.monotonic_us();
        self.offset_us += self.tuner.advance(now);

        let check_delay = self.cycles.next_check_delay_us(raw);
        match self.tuner.next_step_delay_us(now) {
            Some(step_delay) => check_delay.min(step_delay.min(u32::MAX as u64).prechecked_cast()),
            None => check_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::clock::source::MockClockSource;

    fn clock(overflow_value: u32, cycles_per_second: u32) -> (LinkClock, Arc<AtomicU32>) {
        let raw = Arc::new(AtomicU32::new(0));
        let mut source = MockClockSource::new();
        source.expect_overflow_value().return_const(overflow_value);
        source.expect_cycles_per_second().return_const(cycles_per_second);
        source.expect_start().return_const(());
        source.expect_stop().return_const(());
        let raw_in_source = raw.clone();
        source.expect_raw_cycles().returning(move || raw_in_source.load(Ordering::SeqCst));

        let mut clock = LinkClock::new(Box::new(source), 25);
        clock.setup().unwrap();
        (clock, raw)
    }

    #[test]
    fn test_monotonic_across_overflows() {
        let (mut clock, raw) = clock(0xFFFF, 1_000_000);

        let mut expected = 0u64;
        let mut prev = clock.monotonic_us();
        for _ in 0..10 {
            let step = clock.run_check().min(40_000);
            expected += step as u64;
            raw.store((expected % 65_536) as u32, Ordering::SeqCst);

            let now = clock.monotonic_us();
            assert!(now >= prev);
            assert_eq!(now, expected);
            prev = now;
        }
    }

    #[test]
    fn test_raw_capture_before_last_observation() {
        let (mut clock, raw) = clock(u32::MAX, 2_000_000);
        raw.store(2_000_000, Ordering::SeqCst);
        clock.run_check();
        raw.store(2_000_400, Ordering::SeqCst);

        assert_eq!(clock.monotonic_us(), 1_000_200);
        assert_eq!(clock.monotonic_at_raw(1_999_000), 999_500);
        assert_eq!(clock.monotonic_at_raw(2_000_400), 1_000_200);
    }

    #[test]
    fn test_offset_leaves_monotonic_untouched() {
        let (mut clock, raw) = clock(u32::MAX, 1_000_000);
        raw.store(1_500_000, Ordering::SeqCst);

        clock.shift_seconds(3);
        clock.shift_sub_seconds(-600_000);

        assert_eq!(clock.monotonic_us(), 1_500_000);
        assert_eq!(clock.timestamp(), Timestamp { seconds: 3, sub_seconds: 900_000 });
        assert_eq!(clock.timestamp_at_raw(1_000_000), Timestamp { seconds: 3, sub_seconds: 400_000 });
    }

    #[test]
    fn test_tune_is_smeared() {
        let (mut clock, raw) = clock(u32::MAX, 1_000_000);
        clock.set_tune(-10);

        let mut now = 0u32;
        while now < 1_000_000 {
            now += clock.run_check().min(30_000);
            raw.store(now, Ordering::SeqCst);
        }
        clock.run_check();

        let micros = clock.timestamp().to_micros() as i64;
        assert_eq!(micros - clock.monotonic_us() as i64, -10);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let (mut clock, _) = clock(u32::MAX, 1_000_000);
        clock.start();
        clock.start();
        clock.stop();
        clock.stop();
    }
}
