/// Smears a drift correction into the clock: every `1_000_000 / |ppm|` microseconds the offset
///  moves by one microsecond in the direction of the tune, so that a tune of +10 ppm makes the
///  clock gain 10us per second.
pub struct ClockTuner {
    tolerance_ppm: i32,
    tune_ppm: i32,
    last_step_us: u64,
}
impl ClockTuner {
    pub fn new(tolerance_ppm: u32) -> ClockTuner {
        ClockTuner {
            tolerance_ppm: tolerance_ppm.min(i32::MAX as u32) as i32,
            tune_ppm: 0,
            last_step_us: 0,
        }
    }

    pub fn tune_ppm(&self) -> i32 {
        self.tune_ppm
    }

    /// Sets the drift correction, clamped to the configured tolerance. Returns the effective tune.
    pub fn set_tune(&mut self, tune_ppm: i32, now_us: u64) -> i32 {
        self.tune_ppm = tune_ppm.clamp(-self.tolerance_ppm, self.tolerance_ppm);
        self.last_step_us = now_us;
        self.tune_ppm
    }

    fn step_period_us(&self) -> Option<u64> {
        match self.tune_ppm.unsigned_abs() {
            0 => None,
            ppm => Some(1_000_000 / ppm as u64),
        }
    }

    /// Returns the number of microseconds to add to the clock offset for the steps that became due
    ///  up to `now_us`, catching up if calls were late
    pub fn advance(&mut self, now_us: u64) -> i64 {
        let Some(period) = self.step_period_us() else {
            self.last_step_us = now_us;
            return 0;
        };

        let steps = now_us.saturating_sub(self.last_step_us) / period;
        self.last_step_us += steps * period;
        steps as i64 * self.tune_ppm.signum() as i64
    }

    /// Time until the next step is due, `None` while no tune is set
    pub fn next_step_delay_us(&self, now_us: u64) -> Option<u64> {
        self.step_period_us()
            .map(|period| (self.last_step_us + period).saturating_sub(now_us))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::idle(0, 5_000_000, 0)]
    #[case::gain(10, 1_000_000, 10)]
    #[case::lose(-4, 1_000_000, -4)]
    #[case::partial(10, 250_000, 2)]
    #[case::clamped(100, 1_000_000, 25)]
    #[case::clamped_negative(-100, 2_000_000, -50)]
    fn test_advance(#[case] tune: i32, #[case] elapsed: u64, #[case] expected: i64) {
        let mut tuner = ClockTuner::new(25);
        tuner.set_tune(tune, 1_000);
        assert_eq!(tuner.advance(1_000 + elapsed), expected);
    }

    #[test]
    fn test_steps_are_not_lost_between_calls() {
        let mut tuner = ClockTuner::new(25);
        tuner.set_tune(20, 0);
        let mut total = 0;
        for t in (0..=1_000_000).step_by(30_000) {
            total += tuner.advance(t);
        }
        // last call at 990_000: 19 full periods of 50_000us
        assert_eq!(total, 19);
        assert_eq!(tuner.next_step_delay_us(990_000), Some(10_000));
    }

    #[test]
    fn test_no_delay_without_tune() {
        let tuner = ClockTuner::new(25);
        assert_eq!(tuner.next_step_delay_us(17), None);
    }
}
