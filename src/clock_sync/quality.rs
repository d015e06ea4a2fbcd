use crate::util::rolling_data::RollingData;

pub const ERROR_WINDOW: usize = 4;
/// an estimate needs at least this many samples
pub const MIN_SAMPLES: usize = 3;

/// Tracks the clock errors the server reports for the client's periodic tune requests.
///
/// The estimate is the window mean, unless the samples disagree by more than the deviation
///  threshold: then the sample with the smallest magnitude is used, so that a single outlier
///  does not drag the clock around.
pub struct ClockErrorTracker {
    samples: RollingData<ERROR_WINDOW>,
    average_magnitude_us: Option<u32>,
    deviation_threshold_us: u32,
    quality_reference_us: u32,
}
impl ClockErrorTracker {
    pub fn new(deviation_threshold_us: u32, quality_reference_us: u32) -> ClockErrorTracker {
        ClockErrorTracker {
            samples: RollingData::new(),
            average_magnitude_us: None,
            deviation_threshold_us,
            quality_reference_us: quality_reference_us.max(1),
        }
    }

    pub fn add_sample(&mut self, error_us: i32) {
        self.samples.add_value(error_us);

        let magnitude = error_us.unsigned_abs();
        self.average_magnitude_us = Some(match self.average_magnitude_us {
            None => magnitude,
            Some(avg) => ((avg as u64 * 3 + magnitude as u64) / 4) as u32,
        });
    }

    pub fn estimate(&self) -> Option<i32> {
        if self.samples.len() < MIN_SAMPLES {
            return None;
        }
        if self.samples.std_dev() > self.deviation_threshold_us as f64 {
            self.samples.best()
        }
        else {
            Some(self.samples.mean())
        }
    }

    /// 255 for a perfect clock, 0 at or beyond the reference error
    pub fn quality(&self) -> u8 {
        match self.average_magnitude_us {
            None => 0,
            Some(avg) if avg >= self.quality_reference_us => 0,
            Some(avg) => (255 - avg as u64 * 255 / self.quality_reference_us as u64) as u8,
        }
    }

    /// starts a fresh window after a correction was applied, keeping the quality history
    pub fn clear_samples(&mut self) {
        self.samples.clear();
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.average_magnitude_us = None;
    }
}


/// Low-pass filter turning one-shot clock corrections into a drift tune (in ppm)
pub struct DriftFilter {
    tolerance_ppm: i32,
    tune_ppm: i32,
    last_correction_us: Option<u64>,
}
impl DriftFilter {
    pub fn new(tolerance_ppm: u32) -> DriftFilter {
        DriftFilter {
            tolerance_ppm: tolerance_ppm.min(i32::MAX as u32) as i32,
            tune_ppm: 0,
            last_correction_us: None,
        }
    }

    pub fn tune_ppm(&self) -> i32 {
        self.tune_ppm
    }

    /// Registers a correction applied at `now_us` (monotonic) and returns the updated tune
    pub fn on_correction(&mut self, correction_us: i64, now_us: u64) -> i32 {
        if let Some(last) = self.last_correction_us {
            let elapsed = now_us.saturating_sub(last);
            if elapsed > 0 {
                let drift_ppm = correction_us * 1_000_000 / elapsed as i64;
                let target = self.tune_ppm as i64 + drift_ppm;
                let filtered = (self.tune_ppm as i64 * 3 + target) / 4;
                self.tune_ppm = filtered.clamp(-self.tolerance_ppm as i64, self.tolerance_ppm as i64) as i32;
            }
        }
        self.last_correction_us = Some(now_us);
        self.tune_ppm
    }

    pub fn reset(&mut self) {
        self.tune_ppm = 0;
        self.last_correction_us = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::too_few(vec![10, 12], None)]
    #[case::agreeing(vec![10, 12, 8], Some(10))]
    #[case::outliers(vec![5, 300, -290], Some(5))]
    #[case::window_slides(vec![400, -400, 20, 22, 24, 26], Some(23))]
    fn test_estimate(#[case] samples: Vec<i32>, #[case] expected: Option<i32>) {
        let mut tracker = ClockErrorTracker::new(50, 200);
        for s in samples {
            tracker.add_sample(s);
        }
        assert_eq!(tracker.estimate(), expected);
    }

    #[rstest]
    #[case::none(vec![], 0)]
    #[case::perfect(vec![0, 0], 255)]
    #[case::half(vec![100], 128)]
    #[case::bad(vec![-250], 0)]
    #[case::recovering(vec![200, 0, 0], 113)]
    fn test_quality(#[case] samples: Vec<i32>, #[case] expected: u8) {
        let mut tracker = ClockErrorTracker::new(50, 200);
        for s in samples {
            tracker.add_sample(s);
        }
        assert_eq!(tracker.quality(), expected);
    }

    #[test]
    fn test_clear_keeps_quality() {
        let mut tracker = ClockErrorTracker::new(50, 200);
        for s in [1, 2, 3] {
            tracker.add_sample(s);
        }
        tracker.clear_samples();
        assert_eq!(tracker.estimate(), None);
        assert!(tracker.quality() > 250);

        tracker.reset();
        assert_eq!(tracker.quality(), 0);
    }

    #[test]
    fn test_drift_filter_follows_corrections() {
        let mut filter = DriftFilter::new(25);
        assert_eq!(filter.on_correction(-10, 1_000_000), 0);
        assert_eq!(filter.on_correction(-10, 2_000_000), -2);
        assert_eq!(filter.on_correction(-10, 3_000_000), -4);

        filter.reset();
        filter.on_correction(0, 0);
        // 1000us in one second is far beyond the tolerance
        assert_eq!(filter.on_correction(1_000, 1_000_000), 25);
    }
}
