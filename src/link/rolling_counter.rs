use anyhow::bail;

/// Replay protection for the partner's rolling counter: a counter is accepted if it is ahead of
///  the last accepted one by at least one and at most `tolerance`, with the difference taken as
///  a signed 16 bit value.
pub struct RollingCounterTracker {
    last_accepted: Option<u16>,
    tolerance: u16,
}
impl RollingCounterTracker {
    pub fn new(tolerance: u16) -> RollingCounterTracker {
        RollingCounterTracker {
            last_accepted: None,
            tolerance: tolerance.min(i16::MAX as u16),
        }
    }

    pub fn reset(&mut self) {
        self.last_accepted = None;
    }

    pub fn last_accepted(&self) -> Option<u16> {
        self.last_accepted
    }

    /// Returns the number of counter values that were skipped, i.e. packets presumably lost
    pub fn accept(&mut self, counter: u16) -> anyhow::Result<u16> {
        let Some(last) = self.last_accepted else {
            self.last_accepted = Some(counter);
            return Ok(0);
        };

        let delta = counter.wrapping_sub(last) as i16;
        if delta <= 0 || delta as u16 > self.tolerance {
            bail!("counter {} outside the receive window after {}", counter, last);
        }
        self.last_accepted = Some(counter);
        Ok(delta as u16 - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::next(1000, 1001, Some(0))]
    #[case::skipped(1000, 1005, Some(4))]
    #[case::window_end(1000, 1000 + 32767, Some(32766))]
    #[case::wrap(u16::MAX, 2, Some(2))]
    #[case::replay(1000, 1000, None)]
    #[case::behind(1000, 999, None)]
    #[case::far_behind(1000, 1000u16.wrapping_sub(32767), None)]
    #[case::half_ring(1000, 1000 + 32768, None)]
    fn test_window(#[case] accepted: u16, #[case] counter: u16, #[case] expected_lost: Option<u16>) {
        let mut tracker = RollingCounterTracker::new(32767);
        assert_eq!(tracker.accept(accepted).unwrap(), 0);

        match expected_lost {
            Some(lost) => {
                assert_eq!(tracker.accept(counter).unwrap(), lost);
                assert_eq!(tracker.last_accepted(), Some(counter));
            }
            None => {
                assert!(tracker.accept(counter).is_err());
                assert_eq!(tracker.last_accepted(), Some(accepted));
            }
        }
    }

    #[test]
    fn test_narrow_tolerance() {
        let mut tracker = RollingCounterTracker::new(10);
        tracker.accept(0).unwrap();
        assert!(tracker.accept(11).is_err());
        assert_eq!(tracker.accept(10).unwrap(), 9);

        tracker.reset();
        assert_eq!(tracker.accept(500).unwrap(), 0);
    }
}
