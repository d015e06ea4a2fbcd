/// Half-duplex slot arithmetic on a microsecond timeline. The own half of each period starts at
///  `origin + k * period` and lasts half a period, the partner transmits in the other half.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DuplexSchedule {
    period_us: u64,
    origin_us: u64,
}
impl DuplexSchedule {
    pub fn new(period_us: u32, origin_us: u64) -> DuplexSchedule {
        let period_us = (period_us as u64).max(2);
        DuplexSchedule {
            period_us,
            origin_us: origin_us % period_us,
        }
    }

    pub fn period_us(&self) -> u64 {
        self.period_us
    }

    pub fn half_us(&self) -> u64 {
        self.period_us / 2
    }

    /// Only the origin's position within a period matters, so slot indices stay stable when
    ///  the origin is re-aligned by a small amount
    pub fn set_origin(&mut self, origin_us: u64) {
        self.origin_us = origin_us % self.period_us;
    }

    pub fn slot_index(&self, t: u64) -> i64 {
        (t as i64 - self.origin_us as i64).div_euclid(self.period_us as i64)
    }

    pub fn phase(&self, t: u64) -> u64 {
        (t as i64 - self.origin_us as i64).rem_euclid(self.period_us as i64) as u64
    }

    pub fn is_own_half(&self, t: u64) -> bool {
        self.phase(t) < self.half_us()
    }

    /// whether a packet occupying `airtime_us` fits into the rest of the own half
    pub fn can_send(&self, t: u64, airtime_us: u32) -> bool {
        self.is_own_half(t) && self.phase(t) + airtime_us as u64 <= self.half_us()
    }

    /// time until the next own half starts
    pub fn next_own_half_delay(&self, t: u64) -> u64 {
        self.period_us - self.phase(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::start(10_000, true, 2_000)]
    #[case::own_half(10_400, true, 1_600)]
    #[case::partner_half(11_000, false, 1_000)]
    #[case::before_origin(9_999, false, 1)]
    fn test_halves(#[case] t: u64, #[case] own: bool, #[case] next: u64) {
        let schedule = DuplexSchedule::new(2_000, 12_000);
        assert_eq!(schedule.is_own_half(t), own);
        assert_eq!(schedule.next_own_half_delay(t), next);
    }

    #[test]
    fn test_can_send_checks_airtime() {
        let schedule = DuplexSchedule::new(2_000, 0);
        assert!(schedule.can_send(0, 1_000));
        assert!(schedule.can_send(200, 800));
        assert!(!schedule.can_send(200, 801));
        assert!(!schedule.can_send(1_200, 10));
    }

    #[test]
    fn test_realigned_origin_keeps_slot_index() {
        let mut schedule = DuplexSchedule::new(2_000, 1_000);
        let before = schedule.slot_index(51_500);
        schedule.set_origin(48_990);
        assert_eq!(schedule.slot_index(51_500), before);
        assert_eq!(schedule.slot_index(0), -1);
    }
}
