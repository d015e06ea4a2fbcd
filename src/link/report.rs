use crate::packet::linked::ReportData;

/// Periodic link reports. A report carries the local view of the link (RSSI, last accepted
///  counter) and asks for a reply when the partner has been silent for longer than two periods.
pub struct ReportTracker {
    period_us: u64,
    last_sent_us: u64,
    last_partner_rx_us: u64,
    reply_requested: bool,
    partner_rssi: Option<i8>,
}
impl ReportTracker {
    pub fn new(period_us: u32) -> ReportTracker {
        ReportTracker {
            period_us: period_us as u64,
            last_sent_us: 0,
            last_partner_rx_us: 0,
            reply_requested: false,
            partner_rssi: None,
        }
    }

    pub fn reset(&mut self, now: u64) {
        self.last_sent_us = now;
        self.last_partner_rx_us = now;
        self.reply_requested = false;
        self.partner_rssi = None;
    }

    pub fn on_partner_activity(&mut self, now: u64) {
        self.last_partner_rx_us = self.last_partner_rx_us.max(now);
    }

    pub fn partner_rssi(&self) -> Option<i8> {
        self.partner_rssi
    }

    pub fn is_report_due(&self, now: u64) -> bool {
        self.reply_requested || now >= self.last_sent_us + self.period_us
    }

    pub fn report_delay(&self, now: u64) -> u64 {
        if self.reply_requested {
            0
        }
        else {
            (self.last_sent_us + self.period_us).saturating_sub(now)
        }
    }

    pub fn build(&self, now: u64, rssi: i8, receive_counter: u16) -> ReportData {
        ReportData {
            rssi,
            receive_counter,
            request_reply: now.saturating_sub(self.last_partner_rx_us) > 2 * self.period_us,
        }
    }

    pub fn on_report_sent(&mut self, now: u64) {
        self.last_sent_us = now;
        self.reply_requested = false;
    }

    /// Processes the partner's report. A receive counter at or ahead of `next_send_counter`
    ///  means the partner saw counters this side has not sent yet in its view, so sending
    ///  continues after them. Returns whether the counter was moved.
    pub fn on_report_received(&mut self, report: &ReportData, next_send_counter: &mut u16) -> bool {
        self.partner_rssi = Some(report.rssi);
        if report.request_reply {
            self.reply_requested = true;
        }

        if report.receive_counter.wrapping_sub(*next_send_counter) as i16 >= 0 {
            *next_send_counter = report.receive_counter.wrapping_add(1);
            true
        }
        else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_periodic() {
        let mut tracker = ReportTracker::new(50_000);
        tracker.reset(1_000);

        assert!(!tracker.is_report_due(50_999));
        assert_eq!(tracker.report_delay(50_999), 1);
        assert!(tracker.is_report_due(51_000));

        tracker.on_report_sent(51_000);
        assert_eq!(tracker.report_delay(51_000), 50_000);
    }

    #[test]
    fn test_silent_partner_is_asked_for_a_reply() {
        let mut tracker = ReportTracker::new(50_000);
        tracker.reset(0);
        tracker.on_partner_activity(10_000);

        assert!(!tracker.build(110_000, -50, 3).request_reply);
        assert!(tracker.build(110_001, -50, 3).request_reply);
    }

    #[test]
    fn test_reply_request_makes_report_due() {
        let mut tracker = ReportTracker::new(50_000);
        tracker.reset(0);
        let mut counter = 10;
        tracker.on_report_received(&ReportData { rssi: -70, receive_counter: 5, request_reply: true }, &mut counter);

        assert!(tracker.is_report_due(1));
        assert_eq!(tracker.partner_rssi(), Some(-70));
        tracker.on_report_sent(1);
        assert!(!tracker.is_report_due(2));
    }

    #[rstest]
    #[case::behind(100, 99, false, 100)]
    #[case::equal(100, 100, true, 101)]
    #[case::ahead(100, 5_000, true, 5_001)]
    #[case::wrapped(u16::MAX, 1, true, 2)]
    fn test_counter_fast_forward(#[case] next: u16, #[case] received: u16, #[case] moved: bool, #[case] expected: u16) {
        let mut tracker = ReportTracker::new(50_000);
        let mut counter = next;
        let report = ReportData { rssi: 0, receive_counter: received, request_reply: false };
        assert_eq!(tracker.on_report_received(&report, &mut counter), moved);
        assert_eq!(counter, expected);
    }
}
