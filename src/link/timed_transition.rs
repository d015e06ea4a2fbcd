//! Coordinated stage switches. One side announces a switch at a deadline and repeats the
//!  announcement with the remaining time, the other side acknowledges and switches at the
//!  deadline it computed from the announcement's arrival.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransitionOutcome {
    Pending,
    /// deadline reached with an acknowledgement
    Completed,
    /// deadline reached without an acknowledgement although requests went out
    Failed,
    /// no request could be sent at all, the announcement started over
    Restarted,
}

pub struct TransitionAnnouncer {
    duration_us: u64,
    deadline_us: u64,
    requests_sent: u32,
    ack_seen: bool,
}
impl TransitionAnnouncer {
    pub fn new(duration_us: u32) -> TransitionAnnouncer {
        TransitionAnnouncer {
            duration_us: duration_us as u64,
            deadline_us: 0,
            requests_sent: 0,
            ack_seen: false,
        }
    }

    pub fn start(&mut self, now: u64) {
        self.deadline_us = now + self.duration_us;
        self.requests_sent = 0;
        self.ack_seen = false;
    }

    pub fn deadline_us(&self) -> u64 {
        self.deadline_us
    }

    /// What to announce for a request whose first bit reaches the partner at `first_bit_us`,
    ///  `None` if that is at or after the deadline
    pub fn time_remaining(&self, first_bit_us: u64) -> Option<u32> {
        self.deadline_us.checked_sub(first_bit_us)
            .filter(|&remaining| remaining > 0)
            .map(|remaining| remaining.min(u32::MAX as u64) as u32)
    }

    pub fn on_request_sent(&mut self) {
        self.requests_sent += 1;
    }

    pub fn on_ack(&mut self) {
        self.ack_seen = true;
    }

    pub fn ack_seen(&self) -> bool {
        self.ack_seen
    }

    pub fn poll(&mut self, now: u64) -> TransitionOutcome {
        if now < self.deadline_us {
            TransitionOutcome::Pending
        }
        else if self.ack_seen {
            TransitionOutcome::Completed
        }
        else if self.requests_sent > 0 {
            TransitionOutcome::Failed
        }
        else {
            self.start(now);
            TransitionOutcome::Restarted
        }
    }
}

#[derive(Default)]
pub struct TransitionFollower {
    target_us: Option<u64>,
    ack_pending: bool,
}
impl TransitionFollower {
    pub fn new() -> TransitionFollower {
        TransitionFollower::default()
    }

    pub fn reset(&mut self) {
        self.target_us = None;
        self.ack_pending = false;
    }

    /// `rx_us` is the arrival of the request's first bit on the local timeline
    pub fn on_request(&mut self, rx_us: u64, time_remaining_us: u32) {
        self.target_us = Some(rx_us + time_remaining_us as u64);
        self.ack_pending = true;
    }

    pub fn target_us(&self) -> Option<u64> {
        self.target_us
    }

    pub fn is_ack_pending(&self) -> bool {
        self.ack_pending
    }

    pub fn on_ack_sent(&mut self) {
        self.ack_pending = false;
    }

    pub fn is_due(&self, now: u64) -> bool {
        self.target_us.is_some_and(|target| now >= target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_with_ack() {
        let mut announcer = TransitionAnnouncer::new(40_000);
        announcer.start(1_000);
        assert_eq!(announcer.time_remaining(11_000), Some(30_000));
        announcer.on_request_sent();
        announcer.on_ack();

        assert_eq!(announcer.poll(40_999), TransitionOutcome::Pending);
        assert_eq!(announcer.poll(41_000), TransitionOutcome::Completed);
    }

    #[test]
    fn test_no_request_restarts() {
        let mut announcer = TransitionAnnouncer::new(40_000);
        announcer.start(0);
        assert_eq!(announcer.time_remaining(40_000), None);

        assert_eq!(announcer.poll(40_000), TransitionOutcome::Restarted);
        assert_eq!(announcer.deadline_us(), 80_000);
        announcer.on_request_sent();
        assert_eq!(announcer.poll(80_000), TransitionOutcome::Failed);
    }

    #[test]
    fn test_follower_switches_with_announcer() {
        let mut announcer = TransitionAnnouncer::new(40_000);
        let mut follower = TransitionFollower::new();
        announcer.start(0);

        // request handed to the radio at 5000, first bit on air 200us later
        let remaining = announcer.time_remaining(5_200).unwrap();
        announcer.on_request_sent();
        follower.on_request(5_200, remaining);

        assert!(follower.is_ack_pending());
        follower.on_ack_sent();
        announcer.on_ack();

        assert!(!follower.is_due(39_999));
        assert_eq!(announcer.poll(39_999), TransitionOutcome::Pending);
        assert!(follower.is_due(40_000));
        assert_eq!(announcer.poll(40_000), TransitionOutcome::Completed);
    }
}
