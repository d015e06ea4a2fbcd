use tracing::debug;

use crate::clock::timestamp::TimestampError;
use crate::clock_sync::ClockSyncState;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClockSyncPhase {
    Broad,
    Fine,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClockSyncRequest {
    pub phase: ClockSyncPhase,
    pub sequence: u8,
}

/// Requester side of the clock sync. Replies are matched by sequence number, so a late reply to
///  an earlier estimate never gets applied twice.
pub struct ClientClockSyncTracker {
    state: ClockSyncState,
    retry_period_us: u32,
    sequence: u8,
    awaiting_reply_since: Option<u64>,
    broad_requests: u32,
    fine_requests: u32,
}
impl ClientClockSyncTracker {
    pub fn new(retry_period_us: u32) -> ClientClockSyncTracker {
        ClientClockSyncTracker {
            state: ClockSyncState::WaitingForStart,
            retry_period_us,
            sequence: 0,
            awaiting_reply_since: None,
            broad_requests: 0,
            fine_requests: 0,
        }
    }

    pub fn reset(&mut self) {
        self.state = ClockSyncState::WaitingForStart;
        self.awaiting_reply_since = None;
        self.broad_requests = 0;
        self.fine_requests = 0;
    }

    pub fn state(&self) -> ClockSyncState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == ClockSyncState::FineAccepted
    }

    pub fn broad_requests(&self) -> u32 {
        self.broad_requests
    }

    pub fn fine_requests(&self) -> u32 {
        self.fine_requests
    }

    /// The request to send at `now_us`, if any: none once synced, and none while the previous
    ///  request may still be answered
    pub fn next_request(&self, now_us: u64) -> Option<ClockSyncRequest> {
        if let Some(since) = self.awaiting_reply_since {
            if now_us.saturating_sub(since) < self.retry_period_us as u64 {
                return None;
            }
        }

        let phase = match self.state {
            ClockSyncState::WaitingForStart | ClockSyncState::BroadStarted => ClockSyncPhase::Broad,
            ClockSyncState::BroadAccepted | ClockSyncState::FineStarted => ClockSyncPhase::Fine,
            ClockSyncState::FineAccepted => return None,
        };
        Some(ClockSyncRequest {
            phase,
            sequence: self.sequence.wrapping_add(1),
        })
    }

    /// Returns the time until [ClientClockSyncTracker::next_request] may yield a request again
    pub fn retry_delay_us(&self, now_us: u64) -> Option<u64> {
        if self.is_synced() {
            return None;
        }
        Some(match self.awaiting_reply_since {
            Some(since) => (since + self.retry_period_us as u64).saturating_sub(now_us),
            None => 0,
        })
    }

    pub fn on_request_sent(&mut self, request: ClockSyncRequest, now_us: u64) {
        self.sequence = request.sequence;
        self.awaiting_reply_since = Some(now_us);
        match request.phase {
            ClockSyncPhase::Broad => {
                self.broad_requests += 1;
                if self.state == ClockSyncState::WaitingForStart {
                    self.state = ClockSyncState::BroadStarted;
                }
            }
            ClockSyncPhase::Fine => {
                self.fine_requests += 1;
                if self.state == ClockSyncState::BroadAccepted {
                    self.state = ClockSyncState::FineStarted;
                }
            }
        }
    }

    fn is_current(&self, sequence: u8) -> bool {
        self.awaiting_reply_since.is_some() && sequence == self.sequence
    }

    /// Returns the correction (in microseconds) to apply to the local clock
    pub fn on_broad_reply(&mut self, sequence: u8, error: TimestampError, accepted: bool) -> Option<i64> {
        if !self.is_current(sequence) || self.state != ClockSyncState::BroadStarted {
            debug!("ignoring stale broad clock sync reply {}", sequence);
            return None;
        }
        self.awaiting_reply_since = None;
        if accepted {
            self.state = ClockSyncState::BroadAccepted;
        }
        Some(-error.to_micros())
    }

    pub fn on_fine_reply(&mut self, sequence: u8, error: TimestampError, accepted: bool) -> Option<i64> {
        if !self.is_current(sequence) || self.state != ClockSyncState::FineStarted {
            debug!("ignoring stale fine clock sync reply {}", sequence);
            return None;
        }
        self.awaiting_reply_since = None;
        if accepted {
            self.state = ClockSyncState::FineAccepted;
        }
        Some(-error.to_micros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(micros: i64) -> TimestampError {
        TimestampError::from_micros(micros)
    }

    #[test]
    fn test_full_negotiation() {
        let mut tracker = ClientClockSyncTracker::new(8_000);

        let request = tracker.next_request(0).unwrap();
        assert_eq!(request.phase, ClockSyncPhase::Broad);
        tracker.on_request_sent(request, 0);
        assert_eq!(tracker.next_request(1_000), None);

        assert_eq!(tracker.on_broad_reply(request.sequence, error(3_000_000), false), Some(-3_000_000));
        assert_eq!(tracker.state(), ClockSyncState::BroadStarted);

        let request = tracker.next_request(2_000).unwrap();
        assert_eq!(request.phase, ClockSyncPhase::Broad);
        tracker.on_request_sent(request, 2_000);
        assert_eq!(tracker.on_broad_reply(request.sequence, error(12), true), Some(-12));

        let request = tracker.next_request(4_000).unwrap();
        assert_eq!(request.phase, ClockSyncPhase::Fine);
        tracker.on_request_sent(request, 4_000);
        assert_eq!(tracker.on_fine_reply(request.sequence, error(-3), true), Some(3));

        assert!(tracker.is_synced());
        assert_eq!(tracker.next_request(100_000), None);
        assert_eq!(tracker.broad_requests(), 2);
        assert_eq!(tracker.fine_requests(), 1);
    }

    #[test]
    fn test_stale_reply_is_ignored() {
        let mut tracker = ClientClockSyncTracker::new(8_000);
        let first = tracker.next_request(0).unwrap();
        tracker.on_request_sent(first, 0);

        // no reply within the retry period: resend
        assert_eq!(tracker.retry_delay_us(5_000), Some(3_000));
        let second = tracker.next_request(8_000).unwrap();
        assert_ne!(first.sequence, second.sequence);
        tracker.on_request_sent(second, 8_000);

        assert_eq!(tracker.on_broad_reply(first.sequence, error(1_000_000), true), None);
        assert_eq!(tracker.on_broad_reply(second.sequence, error(1_000_000), true), Some(-1_000_000));
        // duplicate of the reply that was just applied
        assert_eq!(tracker.on_broad_reply(second.sequence, error(1_000_000), true), None);
    }

    #[test]
    fn test_fine_rejection_repeats_fine() {
        let mut tracker = ClientClockSyncTracker::new(8_000);
        let request = tracker.next_request(0).unwrap();
        tracker.on_request_sent(request, 0);
        tracker.on_broad_reply(request.sequence, error(0), true);

        let request = tracker.next_request(0).unwrap();
        tracker.on_request_sent(request, 0);
        assert_eq!(tracker.on_fine_reply(request.sequence, error(400), false), Some(-400));
        assert_eq!(tracker.state(), ClockSyncState::FineStarted);
        assert_eq!(tracker.next_request(0).unwrap().phase, ClockSyncPhase::Fine);
    }
}
