use tracing::debug;

use crate::clock::timestamp::{Timestamp, TimestampError};
use crate::clock_sync::ClockSyncState;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClockSyncVerdict {
    pub error: TimestampError,
    pub accepted: bool,
}

/// Judges the client's estimates against the server's own clock
pub struct ServerClockSyncTracker {
    state: ClockSyncState,
    broad_tolerance_seconds: u32,
    fine_tolerance_us: u32,
}
impl ServerClockSyncTracker {
    pub fn new(broad_tolerance_seconds: u32, fine_tolerance_us: u32) -> ServerClockSyncTracker {
        ServerClockSyncTracker {
            state: ClockSyncState::WaitingForStart,
            broad_tolerance_seconds,
            fine_tolerance_us,
        }
    }

    pub fn state(&self) -> ClockSyncState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == ClockSyncState::FineAccepted
    }

    pub fn reset(&mut self) {
        self.state = ClockSyncState::WaitingForStart;
    }

    /// `truth` is the server's link time at the moment the request's first bit arrived
    pub fn on_broad_request(&mut self, estimate: &Timestamp, truth: &Timestamp) -> ClockSyncVerdict {
        let error = estimate.error_to(truth);
        let accepted = error.to_micros().unsigned_abs() <= self.broad_tolerance_seconds as u64 * 1_000_000;

        // a repeated broad request after acceptance means the client missed our reply
        match (self.state, accepted) {
            (ClockSyncState::FineStarted | ClockSyncState::FineAccepted, _) => {}
            (_, true) => self.state = ClockSyncState::BroadAccepted,
            (_, false) => self.state = ClockSyncState::BroadStarted,
        }
        debug!("broad clock sync request: error {:?}, accepted: {}", error, accepted);
        ClockSyncVerdict { error, accepted }
    }

    pub fn on_fine_request(&mut self, estimate: &Timestamp, truth: &Timestamp) -> ClockSyncVerdict {
        let error = estimate.error_to(truth);

        let accepted = match self.state {
            ClockSyncState::WaitingForStart | ClockSyncState::BroadStarted => false,
            _ => error.to_micros().unsigned_abs() <= self.fine_tolerance_us as u64,
        };

        if accepted {
            self.state = ClockSyncState::FineAccepted;
        }
        else if self.state != ClockSyncState::WaitingForStart && self.state != ClockSyncState::BroadStarted {
            self.state = ClockSyncState::FineStarted;
        }
        debug!("fine clock sync request: error {:?}, accepted: {}", error, accepted);
        ClockSyncVerdict { error, accepted }
    }
}
