//! Two-phase clock offset negotiation. The server's clock is the reference: the client proposes
//!  estimates of the server's time, first to the second (broad) and then to the microsecond
//!  (fine), and corrects its own clock by the error the server reports.
//!
//! Once linked, [quality::ClockErrorTracker] and [quality::DriftFilter] keep the client's clock
//!  tuned.

pub mod client_tracker;
pub mod quality;
pub mod server_tracker;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClockSyncState {
    WaitingForStart,
    BroadStarted,
    BroadAccepted,
    FineStarted,
    FineAccepted,
}
