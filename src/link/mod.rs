//! The link state machine. Both roles walk through the same stages:
//!
//! ```ascii
//! Disabled -> Booting -> AwaitingLink -> Pairing -> SwitchingToLinking -> Authenticating
//!                             ^                                                  |
//!                             |                                                  v
//!                             +--- (timeouts, failures) --- Linked <- SwitchingToLinked <- ClockSyncing
//! ```
//!
//! Every transmission happens in the sender's half of a duplex period. Before the link exists
//!  the server's advertisements define the period's phase; once linked, the halves are fixed on
//!  the shared link time and the channel hops with it.

pub mod calibration;
pub mod channel_hop;
mod client;
pub mod duplex;
pub mod engine;
pub mod report;
pub mod rolling_counter;
pub mod send_scheduler;
mod server;
pub mod timed_transition;
pub mod transceiver;

use crate::clock::timestamp::Timestamp;
use crate::crypto::LinkRole;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LinkStage {
    #[default]
    Disabled,
    Booting,
    AwaitingLink,
    Pairing,
    SwitchingToLinking,
    Authenticating,
    ClockSyncing,
    SwitchingToLinked,
    Linked,
}
impl LinkStage {
    /// stages between the switch to linking and the link itself, bounded by the linking timeout
    pub fn is_linking(self) -> bool {
        matches!(self,
            LinkStage::SwitchingToLinking |
            LinkStage::Authenticating |
            LinkStage::ClockSyncing |
            LinkStage::SwitchingToLinked
        )
    }
}

/// Application callbacks
#[cfg_attr(test, mockall::automock)]
pub trait LinkListener: Send {
    fn on_link_stage_changed(&mut self, stage: LinkStage);

    /// a user packet, with the link time at which its first bit arrived
    fn on_packet_received(&mut self, port: u8, payload: &[u8], timestamp: Timestamp);
}

/// Snapshot of the link's state and counters
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkStatus {
    pub stage: LinkStage,
    pub role: LinkRole,
    /// monotonic microseconds when the current link was established
    pub linked_since_us: Option<u64>,

    pub tx_count: u32,
    pub rx_count: u32,
    pub lost_count: u32,
    pub rejected_count: u32,
    pub rx_lost_notifications: u32,

    pub last_rssi: Option<i8>,
    pub partner_rssi: Option<i8>,
    /// share of the partner's packets received on the current link, 0 to 255
    pub receive_quality: u8,
    /// 255 for a perfectly synchronized clock, see [crate::clock_sync::quality::ClockErrorTracker]
    pub clock_quality: u8,
    pub tune_ppm: i32,

    pub failed_link_attempts: u32,
    pub link_losses: u32,
    pub broad_sync_requests: u32,
}
impl LinkStatus {
    pub fn new(role: LinkRole) -> LinkStatus {
        LinkStatus {
            stage: LinkStage::Disabled,
            role,
            linked_since_us: None,
            tx_count: 0,
            rx_count: 0,
            lost_count: 0,
            rejected_count: 0,
            rx_lost_notifications: 0,
            last_rssi: None,
            partner_rssi: None,
            receive_quality: 0,
            clock_quality: 0,
            tune_ppm: 0,
            failed_link_attempts: 0,
            link_losses: 0,
            broad_sync_requests: 0,
        }
    }
}
