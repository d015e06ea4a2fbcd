//! A point-to-point radio link between one server and one client: pairing, authentication,
//!  clock synchronization and an encrypted, channel-hopping, half-duplex link on top of a
//!  transceiver that only knows how to send and receive short packets.
//!
//! ```ascii
//!  application  ──request_send──▶ ┌────────────┐ ──on_packet_received──▶ application
//!                                 │ LinkEngine │
//!  scheduler ──tick()──────────▶  │  (link)    │ ◀──on_rx / on_tx_done── transceiver
//!                                 └────────────┘
//!                                  │    │    │
//!                        crypto ◀──┘    │    └──▶ clock_sync
//!                   (LinkSession)     clock          (trackers)
//! ```
//!
//! [driver::LinkDriver] runs an engine on tokio. [test_util] has a virtual radio medium and a
//!  simulation loop for running two engines against each other.

pub mod clock;
pub mod clock_sync;
pub mod config;
pub mod crypto;
pub mod driver;
pub mod link;
pub mod packet;
pub mod test_util;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
