use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::crypto::primitives::HOP_SEED_SIZE;

/// Pseudo-random channel per hop slot, derived from the session's hop seed. Both partners share
///  seed and link time, so they hop in lockstep without any signaling.
pub struct ChannelHop {
    seed: [u8; HOP_SEED_SIZE],
    hop_period_us: u64,
    channel_count: u8,
}
impl ChannelHop {
    pub fn new(seed: [u8; HOP_SEED_SIZE], hop_period_us: u32, channel_count: u8) -> ChannelHop {
        ChannelHop {
            seed,
            hop_period_us: (hop_period_us as u64).max(1),
            channel_count: channel_count.max(1),
        }
    }

    pub fn slot(&self, link_us: u64) -> u64 {
        link_us / self.hop_period_us
    }

    pub fn channel_for_slot(&self, slot: u64) -> u8 {
        let mut rng = ChaCha8Rng::from_seed(self.seed);
        rng.set_stream(slot);
        (rng.next_u32() % self.channel_count as u32) as u8
    }

    pub fn channel_at(&self, link_us: u64) -> u8 {
        self.channel_for_slot(self.slot(link_us))
    }

    /// time from `link_us` until the next slot starts
    pub fn until_next_slot(&self, link_us: u64) -> u64 {
        self.hop_period_us - link_us % self.hop_period_us
    }
}
