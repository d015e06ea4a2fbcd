use crate::packet::{LINK_PORT, MAX_PAYLOAD_SIZE};

/// score units that accumulate per duplex period
const SCORE_PER_PERIOD: u64 = 16;

pub struct PendingSend {
    pub port: u8,
    pub payload: Vec<u8>,
    pub priority: u8,
    requested_us: u64,
}

/// Holds at most one outgoing user packet. A request is released once its score, growing with
///  the time it has been waiting plus the time the link has been idle, exceeds its priority.
///  Lower priority values are therefore sent sooner.
pub struct SendScheduler {
    pending: Option<PendingSend>,
    last_tx_us: u64,
    duplex_period_us: u64,
}
impl SendScheduler {
    pub fn new(duplex_period_us: u32) -> SendScheduler {
        SendScheduler {
            pending: None,
            last_tx_us: 0,
            duplex_period_us: (duplex_period_us as u64).max(1),
        }
    }

    pub fn request(&mut self, port: u8, payload: &[u8], priority: u8, now: u64) -> bool {
        if self.pending.is_some() || port == LINK_PORT || payload.len() > MAX_PAYLOAD_SIZE {
            return false;
        }
        self.pending = Some(PendingSend {
            port,
            payload: payload.to_vec(),
            priority,
            requested_us: now,
        });
        true
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn on_transmit(&mut self, now: u64) {
        self.last_tx_us = now;
    }

    fn weight_us(&self, pending: &PendingSend, now: u64) -> u64 {
        now.saturating_sub(pending.requested_us) + now.saturating_sub(self.last_tx_us)
    }

    fn threshold_us(&self, priority: u8) -> u64 {
        (priority as u64 + 1) * self.duplex_period_us
    }

    pub fn score(&self, now: u64) -> Option<u64> {
        self.pending.as_ref()
            .map(|p| self.weight_us(p, now) * SCORE_PER_PERIOD / self.duplex_period_us)
    }

    /// the pending request if its score exceeds its priority
    pub fn released(&self, now: u64) -> Option<&PendingSend> {
        self.pending.as_ref()
            .filter(|p| self.weight_us(p, now) * SCORE_PER_PERIOD >= self.threshold_us(p.priority))
    }

    /// time until the pending request gets released, zero if it already is
    pub fn release_delay(&self, now: u64) -> Option<u64> {
        let pending = self.pending.as_ref()?;
        let needed = self.threshold_us(pending.priority).div_ceil(SCORE_PER_PERIOD);
        // both waiting time and idle time grow with elapsed time
        Some(needed.saturating_sub(self.weight_us(pending, now)).div_ceil(2))
    }

    /// Removes the request after it was handed to the radio
    pub fn complete(&mut self, now: u64) {
        self.pending = None;
        self.last_tx_us = now;
    }
}
