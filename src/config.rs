use std::time::Duration;

use anyhow::bail;

use crate::util::safe_converter::duration_to_micros;

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// length of one half-duplex exchange: the server transmits in the first half, the client in
    ///  the second
    pub duplex_period: Duration,

    /// channels used before a shared hop seed exists. The server advertises on
    ///  `advertising_channels[session_id % len]`, the client searches them in turn
    pub advertising_channels: Vec<u8>,
    /// number of channels the transceiver supports, hop channels are `0..channel_count`
    pub channel_count: u8,
    pub hop_period_duplex_count: u32,

    /// a linked link is dropped after this many duplex periods without a valid packet
    pub link_timeout_duplex_count: u32,
    pub pairing_timeout: Duration,
    /// budget for everything from the switch to linking until the link is established
    pub linking_timeout: Duration,
    pub session_rotation_timeout: Duration,
    pub search_dwell: Duration,
    pub transition_duration: Duration,

    pub clock_sync_retry_duplex_count: u32,
    pub broad_tolerance_seconds: u32,
    pub clock_tolerance_us: u32,
    pub tune_tolerance_ppm: u32,
    pub clock_tune_period: Duration,
    /// clock error samples deviating more than this are not averaged, the best sample is used
    ///  instead
    pub clock_deviation_threshold_us: u32,
    /// error magnitude that maps to clock quality 0
    pub clock_quality_reference_us: u32,

    pub report_period: Duration,

    /// a linked packet received this close to a sub-token boundary is also tried against the
    ///  neighbouring token
    pub decode_time_tolerance_us: u32,
    pub receive_counter_tolerance: u16,
    pub calibration_rounds: u32,
}

impl LinkConfig {
    pub fn new() -> LinkConfig {
        LinkConfig {
            duplex_period: Duration::from_millis(10),
            advertising_channels: vec![3, 37, 71],
            channel_count: 80,
            hop_period_duplex_count: 1,
            link_timeout_duplex_count: 100,
            pairing_timeout: Duration::from_secs(1),
            linking_timeout: Duration::from_secs(2),
            session_rotation_timeout: Duration::from_millis(500),
            search_dwell: Duration::from_secs(1),
            transition_duration: Duration::from_millis(40),
            clock_sync_retry_duplex_count: 4,
            broad_tolerance_seconds: 2,
            clock_tolerance_us: 25,
            tune_tolerance_ppm: 25,
            clock_tune_period: Duration::from_secs(1),
            clock_deviation_threshold_us: 50,
            clock_quality_reference_us: 200,
            report_period: Duration::from_millis(250),
            decode_time_tolerance_us: 100,
            receive_counter_tolerance: 32767,
            calibration_rounds: 100,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let duplex = self.duplex_period_us();
        if duplex < 1000 || duplex > 1_000_000 {
            bail!("duplex period must be between 1ms and 1s, was {:?}", self.duplex_period);
        }
        if self.channel_count == 0 {
            bail!("at least one channel is required");
        }
        if self.advertising_channels.is_empty() {
            bail!("at least one advertising channel is required");
        }
        if let Some(ch) = self.advertising_channels.iter().find(|&&ch| ch >= self.channel_count) {
            bail!("advertising channel {} is outside the channel range 0..{}", ch, self.channel_count);
        }
        if self.hop_period_duplex_count == 0 {
            bail!("hop period must span at least one duplex period");
        }
        if self.link_timeout_duplex_count < 4 {
            bail!("link timeout must span at least four duplex periods");
        }
        if self.transition_duration < self.duplex_period * 3 {
            bail!("transition duration {:?} must cover at least three duplex periods", self.transition_duration);
        }
        if self.linking_timeout <= self.transition_duration * 2 {
            bail!("linking timeout must leave room for both timed transitions");
        }
        if self.report_period * 2 >= self.link_timeout() {
            bail!("report period {:?} is too long for a link timeout of {:?}", self.report_period, self.link_timeout());
        }
        if self.clock_sync_retry_duplex_count == 0 {
            bail!("clock sync retry period must be at least one duplex period");
        }
        if self.receive_counter_tolerance == 0 || self.receive_counter_tolerance > i16::MAX as u16 {
            bail!("receive counter tolerance must be in 1..=32767");
        }
        if self.decode_time_tolerance_us >= crate::crypto::codec::SUB_TOKEN_PERIOD_US / 2 {
            bail!("decode time tolerance must be less than half a sub-token period");
        }
        if self.clock_quality_reference_us == 0 {
            bail!("clock quality reference must be positive");
        }
        if self.calibration_rounds == 0 {
            bail!("calibration needs at least one round");
        }
        Ok(())
    }

    pub fn duplex_period_us(&self) -> u32 {
        duration_to_micros(self.duplex_period)
    }

    pub fn link_timeout(&self) -> Duration {
        self.duplex_period * self.link_timeout_duplex_count
    }

    pub fn link_timeout_us(&self) -> u32 {
        duration_to_micros(self.link_timeout())
    }

    pub fn hop_period_us(&self) -> u32 {
        self.duplex_period_us().saturating_mul(self.hop_period_duplex_count)
    }

    pub fn clock_sync_retry_us(&self) -> u32 {
        self.duplex_period_us().saturating_mul(self.clock_sync_retry_duplex_count)
    }

    pub fn pairing_timeout_us(&self) -> u32 {
        duration_to_micros(self.pairing_timeout)
    }

    pub fn linking_timeout_us(&self) -> u32 {
        duration_to_micros(self.linking_timeout)
    }

    pub fn session_rotation_timeout_us(&self) -> u32 {
        duration_to_micros(self.session_rotation_timeout)
    }

    pub fn search_dwell_us(&self) -> u32 {
        duration_to_micros(self.search_dwell)
    }

    pub fn transition_duration_us(&self) -> u32 {
        duration_to_micros(self.transition_duration)
    }

    pub fn clock_tune_period_us(&self) -> u32 {
        duration_to_micros(self.clock_tune_period)
    }

    pub fn report_period_us(&self) -> u32 {
        duration_to_micros(self.report_period)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new()
    }
}
