use std::hint::black_box;

use anyhow::bail;
use tracing::debug;

use crate::clock::timestamp::Timestamp;
use crate::clock::LinkClock;
use crate::crypto::codec::PacketCodec;
use crate::crypto::primitives::{ExpandedKey, ADDRESSING_KEY_SIZE};
use crate::crypto::LinkRole;
use crate::packet::{HEADER_SIZE, LINK_PORT, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE};

/// Linear model of the time it takes to encode a packet of a given size, measured on the
///  running host. Senders add it to the transceiver's time-to-air when predicting a packet's
///  first bit.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TimingModel {
    base_ns: u64,
    per_byte_ns: u64,
}
impl TimingModel {
    pub const fn new(base_ns: u64, per_byte_ns: u64) -> TimingModel {
        TimingModel { base_ns, per_byte_ns }
    }

    /// `short_ns` and `long_ns` are the mean durations for the smallest and the largest packet.
    ///  A long packet that does not take longer than a short one means the clock could not
    ///  resolve the encoding.
    pub fn from_measurements(short_ns: u64, long_ns: u64) -> anyhow::Result<TimingModel> {
        if long_ns <= short_ns {
            bail!("calibration measured {}ns for a short packet but {}ns for a long one", short_ns, long_ns);
        }

        let per_byte_ns = (long_ns - short_ns) / (MAX_PACKET_SIZE - HEADER_SIZE) as u64;
        Ok(TimingModel {
            base_ns: short_ns.saturating_sub(per_byte_ns * HEADER_SIZE as u64),
            per_byte_ns,
        })
    }

    /// rounded up to whole microseconds
    pub fn duration_us(&self, packet_size: usize) -> u32 {
        let ns = self.base_ns + self.per_byte_ns * packet_size as u64;
        ns.div_ceil(1_000).min(u32::MAX as u64) as u32
    }
}

/// Encodes `rounds` packets of minimum and of maximum size and derives the timing model
pub fn calibrate(clock: &LinkClock, rounds: u32) -> anyhow::Result<TimingModel> {
    if rounds == 0 {
        bail!("calibration needs at least one round");
    }

    let key = ExpandedKey::derive(b"calibration", 0)?;
    let codec = PacketCodec::new(&key, [0; ADDRESSING_KEY_SIZE], [0; ADDRESSING_KEY_SIZE], LinkRole::Server);

    let short_ns = measure(clock, &codec, 0, rounds)?;
    let long_ns = measure(clock, &codec, MAX_PAYLOAD_SIZE, rounds)?;
    debug!("calibration: {}ns for empty packets, {}ns for full packets", short_ns, long_ns);

    TimingModel::from_measurements(short_ns, long_ns)
}

fn measure(clock: &LinkClock, codec: &PacketCodec, payload_size: usize, rounds: u32) -> anyhow::Result<u64> {
    let payload = [0xA5u8; MAX_PAYLOAD_SIZE];
    let start = clock.cyclestamp();
    for counter in 0..rounds {
        let packet = codec.encode(counter as u16, LINK_PORT, &payload[..payload_size], &Timestamp::ZERO)?;
        black_box(packet);
    }
    Ok(clock.elapsed_nanos(start) / rounds as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::source::MockClockSource;
    use rstest::rstest;

    #[rstest]
    #[case::one_ns_per_packet(5_000, 5_001, 32, 5)]
    #[case::linear_short(2_000, 4_500, 7, 2)]
    #[case::linear_long(2_000, 4_500, 32, 5)]
    fn test_model(#[case] short_ns: u64, #[case] long_ns: u64, #[case] size: usize, #[case] expected_us: u32) {
        let model = TimingModel::from_measurements(short_ns, long_ns).unwrap();
        assert_eq!(model.duration_us(size), expected_us);
    }

    #[rstest]
    #[case::long_faster(3_000, 2_999)]
    #[case::equal(3_000, 3_000)]
    #[case::unresolved(0, 0)]
    fn test_inconsistent_measurements_are_rejected(#[case] short_ns: u64, #[case] long_ns: u64) {
        assert!(TimingModel::from_measurements(short_ns, long_ns).is_err());
    }

    #[test]
    fn test_calibrate_on_frozen_clock_fails() {
        let mut source = MockClockSource::new();
        source.expect_overflow_value().return_const(u32::MAX);
        source.expect_cycles_per_second().return_const(1_000_000u32);
        source.expect_raw_cycles().return_const(77u32);
        let mut clock = LinkClock::new(Box::new(source), 25);
        clock.setup().unwrap();

        assert!(calibrate(&clock, 3).is_err());
        assert!(calibrate(&clock, 0).is_err());
    }
}
