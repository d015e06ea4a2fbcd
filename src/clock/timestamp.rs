use std::fmt::{Display, Formatter};

pub const MICROS_PER_SECOND: u32 = 1_000_000;

/// Link time: whole seconds on a wrapping 2^32 ring plus microseconds within the second.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct Timestamp {
    pub seconds: u32,
    /// always < [MICROS_PER_SECOND]
    pub sub_seconds: u32,
}
impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { seconds: 0, sub_seconds: 0 };

    /// Normalizes an out-of-range `sub_seconds` value into the seconds field
    pub fn new(seconds: u32, sub_seconds: u32) -> Timestamp {
        Timestamp {
            seconds: seconds.wrapping_add(sub_seconds / MICROS_PER_SECOND),
            sub_seconds: sub_seconds % MICROS_PER_SECOND,
        }
    }

    /// Maps a signed microsecond count onto the timestamp ring
    pub fn from_micros(micros: i64) -> Timestamp {
        let seconds = micros.div_euclid(MICROS_PER_SECOND as i64);
        let sub_seconds = micros.rem_euclid(MICROS_PER_SECOND as i64);
        Timestamp {
            seconds: seconds as u32, // truncation is the 2^32 ring wrap
            sub_seconds: sub_seconds as u32,
        }
    }

    /// Microseconds on the (non-wrapping) timeline, for values whose seconds did not wrap
    pub fn to_micros(&self) -> u64 {
        self.seconds as u64 * MICROS_PER_SECOND as u64 + self.sub_seconds as u64
    }

    pub fn shift_seconds(&mut self, seconds: i32) {
        self.seconds = self.seconds.wrapping_add_signed(seconds);
    }

    pub fn shift_sub_seconds(&mut self, micros: i64) {
        let total = self.sub_seconds as i64 + micros;
        let carry = total.div_euclid(MICROS_PER_SECOND as i64);
        self.sub_seconds = total.rem_euclid(MICROS_PER_SECOND as i64) as u32;
        self.seconds = self.seconds.wrapping_add(carry as u32);
    }

    pub fn shifted(mut self, micros: i64) -> Timestamp {
        self.shift_sub_seconds(micros);
        self
    }

    /// Signed distance from `earlier` to `self`, treating seconds as a ring (so the result is
    ///  meaningful as long as the two are less than 2^31 seconds apart)
    pub fn micros_since(&self, earlier: &Timestamp) -> i64 {
        let seconds = self.seconds.wrapping_sub(earlier.seconds) as i32;
        seconds as i64 * MICROS_PER_SECOND as i64 + self.sub_seconds as i64 - earlier.sub_seconds as i64
    }

    /// How far this estimate is ahead of `truth` (negative if it lags behind)
    pub fn error_to(&self, truth: &Timestamp) -> TimestampError {
        TimestampError::from_micros(self.micros_since(truth))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:06}", self.seconds, self.sub_seconds)
    }
}


/// Signed difference between two timestamps. Both fields carry the same sign, and
///  `|sub_seconds| < 1_000_000`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TimestampError {
    pub seconds: i32,
    pub sub_seconds: i32,
}
impl TimestampError {
    pub fn from_micros(micros: i64) -> TimestampError {
        TimestampError {
            seconds: (micros / MICROS_PER_SECOND as i64) as i32,
            sub_seconds: (micros % MICROS_PER_SECOND as i64) as i32,
        }
    }

    pub fn to_micros(&self) -> i64 {
        self.seconds as i64 * MICROS_PER_SECOND as i64 + self.sub_seconds as i64
    }

    /// clamps to the i32 range, which is what the fine-grained protocol fields carry
    pub fn to_micros_saturating(&self) -> i32 {
        self.to_micros().clamp(i32::MIN as i64, i32::MAX as i64) as i32
    }
}
