use std::time::Instant;

/// A free-running hardware cycle counter. The raw value counts up to [ClockSource::overflow_value]
///  and then restarts at 0.
#[cfg_attr(test, mockall::automock)]
pub trait ClockSource: Send {
    fn start(&mut self);
    fn stop(&mut self);

    fn raw_cycles(&self) -> u32;

    /// largest raw value before the counter wraps to 0
    fn overflow_value(&self) -> u32;

    fn cycles_per_second(&self) -> u32;
}

/// Host clock source counting microseconds since its creation, wrapping at 2^32
pub struct StdClockSource {
    reference: Instant,
}
impl StdClockSource {
    pub fn new() -> StdClockSource {
        StdClockSource {
            reference: Instant::now(),
        }
    }
}

impl Default for StdClockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for StdClockSource {
    fn start(&mut self) {}

    fn stop(&mut self) {}

    fn raw_cycles(&self) -> u32 {
        self.reference.elapsed().as_micros() as u32
    }

    fn overflow_value(&self) -> u32 {
        u32::MAX
    }

    fn cycles_per_second(&self) -> u32 {
        1_000_000
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_std_source_counts_micros() {
        let source = StdClockSource::new();
        let before = source.raw_cycles();
        std::thread::sleep(Duration::from_millis(2));
        assert!(source.raw_cycles().wrapping_sub(before) >= 2_000);
        assert_eq!(source.cycles_per_second(), 1_000_000);
    }
}
