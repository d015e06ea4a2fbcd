/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u8> for usize {
    fn prechecked_cast(self) -> u8 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u32> for u64 {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

/// Saturating conversion of a configured [std::time::Duration] to microseconds
pub fn duration_to_micros(duration: std::time::Duration) -> u32 {
    duration.as_micros()
        .try_into()
        .unwrap_or(u32::MAX)
}
