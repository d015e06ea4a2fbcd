pub mod random;
pub mod rolling_data;
pub mod safe_converter;
