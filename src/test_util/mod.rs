//! Utilities for running link engines without hardware: a virtual clock, a virtual radio medium
//!  and a simulation loop driving a server and a client against each other.
//!
//! They are part of the crate's regular code (not `#[cfg(test)]`) so that applications can test
//!  their own listeners against a simulated link.

pub mod simulation;
pub mod virtual_radio;

use std::time::Duration;

use crate::config::LinkConfig;

/// A fast configuration for simulations: 2ms duplex periods and a single advertising channel
pub fn test_config() -> LinkConfig {
    LinkConfig {
        duplex_period: Duration::from_millis(2),
        advertising_channels: vec![7],
        channel_count: 40,
        transition_duration: Duration::from_millis(8),
        clock_tune_period: Duration::from_millis(100),
        report_period: Duration::from_millis(50),
        calibration_rounds: 10,
        ..LinkConfig::new()
    }
}
