/// The radio underneath the link. It sends or receives one packet at a time, and reports
///  completion through the engine's `on_rx`, `on_rx_lost` and `on_tx_done` callbacks.
#[cfg_attr(test, mockall::automock)]
pub trait Transceiver: Send {
    fn start(&mut self) -> anyhow::Result<()>;
    fn stop(&mut self);

    fn tx_available(&self) -> bool;

    /// Starts transmitting, returns `false` if the radio is busy
    fn tx(&mut self, data: &[u8], channel: u8) -> bool;

    /// Switches to receive mode on the given channel
    fn rx(&mut self, channel: u8);

    /// microseconds from [Transceiver::tx] until the packet's first bit is on air
    fn time_to_air(&self, packet_size: u8) -> u32;

    /// microseconds the packet occupies the air
    fn duration_in_air(&self, packet_size: u8) -> u32;
}
