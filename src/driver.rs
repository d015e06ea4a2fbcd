//! Runs a [LinkEngine] on a tokio runtime, standing in for the cooperative scheduler of an
//!  embedded target.
//!
//! The radio side (typically an interrupt handler or a transceiver task) hands its events to
//!  the driver through an mpsc channel. The application can optionally pass a second channel
//!  for send requests.

use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::clock::source::ClockSource;
use crate::crypto::LinkSession;
use crate::link::engine::LinkEngine;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RadioEvent {
    /// `rx_cycles` is the raw clock reading captured at the packet's first bit
    Received { data: Vec<u8>, rx_cycles: u32, rssi: i8 },
    ReceiveLost { rx_cycles: u32 },
    TransmitDone,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkCommand {
    Send { port: u8, payload: Vec<u8>, priority: u8 },
    CancelSend,
}

/// Clock source on tokio's clock, so that it follows paused and advanced time in tests. Copies
///  share the same reference point, which lets the radio side capture receive timestamps.
#[derive(Clone, Copy, Debug)]
pub struct TokioClockSource {
    reference: Instant,
}
impl TokioClockSource {
    pub fn new() -> TokioClockSource {
        TokioClockSource {
            reference: Instant::now(),
        }
    }
}

impl Default for TokioClockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for TokioClockSource {
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

enum Wakeup {
    Timer,
    Radio(Option<RadioEvent>),
    Command(Option<LinkCommand>),
}

pub struct LinkDriver<S: LinkSession> {
    engine: LinkEngine<S>,
    events: mpsc::Receiver<RadioEvent>,
    commands: Option<mpsc::Receiver<LinkCommand>>,
}
impl<S: LinkSession> LinkDriver<S> {
    /// `engine` must be set up already
    pub fn new(engine: LinkEngine<S>, events: mpsc::Receiver<RadioEvent>) -> LinkDriver<S> {
        LinkDriver {
            engine,
            events,
            commands: None,
        }
    }

    pub fn with_commands(mut self, commands: mpsc::Receiver<LinkCommand>) -> LinkDriver<S> {
        self.commands = Some(commands);
        self
    }

    /// Starts the engine and runs it until the radio event channel is closed. The stopped
    ///  engine is returned for inspection.
    pub async fn run(mut self) -> anyhow::Result<LinkEngine<S>> {
        self.engine.start()?;
        info!("link driver started as {:?}", self.engine.status().role);

        let mut delay_us = self.engine.tick();
        loop {
            let wakeup = select! {
                _ = sleep(Duration::from_micros(delay_us as u64)) => Wakeup::Timer,
                event = self.events.recv() => Wakeup::Radio(event),
                command = next_command(&mut self.commands) => Wakeup::Command(command),
            };

            match wakeup {
                Wakeup::Timer => {}
                Wakeup::Radio(Some(event)) => self.on_radio_event(event),
                Wakeup::Radio(None) => {
                    debug!("radio event channel closed");
                    break;
                }
                Wakeup::Command(Some(command)) => self.on_command(command),
                Wakeup::Command(None) => {
                    debug!("command channel closed - continuing without commands");
                    self.commands = None;
                }
            }
            delay_us = self.engine.tick();
        }

        self.engine.stop();
        info!("link driver stopped");
        Ok(self.engine)
    }

    fn on_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::Received { data, rx_cycles, rssi } => self.engine.on_rx(&data, rx_cycles, rssi),
            RadioEvent::ReceiveLost { rx_cycles } => self.engine.on_rx_lost(rx_cycles),
            RadioEvent::TransmitDone => self.engine.on_tx_done(),
        }
    }

    fn on_command(&mut self, command: LinkCommand) {
        match command {
            LinkCommand::Send { port, payload, priority } => {
                if !self.engine.request_send(port, &payload, priority) {
                    warn!("send request for port {} was not accepted in stage {:?} - ignoring", port, self.engine.stage());
                }
            }
            LinkCommand::CancelSend => self.engine.request_send_cancel(),
        }
    }
}

async fn next_command(commands: &mut Option<mpsc::Receiver<LinkCommand>>) -> Option<LinkCommand> {
    match commands {
        Some(commands) => commands.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::crypto::address_match_session::AddressMatchSession;
    use crate::crypto::LinkRole;
    use crate::link::transceiver::Transceiver;
    use crate::link::LinkStage;
    use crate::test_util::simulation::CollectingListener;
    use crate::test_util::test_config;
    use crate::test_util::virtual_radio::{duration_in_air_us, ENCODING_TIMING};
    use crate::util::random::RngRandom;

    /// Completes every transmission right away. It holds only a weak sender so that the test
    ///  controls when the event channel closes.
    struct InstantTransceiver {
        tx_count: Arc<AtomicUsize>,
        events: mpsc::WeakSender<RadioEvent>,
    }
    impl Transceiver for InstantTransceiver {
        fn start(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        fn stop(&mut self) {}

        fn tx_available(&self) -> bool {
            true
        }

        fn tx(&mut self, _data: &[u8], _channel: u8) -> bool {
            self.tx_count.fetch_add(1, Ordering::SeqCst);
            if let Some(events) = self.events.upgrade() {
                events.try_send(RadioEvent::TransmitDone).ok();
            }
            true
        }

        fn rx(&mut self, _channel: u8) {}

        fn time_to_air(&self, _packet_size: u8) -> u32 {
            20
        }

        fn duration_in_air(&self, packet_size: u8) -> u32 {
            duration_in_air_us(packet_size)
        }
    }

    struct Fixture {
        engine: LinkEngine<AddressMatchSession>,
        sender: mpsc::Sender<RadioEvent>,
        events: mpsc::Receiver<RadioEvent>,
        tx_count: Arc<AtomicUsize>,
        listener: CollectingListener,
        clock_source: TokioClockSource,
    }

    fn server_fixture() -> Fixture {
        let (sender, events) = mpsc::channel(16);
        let tx_count = Arc::new(AtomicUsize::new(0));
        let listener = CollectingListener::default();
        let clock_source = TokioClockSource::new();

        let mut engine = LinkEngine::new(
            Arc::new(test_config()),
            AddressMatchSession::new(LinkRole::Server, [1; 8], [2; 8], [7; 32]),
            Box::new(clock_source),
            Box::new(InstantTransceiver {
                tx_count: tx_count.clone(),
                events: sender.downgrade(),
            }),
            Box::new(listener.clone()),
            Box::new(RngRandom {}),
        );
        engine.setup_with_timing(ENCODING_TIMING).unwrap();

        Fixture { engine, sender, events, tx_count, listener, clock_source }
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_runs_until_event_channel_closes() {
        let Fixture { engine, sender, events, tx_count, listener, .. } = server_fixture();
        let driver = LinkDriver::new(engine, events);

        let (result, _) = tokio::join!(
            driver.run(),
            async {
                sleep(Duration::from_millis(100)).await;
                assert_eq!(listener.stages(), vec![LinkStage::Booting, LinkStage::AwaitingLink]);
                assert!(tx_count.load(Ordering::SeqCst) >= 10);
                drop(sender);
            },
        );

        let engine = result.unwrap();
        assert_eq!(engine.stage(), LinkStage::Disabled);
        assert_eq!(listener.stages().last(), Some(&LinkStage::Disabled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_events_reach_engine() {
        let Fixture { engine, sender, events, clock_source, .. } = server_fixture();
        let driver = LinkDriver::new(engine, events);

        let (result, _) = tokio::join!(
            driver.run(),
            async {
                sleep(Duration::from_millis(10)).await;
                sender.send(RadioEvent::Received {
                    data: vec![0x55; 20],
                    rx_cycles: clock_source.raw_cycles(),
                    rssi: -50,
                }).await.unwrap();
                sender.send(RadioEvent::ReceiveLost { rx_cycles: clock_source.raw_cycles() }).await.unwrap();
                sleep(Duration::from_millis(10)).await;
                drop(sender);
            },
        );

        let status = result.unwrap().status();
        assert_eq!(status.rejected_count, 1);
        assert_eq!(status.rx_lost_notifications, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command_outside_link_is_ignored() {
        let Fixture { engine, sender, events, .. } = server_fixture();
        let (command_sender, commands) = mpsc::channel(4);
        let driver = LinkDriver::new(engine, events).with_commands(commands);

        let (result, _) = tokio::join!(
            driver.run(),
            async {
                command_sender.send(LinkCommand::Send { port: 3, payload: vec![1, 2, 3], priority: 0 }).await.unwrap();
                drop(command_sender);
                sleep(Duration::from_millis(10)).await;
                drop(sender);
            },
        );

        let engine = result.unwrap();
        assert!(!engine.is_send_pending());
    }
}
