use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::source::ClockSource;
use crate::link::calibration::TimingModel;
use crate::link::transceiver::Transceiver;

pub const TIME_TO_AIR_US: u32 = 20;

/// Virtual time stands still while an engine encodes, so there is nothing to calibrate
pub const ENCODING_TIMING: TimingModel = TimingModel::new(0, 0);

pub fn duration_in_air_us(packet_size: u8) -> u32 {
    40 + 8 * packet_size as u32
}

/// Shared virtual time in microseconds
#[derive(Clone, Debug)]
pub struct VirtualTime(Arc<AtomicU64>);
impl VirtualTime {
    pub fn new(start_us: u64) -> VirtualTime {
        VirtualTime(Arc::new(AtomicU64::new(start_us)))
    }

    pub fn now_us(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, now_us: u64) {
        self.0.fetch_max(now_us, Ordering::SeqCst);
    }
}

/// A 1MHz, 32 bit cycle counter running on [VirtualTime]
pub struct ManualClockSource {
    time: VirtualTime,
}
impl ManualClockSource {
    pub fn new(time: VirtualTime) -> ManualClockSource {
        ManualClockSource { time }
    }
}
impl ClockSource for ManualClockSource {
    fn start(&mut self) {}

    fn stop(&mut self) {}

    fn raw_cycles(&self) -> u32 {
        self.time.now_us() as u32
    }

    fn overflow_value(&self) -> u32 {
        u32::MAX
    }

    fn cycles_per_second(&self) -> u32 {
        1_000_000
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MediumEvent {
    TxDone { radio: usize },
    Delivered { radio: usize, data: Vec<u8>, rx_us: u64 },
}

struct InFlight {
    sender: usize,
    channel: u8,
    data: Vec<u8>,
    start_us: u64,
    end_us: u64,
}

#[derive(Default)]
struct RadioState {
    listening: Option<u8>,
    listening_since_us: u64,
    transmitting: bool,
}

/// The air between virtual transceivers. A packet reaches every other radio that was listening
///  on its channel from the packet's first bit to its last. Collisions are not modelled.
pub struct VirtualMedium {
    time: VirtualTime,
    radios: Vec<RadioState>,
    in_flight: Vec<InFlight>,
    blocked: bool,
}
impl VirtualMedium {
    pub fn new(time: VirtualTime) -> Arc<Mutex<VirtualMedium>> {
        Arc::new(Mutex::new(VirtualMedium {
            time,
            radios: Vec::new(),
            in_flight: Vec::new(),
            blocked: false,
        }))
    }

    pub fn add_radio(medium: &Arc<Mutex<VirtualMedium>>) -> VirtualTransceiver {
        let mut locked = lock(medium);
        locked.radios.push(RadioState::default());
        VirtualTransceiver {
            id: locked.radios.len() - 1,
            medium: medium.clone(),
        }
    }

    /// a blocked medium silently swallows every packet
    pub fn set_blocked(&mut self, blocked: bool) {
        self.blocked = blocked;
    }

    pub fn next_event_us(&self) -> Option<u64> {
        self.in_flight.iter()
            .map(|p| p.end_us)
            .min()
    }

    /// Removes and returns everything that completed at or before `now_us`
    pub fn take_due(&mut self, now_us: u64) -> Vec<MediumEvent> {
        let (due, pending): (Vec<InFlight>, Vec<InFlight>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|p| p.end_us <= now_us);
        self.in_flight = pending;

        let mut events = Vec::new();
        for packet in due {
            self.radios[packet.sender].transmitting = false;
            events.push(MediumEvent::TxDone { radio: packet.sender });

            if self.blocked {
                continue;
            }
            for (radio, state) in self.radios.iter().enumerate() {
                if radio != packet.sender && state.listening == Some(packet.channel) && state.listening_since_us <= packet.start_us {
                    events.push(MediumEvent::Delivered {
                        radio,
                        data: packet.data.clone(),
                        rx_us: packet.start_us,
                    });
                }
            }
        }
        events
    }
}

fn lock(medium: &Mutex<VirtualMedium>) -> MutexGuard<'_, VirtualMedium> {
    medium.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct VirtualTransceiver {
    id: usize,
    medium: Arc<Mutex<VirtualMedium>>,
}
impl VirtualTransceiver {
    pub fn id(&self) -> usize {
        self.id
    }
}
impl Transceiver for VirtualTransceiver {
    fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&mut self) {
        lock(&self.medium).radios[self.id].listening = None;
    }

    fn tx_available(&self) -> bool {
        !lock(&self.medium).radios[self.id].transmitting
    }

    fn tx(&mut self, data: &[u8], channel: u8) -> bool {
        let mut medium = lock(&self.medium);
        let now = medium.time.now_us();
        let radio = &mut medium.radios[self.id];
        if radio.transmitting {
            return false;
        }
        radio.transmitting = true;
        radio.listening = None;

        let start_us = now + TIME_TO_AIR_US as u64;
        medium.in_flight.push(InFlight {
            sender: self.id,
            channel,
            data: data.to_vec(),
            start_us,
            end_us: start_us + duration_in_air_us(data.len() as u8) as u64,
        });
        true
    }

    fn rx(&mut self, channel: u8) {
        let mut medium = lock(&self.medium);
        let now = medium.time.now_us();
        let radio = &mut medium.radios[self.id];
        if radio.listening != Some(channel) {
            radio.listening = Some(channel);
            radio.listening_since_us = now;
        }
    }

    fn time_to_air(&self, _packet_size: u8) -> u32 {
        TIME_TO_AIR_US
    }

    fn duration_in_air(&self, packet_size: u8) -> u32 {
        duration_in_air_us(packet_size)
    }
}
