use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::clock::timestamp::Timestamp;
use crate::config::LinkConfig;
use crate::crypto::LinkSession;
use crate::link::engine::LinkEngine;
use crate::link::{LinkListener, LinkStage};
use crate::test_util::virtual_radio::{ManualClockSource, MediumEvent, VirtualMedium, VirtualTime, ENCODING_TIMING};
use crate::util::random::Random;

/// virtual time at which simulations start
pub const SIMULATION_START_US: u64 = 10_000_000;
pub const SIMULATED_RSSI: i8 = -40;

/// Deterministic [Random] for reproducible simulations
pub struct SeededRandom(ChaCha8Rng);
impl SeededRandom {
    pub fn new(seed: u64) -> SeededRandom {
        SeededRandom(ChaCha8Rng::seed_from_u64(seed))
    }
}
impl Random for SeededRandom {
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedPacket {
    pub port: u8,
    pub payload: Vec<u8>,
    pub timestamp: Timestamp,
}

/// Records listener callbacks. Clones share their records.
#[derive(Clone, Default)]
pub struct CollectingListener {
    stages: Arc<Mutex<Vec<LinkStage>>>,
    packets: Arc<Mutex<Vec<ReceivedPacket>>>,
}
impl CollectingListener {
    pub fn stages(&self) -> Vec<LinkStage> {
        lock(&self.stages).clone()
    }

    pub fn packets(&self) -> Vec<ReceivedPacket> {
        lock(&self.packets).clone()
    }
}
impl LinkListener for CollectingListener {
    fn on_link_stage_changed(&mut self, stage: LinkStage) {
        lock(&self.stages).push(stage);
    }

    fn on_packet_received(&mut self, port: u8, payload: &[u8], timestamp: Timestamp) {
        lock(&self.packets).push(ReceivedPacket {
            port,
            payload: payload.to_vec(),
            timestamp,
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A server and a client engine on a shared [VirtualMedium], driven by a discrete event loop
///  that jumps from one due tick or radio event to the next
pub struct LinkSimulation<S: LinkSession> {
    time: VirtualTime,
    medium: Arc<Mutex<VirtualMedium>>,
    pub server: LinkEngine<S>,
    pub client: LinkEngine<S>,
    pub server_events: CollectingListener,
    pub client_events: CollectingListener,
    next_tick_us: [u64; 2],
}
impl<S: LinkSession> LinkSimulation<S> {
    /// Creates and sets up both engines. They are not started yet, so tests can adjust clocks
    ///  first.
    pub fn new(config: LinkConfig, server_session: S, client_session: S) -> anyhow::Result<LinkSimulation<S>> {
        let config = Arc::new(config);
        let time = VirtualTime::new(SIMULATION_START_US);
        let medium = VirtualMedium::new(time.clone());

        let server_events = CollectingListener::default();
        let client_events = CollectingListener::default();

        let mut server = LinkEngine::new(
            config.clone(),
            server_session,
            Box::new(ManualClockSource::new(time.clone())),
            Box::new(VirtualMedium::add_radio(&medium)),
            Box::new(server_events.clone()),
            Box::new(SeededRandom::new(1)),
        );
        let mut client = LinkEngine::new(
            config,
            client_session,
            Box::new(ManualClockSource::new(time.clone())),
            Box::new(VirtualMedium::add_radio(&medium)),
            Box::new(client_events.clone()),
            Box::new(SeededRandom::new(2)),
        );
        server.setup_with_timing(ENCODING_TIMING)?;
        client.setup_with_timing(ENCODING_TIMING)?;

        let now = time.now_us();
        Ok(LinkSimulation {
            time,
            medium,
            server,
            client,
            server_events,
            client_events,
            next_tick_us: [now; 2],
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        self.server.start()?;
        self.client.start()?;
        self.next_tick_us = [self.now_us(); 2];
        Ok(())
    }

    pub fn now_us(&self) -> u64 {
        self.time.now_us()
    }

    pub fn set_medium_blocked(&self, blocked: bool) {
        lock(&self.medium).set_blocked(blocked);
    }

    fn engine(&mut self, index: usize) -> &mut LinkEngine<S> {
        if index == 0 { &mut self.server } else { &mut self.client }
    }

    /// Processes the next event if it is due no later than `until_us`. Returns `false` (with
    ///  time advanced to `until_us`) otherwise.
    fn step(&mut self, until_us: u64) -> bool {
        let medium_next = lock(&self.medium).next_event_us().unwrap_or(u64::MAX);
        let next = self.next_tick_us.iter().copied().min().unwrap_or(u64::MAX).min(medium_next);
        if next > until_us {
            self.time.set(until_us);
            return false;
        }
        self.time.set(next);
        let now = self.time.now_us();

        // the medium lock must not be held while engines call into their transceivers
        let events = lock(&self.medium).take_due(now);
        for event in events {
            match event {
                MediumEvent::TxDone { radio } => {
                    self.engine(radio).on_tx_done();
                    self.next_tick_us[radio] = now;
                }
                MediumEvent::Delivered { radio, data, rx_us } => {
                    self.engine(radio).on_rx(&data, rx_us as u32, SIMULATED_RSSI);
                    self.next_tick_us[radio] = now;
                }
            }
        }

        for index in 0..2 {
            if self.next_tick_us[index] <= now {
                let delay = self.engine(index).tick();
                self.next_tick_us[index] = now + delay as u64;
            }
        }
        true
    }

    pub fn run_for(&mut self, duration_us: u64) {
        let until_us = self.now_us() + duration_us;
        while self.step(until_us) {}
    }

    /// Runs until `condition` holds or `max_duration_us` elapsed, returning whether it held
    pub fn run_until(&mut self, max_duration_us: u64, condition: impl Fn(&LinkSimulation<S>) -> bool) -> bool {
        let until_us = self.now_us() + max_duration_us;
        loop {
            if condition(self) {
                return true;
            }
            if !self.step(until_us) {
                return condition(self);
            }
        }
    }

    pub fn both_linked(&self) -> bool {
        self.server.stage() == LinkStage::Linked && self.client.stage() == LinkStage::Linked
    }
}
