use std::sync::Arc;

use anyhow::bail;
use tracing::{debug, error, info, trace, warn};

use crate::clock::source::ClockSource;
use crate::clock::timestamp::Timestamp;
use crate::clock::LinkClock;
use crate::config::LinkConfig;
use crate::crypto::codec::{DecodedPacket, PacketCodec};
use crate::crypto::{LinkRole, LinkSession};
use crate::link::calibration::{calibrate, TimingModel};
use crate::link::channel_hop::ChannelHop;
use crate::link::client::ClientState;
use crate::link::duplex::DuplexSchedule;
use crate::link::report::ReportTracker;
use crate::link::rolling_counter::RollingCounterTracker;
use crate::link::send_scheduler::SendScheduler;
use crate::link::server::ServerState;
use crate::link::transceiver::Transceiver;
use crate::link::{LinkListener, LinkStage, LinkStatus};
use crate::packet::linked::LinkedMessage;
use crate::packet::{LinkMessage, HEADER_SIZE, LINK_PORT, MAX_PACKET_SIZE};
use crate::util::random::Random;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CodecKind {
    Unlinked,
    Session,
}

/// Reception details of a packet, on the receiver's timelines
#[derive(Clone, Copy, Debug)]
pub(crate) struct RxInfo {
    /// monotonic time of the first bit
    pub rx_us: u64,
    /// link time of the first bit
    pub rx_ts: Timestamp,
    pub packet_size: usize,
}

/// Everything the two roles share: radio, clock, session, timing and counters
pub(crate) struct LinkCore<S: LinkSession> {
    pub(crate) config: Arc<LinkConfig>,
    pub(crate) clock: LinkClock,
    pub(crate) session: S,
    pub(crate) random: Box<dyn Random>,
    pub(crate) status: LinkStatus,
    transceiver: Box<dyn Transceiver>,
    listener: Box<dyn LinkListener>,
    unlinked_codec: PacketCodec,
    timing: Option<TimingModel>,

    stage: LinkStage,
    stage_started_us: u64,

    next_send_counter: u16,
    receive_counter: RollingCounterTracker,
    transmitting: bool,
    rx_channel: Option<u8>,

    handshake_channel: u8,
    pre_link_duplex: DuplexSchedule,
    linked_duplex: DuplexSchedule,
    last_tx_slot: Option<i64>,
    hop: Option<ChannelHop>,

    last_rx_us: u64,
    send_scheduler: SendScheduler,
    report: ReportTracker,
    linked_received: u32,
    linked_lost: u32,
}
impl<S: LinkSession> LinkCore<S> {
    fn new(config: Arc<LinkConfig>, session: S, clock: LinkClock, transceiver: Box<dyn Transceiver>, listener: Box<dyn LinkListener>, random: Box<dyn Random>) -> LinkCore<S> {
        let role = session.role();
        let period_us = config.duplex_period_us();
        LinkCore {
            status: LinkStatus::new(role),
            unlinked_codec: PacketCodec::unlinked(role),
            timing: None,
            stage: LinkStage::Disabled,
            stage_started_us: 0,
            next_send_counter: 0,
            receive_counter: RollingCounterTracker::new(config.receive_counter_tolerance),
            transmitting: false,
            rx_channel: None,
            handshake_channel: config.advertising_channels.first().copied().unwrap_or_default(),
            pre_link_duplex: DuplexSchedule::new(period_us, 0),
            linked_duplex: DuplexSchedule::new(period_us, 0),
            last_tx_slot: None,
            hop: None,
            last_rx_us: 0,
            send_scheduler: SendScheduler::new(period_us),
            report: ReportTracker::new(config.report_period_us()),
            linked_received: 0,
            linked_lost: 0,
            config,
            clock,
            session,
            random,
            transceiver,
            listener,
        }
    }

    pub(crate) fn stage(&self) -> LinkStage {
        self.stage
    }

    pub(crate) fn stage_elapsed_us(&self, now: u64) -> u64 {
        now.saturating_sub(self.stage_started_us)
    }

    pub(crate) fn set_stage(&mut self, stage: LinkStage, now: u64) {
        if stage == self.stage {
            return;
        }
        info!("link stage {:?} -> {:?}", self.stage, stage);
        self.stage = stage;
        self.stage_started_us = now;
        self.status.stage = stage;
        self.status.linked_since_us = if stage == LinkStage::Linked { Some(now) } else { None };
        self.listener.on_link_stage_changed(stage);
    }

    /// Clears per-link state when (re-)entering the search for a partner
    pub(crate) fn reset_link_state(&mut self, now: u64) {
        self.next_send_counter = self.random.next_u16();
        self.receive_counter.reset();
        self.last_tx_slot = None;
        self.hop = None;
        self.send_scheduler.cancel();
        self.report.reset(now);
        self.last_rx_us = now;
    }

    /// Channel for all traffic before the link exists. A server passes the start of its duplex
    ///  phase, a client aligns to the server's packets instead.
    pub(crate) fn set_handshake_channel(&mut self, channel: u8, duplex_origin_us: Option<u64>) {
        self.handshake_channel = channel;
        if let Some(origin) = duplex_origin_us {
            self.pre_link_duplex.set_origin(origin);
            self.last_tx_slot = None;
        }
    }

    /// Moves the own half to follow the partner's half, given a packet the partner sent at the
    ///  start of its half
    pub(crate) fn align_to_partner(&mut self, rx: &RxInfo) {
        let partner_start = rx.rx_us.saturating_sub(self.first_bit_delay_us(rx.packet_size) as u64);
        self.pre_link_duplex.set_origin(partner_start + self.pre_link_duplex.half_us());
    }

    fn timing(&self) -> TimingModel {
        self.timing.unwrap_or_default()
    }

    fn first_bit_delay_us(&self, packet_size: usize) -> u32 {
        self.timing().duration_us(packet_size) + self.transceiver.time_to_air(packet_size as u8)
    }

    fn airtime_us(&self, packet_size: usize) -> u32 {
        self.first_bit_delay_us(packet_size) + self.transceiver.duration_in_air(packet_size as u8)
    }

    /// monotonic time at which the first bit of `message` would be on air if sent now
    pub(crate) fn first_bit_us(&self, now: u64, message: &LinkMessage) -> u64 {
        let packet_size = HEADER_SIZE + message.to_payload().len();
        now + self.first_bit_delay_us(packet_size) as u64
    }

    pub(crate) fn link_us(&self, now: u64) -> u64 {
        self.clock.timestamp_at_monotonic(now).to_micros()
    }

    fn slot_timeline(&self, now: u64) -> (DuplexSchedule, u64) {
        if self.stage == LinkStage::Linked {
            (self.linked_duplex, self.link_us(now))
        }
        else {
            (self.pre_link_duplex, now)
        }
    }

    /// time until the next own half starts
    pub(crate) fn slot_delay(&self, now: u64) -> u64 {
        let (schedule, t) = self.slot_timeline(now);
        schedule.next_own_half_delay(t)
    }

    fn rx_channel_at(&self, now: u64) -> u8 {
        match (&self.hop, self.stage) {
            (Some(hop), LinkStage::Linked) => {
                let t = self.link_us(now);
                // towards the end of the own half, listen on the channel the partner's next
                //  half will use
                if self.linked_duplex.is_own_half(t) {
                    hop.channel_at(t + self.linked_duplex.period_us() / 8)
                }
                else {
                    hop.channel_at(t)
                }
            }
            _ => self.handshake_channel,
        }
    }

    pub(crate) fn arm_rx(&mut self, now: u64) {
        if self.transmitting {
            return;
        }
        let channel = self.rx_channel_at(now);
        if self.rx_channel != Some(channel) {
            trace!("receiving on channel {}", channel);
            self.transceiver.rx(channel);
            self.rx_channel = Some(channel);
        }
    }

    fn is_tx_possible(&self) -> bool {
        !self.transmitting && self.transceiver.tx_available()
    }

    /// Sends a packet if the current slot's own half has room for it and nothing was sent in
    ///  this slot yet
    fn try_send(&mut self, kind: CodecKind, port: u8, payload: &[u8], now: u64) -> bool {
        let packet_size = HEADER_SIZE + payload.len();
        let (schedule, t) = self.slot_timeline(now);
        let slot = schedule.slot_index(t);
        if self.last_tx_slot == Some(slot) || !schedule.can_send(t, self.airtime_us(packet_size)) || !self.is_tx_possible() {
            return false;
        }

        let first_bit_us = now + self.first_bit_delay_us(packet_size) as u64;
        let (timestamp, channel) = match (&self.hop, self.stage) {
            (Some(hop), LinkStage::Linked) => {
                let timestamp = self.clock.timestamp_at_monotonic(first_bit_us);
                (timestamp, hop.channel_at(timestamp.to_micros()))
            }
            _ => (Timestamp::ZERO, self.handshake_channel),
        };

        let codec = match kind {
            CodecKind::Unlinked => &self.unlinked_codec,
            CodecKind::Session => match self.session.codec() {
                Some(codec) => codec,
                None => {
                    warn!("no session keys for sending on port {} - ignoring", port);
                    return false;
                }
            },
        };
        let packet = match codec.encode(self.next_send_counter, port, payload, &timestamp) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("failed to encode packet for port {}: {}", port, e);
                return false;
            }
        };

        if !self.transceiver.tx(packet.as_bytes(), channel) {
            debug!("transceiver refused packet");
            return false;
        }
        trace!("sent {} bytes on channel {} with counter {}", packet.len(), channel, self.next_send_counter);

        self.next_send_counter = self.next_send_counter.wrapping_add(1);
        self.transmitting = true;
        self.rx_channel = None;
        self.last_tx_slot = Some(slot);
        self.status.tx_count += 1;
        self.send_scheduler.on_transmit(now);
        true
    }

    pub(crate) fn try_send_message(&mut self, message: LinkMessage, now: u64) -> bool {
        let kind = match message {
            LinkMessage::Unlinked(_) => CodecKind::Unlinked,
            LinkMessage::Linking(_) | LinkMessage::Linked(_) => CodecKind::Session,
        };
        self.try_send(kind, LINK_PORT, &message.to_payload(), now)
    }

    fn decode(&self, data: &[u8], rx_ts: &Timestamp) -> anyhow::Result<(CodecKind, DecodedPacket)> {
        if self.stage == LinkStage::Linked {
            let Some(codec) = self.session.codec() else {
                bail!("linked without session keys");
            };
            let packet = codec.decode_with_tolerance(data, rx_ts, self.config.decode_time_tolerance_us)?;
            return Ok((CodecKind::Session, packet));
        }

        if let Some(codec) = self.session.codec() {
            if let Ok(packet) = codec.decode(data, &Timestamp::ZERO) {
                return Ok((CodecKind::Session, packet));
            }
        }
        Ok((CodecKind::Unlinked, self.unlinked_codec.decode(data, &Timestamp::ZERO)?))
    }

    pub(crate) fn reject(&mut self, reason: &str) {
        debug!("rejecting packet: {}", reason);
        self.status.rejected_count += 1;
    }

    pub(crate) fn enter_linked(&mut self, now: u64, own_half_offset_us: u64) -> anyhow::Result<()> {
        let Some(seed) = self.session.hop_seed() else {
            bail!("session has no hop seed");
        };
        self.hop = Some(ChannelHop::new(seed, self.config.hop_period_us(), self.config.channel_count));
        self.linked_duplex = DuplexSchedule::new(self.config.duplex_period_us(), own_half_offset_us);
        self.last_tx_slot = None;
        self.rx_channel = None;
        self.last_rx_us = now;
        self.report.reset(now);
        self.linked_received = 0;
        self.linked_lost = 0;
        self.set_stage(LinkStage::Linked, now);
        Ok(())
    }

    pub(crate) fn is_link_timed_out(&self, now: u64) -> bool {
        now >= self.last_rx_us + self.config.link_timeout_us() as u64
    }

    /// One linked-stage step: the role's `control` message takes precedence over a due report,
    ///  which takes precedence over a released user packet. Returns whether `control` was
    ///  sent, and the delay until the next step.
    pub(crate) fn linked_tick(&mut self, now: u64, control: Option<LinkedMessage>) -> (bool, u64) {
        self.arm_rx(now);

        let mut control_sent = false;
        if let Some(message) = control {
            control_sent = self.try_send_message(LinkMessage::Linked(message), now);
        }
        else if self.report.is_report_due(now) {
            let receive_counter = self.receive_counter.last_accepted().unwrap_or_default();
            let rssi = self.status.last_rssi.unwrap_or(i8::MIN);
            let report = self.report.build(now, rssi, receive_counter);
            if self.try_send_message(LinkMessage::Linked(LinkedMessage::Report(report)), now) {
                self.report.on_report_sent(now);
            }
        }
        else if let Some(pending) = self.send_scheduler.released(now) {
            let port = pending.port;
            let payload = pending.payload.clone();
            if self.try_send(CodecKind::Session, port, &payload, now) {
                self.send_scheduler.complete(now);
            }
        }

        (control_sent, self.linked_delay(now))
    }

    fn linked_delay(&self, now: u64) -> u64 {
        let t = self.link_us(now);
        let mut delay = self.linked_duplex.next_own_half_delay(t);

        if let Some(hop) = &self.hop {
            let eighth = self.linked_duplex.period_us() / 8;
            let until_hop = hop.until_next_slot(t);
            delay = delay.min(if until_hop > eighth { until_hop - eighth } else { until_hop });
        }
        if !self.report.is_report_due(now) {
            delay = delay.min(self.report.report_delay(now));
        }
        if let Some(release_delay) = self.send_scheduler.release_delay(now) {
            if release_delay > 0 {
                delay = delay.min(release_delay);
            }
        }
        let timeout_at = self.last_rx_us + self.config.link_timeout_us() as u64;
        delay.min(timeout_at.saturating_sub(now).max(1))
    }

    fn status(&self) -> LinkStatus {
        let mut status = self.status.clone();
        status.partner_rssi = self.report.partner_rssi();
        status.tune_ppm = self.clock.tune_ppm();
        let total = self.linked_received as u64 + self.linked_lost as u64;
        status.receive_quality = if total == 0 { 0 } else { (self.linked_received as u64 * 255 / total) as u8 };
        status
    }
}


enum RoleState {
    Server(ServerState),
    Client(ClientState),
}

/// One end of a point-to-point link. The host drives it by calling [LinkEngine::tick] after the
///  delay the previous call returned, and by forwarding the transceiver's events.
pub struct LinkEngine<S: LinkSession> {
    core: LinkCore<S>,
    role: RoleState,
}
impl<S: LinkSession> LinkEngine<S> {
    pub fn new(
        config: Arc<LinkConfig>,
        session: S,
        clock_source: Box<dyn ClockSource>,
        transceiver: Box<dyn Transceiver>,
        listener: Box<dyn LinkListener>,
        random: Box<dyn Random>,
    ) -> LinkEngine<S> {
        let clock = LinkClock::new(clock_source, config.tune_tolerance_ppm);
        let role = match session.role() {
            LinkRole::Server => RoleState::Server(ServerState::new(&config)),
            LinkRole::Client => RoleState::Client(ClientState::new(&config)),
        };
        LinkEngine {
            core: LinkCore::new(config, session, clock, transceiver, listener, random),
            role,
        }
    }

    /// Validates the configuration, sets up the clock and measures the local encoding time
    pub fn setup(&mut self) -> anyhow::Result<()> {
        let result = self.calibrate_and_apply();
        if let Err(e) = &result {
            error!("link engine setup failed: {}", e);
        }
        result
    }

    /// Like [LinkEngine::setup], but with a known timing model instead of a measured one. This is
    ///  for targets with a pre-measured model and for virtual radios whose clock does not move
    ///  while encoding.
    pub fn setup_with_timing(&mut self, timing: TimingModel) -> anyhow::Result<()> {
        let result = self.prepare().and_then(|_| self.apply_timing(timing));
        if let Err(e) = &result {
            error!("link engine setup failed: {}", e);
        }
        result
    }

    fn prepare(&mut self) -> anyhow::Result<()> {
        self.core.config.validate()?;
        self.core.clock.setup()?;
        // calibration needs a counting source
        self.core.clock.start();
        Ok(())
    }

    fn calibrate_and_apply(&mut self) -> anyhow::Result<()> {
        self.prepare()?;
        let timing = calibrate(&self.core.clock, self.core.config.calibration_rounds)?;
        self.apply_timing(timing)
    }

    fn apply_timing(&mut self, timing: TimingModel) -> anyhow::Result<()> {
        let max_size = MAX_PACKET_SIZE as u8;
        let budget_us = timing.duration_us(MAX_PACKET_SIZE) as u64
            + self.core.transceiver.time_to_air(max_size) as u64
            + self.core.transceiver.duration_in_air(max_size) as u64;
        let half_us = self.core.config.duplex_period_us() as u64 / 2;
        if budget_us > half_us {
            bail!("sending a maximum size packet takes {}us, which exceeds half a duplex period ({}us)", budget_us, half_us);
        }

        self.core.timing = Some(timing);
        info!("link engine set up as {:?}: {:?}", self.core.session.role(), timing);
        Ok(())
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.core.timing.is_none() {
            bail!("link engine must be set up before it is started");
        }
        if self.core.stage != LinkStage::Disabled {
            return Ok(());
        }

        self.core.clock.start();
        self.core.transceiver.start()?;
        let now = self.core.clock.monotonic_us();
        self.core.set_stage(LinkStage::Booting, now);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.core.stage == LinkStage::Disabled {
            return;
        }
        self.core.transceiver.stop();
        self.core.transmitting = false;
        self.core.rx_channel = None;
        self.core.session.reset();
        let now = self.core.clock.monotonic_us();
        self.core.clock.stop();
        self.core.set_stage(LinkStage::Disabled, now);
    }

    /// Advances timers and state. Returns the number of microseconds after which this must be
    ///  called again (it may be called earlier).
    pub fn tick(&mut self) -> u32 {
        let check_delay = self.core.clock.run_check() as u64;
        if self.core.stage == LinkStage::Disabled {
            return check_delay.max(1) as u32;
        }

        let now = self.core.clock.monotonic_us();
        let delay = match &mut self.role {
            RoleState::Server(server) => {
                if self.core.stage == LinkStage::Booting {
                    server.restart(&mut self.core, now);
                }
                server.tick(&mut self.core, now)
            }
            RoleState::Client(client) => {
                if self.core.stage == LinkStage::Booting {
                    client.restart(&mut self.core, now);
                }
                client.tick(&mut self.core, now)
            }
        };
        delay.min(check_delay).max(1) as u32
    }

    /// A packet arrived. `rx_cycles` is the raw clock reading captured at its first bit.
    pub fn on_rx(&mut self, data: &[u8], rx_cycles: u32, rssi: i8) {
        let core = &mut self.core;
        if matches!(core.stage, LinkStage::Disabled | LinkStage::Booting) {
            return;
        }

        let now = core.clock.monotonic_us();
        let rx = RxInfo {
            rx_us: core.clock.monotonic_at_raw(rx_cycles),
            rx_ts: core.clock.timestamp_at_raw(rx_cycles),
            packet_size: data.len(),
        };

        let (kind, packet) = match core.decode(data, &rx.rx_ts) {
            Ok(decoded) => decoded,
            Err(e) => {
                core.reject(&e.to_string());
                return;
            }
        };

        if kind == CodecKind::Session {
            match core.receive_counter.accept(packet.counter) {
                Ok(lost) => {
                    core.status.lost_count += lost as u32;
                    if core.stage == LinkStage::Linked {
                        core.linked_lost += lost as u32;
                    }
                }
                Err(e) => {
                    core.reject(&e.to_string());
                    return;
                }
            }
        }

        core.status.rx_count += 1;
        core.status.last_rssi = Some(rssi);
        core.last_rx_us = core.last_rx_us.max(rx.rx_us);
        core.report.on_partner_activity(rx.rx_us);
        if core.stage == LinkStage::Linked {
            core.linked_received += 1;
        }

        if packet.port != LINK_PORT {
            if core.stage == LinkStage::Linked {
                trace!("user packet on port {} ({} bytes)", packet.port, packet.payload.len());
                core.listener.on_packet_received(packet.port, &packet.payload, rx.rx_ts);
            }
            else {
                debug!("user packet on port {} before the link is established - ignoring", packet.port);
            }
            return;
        }

        let message = match LinkMessage::deser(&packet.payload) {
            Ok(message) => message,
            Err(e) => {
                core.reject(&e.to_string());
                return;
            }
        };
        let codec_matches = matches!(
            (kind, &message),
            (CodecKind::Unlinked, LinkMessage::Unlinked(_)) |
            (CodecKind::Session, LinkMessage::Linking(_)) |
            (CodecKind::Session, LinkMessage::Linked(_))
        );
        if !codec_matches {
            core.reject("link message with mismatched keys");
            return;
        }

        if let LinkMessage::Linked(LinkedMessage::Report(report)) = &message {
            if core.stage == LinkStage::Linked {
                if core.report.on_report_received(report, &mut core.next_send_counter) {
                    debug!("partner saw counter {} - continuing after it", report.receive_counter);
                }
            }
            return;
        }

        match &mut self.role {
            RoleState::Server(server) => server.on_message(core, message, &rx, now),
            RoleState::Client(client) => client.on_message(core, message, &rx, now),
        }
    }

    /// The transceiver started receiving a packet but could not complete it
    pub fn on_rx_lost(&mut self, rx_cycles: u32) {
        trace!("lost a packet received at cycle {}", rx_cycles);
        self.core.status.rx_lost_notifications += 1;
    }

    pub fn on_tx_done(&mut self) {
        self.core.transmitting = false;
        self.core.rx_channel = None;
        if !matches!(self.core.stage, LinkStage::Disabled | LinkStage::Booting) {
            let now = self.core.clock.monotonic_us();
            self.core.arm_rx(now);
        }
    }

    /// Queues a user packet, which is only possible while linked and when no other packet is
    ///  pending. Lower `priority` values are sent sooner.
    pub fn request_send(&mut self, port: u8, payload: &[u8], priority: u8) -> bool {
        if self.core.stage != LinkStage::Linked {
            return false;
        }
        let now = self.core.clock.monotonic_us();
        self.core.send_scheduler.request(port, payload, priority, now)
    }

    pub fn request_send_cancel(&mut self) {
        self.core.send_scheduler.cancel();
    }

    pub fn is_send_pending(&self) -> bool {
        self.core.send_scheduler.is_pending()
    }

    pub fn stage(&self) -> LinkStage {
        self.core.stage
    }

    pub fn status(&self) -> LinkStatus {
        self.core.status()
    }

    pub fn clock(&self) -> &LinkClock {
        &self.core.clock
    }

    pub fn clock_mut(&mut self) -> &mut LinkClock {
        &mut self.core.clock
    }

    pub fn session(&self) -> &S {
        &self.core.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::source::MockClockSource;
    use crate::crypto::address_match_session::AddressMatchSession;
    use crate::crypto::pke_session::PkeSession;
    use crate::link::transceiver::MockTransceiver;
    use crate::link::MockLinkListener;
    use crate::test_util::simulation::LinkSimulation;
    use crate::test_util::test_config;
    use crate::test_util::virtual_radio::{ManualClockSource, VirtualTime};
    use crate::util::random::MockRandom;

    const SERVER_ADDRESS: [u8; 8] = [1, 1, 1, 1, 1, 1, 1, 1];
    const CLIENT_ADDRESS: [u8; 8] = [2, 2, 2, 2, 2, 2, 2, 2];

    fn address_match_simulation() -> LinkSimulation<AddressMatchSession> {
        LinkSimulation::new(
            test_config(),
            AddressMatchSession::new(LinkRole::Server, SERVER_ADDRESS, CLIENT_ADDRESS, [7; 32]),
            AddressMatchSession::new(LinkRole::Client, CLIENT_ADDRESS, SERVER_ADDRESS, [7; 32]),
        ).unwrap()
    }

    fn linked_simulation() -> LinkSimulation<AddressMatchSession> {
        let mut sim = address_match_simulation();
        sim.start().unwrap();
        assert!(sim.run_until(2_000_000, |s| s.both_linked()));
        sim
    }

    #[test]
    fn test_pke_pair_links() {
        let mut sim = LinkSimulation::new(
            test_config(),
            PkeSession::new(LinkRole::Server),
            PkeSession::new(LinkRole::Client),
        ).unwrap();
        sim.start().unwrap();

        assert!(sim.run_until(2_000_000, |s| s.both_linked()));
        assert_eq!(sim.server_events.stages(), vec![
            LinkStage::Booting,
            LinkStage::AwaitingLink,
            LinkStage::Pairing,
            LinkStage::SwitchingToLinking,
            LinkStage::Authenticating,
            LinkStage::ClockSyncing,
            LinkStage::SwitchingToLinked,
            LinkStage::Linked,
        ]);
        assert_eq!(sim.client_events.stages(), sim.server_events.stages());
        assert_eq!(sim.server.status().failed_link_attempts, 0);
        assert_eq!(sim.client.status().failed_link_attempts, 0);
    }

    #[test]
    fn test_linked_link_stays_up() {
        let mut sim = linked_simulation();
        let rx_before = sim.server.status().rx_count;

        sim.run_for(1_000_000);

        assert!(sim.both_linked());
        let server = sim.server.status();
        let client = sim.client.status();
        assert!(server.rx_count > rx_before);
        assert!(server.linked_since_us.is_some());
        assert_eq!(server.partner_rssi, Some(-40));
        assert!(server.receive_quality > 200);
        assert!(client.receive_quality > 200);
        assert!(client.clock_quality > 200);
        assert_eq!(server.link_losses + client.link_losses, 0);
    }

    #[test]
    fn test_client_clock_offset_is_corrected() {
        let mut sim = address_match_simulation();
        sim.client.clock_mut().shift_seconds(3);
        sim.start().unwrap();

        assert!(sim.run_until(2_000_000, |s| s.both_linked()));

        assert!(sim.client.status().broad_sync_requests <= 2);
        let offset = sim.client.clock().timestamp().micros_since(&sim.server.clock().timestamp());
        assert!(offset.abs() <= 25, "offset {}us", offset);
    }

    #[test]
    fn test_user_packets_both_ways() {
        let mut sim = linked_simulation();

        assert!(sim.server.request_send(9, b"ping", 0));
        assert!(sim.server.is_send_pending());
        assert!(!sim.server.request_send(9, b"again", 0));
        assert!(sim.run_until(500_000, |s| !s.client_events.packets().is_empty()));
        assert!(!sim.server.is_send_pending());

        let received = sim.client_events.packets();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].port, 9);
        assert_eq!(received[0].payload, b"ping".to_vec());
        let age = sim.client.clock().timestamp().micros_since(&received[0].timestamp);
        assert!((0..2_000).contains(&age));

        assert!(sim.client.request_send(3, b"pong", 200));
        assert!(sim.run_until(500_000, |s| !s.server_events.packets().is_empty()));
        assert_eq!(sim.server_events.packets()[0].payload, b"pong".to_vec());
    }

    #[test]
    fn test_cancelled_send_is_not_delivered() {
        let mut sim = linked_simulation();

        assert!(sim.client.request_send(3, b"never", 255));
        sim.client.request_send_cancel();
        assert!(!sim.client.is_send_pending());

        sim.run_for(200_000);
        assert!(sim.server_events.packets().is_empty());
    }

    #[test]
    fn test_blocked_medium_loses_link() {
        let mut sim = linked_simulation();
        sim.set_medium_blocked(true);

        assert!(sim.run_until(1_000_000, |s| s.server.stage() == LinkStage::AwaitingLink && s.client.stage() == LinkStage::AwaitingLink));
        assert_eq!(sim.server.status().link_losses, 1);
        assert_eq!(sim.client.status().link_losses, 1);
        assert!(!sim.server.request_send(9, b"late", 0));

        sim.set_medium_blocked(false);
        assert!(sim.run_until(3_000_000, |s| s.both_linked()));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let mut sim = address_match_simulation();
        sim.start().unwrap();
        sim.run_for(100);

        sim.client.on_rx(&[0x55; 20], 0, -90);
        sim.client.on_rx(&[0x55; 3], 0, -90);
        sim.client.on_rx_lost(0);

        let status = sim.client.status();
        assert_eq!(status.rejected_count, 2);
        assert_eq!(status.rx_lost_notifications, 1);
        assert_eq!(status.last_rssi, None);
    }

    #[test]
    fn test_setup_rejects_slow_transceiver() {
        let mut transceiver = MockTransceiver::new();
        transceiver.expect_time_to_air().return_const(4_000u32);
        transceiver.expect_duration_in_air().return_const(1_500u32);

        let mut engine = LinkEngine::new(
            Arc::new(LinkConfig::new()),
            AddressMatchSession::new(LinkRole::Server, SERVER_ADDRESS, CLIENT_ADDRESS, [7; 32]),
            Box::new(ManualClockSource::new(VirtualTime::new(0))),
            Box::new(transceiver),
            Box::new(MockLinkListener::new()),
            Box::new(MockRandom::new()),
        );

        let err = engine.setup_with_timing(TimingModel::new(2_000, 100)).unwrap_err();
        assert!(err.to_string().contains("exceeds half a duplex period"));
        assert!(engine.start().is_err());
        assert_eq!(engine.stage(), LinkStage::Disabled);
        assert!(!engine.request_send(1, b"x", 0));
    }

    #[test]
    fn test_setup_fails_on_frozen_clock() {
        let mut source = MockClockSource::new();
        source.expect_overflow_value().return_const(u32::MAX);
        source.expect_cycles_per_second().return_const(1_000_000u32);
        source.expect_raw_cycles().return_const(5_000u32);
        source.expect_start().return_const(());

        let mut engine = LinkEngine::new(
            Arc::new(LinkConfig::new()),
            AddressMatchSession::new(LinkRole::Server, SERVER_ADDRESS, CLIENT_ADDRESS, [7; 32]),
            Box::new(source),
            Box::new(MockTransceiver::new()),
            Box::new(MockLinkListener::new()),
            Box::new(MockRandom::new()),
        );

        let err = engine.setup().unwrap_err();
        assert!(err.to_string().contains("calibration"));
        assert!(engine.start().is_err());
        assert_eq!(engine.stage(), LinkStage::Disabled);
    }

    #[test]
    fn test_unacknowledged_switch_to_linked_fails() {
        let mut sim = address_match_simulation();
        sim.start().unwrap();
        assert!(sim.run_until(2_000_000, |s| s.client.stage() == LinkStage::SwitchingToLinked));

        sim.set_medium_blocked(true);
        assert!(sim.run_until(1_000_000, |s| s.client.stage() == LinkStage::AwaitingLink));

        assert_eq!(sim.client.status().failed_link_attempts, 1);
        assert!(!sim.client_events.stages().contains(&LinkStage::Linked));
        assert_ne!(sim.server.stage(), LinkStage::Linked);
    }

    #[test]
    fn test_stop_disables() {
        let mut sim = linked_simulation();
        sim.server.stop();

        assert_eq!(sim.server.stage(), LinkStage::Disabled);
        assert_eq!(sim.server_events.stages().last(), Some(&LinkStage::Disabled));
        assert!(sim.run_until(1_000_000, |s| s.client.stage() == LinkStage::AwaitingLink));
    }
}
