use tracing::{debug, info, trace, warn};

use crate::clock::timestamp::Timestamp;
use crate::clock_sync::client_tracker::{ClientClockSyncTracker, ClockSyncPhase, ClockSyncRequest};
use crate::clock_sync::quality::{ClockErrorTracker, DriftFilter};
use crate::config::LinkConfig;
use crate::crypto::{CalculationStep, LinkRole, LinkSession, SessionId};
use crate::link::engine::{LinkCore, RxInfo};
use crate::link::timed_transition::{TransitionAnnouncer, TransitionFollower, TransitionOutcome};
use crate::link::LinkStage;
use crate::packet::identity::{IdentityAssembler, IdentityFragment};
use crate::packet::linked::LinkedMessage;
use crate::packet::linking::LinkingMessage;
use crate::packet::unlinked::UnlinkedMessage;
use crate::packet::LinkMessage;

fn clock_sync_message(request: ClockSyncRequest, estimate: Timestamp) -> LinkMessage {
    let sequence = request.sequence;
    LinkMessage::Linking(match request.phase {
        ClockSyncPhase::Broad => LinkingMessage::ClockSyncBroadRequest { sequence, estimate },
        ClockSyncPhase::Fine => LinkingMessage::ClockSyncFineRequest { sequence, estimate },
    })
}

/// The client searches the advertising channels, follows the server's switch to linking,
///  synchronizes its clock to the server's and announces the switch to linked. Once linked it
///  keeps tuning its clock from periodic error measurements.
pub(crate) struct ClientState {
    search_index: usize,
    dwell_started_us: u64,
    assembler: IdentityAssembler,
    identity_index: usize,
    linking_started_us: u64,
    follower: TransitionFollower,
    announcer: TransitionAnnouncer,
    server_challenge: Option<u32>,
    challenge: u32,
    clock_sync: ClientClockSyncTracker,
    last_tune_request_us: u64,
    tune_errors: ClockErrorTracker,
    drift: DriftFilter,
}
impl ClientState {
    pub(crate) fn new(config: &LinkConfig) -> ClientState {
        ClientState {
            search_index: 0,
            dwell_started_us: 0,
            assembler: IdentityAssembler::new(),
            identity_index: 0,
            linking_started_us: 0,
            follower: TransitionFollower::new(),
            announcer: TransitionAnnouncer::new(config.transition_duration_us()),
            server_challenge: None,
            challenge: 0,
            clock_sync: ClientClockSyncTracker::new(config.clock_sync_retry_us()),
            last_tune_request_us: 0,
            tune_errors: ClockErrorTracker::new(config.clock_deviation_threshold_us, config.clock_quality_reference_us),
            drift: DriftFilter::new(config.tune_tolerance_ppm),
        }
    }

    pub(crate) fn restart<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64) {
        core.session.reset();
        core.reset_link_state(now);
        self.assembler.reset();
        self.identity_index = 0;
        self.follower.reset();
        self.server_challenge = None;
        self.clock_sync.reset();
        self.tune_errors.reset();
        self.drift.reset();
        core.clock.set_tune(0);
        core.status.clock_quality = 0;

        self.dwell_started_us = now;
        let channel = core.config.advertising_channels[self.search_index % core.config.advertising_channels.len()];
        core.set_handshake_channel(channel, None);
        core.set_stage(LinkStage::AwaitingLink, now);
    }

    fn fail<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64, reason: &str) {
        warn!("link attempt failed: {}", reason);
        core.status.failed_link_attempts += 1;
        self.restart(core, now);
    }

    pub(crate) fn tick<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64) -> u64 {
        core.arm_rx(now);

        let stage = core.stage();
        if stage.is_linking() && now >= self.linking_started_us + core.config.linking_timeout_us() as u64 {
            self.fail(core, now, "linking timed out");
            return 0;
        }

        match stage {
            LinkStage::AwaitingLink => self.tick_awaiting_link(core, now),
            LinkStage::Pairing => self.tick_pairing(core, now),
            LinkStage::SwitchingToLinking => self.tick_switching_to_linking(core, now),
            LinkStage::Authenticating => {
                if let Some(server_challenge) = self.server_challenge {
                    match core.session.auth_response(server_challenge, LinkRole::Client.tx_direction()) {
                        Ok(response) => {
                            let reply = LinkingMessage::AuthReply { response, challenge: self.challenge };
                            core.try_send_message(LinkMessage::Linking(reply), now);
                        }
                        Err(e) => {
                            self.fail(core, now, &format!("cannot answer the server's challenge: {}", e));
                            return 0;
                        }
                    }
                }
                core.slot_delay(now)
            }
            LinkStage::ClockSyncing => self.tick_clock_syncing(core, now),
            LinkStage::SwitchingToLinked => self.tick_switching_to_linked(core, now),
            LinkStage::Linked => self.tick_linked(core, now),
            LinkStage::Disabled | LinkStage::Booting => core.slot_delay(now),
        }
    }

    fn tick_awaiting_link<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64) -> u64 {
        let dwell_us = core.config.search_dwell_us() as u64;
        if now >= self.dwell_started_us + dwell_us {
            let channels = &core.config.advertising_channels;
            self.search_index = (self.search_index + 1) % channels.len();
            let channel = channels[self.search_index];
            trace!("searching on channel {}", channel);

            self.dwell_started_us = now;
            self.assembler.reset();
            core.set_handshake_channel(channel, None);
            core.arm_rx(now);
        }
        (self.dwell_started_us + dwell_us).saturating_sub(now)
    }

    fn tick_pairing<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64) -> u64 {
        if core.stage_elapsed_us(now) >= core.config.pairing_timeout_us() as u64 {
            self.fail(core, now, "pairing timed out");
            return 0;
        }

        if !core.session.is_ready() {
            match core.session.calculate() {
                Ok(CalculationStep::Done) => debug!("session {} calculated", core.session.session_id()),
                Ok(CalculationStep::Pending) => return 0,
                Err(e) => {
                    self.fail(core, now, &format!("session calculation failed: {}", e));
                    return 0;
                }
            }
        }

        let fragment = IdentityFragment::of(core.session.local_identity(), self.identity_index);
        let request = UnlinkedMessage::LinkingStartRequest {
            session_id: core.session.session_id(),
            fragment,
        };
        if core.try_send_message(LinkMessage::Unlinked(request), now) {
            self.identity_index = self.identity_index.wrapping_add(1);
        }
        core.slot_delay(now)
    }

    fn enter_authenticating<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64) {
        self.challenge = core.random.next_u32();
        self.server_challenge = None;
        core.set_stage(LinkStage::Authenticating, now);
    }

    fn tick_switching_to_linking<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64) -> u64 {
        if self.follower.is_due(now) {
            self.enter_authenticating(core, now);
            return 0;
        }

        if self.follower.is_ack_pending() && core.try_send_message(LinkMessage::Linking(LinkingMessage::SwitchToLinkingAck), now) {
            self.follower.on_ack_sent();
        }

        let until_switch = self.follower.target_us()
            .map(|target| target.saturating_sub(now))
            .unwrap_or(u64::MAX);
        core.slot_delay(now).min(until_switch)
    }

    fn tick_clock_syncing<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64) -> u64 {
        if self.clock_sync.is_synced() {
            info!("clock synchronized after {} broad and {} fine requests", self.clock_sync.broad_requests(), self.clock_sync.fine_requests());
            self.announcer.start(now);
            core.set_stage(LinkStage::SwitchingToLinked, now);
            return 0;
        }

        if let Some(request) = self.clock_sync.next_request(now) {
            let first_bit_us = core.first_bit_us(now, &clock_sync_message(request, Timestamp::ZERO));
            let estimate = core.clock.timestamp_at_monotonic(first_bit_us);
            if core.try_send_message(clock_sync_message(request, estimate), now) {
                self.clock_sync.on_request_sent(request, now);
                core.status.broad_sync_requests = self.clock_sync.broad_requests();
            }
        }

        let delay = core.slot_delay(now);
        match self.clock_sync.retry_delay_us(now) {
            Some(retry) if retry > 0 => delay.min(retry),
            _ => delay,
        }
    }

    fn tick_switching_to_linked<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64) -> u64 {
        match self.announcer.poll(now) {
            TransitionOutcome::Completed => {
                let own_half_offset_us = core.config.duplex_period_us() as u64 / 2;
                match core.enter_linked(now, own_half_offset_us) {
                    Ok(()) => self.last_tune_request_us = now,
                    Err(e) => self.fail(core, now, &format!("cannot enter linked stage: {}", e)),
                }
                return 0;
            }
            TransitionOutcome::Failed => {
                self.fail(core, now, "server did not acknowledge the switch to linked");
                return 0;
            }
            TransitionOutcome::Restarted => debug!("no switch to linked request went out - announcing again"),
            TransitionOutcome::Pending => {}
        }

        let probe = LinkMessage::Linking(LinkingMessage::SwitchToLinked { time_remaining_us: 0 });
        let first_bit_us = core.first_bit_us(now, &probe);
        if let Some(time_remaining_us) = self.announcer.time_remaining(first_bit_us) {
            let request = LinkingMessage::SwitchToLinked { time_remaining_us };
            if core.try_send_message(LinkMessage::Linking(request), now) {
                self.announcer.on_request_sent();
            }
        }

        core.slot_delay(now)
            .min(self.announcer.deadline_us().saturating_sub(now))
    }

    fn tick_linked<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64) -> u64 {
        if core.is_link_timed_out(now) {
            warn!("no packet from the server within the link timeout - link lost");
            core.status.link_losses += 1;
            self.restart(core, now);
            return 0;
        }

        let tune_due_at = self.last_tune_request_us + core.config.clock_tune_period_us() as u64;
        let control = if now >= tune_due_at {
            let probe = LinkMessage::Linked(LinkedMessage::ClockTuneRequest { estimate: Timestamp::ZERO });
            let first_bit_us = core.first_bit_us(now, &probe);
            Some(LinkedMessage::ClockTuneRequest { estimate: core.clock.timestamp_at_monotonic(first_bit_us) })
        }
        else {
            None
        };

        let (control_sent, delay) = core.linked_tick(now, control);
        if control_sent {
            self.last_tune_request_us = now;
        }
        if now >= tune_due_at {
            delay
        }
        else {
            delay.min(tune_due_at - now)
        }
    }

    pub(crate) fn on_message<S: LinkSession>(&mut self, core: &mut LinkCore<S>, message: LinkMessage, rx: &RxInfo, now: u64) {
        match (core.stage(), message) {
            (LinkStage::AwaitingLink | LinkStage::Pairing, LinkMessage::Unlinked(UnlinkedMessage::SessionAvailable { session_id, fragment })) => {
                self.on_session_available(core, session_id, &fragment, rx, now);
            }
            (stage @ (LinkStage::Pairing | LinkStage::SwitchingToLinking), LinkMessage::Linking(LinkingMessage::SwitchToLinking { time_remaining_us })) => {
                self.follower.on_request(rx.rx_us, time_remaining_us);
                if stage == LinkStage::Pairing {
                    self.linking_started_us = now;
                    core.set_stage(LinkStage::SwitchingToLinking, now);
                }
            }
            (stage @ (LinkStage::SwitchingToLinking | LinkStage::Authenticating), LinkMessage::Linking(LinkingMessage::AuthRequest { challenge })) => {
                if stage == LinkStage::SwitchingToLinking {
                    // the server switched before our deadline
                    self.enter_authenticating(core, now);
                }
                self.server_challenge = Some(challenge);
            }
            (LinkStage::Authenticating, LinkMessage::Linking(LinkingMessage::AuthAccepted { response })) => {
                self.on_auth_accepted(core, response, now);
            }
            (LinkStage::ClockSyncing, LinkMessage::Linking(LinkingMessage::ClockSyncBroadReply { sequence, error, accepted })) => {
                if let Some(correction_us) = self.clock_sync.on_broad_reply(sequence, error, accepted) {
                    core.clock.shift_sub_seconds(correction_us);
                }
            }
            (LinkStage::ClockSyncing, LinkMessage::Linking(LinkingMessage::ClockSyncFineReply { sequence, error, accepted })) => {
                if let Some(correction_us) = self.clock_sync.on_fine_reply(sequence, error, accepted) {
                    core.clock.shift_sub_seconds(correction_us);
                }
            }
            (LinkStage::SwitchingToLinked, LinkMessage::Linking(LinkingMessage::SwitchToLinkedAck)) => {
                self.announcer.on_ack();
            }
            (LinkStage::Linked, LinkMessage::Linked(LinkedMessage::ClockTuneReply { error_us })) => {
                self.on_tune_reply(core, error_us, now);
            }
            (stage, message) => debug!("received {:?} in stage {:?} - ignoring", message, stage),
        }
    }

    fn on_session_available<S: LinkSession>(&mut self, core: &mut LinkCore<S>, session_id: SessionId, fragment: &IdentityFragment, rx: &RxInfo, now: u64) {
        // advertisements go out at the start of the server's half
        core.align_to_partner(rx);
        if core.stage() == LinkStage::Pairing {
            return;
        }

        let Some(identity) = self.assembler.accept(session_id, fragment) else {
            return;
        };
        core.session.set_session_id(session_id);
        match core.session.set_partner_identity(&identity) {
            Ok(()) => {
                info!("found server session {}", session_id);
                self.identity_index = 0;
                core.set_stage(LinkStage::Pairing, now);
            }
            Err(e) => {
                debug!("rejecting server identity: {}", e);
                self.assembler.reset();
            }
        }
    }

    fn on_auth_accepted<S: LinkSession>(&mut self, core: &mut LinkCore<S>, response: u32, now: u64) {
        match core.session.auth_response(self.challenge, LinkRole::Server.tx_direction()) {
            Ok(expected) if expected == response => {
                info!("server authenticated");
                self.clock_sync.reset();
                core.set_stage(LinkStage::ClockSyncing, now);
            }
            Ok(_) => {
                warn!("server failed authentication");
                core.reject("wrong authentication response");
            }
            Err(e) => warn!("cannot check authentication: {}", e),
        }
    }

    fn on_tune_reply<S: LinkSession>(&mut self, core: &mut LinkCore<S>, error_us: i32, now: u64) {
        self.tune_errors.add_sample(error_us);
        core.status.clock_quality = self.tune_errors.quality();

        if let Some(estimate_us) = self.tune_errors.estimate() {
            let correction_us = -(estimate_us as i64);
            core.clock.shift_sub_seconds(correction_us);
            self.tune_errors.clear_samples();
            let tune_ppm = self.drift.on_correction(correction_us, now);
            let applied = core.clock.set_tune(tune_ppm);
            debug!("clock corrected by {}us, tuning {}ppm", correction_us, applied);
        }
    }
}
