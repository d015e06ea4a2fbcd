use tracing::{debug, info, warn};

use crate::clock_sync::server_tracker::ServerClockSyncTracker;
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

/// The server advertises sessions, answers the client's requests and is the reference clock.
///  It announces the switch to linking, and follows the client's switch to linked.
pub(crate) struct ServerState {
    assembler: IdentityAssembler,
    advert_index: usize,
    session_started_us: u64,
    linking_started_us: u64,
    announcer: TransitionAnnouncer,
    follower: TransitionFollower,
    challenge: u32,
    clock_sync: ServerClockSyncTracker,
    pending_reply: Option<LinkingMessage>,
    pending_tune_reply: Option<i32>,
}
impl ServerState {
    pub(crate) fn new(config: &LinkConfig) -> ServerState {
        ServerState {
            assembler: IdentityAssembler::new(),
            advert_index: 0,
            session_started_us: 0,
            linking_started_us: 0,
            announcer: TransitionAnnouncer::new(config.transition_duration_us()),
            follower: TransitionFollower::new(),
            challenge: 0,
            clock_sync: ServerClockSyncTracker::new(config.broad_tolerance_seconds, config.clock_tolerance_us),
            pending_reply: None,
            pending_tune_reply: None,
        }
    }

    pub(crate) fn restart<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64) {
        core.session.reset();
        core.reset_link_state(now);
        self.follower.reset();
        self.clock_sync.reset();
        self.pending_reply = None;
        self.pending_tune_reply = None;
        self.rotate_session(core, now);
        core.set_stage(LinkStage::AwaitingLink, now);
    }

    fn fail<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64, reason: &str) {
        warn!("link attempt failed: {}", reason);
        core.status.failed_link_attempts += 1;
        self.restart(core, now);
    }

    fn rotate_session<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64) {
        let session_id: SessionId = core.random.next_u16();
        core.session.set_session_id(session_id);
        self.assembler.reset();
        self.advert_index = 0;
        self.session_started_us = now;

        let channels = &core.config.advertising_channels;
        let channel = channels[session_id as usize % channels.len()];
        core.set_handshake_channel(channel, Some(now));
        debug!("advertising session {} on channel {}", session_id, channel);
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
                let request = LinkingMessage::AuthRequest { challenge: self.challenge };
                core.try_send_message(LinkMessage::Linking(request), now);
                core.slot_delay(now)
            }
            LinkStage::ClockSyncing => {
                if let Some(reply) = self.pending_reply.clone() {
                    if core.try_send_message(LinkMessage::Linking(reply), now) {
                        self.pending_reply = None;
                    }
                }
                core.slot_delay(now)
            }
            LinkStage::SwitchingToLinked => self.tick_switching_to_linked(core, now),
            LinkStage::Linked => self.tick_linked(core, now),
            LinkStage::Disabled | LinkStage::Booting => core.slot_delay(now),
        }
    }

    fn advertise<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64) {
        let fragment = IdentityFragment::of(core.session.local_identity(), self.advert_index);
        let message = UnlinkedMessage::SessionAvailable {
            session_id: core.session.session_id(),
            fragment,
        };
        if core.try_send_message(LinkMessage::Unlinked(message), now) {
            self.advert_index = self.advert_index.wrapping_add(1);
        }
    }

    fn tick_awaiting_link<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64) -> u64 {
        let rotation_us = core.config.session_rotation_timeout_us() as u64;
        if now >= self.session_started_us + rotation_us {
            self.rotate_session(core, now);
        }
        self.advertise(core, now);

        core.slot_delay(now)
            .min((self.session_started_us + rotation_us).saturating_sub(now))
    }

    fn tick_pairing<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64) -> u64 {
        if core.stage_elapsed_us(now) >= core.config.pairing_timeout_us() as u64 {
            self.fail(core, now, "pairing timed out");
            return 0;
        }

        match core.session.calculate() {
            Ok(CalculationStep::Done) => {
                info!("session {} established, switching to linking", core.session.session_id());
                self.linking_started_us = now;
                self.announcer.start(now);
                core.set_stage(LinkStage::SwitchingToLinking, now);
                0
            }
            Ok(CalculationStep::Pending) => {
                // keep the client's timing aligned while calculating
                self.advertise(core, now);
                0
            }
            Err(e) => {
                self.fail(core, now, &format!("session calculation failed: {}", e));
                0
            }
        }
    }

    fn tick_switching_to_linking<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64) -> u64 {
        match self.announcer.poll(now) {
            TransitionOutcome::Completed => {
                self.challenge = core.random.next_u32();
                core.set_stage(LinkStage::Authenticating, now);
                return 0;
            }
            TransitionOutcome::Failed => {
                self.fail(core, now, "client did not acknowledge the switch to linking");
                return 0;
            }
            TransitionOutcome::Restarted => debug!("no switch to linking request went out - announcing again"),
            TransitionOutcome::Pending => {}
        }

        let probe = LinkMessage::Linking(LinkingMessage::SwitchToLinking { time_remaining_us: 0 });
        let first_bit_us = core.first_bit_us(now, &probe);
        if let Some(time_remaining_us) = self.announcer.time_remaining(first_bit_us) {
            let request = LinkingMessage::SwitchToLinking { time_remaining_us };
            if core.try_send_message(LinkMessage::Linking(request), now) {
                self.announcer.on_request_sent();
            }
        }

        core.slot_delay(now)
            .min(self.announcer.deadline_us().saturating_sub(now))
    }

    fn tick_switching_to_linked<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64) -> u64 {
        if self.follower.is_due(now) {
            match core.enter_linked(now, 0) {
                Ok(()) => core.status.clock_quality = u8::MAX,
                Err(e) => self.fail(core, now, &format!("cannot enter linked stage: {}", e)),
            }
            return 0;
        }

        if self.follower.is_ack_pending() && core.try_send_message(LinkMessage::Linking(LinkingMessage::SwitchToLinkedAck), now) {
            self.follower.on_ack_sent();
        }

        let until_switch = self.follower.target_us()
            .map(|target| target.saturating_sub(now))
            .unwrap_or(u64::MAX);
        core.slot_delay(now).min(until_switch)
    }

    fn tick_linked<S: LinkSession>(&mut self, core: &mut LinkCore<S>, now: u64) -> u64 {
        if core.is_link_timed_out(now) {
            warn!("no packet from the client within the link timeout - link lost");
            core.status.link_losses += 1;
            self.restart(core, now);
            return 0;
        }

        let control = self.pending_tune_reply
            .map(|error_us| LinkedMessage::ClockTuneReply { error_us });
        let (control_sent, delay) = core.linked_tick(now, control);
        if control_sent {
            self.pending_tune_reply = None;
        }
        delay
    }

    pub(crate) fn on_message<S: LinkSession>(&mut self, core: &mut LinkCore<S>, message: LinkMessage, rx: &RxInfo, now: u64) {
        match (core.stage(), message) {
            (LinkStage::AwaitingLink, LinkMessage::Unlinked(UnlinkedMessage::LinkingStartRequest { session_id, fragment })) => {
                self.on_linking_start_request(core, session_id, &fragment, now);
            }
            (LinkStage::SwitchingToLinking, LinkMessage::Linking(LinkingMessage::SwitchToLinkingAck)) => {
                self.announcer.on_ack();
            }
            (LinkStage::Authenticating | LinkStage::ClockSyncing, LinkMessage::Linking(LinkingMessage::AuthReply { response, challenge })) => {
                self.on_auth_reply(core, response, challenge, now);
            }
            (LinkStage::ClockSyncing, LinkMessage::Linking(LinkingMessage::ClockSyncBroadRequest { sequence, estimate })) => {
                let verdict = self.clock_sync.on_broad_request(&estimate, &rx.rx_ts);
                self.pending_reply = Some(LinkingMessage::ClockSyncBroadReply { sequence, error: verdict.error, accepted: verdict.accepted });
            }
            (LinkStage::ClockSyncing, LinkMessage::Linking(LinkingMessage::ClockSyncFineRequest { sequence, estimate })) => {
                let verdict = self.clock_sync.on_fine_request(&estimate, &rx.rx_ts);
                self.pending_reply = Some(LinkingMessage::ClockSyncFineReply { sequence, error: verdict.error, accepted: verdict.accepted });
            }
            (LinkStage::ClockSyncing | LinkStage::SwitchingToLinked, LinkMessage::Linking(LinkingMessage::SwitchToLinked { time_remaining_us })) => {
                if !self.clock_sync.is_synced() {
                    debug!("switch to linked before the clock sync completed - ignoring");
                    return;
                }
                self.follower.on_request(rx.rx_us, time_remaining_us);
                core.set_stage(LinkStage::SwitchingToLinked, now);
            }
            (LinkStage::Linked, LinkMessage::Linked(LinkedMessage::ClockTuneRequest { estimate })) => {
                self.pending_tune_reply = Some(estimate.error_to(&rx.rx_ts).to_micros_saturating());
            }
            (stage, message) => debug!("received {:?} in stage {:?} - ignoring", message, stage),
        }
    }

    fn on_linking_start_request<S: LinkSession>(&mut self, core: &mut LinkCore<S>, session_id: SessionId, fragment: &IdentityFragment, now: u64) {
        if session_id != core.session.session_id() {
            debug!("linking start request for session {} while advertising {} - ignoring", session_id, core.session.session_id());
            return;
        }
        let Some(identity) = self.assembler.accept(session_id, fragment) else {
            return;
        };

        match core.session.set_partner_identity(&identity) {
            Ok(()) => {
                info!("client identity received for session {}", session_id);
                core.set_stage(LinkStage::Pairing, now);
            }
            Err(e) => {
                debug!("rejecting client identity: {}", e);
                self.assembler.reset();
            }
        }
    }

    fn on_auth_reply<S: LinkSession>(&mut self, core: &mut LinkCore<S>, response: u32, client_challenge: u32, now: u64) {
        let expected = core.session.auth_response(self.challenge, LinkRole::Client.tx_direction());
        let accepted = core.session.auth_response(client_challenge, LinkRole::Server.tx_direction());
        match (expected, accepted) {
            (Ok(expected), Ok(accepted)) if expected == response => {
                self.pending_reply = Some(LinkingMessage::AuthAccepted { response: accepted });
                if core.stage() == LinkStage::Authenticating {
                    info!("client authenticated");
                    self.clock_sync.reset();
                    core.set_stage(LinkStage::ClockSyncing, now);
                }
            }
            (Ok(_), Ok(_)) => {
                warn!("client failed authentication");
                core.reject("wrong authentication response");
            }
            (Err(e), _) | (_, Err(e)) => warn!("cannot check authentication: {}", e),
        }
    }
}
