pub mod address_match_session;
pub mod codec;
pub mod pke_session;
pub mod primitives;
pub mod session_core;

use crate::crypto::codec::PacketCodec;
use crate::crypto::primitives::HOP_SEED_SIZE;
use crate::crypto::session_core::SessionCore;

/// Ephemeral per-attempt identifier chosen by the server. It salts the key expansion, so changing
///  it invalidates any cached session.
pub type SessionId = u16;

const DIRECTION_SERVER_TO_CLIENT: u8 = 0x5C;
const DIRECTION_CLIENT_TO_SERVER: u8 = 0xC5;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkRole {
    Server,
    Client,
}
impl LinkRole {
    pub fn partner(self) -> LinkRole {
        match self {
            LinkRole::Server => LinkRole::Client,
            LinkRole::Client => LinkRole::Server,
        }
    }

    /// nonce byte for packets this role sends
    pub fn tx_direction(self) -> u8 {
        match self {
            LinkRole::Server => DIRECTION_SERVER_TO_CLIENT,
            LinkRole::Client => DIRECTION_CLIENT_TO_SERVER,
        }
    }

    pub fn rx_direction(self) -> u8 {
        self.partner().tx_direction()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CalculationStep {
    Pending,
    Done,
}

/// Key establishment with a partner. Expensive work is split into resumable steps: the owner
///  calls [LinkSession::calculate] once per scheduler tick until it reports
///  [CalculationStep::Done], so that no single tick blocks for a full key agreement.
pub trait LinkSession: Send {
    fn core(&self) -> &SessionCore;
    fn core_mut(&mut self) -> &mut SessionCore;

    /// Stores the partner's identity (as received on the wire) and restarts the calculation,
    ///  unless a session for this identity and session id is cached
    fn set_partner_identity(&mut self, identity: &[u8]) -> anyhow::Result<()>;

    fn calculate(&mut self) -> anyhow::Result<CalculationStep>;

    fn is_ready(&self) -> bool;

    fn role(&self) -> LinkRole {
        self.core().role()
    }

    /// what this side transmits as its identity
    fn local_identity(&self) -> &[u8] {
        self.core().local_identity()
    }

    fn session_id(&self) -> SessionId {
        self.core().session_id()
    }

    fn set_session_id(&mut self, session_id: SessionId) {
        self.core_mut().set_session_id(session_id);
    }

    fn session_is_cached(&self, identity: &[u8]) -> bool {
        self.core().is_cached_for(identity)
    }

    fn codec(&self) -> Option<&PacketCodec> {
        if self.is_ready() {
            self.core().codec()
        }
        else {
            None
        }
    }

    fn hop_seed(&self) -> Option<[u8; HOP_SEED_SIZE]> {
        if self.is_ready() {
            self.core().hop_seed()
        }
        else {
            None
        }
    }

    /// proof of possession of the session keys for a partner's challenge
    fn auth_response(&self, challenge: u32, direction: u8) -> anyhow::Result<u32> {
        self.core().auth_response(challenge, direction)
    }

    /// Forgets the partner but keeps derived material cached for a possible reconnect
    fn reset(&mut self);

    /// Drops all derived material
    fn clear(&mut self);
}
