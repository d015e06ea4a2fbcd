use anyhow::bail;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::crypto::primitives::{sha256, truncated};
use crate::crypto::session_core::SessionCore;
use crate::crypto::{CalculationStep, LinkRole, LinkSession};

pub const ADDRESS_SIZE: usize = 8;
pub const SECRET_KEY_SIZE: usize = 32;

pub type Address = [u8; ADDRESS_SIZE];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressMatchState {
    AwaitingPartner,
    CalculatingLinkingToken,
    CalculatingSecret,
    CalculatingExpandedKey,
    CalculatingAddressing,
    CalculatingSessionToken,
    Cached,
}

/// Key establishment for pre-paired devices: both sides know each other's address and share a
///  static secret key, so no curve math is needed.
pub struct AddressMatchSession {
    core: SessionCore,
    expected_partner: Address,
    secret_key: Zeroizing<[u8; SECRET_KEY_SIZE]>,
    state: AddressMatchState,
}
impl AddressMatchSession {
    pub fn new(role: LinkRole, local_address: Address, partner_address: Address, secret_key: [u8; SECRET_KEY_SIZE]) -> AddressMatchSession {
        AddressMatchSession {
            core: SessionCore::new(role, local_address.to_vec()),
            expected_partner: partner_address,
            secret_key: Zeroizing::new(secret_key),
            state: AddressMatchState::AwaitingPartner,
        }
    }

    pub fn state(&self) -> AddressMatchState {
        self.state
    }

    /// The linking token only depends on the two addresses, ordered server first
    fn linking_token(&self) -> [u8; 16] {
        let local = self.core.local_identity();
        let partner = self.expected_partner.as_slice();
        let (server, client) = match self.core.role() {
            LinkRole::Server => (local, partner),
            LinkRole::Client => (partner, local),
        };
        truncated(&sha256(&[b"address match".as_slice(), server, client]))
    }

    fn step(&mut self) -> anyhow::Result<AddressMatchState> {
        Ok(match self.state {
            AddressMatchState::AwaitingPartner => bail!("no partner address"),
            AddressMatchState::CalculatingLinkingToken => {
                let token = self.linking_token();
                self.core.set_linking_token(token);
                AddressMatchState::CalculatingSecret
            }
            AddressMatchState::CalculatingSecret => {
                let secret = Zeroizing::new(sha256(&[
                    self.secret_key.as_slice(),
                    self.core.linking_token()?.as_slice(),
                ]));
                self.core.set_secret(secret.as_slice())?;
                AddressMatchState::CalculatingExpandedKey
            }
            AddressMatchState::CalculatingExpandedKey => {
                self.core.derive_expanded_key()?;
                AddressMatchState::CalculatingAddressing
            }
            AddressMatchState::CalculatingAddressing => {
                self.core.derive_addressing()?;
                AddressMatchState::CalculatingSessionToken
            }
            AddressMatchState::CalculatingSessionToken => {
                self.core.derive_session_token()?;
                AddressMatchState::Cached
            }
            AddressMatchState::Cached => AddressMatchState::Cached,
        })
    }
}

impl LinkSession for AddressMatchSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SessionCore {
        &mut self.core
    }

    fn set_partner_identity(&mut self, identity: &[u8]) -> anyhow::Result<()> {
        if identity != self.expected_partner.as_slice() {
            bail!("partner address does not match the expected address");
        }

        if self.core.set_partner_identity(identity)? {
            debug!("session with partner is cached");
            self.state = AddressMatchState::Cached;
        }
        else {
            self.state = AddressMatchState::CalculatingLinkingToken;
        }
        Ok(())
    }

    fn calculate(&mut self) -> anyhow::Result<CalculationStep> {
        if self.state != AddressMatchState::Cached {
            self.state = self.step()?;
            trace!("address match session advanced to {:?}", self.state);
        }

        Ok(if self.state == AddressMatchState::Cached {
            CalculationStep::Done
        }
        else {
            CalculationStep::Pending
        })
    }

    fn is_ready(&self) -> bool {
        self.state == AddressMatchState::Cached
    }

    fn reset(&mut self) {
        self.core.reset();
        self.state = AddressMatchState::AwaitingPartner;
    }

    fn clear(&mut self) {
        self.core.clear();
        self.state = AddressMatchState::AwaitingPartner;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::timestamp::Timestamp;

    const SERVER_ADDRESS: Address = [1, 2, 3, 4, 5, 6, 7, 8];
    const CLIENT_ADDRESS: Address = [8, 7, 6, 5, 4, 3, 2, 1];

    fn calculate(session: &mut AddressMatchSession) {
        for _ in 0..10 {
            if session.calculate().unwrap() == CalculationStep::Done {
                return;
            }
        }
        panic!("calculation did not finish");
    }

    fn pair(server_secret: [u8; 32], client_secret: [u8; 32]) -> (AddressMatchSession, AddressMatchSession) {
        let mut server = AddressMatchSession::new(LinkRole::Server, SERVER_ADDRESS, CLIENT_ADDRESS, server_secret);
        let mut client = AddressMatchSession::new(LinkRole::Client, CLIENT_ADDRESS, SERVER_ADDRESS, client_secret);
        server.set_session_id(77);
        client.set_session_id(77);
        server.set_partner_identity(&CLIENT_ADDRESS).unwrap();
        client.set_partner_identity(&SERVER_ADDRESS).unwrap();
        calculate(&mut server);
        calculate(&mut client);
        (server, client)
    }

    #[test]
    fn test_shared_secret_links() {
        let (server, client) = pair([9; 32], [9; 32]);
        let packet = client.codec().unwrap().encode(1, 2, b"hello", &Timestamp::ZERO).unwrap();
        let decoded = server.codec().unwrap().decode(packet.as_bytes(), &Timestamp::ZERO).unwrap();
        assert_eq!(decoded.payload, b"hello");
        assert_eq!(server.auth_response(5, 0xC5).unwrap(), client.auth_response(5, 0xC5).unwrap());
    }

    #[test]
    fn test_different_secrets_do_not_link() {
        let (server, client) = pair([9; 32], [10; 32]);
        let packet = client.codec().unwrap().encode(1, 2, b"hello", &Timestamp::ZERO).unwrap();
        assert!(server.codec().unwrap().decode(packet.as_bytes(), &Timestamp::ZERO).is_err());
    }

    #[test]
    fn test_rejects_unexpected_partner() {
        let mut server = AddressMatchSession::new(LinkRole::Server, SERVER_ADDRESS, CLIENT_ADDRESS, [0; 32]);
        assert!(server.set_partner_identity(&[0; 8]).is_err());
        assert!(server.set_partner_identity(&SERVER_ADDRESS).is_err());
        assert_eq!(server.state(), AddressMatchState::AwaitingPartner);
    }

    #[test]
    fn test_rejects_self_collision() {
        let mut confused = AddressMatchSession::new(LinkRole::Server, SERVER_ADDRESS, SERVER_ADDRESS, [0; 32]);
        assert!(confused.set_partner_identity(&SERVER_ADDRESS).is_err());
    }

    #[test]
    fn test_cached_after_reset() {
        let (mut server, _) = pair([9; 32], [9; 32]);
        server.reset();
        assert!(server.session_is_cached(&CLIENT_ADDRESS));
        server.set_partner_identity(&CLIENT_ADDRESS).unwrap();
        assert!(server.is_ready());
    }

    #[test]
    fn test_calculate_without_partner_fails() {
        let mut server = AddressMatchSession::new(LinkRole::Server, SERVER_ADDRESS, CLIENT_ADDRESS, [0; 32]);
        assert!(server.calculate().is_err());
    }
}
