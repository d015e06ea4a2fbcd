use anyhow::{anyhow, bail};
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use tracing::{debug, trace};

use crate::crypto::session_core::SessionCore;
use crate::crypto::{CalculationStep, LinkRole, LinkSession};

/// SEC1 compressed P-256 point
pub const COMPRESSED_KEY_SIZE: usize = 33;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PkeState {
    AwaitingPartner,
    DecompressingPartnerKey,
    CalculatingSecret,
    CalculatingExpandedKey,
    CalculatingAddressing,
    CalculatingLinkingToken,
    CalculatingSessionToken,
    Cached,
}

/// Key establishment through ECDH over P-256. Identities on the wire are compressed public keys.
pub struct PkeSession {
    core: SessionCore,
    secret_key: SecretKey,
    partner_key: Option<PublicKey>,
    state: PkeState,
}
impl PkeSession {
    /// session with a freshly generated key pair
    pub fn new(role: LinkRole) -> PkeSession {
        Self::with_secret_key(role, SecretKey::random(&mut OsRng))
    }

    pub fn from_secret_bytes(role: LinkRole, secret: &[u8]) -> anyhow::Result<PkeSession> {
        let secret_key = SecretKey::from_slice(secret)
            .map_err(|_| anyhow!("invalid P-256 secret key"))?;
        Ok(Self::with_secret_key(role, secret_key))
    }

    fn with_secret_key(role: LinkRole, secret_key: SecretKey) -> PkeSession {
        let compressed = Self::compress(&secret_key.public_key());
        PkeSession {
            core: SessionCore::new(role, compressed),
            secret_key,
            partner_key: None,
            state: PkeState::AwaitingPartner,
        }
    }

    fn compress(public_key: &PublicKey) -> Vec<u8> {
        public_key.to_encoded_point(true).as_bytes().to_vec()
    }

    pub fn state(&self) -> PkeState {
        self.state
    }

    pub fn compressed_public_key(&self) -> &[u8] {
        self.core.local_identity()
    }

    fn step(&mut self) -> anyhow::Result<PkeState> {
        Ok(match self.state {
            PkeState::AwaitingPartner => bail!("no partner public key"),
            PkeState::DecompressingPartnerKey => {
                let partner = PublicKey::from_sec1_bytes(self.core.partner_identity()?)
                    .map_err(|_| anyhow!("partner public key is not a valid curve point"))?;
                self.partner_key = Some(partner);
                PkeState::CalculatingSecret
            }
            PkeState::CalculatingSecret => {
                let partner = self.partner_key.as_ref()
                    .ok_or_else(|| anyhow!("partner public key not decompressed"))?;
                let shared = diffie_hellman(self.secret_key.to_nonzero_scalar(), partner.as_affine());
                self.core.set_secret(shared.raw_secret_bytes().as_slice())?;
                PkeState::CalculatingExpandedKey
            }
            PkeState::CalculatingExpandedKey => {
                self.core.derive_expanded_key()?;
                PkeState::CalculatingAddressing
            }
            PkeState::CalculatingAddressing => {
                self.core.derive_addressing()?;
                PkeState::CalculatingLinkingToken
            }
            PkeState::CalculatingLinkingToken => {
                self.core.derive_linking_token_from_keys()?;
                PkeState::CalculatingSessionToken
            }
            PkeState::CalculatingSessionToken => {
                self.core.derive_session_token()?;
                PkeState::Cached
            }
            PkeState::Cached => PkeState::Cached,
        })
    }
}

impl LinkSession for PkeSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SessionCore {
        &mut self.core
    }

    fn set_partner_identity(&mut self, identity: &[u8]) -> anyhow::Result<()> {
        if identity.len() != COMPRESSED_KEY_SIZE || !matches!(identity[0], 0x02 | 0x03) {
            bail!("partner identity is not a compressed public key");
        }

        if self.core.set_partner_identity(identity)? {
            debug!("session with partner is cached");
            self.state = PkeState::Cached;
        }
        else {
            self.partner_key = None;
            self.state = PkeState::DecompressingPartnerKey;
        }
        Ok(())
    }

    fn calculate(&mut self) -> anyhow::Result<CalculationStep> {
        if self.state != PkeState::Cached {
            self.state = self.step()?;
            trace!("pke session advanced to {:?}", self.state);
        }

        Ok(if self.state == PkeState::Cached {
            CalculationStep::Done
        }
        else {
            CalculationStep::Pending
        })
    }

    fn is_ready(&self) -> bool {
        self.state == PkeState::Cached
    }

    fn reset(&mut self) {
        self.core.reset();
        self.partner_key = None;
        self.state = PkeState::AwaitingPartner;
    }

    fn clear(&mut self) {
        self.core.clear();
        self.partner_key = None;
        self.state = PkeState::AwaitingPartner;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::timestamp::Timestamp;

    fn calculate_to_done(session: &mut PkeSession) -> usize {
        let mut steps = 0;
        loop {
            steps += 1;
            if session.calculate().unwrap() == CalculationStep::Done {
                return steps;
            }
            assert!(steps < 20);
        }
    }

    fn linked_pair() -> (PkeSession, PkeSession) {
        let mut server = PkeSession::new(LinkRole::Server);
        let mut client = PkeSession::new(LinkRole::Client);
        server.set_session_id(0x1234);
        client.set_session_id(0x1234);

        let server_key = server.local_identity().to_vec();
        let client_key = client.local_identity().to_vec();
        server.set_partner_identity(&client_key).unwrap();
        client.set_partner_identity(&server_key).unwrap();

        calculate_to_done(&mut server);
        calculate_to_done(&mut client);
        (server, client)
    }

    #[test]
    fn test_calculation_is_stepped() {
        let mut server = PkeSession::new(LinkRole::Server);
        let client = PkeSession::new(LinkRole::Client);
        server.set_partner_identity(client.local_identity()).unwrap();
        assert_eq!(server.state(), PkeState::DecompressingPartnerKey);
        assert!(server.codec().is_none());

        assert_eq!(calculate_to_done(&mut server), 6);
        assert!(server.is_ready());
    }

    #[test]
    fn test_both_sides_agree() {
        let (server, client) = linked_pair();

        let ts = Timestamp::new(3, 4);
        let packet = server.codec().unwrap().encode(11, 5, b"to client", &ts).unwrap();
        let decoded = client.codec().unwrap().decode(packet.as_bytes(), &ts).unwrap();
        assert_eq!(decoded.payload, b"to client");

        let packet = client.codec().unwrap().encode(12, 6, b"to server", &ts).unwrap();
        assert_eq!(server.codec().unwrap().decode(packet.as_bytes(), &ts).unwrap().port, 6);

        assert_eq!(server.hop_seed(), client.hop_seed());
        assert_eq!(server.auth_response(99, 1).unwrap(), client.auth_response(99, 1).unwrap());
        assert_ne!(server.auth_response(99, 1).unwrap(), server.auth_response(99, 2).unwrap());
    }

    #[test]
    fn test_session_is_cached_across_reset() {
        let (mut server, client) = linked_pair();
        let client_key = client.local_identity().to_vec();

        server.reset();
        assert!(!server.is_ready());
        assert!(server.session_is_cached(&client_key));

        server.set_session_id(0x1234);
        server.set_partner_identity(&client_key).unwrap();
        assert_eq!(server.state(), PkeState::Cached);
        assert_eq!(calculate_to_done(&mut server), 1);
    }

    #[test]
    fn test_cache_invalidated_by_session_id() {
        let (mut server, client) = linked_pair();
        let client_key = client.local_identity().to_vec();

        server.reset();
        server.set_session_id(0x4321);
        assert!(!server.session_is_cached(&client_key));

        server.set_partner_identity(&client_key).unwrap();
        assert_eq!(server.state(), PkeState::DecompressingPartnerKey);
    }

    #[test]
    fn test_cache_is_per_partner() {
        let (mut server, _) = linked_pair();
        let other = PkeSession::new(LinkRole::Client);
        server.reset();
        assert!(!server.session_is_cached(other.local_identity()));
    }

    #[test]
    fn test_rejects_own_key() {
        let mut server = PkeSession::new(LinkRole::Server);
        let own = server.local_identity().to_vec();
        assert!(server.set_partner_identity(&own).is_err());
        assert_eq!(server.state(), PkeState::AwaitingPartner);
    }

    #[test]
    fn test_rejects_invalid_point() {
        let mut server = PkeSession::new(LinkRole::Server);
        assert!(server.set_partner_identity(&[0x04; COMPRESSED_KEY_SIZE]).is_err());

        // well-formed prefix, but not on the curve
        let mut bogus = [0xFFu8; COMPRESSED_KEY_SIZE];
        bogus[0] = 0x02;
        server.set_partner_identity(&bogus).unwrap();
        assert!(server.calculate().is_err());
    }

    #[test]
    fn test_from_secret_bytes_is_deterministic() {
        let a = PkeSession::from_secret_bytes(LinkRole::Server, &[7; 32]).unwrap();
        let b = PkeSession::from_secret_bytes(LinkRole::Client, &[7; 32]).unwrap();
        assert_eq!(a.compressed_public_key(), b.compressed_public_key());
        assert_eq!(a.compressed_public_key().len(), COMPRESSED_KEY_SIZE);
        assert!(PkeSession::from_secret_bytes(LinkRole::Server, &[0; 32]).is_err());
    }

    #[test]
    fn test_clear_drops_cache() {
        let (mut server, client) = linked_pair();
        server.clear();
        assert!(!server.session_is_cached(client.local_identity()));
        assert!(server.codec().is_none());
    }
}
