use anyhow::{anyhow, bail};
use tracing::trace;
use zeroize::Zeroizing;

use crate::crypto::codec::PacketCodec;
use crate::crypto::primitives::{hmac_sha256_bytes, sha256, truncated, ExpandedKey, ADDRESSING_KEY_SIZE, HOP_SEED_SIZE, LINKING_TOKEN_SIZE, SESSION_TOKEN_SIZE};
use crate::crypto::{LinkRole, SessionId};

/// State and derivation steps shared by all key establishment variants. The variants only
///  differ in how they arrive at the shared secret and the linking token.
pub struct SessionCore {
    role: LinkRole,
    local_identity: Vec<u8>,
    session_id: SessionId,
    partner_identity: Option<Vec<u8>>,

    secret: Option<Zeroizing<[u8; 32]>>,
    expanded_key: Option<ExpandedKey>,
    codec: Option<PacketCodec>,
    linking_token: Option<Zeroizing<[u8; LINKING_TOKEN_SIZE]>>,
    session_token: Option<[u8; SESSION_TOKEN_SIZE]>,
}
impl SessionCore {
    pub fn new(role: LinkRole, local_identity: Vec<u8>) -> SessionCore {
        SessionCore {
            role,
            local_identity,
            session_id: 0,
            partner_identity: None,
            secret: None,
            expanded_key: None,
            codec: None,
            linking_token: None,
            session_token: None,
        }
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn local_identity(&self) -> &[u8] {
        &self.local_identity
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn set_session_id(&mut self, session_id: SessionId) {
        if session_id != self.session_id {
            trace!("session id changed from {} to {}, dropping cached session", self.session_id, session_id);
            self.invalidate();
            self.session_id = session_id;
        }
    }

    pub fn partner_identity(&self) -> anyhow::Result<&[u8]> {
        self.partner_identity.as_deref()
            .ok_or_else(|| anyhow!("no partner identity"))
    }

    /// Stores the partner identity. Returns `true` if the derived material for this partner is
    ///  still cached, in which case no calculation is necessary.
    pub fn set_partner_identity(&mut self, identity: &[u8]) -> anyhow::Result<bool> {
        if identity == self.local_identity.as_slice() {
            bail!("partner identity collides with our own");
        }

        let cached = self.is_cached_for(identity);
        if !cached {
            self.invalidate();
        }
        self.partner_identity = Some(identity.to_vec());
        Ok(cached)
    }

    pub fn set_secret(&mut self, secret: &[u8]) -> anyhow::Result<()> {
        let mut stored = Zeroizing::new([0u8; 32]);
        if secret.len() != stored.len() {
            bail!("shared secret has {} bytes, expected {}", secret.len(), stored.len());
        }
        stored.copy_from_slice(secret);
        self.secret = Some(stored);
        Ok(())
    }

    pub fn derive_expanded_key(&mut self) -> anyhow::Result<()> {
        let secret = self.secret.take()
            .ok_or_else(|| anyhow!("no shared secret to expand"))?;
        self.expanded_key = Some(ExpandedKey::derive(secret.as_slice(), self.session_id)?);
        Ok(())
    }

    fn expanded_key(&self) -> anyhow::Result<&ExpandedKey> {
        self.expanded_key.as_ref()
            .ok_or_else(|| anyhow!("key material not derived yet"))
    }

    /// Derives the two directional implicit addressing keys and sets up the packet codec with
    ///  them. The key for a direction is keyed by the sender's identity first, so our transmit
    ///  key is the partner's receive key.
    pub fn derive_addressing(&mut self) -> anyhow::Result<()> {
        let partner = self.partner_identity()?;
        let key = self.expanded_key()?;

        let tx = hmac_sha256_bytes(&key.addressing_seed, &[self.local_identity.as_slice(), partner])?;
        let rx = hmac_sha256_bytes(&key.addressing_seed, &[partner, self.local_identity.as_slice()])?;

        let codec = PacketCodec::new(
            key,
            truncated::<ADDRESSING_KEY_SIZE>(&tx),
            truncated::<ADDRESSING_KEY_SIZE>(&rx),
            self.role,
        );
        self.codec = Some(codec);
        Ok(())
    }

    pub fn set_linking_token(&mut self, token: [u8; LINKING_TOKEN_SIZE]) {
        self.linking_token = Some(Zeroizing::new(token));
    }

    /// linking token bound to the session keys, for variants without a pre-shared token
    pub fn derive_linking_token_from_keys(&mut self) -> anyhow::Result<()> {
        let key = self.expanded_key()?;
        let token = hmac_sha256_bytes(&key.mac_key, &[b"linking token".as_slice(), &self.session_id.to_be_bytes()])?;
        self.set_linking_token(truncated(&token));
        Ok(())
    }

    pub fn linking_token(&self) -> anyhow::Result<&[u8; LINKING_TOKEN_SIZE]> {
        self.linking_token.as_deref()
            .ok_or_else(|| anyhow!("no linking token"))
    }

    fn session_token_for(&self, partner_identity: &[u8]) -> [u8; SESSION_TOKEN_SIZE] {
        let digest = sha256(&[
            b"session token".as_slice(),
            &self.session_id.to_be_bytes(),
            partner_identity,
            &self.local_identity,
        ]);
        truncated(&digest)
    }

    pub fn derive_session_token(&mut self) -> anyhow::Result<()> {
        let token = self.session_token_for(self.partner_identity()?);
        self.session_token = Some(token);
        Ok(())
    }

    /// `true` if a complete derivation for this partner and the current session id is cached
    pub fn is_cached_for(&self, partner_identity: &[u8]) -> bool {
        match &self.session_token {
            Some(token) => self.codec.is_some() && *token == self.session_token_for(partner_identity),
            None => false,
        }
    }

    pub fn codec(&self) -> Option<&PacketCodec> {
        self.codec.as_ref()
    }

    pub fn hop_seed(&self) -> Option<[u8; HOP_SEED_SIZE]> {
        self.expanded_key.as_ref()
            .map(|key| key.hop_seed)
    }

    pub fn auth_response(&self, challenge: u32, direction: u8) -> anyhow::Result<u32> {
        let key = self.expanded_key()?;
        let digest = hmac_sha256_bytes(&key.mac_key, &[
            b"auth".as_slice(),
            self.linking_token()?.as_slice(),
            &challenge.to_be_bytes(),
            &[direction],
        ])?;
        Ok(u32::from_be_bytes(truncated(&digest)))
    }

    pub fn reset(&mut self) {
        self.partner_identity = None;
        self.secret = None;
    }

    fn invalidate(&mut self) {
        self.secret = None;
        self.expanded_key = None;
        self.codec = None;
        self.linking_token = None;
        self.session_token = None;
    }

    pub fn clear(&mut self) {
        self.invalidate();
        self.partner_identity = None;
    }
}
