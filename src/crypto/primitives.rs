use anyhow::anyhow;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::SessionId;

pub type HmacSha256 = Hmac<Sha256>;

pub const CYPHER_KEY_SIZE: usize = 32;
pub const CYPHER_IV_SIZE: usize = 12;
pub const MAC_KEY_SIZE: usize = 32;
pub const ADDRESSING_SEED_SIZE: usize = 16;
pub const ID_KEY_SIZE: usize = 2;
pub const HOP_SEED_SIZE: usize = 32;

pub const ADDRESSING_KEY_SIZE: usize = 8;
pub const LINKING_TOKEN_SIZE: usize = 16;
pub const SESSION_TOKEN_SIZE: usize = 8;

const EXPANDED_KEY_SIZE: usize = CYPHER_KEY_SIZE + CYPHER_IV_SIZE + MAC_KEY_SIZE + ADDRESSING_SEED_SIZE + ID_KEY_SIZE + HOP_SEED_SIZE;
const EXPANDED_KEY_INFO: &[u8] = b"link expanded key";

/// Symmetric key material of one session, expanded from the shared secret
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ExpandedKey {
    pub cypher_key: [u8; CYPHER_KEY_SIZE],
    pub cypher_iv: [u8; CYPHER_IV_SIZE],
    pub mac_key: [u8; MAC_KEY_SIZE],
    pub addressing_seed: [u8; ADDRESSING_SEED_SIZE],
    pub id_key: [u8; ID_KEY_SIZE],
    pub hop_seed: [u8; HOP_SEED_SIZE],
}
impl ExpandedKey {
    /// HKDF-SHA256 over the shared secret, salted with the session id so that every session gets
    ///  fresh keys even for a static secret
    pub fn derive(secret: &[u8], session_id: SessionId) -> anyhow::Result<ExpandedKey> {
        let hkdf = Hkdf::<Sha256>::new(Some(&session_id.to_be_bytes()), secret);
        let mut okm = Zeroizing::new([0u8; EXPANDED_KEY_SIZE]);
        hkdf.expand(EXPANDED_KEY_INFO, okm.as_mut_slice())
            .map_err(|_| anyhow!("key expansion failed"))?;

        let mut key = ExpandedKey {
            cypher_key: [0; CYPHER_KEY_SIZE],
            cypher_iv: [0; CYPHER_IV_SIZE],
            mac_key: [0; MAC_KEY_SIZE],
            addressing_seed: [0; ADDRESSING_SEED_SIZE],
            id_key: [0; ID_KEY_SIZE],
            hop_seed: [0; HOP_SEED_SIZE],
        };

        let mut rest: &[u8] = okm.as_slice();
        for target in [
            key.cypher_key.as_mut_slice(),
            key.cypher_iv.as_mut_slice(),
            key.mac_key.as_mut_slice(),
            key.addressing_seed.as_mut_slice(),
            key.id_key.as_mut_slice(),
            key.hop_seed.as_mut_slice(),
        ] {
            let (head, tail) = rest.split_at(target.len());
            target.copy_from_slice(head);
            rest = tail;
        }
        Ok(key)
    }

    pub fn id_key(&self) -> u16 {
        u16::from_be_bytes(self.id_key)
    }
}

pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> anyhow::Result<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| anyhow!("invalid HMAC key length"))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac)
}

pub fn hmac_sha256_bytes(key: &[u8], parts: &[&[u8]]) -> anyhow::Result<[u8; 32]> {
    Ok(hmac_sha256(key, parts)?.finalize().into_bytes().into())
}

pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Copies the leading `N` bytes of a digest
pub fn truncated<const N: usize>(digest: &[u8; 32]) -> [u8; N] {
    let mut result = [0u8; N];
    result.copy_from_slice(&digest[..N]);
    result
}
