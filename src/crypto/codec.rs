use anyhow::anyhow;
use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use hmac::Mac;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::clock::timestamp::Timestamp;
use crate::crypto::LinkRole;
use crate::crypto::primitives::{hmac_sha256, ExpandedKey, HmacSha256, ADDRESSING_KEY_SIZE, CYPHER_IV_SIZE, CYPHER_KEY_SIZE, MAC_KEY_SIZE};
use crate::packet::{PacketBuffer, MAC_SIZE};
use crate::util::safe_converter::PrecheckedCast;

/// Length of one sub-token roll: packets are bound to the millisecond they were sent in
pub const SUB_TOKEN_PERIOD_US: u32 = 1_000;
pub const NONCE_SIZE: usize = CYPHER_IV_SIZE;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DecodedPacket {
    pub counter: u16,
    pub port: u8,
    pub payload: Vec<u8>,
}

/// Per-packet authenticated encryption: ChaCha20 over port and payload, and a truncated
///  HMAC-SHA256 tag that folds in the sender's directional addressing key.
///
/// ```ascii
/// nonce = [rolling id(2)][packet size(1)][sub-token roll(2)][seconds(4)][direction(1)][0(2)] ^ iv
/// tag   = HMAC(mac key, addressing key | nonce | ciphertext)[..4]
/// ```
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PacketCodec {
    cypher_key: [u8; CYPHER_KEY_SIZE],
    cypher_iv: [u8; CYPHER_IV_SIZE],
    mac_key: [u8; MAC_KEY_SIZE],
    tx_addressing: [u8; ADDRESSING_KEY_SIZE],
    rx_addressing: [u8; ADDRESSING_KEY_SIZE],
    id_key: u16,
    tx_direction: u8,
    rx_direction: u8,
}
impl PacketCodec {
    /// Codec for packets sent before any key is established: all keys are zero, so this only
    ///  provides integrity against corruption, not authenticity
    pub fn unlinked(role: LinkRole) -> PacketCodec {
        PacketCodec {
            cypher_key: [0; CYPHER_KEY_SIZE],
            cypher_iv: [0; CYPHER_IV_SIZE],
            mac_key: [0; MAC_KEY_SIZE],
            tx_addressing: [0; ADDRESSING_KEY_SIZE],
            rx_addressing: [0; ADDRESSING_KEY_SIZE],
            id_key: 0,
            tx_direction: role.tx_direction(),
            rx_direction: role.rx_direction(),
        }
    }

    pub fn new(key: &ExpandedKey, tx_addressing: [u8; ADDRESSING_KEY_SIZE], rx_addressing: [u8; ADDRESSING_KEY_SIZE], role: LinkRole) -> PacketCodec {
        PacketCodec {
            cypher_key: key.cypher_key,
            cypher_iv: key.cypher_iv,
            mac_key: key.mac_key,
            tx_addressing,
            rx_addressing,
            id_key: key.id_key(),
            tx_direction: role.tx_direction(),
            rx_direction: role.rx_direction(),
        }
    }

    pub fn sub_token_roll(timestamp: &Timestamp) -> u16 {
        (timestamp.to_micros() / SUB_TOKEN_PERIOD_US as u64) as u16
    }

    fn rolling_id(&self, counter: u16, timestamp: &Timestamp) -> u16 {
        counter ^ self.id_key ^ (timestamp.seconds as u16)
    }

    fn nonce(&self, rolling_id: u16, packet_size: usize, timestamp: &Timestamp, direction: u8) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0..2].copy_from_slice(&rolling_id.to_be_bytes());
        nonce[2] = packet_size.prechecked_cast();
        nonce[3..5].copy_from_slice(&Self::sub_token_roll(timestamp).to_be_bytes());
        nonce[5..9].copy_from_slice(&timestamp.seconds.to_be_bytes());
        nonce[9] = direction;

        for (n, iv) in nonce.iter_mut().zip(self.cypher_iv.iter()) {
            *n ^= iv;
        }
        nonce
    }

    fn apply_keystream(&self, nonce: &[u8; NONCE_SIZE], data: &mut [u8]) -> anyhow::Result<()> {
        let mut cipher = ChaCha20::new_from_slices(&self.cypher_key, nonce)
            .map_err(|_| anyhow!("invalid cipher key or nonce length"))?;
        cipher.apply_keystream(data);
        Ok(())
    }

    fn tag(&self, addressing: &[u8; ADDRESSING_KEY_SIZE], nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> anyhow::Result<HmacSha256> {
        hmac_sha256(&self.mac_key, &[addressing.as_slice(), nonce.as_slice(), ciphertext])
    }

    /// `timestamp` is the link time at which the packet's first bit is expected on air, or
    ///  [Timestamp::ZERO] for packets that are not bound to time
    pub fn encode(&self, counter: u16, port: u8, payload: &[u8], timestamp: &Timestamp) -> anyhow::Result<PacketBuffer> {
        let mut packet = PacketBuffer::new(payload.len())?;
        let rolling_id = self.rolling_id(counter, timestamp);
        packet.set_rolling_id(rolling_id);

        let sealed = packet.sealed_mut();
        sealed[0] = port;
        sealed[1..].copy_from_slice(payload);

        let nonce = self.nonce(rolling_id, packet.len(), timestamp, self.tx_direction);
        self.apply_keystream(&nonce, packet.sealed_mut())?;

        let tag = self.tag(&self.tx_addressing, &nonce, packet.sealed())?
            .finalize()
            .into_bytes();
        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&tag[..MAC_SIZE]);
        packet.set_mac(&mac);
        Ok(packet)
    }

    /// Verifies and decrypts a received packet. The tag comparison is constant-time, and the
    ///  received bytes are never modified.
    pub fn decode(&self, data: &[u8], timestamp: &Timestamp) -> anyhow::Result<DecodedPacket> {
        let packet = PacketBuffer::from_bytes(data)?;
        let rolling_id = packet.rolling_id();
        let nonce = self.nonce(rolling_id, packet.len(), timestamp, self.rx_direction);

        self.tag(&self.rx_addressing, &nonce, packet.sealed())?
            .verify_truncated_left(packet.mac())
            .map_err(|_| anyhow!("packet tag mismatch"))?;

        let mut plain = packet.sealed().to_vec();
        self.apply_keystream(&nonce, &mut plain)?;
        let payload = plain.split_off(1);

        Ok(DecodedPacket {
            counter: rolling_id ^ self.id_key ^ (timestamp.seconds as u16),
            port: plain[0],
            payload,
        })
    }

    /// Like [PacketCodec::decode], but if the receive time lies within `tolerance_us` of a
    ///  sub-token boundary, the neighbouring sub-token is tried as well
    pub fn decode_with_tolerance(&self, data: &[u8], timestamp: &Timestamp, tolerance_us: u32) -> anyhow::Result<DecodedPacket> {
        let err = match self.decode(data, timestamp) {
            Ok(packet) => return Ok(packet),
            Err(e) => e,
        };

        let within_roll = timestamp.sub_seconds % SUB_TOKEN_PERIOD_US;
        if within_roll < tolerance_us {
            self.decode(data, &timestamp.shifted(-(tolerance_us as i64)))
        }
        else if within_roll >= SUB_TOKEN_PERIOD_US - tolerance_us {
            self.decode(data, &timestamp.shifted(tolerance_us as i64))
        }
        else {
            Err(err)
        }
    }
}
