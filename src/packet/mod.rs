//! Wire layout of a link packet:
//!
//! ```ascii
//! 0: MAC tag (4 bytes) - truncated HMAC over addressing key, nonce and everything after the id
//! 4: rolling id (2 bytes) - counter ^ id key ^ low bits of the link second, in the clear
//! 6: port (1 byte) - encrypted
//! 7: payload (0..25 bytes) - encrypted
//! ```
//!
//! Port [LINK_PORT] carries [LinkMessage]s, all other ports carry application data.

pub mod identity;
pub mod linked;
pub mod linking;
pub mod unlinked;

use anyhow::{anyhow, bail};
use bytes::BufMut;

use crate::packet::linked::LinkedMessage;
use crate::packet::linking::LinkingMessage;
use crate::packet::unlinked::UnlinkedMessage;

pub const MAC_SIZE: usize = 4;
pub const ID_SIZE: usize = 2;
pub const PORT_SIZE: usize = 1;
pub const HEADER_SIZE: usize = MAC_SIZE + ID_SIZE + PORT_SIZE;
pub const MAX_PACKET_SIZE: usize = 32;
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

pub const LINK_PORT: u8 = 0xFF;

const ID_INDEX: usize = MAC_SIZE;
const SEALED_INDEX: usize = MAC_SIZE + ID_SIZE;

/// Typed view of one wire packet. Construction enforces the size bounds, so all accessors are
///  infallible.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketBuffer {
    data: [u8; MAX_PACKET_SIZE],
    len: usize,
}
impl PacketBuffer {
    /// zero-filled packet for a payload of the given size
    pub fn new(payload_size: usize) -> anyhow::Result<PacketBuffer> {
        if payload_size > MAX_PAYLOAD_SIZE {
            bail!("payload of {} bytes exceeds the maximum of {}", payload_size, MAX_PAYLOAD_SIZE);
        }
        Ok(PacketBuffer {
            data: [0; MAX_PACKET_SIZE],
            len: HEADER_SIZE + payload_size,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<PacketBuffer> {
        if bytes.len() < HEADER_SIZE || bytes.len() > MAX_PACKET_SIZE {
            bail!("packet size {} outside {}..={}", bytes.len(), HEADER_SIZE, MAX_PACKET_SIZE);
        }
        let mut data = [0; MAX_PACKET_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(PacketBuffer {
            data,
            len: bytes.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn payload_size(&self) -> usize {
        self.len - HEADER_SIZE
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn mac(&self) -> &[u8] {
        &self.data[..MAC_SIZE]
    }

    pub fn set_mac(&mut self, mac: &[u8; MAC_SIZE]) {
        self.data[..MAC_SIZE].copy_from_slice(mac);
    }

    pub fn rolling_id(&self) -> u16 {
        u16::from_be_bytes([self.data[ID_INDEX], self.data[ID_INDEX + 1]])
    }

    pub fn set_rolling_id(&mut self, rolling_id: u16) {
        self.data[ID_INDEX..ID_INDEX + ID_SIZE].copy_from_slice(&rolling_id.to_be_bytes());
    }

    /// port and payload, i.e. the part that gets encrypted
    pub fn sealed(&self) -> &[u8] {
        &self.data[SEALED_INDEX..self.len]
    }

    pub fn sealed_mut(&mut self) -> &mut [u8] {
        &mut self.data[SEALED_INDEX..self.len]
    }
}


/// Sub-protocol message on [LINK_PORT]. The header byte ranges of the three sub-protocols are
///  disjoint, so a message can be classified without knowing the sender's stage.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkMessage {
    Unlinked(UnlinkedMessage),
    Linking(LinkingMessage),
    Linked(LinkedMessage),
}
impl LinkMessage {
    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            LinkMessage::Unlinked(msg) => msg.ser(buf),
            LinkMessage::Linking(msg) => msg.ser(buf),
            LinkMessage::Linked(msg) => msg.ser(buf),
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_PAYLOAD_SIZE);
        self.ser(&mut buf);
        buf
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<LinkMessage> {
        let header = *buf.first()
            .ok_or_else(|| anyhow!("empty link message"))?;

        match header {
            unlinked::HEADER_RANGE_START..=unlinked::HEADER_RANGE_END => Ok(LinkMessage::Unlinked(UnlinkedMessage::deser(buf)?)),
            linking::HEADER_RANGE_START..=linking::HEADER_RANGE_END => Ok(LinkMessage::Linking(LinkingMessage::deser(buf)?)),
            linked::HEADER_RANGE_START..=linked::HEADER_RANGE_END => Ok(LinkMessage::Linked(LinkedMessage::deser(buf)?)),
            other => bail!("unknown link message header {:#04x}", other),
        }
    }
}
