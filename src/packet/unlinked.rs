use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::crypto::SessionId;
use crate::packet::identity::IdentityFragment;

pub const HEADER_RANGE_START: u8 = 0x10;
pub const HEADER_RANGE_END: u8 = 0x1F;

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum UnlinkedHeader {
    SessionAvailable = 0x10,
    LinkingStartRequest = 0x11,
}

/// Messages exchanged before any session key exists, encoded with the all-zero unlinked codec
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UnlinkedMessage {
    /// server advertisement, cycling through the fragments of its identity
    SessionAvailable {
        session_id: SessionId,
        fragment: IdentityFragment,
    },
    /// the client's answer, carrying its own identity for the advertised session
    LinkingStartRequest {
        session_id: SessionId,
        fragment: IdentityFragment,
    },
}
impl UnlinkedMessage {
    fn header(&self) -> UnlinkedHeader {
        match self {
            UnlinkedMessage::SessionAvailable { .. } => UnlinkedHeader::SessionAvailable,
            UnlinkedMessage::LinkingStartRequest { .. } => UnlinkedHeader::LinkingStartRequest,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.header().into());
        match self {
            UnlinkedMessage::SessionAvailable { session_id, fragment } |
            UnlinkedMessage::LinkingStartRequest { session_id, fragment } => {
                buf.put_u16(*session_id);
                fragment.ser(buf);
            }
        }
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<UnlinkedMessage> {
        let mut buf = buf;
        let header = UnlinkedHeader::try_from(buf.try_get_u8()?)?;
        let session_id = buf.try_get_u16()?;
        let fragment = IdentityFragment::deser(&mut buf)?;

        Ok(match header {
            UnlinkedHeader::SessionAvailable => UnlinkedMessage::SessionAvailable { session_id, fragment },
            UnlinkedHeader::LinkingStartRequest => UnlinkedMessage::LinkingStartRequest { session_id, fragment },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MAX_PAYLOAD_SIZE;
    use crate::packet::identity::FRAGMENT_CAPACITY;

    #[test]
    fn test_full_fragment_fits_payload() {
        let msg = UnlinkedMessage::LinkingStartRequest {
            session_id: 0xBEEF,
            fragment: IdentityFragment { index: 0, count: 2, bytes: vec![0xAA; FRAGMENT_CAPACITY] },
        };
        let mut buf = Vec::new();
        msg.ser(&mut buf);

        assert_eq!(buf.len(), MAX_PAYLOAD_SIZE);
        assert_eq!(&buf[..4], &[0x11, 0xBE, 0xEF, 0x02]);
        assert_eq!(UnlinkedMessage::deser(&buf).unwrap(), msg);
    }

    #[test]
    fn test_deser_truncated() {
        assert!(UnlinkedMessage::deser(&[0x10, 0x01]).is_err());
        assert!(UnlinkedMessage::deser(&[0x10, 0x01, 0x02]).is_err());
        assert!(UnlinkedMessage::deser(&[0x1F, 0x01, 0x02, 0x01, 0x05]).is_err());
    }
}
