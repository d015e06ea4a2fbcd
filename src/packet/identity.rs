//! Identities (a compressed public key or a device address) can exceed what fits into one
//!  unlinked message, so they travel as numbered fragments.

use anyhow::bail;
use bytes::{Buf, BufMut};

use crate::crypto::SessionId;
use crate::util::safe_converter::PrecheckedCast;

/// identity bytes per fragment: the payload minus message header, session id and fragment header
pub const FRAGMENT_CAPACITY: usize = 21;
pub const MAX_FRAGMENTS: usize = 15;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IdentityFragment {
    pub index: u8,
    pub count: u8,
    pub bytes: Vec<u8>,
}
impl IdentityFragment {
    /// The `index`-th fragment of an identity, wrapping around so that a sender can simply pass a
    ///  running counter
    pub fn of(identity: &[u8], index: usize) -> IdentityFragment {
        let count = fragment_count(identity.len());
        let index = index % count;
        let start = index * FRAGMENT_CAPACITY;
        let end = (start + FRAGMENT_CAPACITY).min(identity.len());

        IdentityFragment {
            index: index.prechecked_cast(),
            count: count.prechecked_cast(),
            bytes: identity[start..end].to_vec(),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8((self.index << 4) | self.count);
        buf.put_slice(&self.bytes);
    }

    /// A fragment is always the last field of its message, so it consumes the rest of the buffer
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<IdentityFragment> {
        let header = buf.try_get_u8()?;
        let index = header >> 4;
        let count = header & 0x0F;
        if count == 0 || index >= count {
            bail!("invalid identity fragment {} of {}", index, count);
        }

        let len = buf.remaining();
        if len == 0 || len > FRAGMENT_CAPACITY {
            bail!("identity fragment of {} bytes", len);
        }
        let mut bytes = vec![0u8; len];
        buf.copy_to_slice(&mut bytes);

        Ok(IdentityFragment {
            index,
            count,
            bytes,
        })
    }
}

pub fn fragment_count(identity_len: usize) -> usize {
    identity_len.div_ceil(FRAGMENT_CAPACITY).clamp(1, MAX_FRAGMENTS)
}


/// Collects the fragments of one partner's identity. Fragments of a different session or with a
///  different fragment count start over.
#[derive(Default)]
pub struct IdentityAssembler {
    session_id: Option<SessionId>,
    parts: Vec<Option<Vec<u8>>>,
}
impl IdentityAssembler {
    pub fn new() -> IdentityAssembler {
        Default::default()
    }

    pub fn reset(&mut self) {
        self.session_id = None;
        self.parts.clear();
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// Returns the complete identity once the last missing fragment arrives
    pub fn accept(&mut self, session_id: SessionId, fragment: &IdentityFragment) -> Option<Vec<u8>> {
        if self.session_id != Some(session_id) || self.parts.len() != fragment.count as usize {
            self.session_id = Some(session_id);
            self.parts = vec![None; fragment.count as usize];
        }

        self.parts[fragment.index as usize] = Some(fragment.bytes.clone());

        if self.parts.iter().any(|p| p.is_none()) {
            return None;
        }
        let identity = self.parts.iter()
            .flatten()
            .flat_map(|p| p.iter().copied())
            .collect();
        self.parts = vec![None; self.parts.len()];
        Some(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::address(8, 1)]
    #[case::exact(21, 1)]
    #[case::compressed_key(33, 2)]
    #[case::three(43, 3)]
    fn test_fragment_count(#[case] len: usize, #[case] expected: usize) {
        assert_eq!(fragment_count(len), expected);
    }

    #[test]
    fn test_fragment_wraps_index() {
        let identity: Vec<u8> = (0..33).collect();
        let second = IdentityFragment::of(&identity, 3);
        assert_eq!(second.index, 1);
        assert_eq!(second.count, 2);
        assert_eq!(second.bytes, (21..33).collect::<Vec<u8>>());
    }

    #[rstest]
    #[case::zero_count(vec![0x00, 1])]
    #[case::index_out_of_range(vec![0x22, 1])]
    #[case::no_bytes(vec![0x01])]
    #[case::too_long([vec![0x01], vec![7; 22]].concat())]
    fn test_deser_rejects(#[case] buf: Vec<u8>) {
        assert!(IdentityFragment::deser(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn test_assembler() {
        let identity: Vec<u8> = (100..133).collect();
        let first = IdentityFragment::of(&identity, 0);
        let second = IdentityFragment::of(&identity, 1);

        let mut assembler = IdentityAssembler::new();
        assert_eq!(assembler.accept(5, &second), None);
        // a new session discards what was collected so far
        assert_eq!(assembler.accept(6, &first), None);
        assert_eq!(assembler.accept(6, &first), None);
        assert_eq!(assembler.accept(6, &second), Some(identity.clone()));

        // complete again only after both fragments were seen again
        assert_eq!(assembler.accept(6, &second), None);
        assert_eq!(assembler.accept(6, &first), Some(identity));
    }
}
