use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::clock::timestamp::{Timestamp, TimestampError};

pub const HEADER_RANGE_START: u8 = 0x20;
pub const HEADER_RANGE_END: u8 = 0x2F;

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum LinkingHeader {
    SwitchToLinking = 0x20,
    SwitchToLinkingAck = 0x21,
    AuthRequest = 0x22,
    AuthReply = 0x23,
    AuthAccepted = 0x24,
    ClockSyncBroadRequest = 0x25,
    ClockSyncBroadReply = 0x26,
    ClockSyncFineRequest = 0x27,
    ClockSyncFineReply = 0x28,
    SwitchToLinked = 0x29,
    SwitchToLinkedAck = 0x2A,
}

/// Handshake messages, encoded with the session keys and a zero timestamp
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkingMessage {
    SwitchToLinking { time_remaining_us: u32 },
    SwitchToLinkingAck,
    AuthRequest { challenge: u32 },
    AuthReply { response: u32, challenge: u32 },
    AuthAccepted { response: u32 },
    ClockSyncBroadRequest { sequence: u8, estimate: Timestamp },
    ClockSyncBroadReply { sequence: u8, error: TimestampError, accepted: bool },
    ClockSyncFineRequest { sequence: u8, estimate: Timestamp },
    ClockSyncFineReply { sequence: u8, error: TimestampError, accepted: bool },
    SwitchToLinked { time_remaining_us: u32 },
    SwitchToLinkedAck,
}
impl LinkingMessage {
    fn header(&self) -> LinkingHeader {
        match self {
            LinkingMessage::SwitchToLinking { .. } => LinkingHeader::SwitchToLinking,
            LinkingMessage::SwitchToLinkingAck => LinkingHeader::SwitchToLinkingAck,
            LinkingMessage::AuthRequest { .. } => LinkingHeader::AuthRequest,
            LinkingMessage::AuthReply { .. } => LinkingHeader::AuthReply,
            LinkingMessage::AuthAccepted { .. } => LinkingHeader::AuthAccepted,
            LinkingMessage::ClockSyncBroadRequest { .. } => LinkingHeader::ClockSyncBroadRequest,
            LinkingMessage::ClockSyncBroadReply { .. } => LinkingHeader::ClockSyncBroadReply,
            LinkingMessage::ClockSyncFineRequest { .. } => LinkingHeader::ClockSyncFineRequest,
            LinkingMessage::ClockSyncFineReply { .. } => LinkingHeader::ClockSyncFineReply,
            LinkingMessage::SwitchToLinked { .. } => LinkingHeader::SwitchToLinked,
            LinkingMessage::SwitchToLinkedAck => LinkingHeader::SwitchToLinkedAck,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.header().into());
        match self {
            LinkingMessage::SwitchToLinking { time_remaining_us } |
            LinkingMessage::SwitchToLinked { time_remaining_us } => buf.put_u32(*time_remaining_us),
            LinkingMessage::SwitchToLinkingAck |
            LinkingMessage::SwitchToLinkedAck => {}
            LinkingMessage::AuthRequest { challenge } => buf.put_u32(*challenge),
            LinkingMessage::AuthReply { response, challenge } => {
                buf.put_u32(*response);
                buf.put_u32(*challenge);
            }
            LinkingMessage::AuthAccepted { response } => buf.put_u32(*response),
            LinkingMessage::ClockSyncBroadRequest { sequence, estimate } |
            LinkingMessage::ClockSyncFineRequest { sequence, estimate } => {
                buf.put_u8(*sequence);
                ser_timestamp(estimate, buf);
            }
            LinkingMessage::ClockSyncBroadReply { sequence, error, accepted } |
            LinkingMessage::ClockSyncFineReply { sequence, error, accepted } => {
                buf.put_u8(*sequence);
                buf.put_i32(error.seconds);
                buf.put_i32(error.sub_seconds);
                buf.put_u8(*accepted as u8);
            }
        }
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<LinkingMessage> {
        let mut buf = buf;
        let header = LinkingHeader::try_from(buf.try_get_u8()?)?;

        Ok(match header {
            LinkingHeader::SwitchToLinking => LinkingMessage::SwitchToLinking { time_remaining_us: buf.try_get_u32()? },
            LinkingHeader::SwitchToLinkingAck => LinkingMessage::SwitchToLinkingAck,
            LinkingHeader::AuthRequest => LinkingMessage::AuthRequest { challenge: buf.try_get_u32()? },
            LinkingHeader::AuthReply => LinkingMessage::AuthReply {
                response: buf.try_get_u32()?,
                challenge: buf.try_get_u32()?,
            },
            LinkingHeader::AuthAccepted => LinkingMessage::AuthAccepted { response: buf.try_get_u32()? },
            LinkingHeader::ClockSyncBroadRequest => LinkingMessage::ClockSyncBroadRequest {
                sequence: buf.try_get_u8()?,
                estimate: deser_timestamp(&mut buf)?,
            },
            LinkingHeader::ClockSyncBroadReply => {
                let (sequence, error, accepted) = deser_reply(&mut buf)?;
                LinkingMessage::ClockSyncBroadReply { sequence, error, accepted }
            }
            LinkingHeader::ClockSyncFineRequest => LinkingMessage::ClockSyncFineRequest {
                sequence: buf.try_get_u8()?,
                estimate: deser_timestamp(&mut buf)?,
            },
            LinkingHeader::ClockSyncFineReply => {
                let (sequence, error, accepted) = deser_reply(&mut buf)?;
                LinkingMessage::ClockSyncFineReply { sequence, error, accepted }
            }
            LinkingHeader::SwitchToLinked => LinkingMessage::SwitchToLinked { time_remaining_us: buf.try_get_u32()? },
            LinkingHeader::SwitchToLinkedAck => LinkingMessage::SwitchToLinkedAck,
        })
    }
}

pub(crate) fn ser_timestamp(timestamp: &Timestamp, buf: &mut impl BufMut) {
    buf.put_u32(timestamp.seconds);
    buf.put_u32(timestamp.sub_seconds);
}

pub(crate) fn deser_timestamp(buf: &mut impl Buf) -> anyhow::Result<Timestamp> {
    let seconds = buf.try_get_u32()?;
    let sub_seconds = buf.try_get_u32()?;
    if sub_seconds >= crate::clock::timestamp::MICROS_PER_SECOND {
        anyhow::bail!("sub-second field out of range: {}", sub_seconds);
    }
    Ok(Timestamp { seconds, sub_seconds })
}

fn deser_reply(buf: &mut impl Buf) -> anyhow::Result<(u8, TimestampError, bool)> {
    let sequence = buf.try_get_u8()?;
    let seconds = buf.try_get_i32()?;
    let sub_seconds = buf.try_get_i32()?;
    let accepted = buf.try_get_u8()? != 0;
    Ok((sequence, TimestampError { seconds, sub_seconds }, accepted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_layout() {
        let msg = LinkingMessage::ClockSyncBroadReply {
            sequence: 9,
            error: TimestampError { seconds: -3, sub_seconds: -20 },
            accepted: false,
        };
        let mut buf = Vec::new();
        msg.ser(&mut buf);

        assert_eq!(buf, vec![0x26, 9, 0xFF, 0xFF, 0xFF, 0xFD, 0xFF, 0xFF, 0xFF, 0xEC, 0]);
        assert_eq!(LinkingMessage::deser(&buf).unwrap(), msg);
    }

    #[test]
    fn test_rejects_invalid_sub_seconds() {
        let mut buf = vec![0x27, 1];
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(&1_000_000u32.to_be_bytes());
        assert!(LinkingMessage::deser(&buf).is_err());
    }

    #[test]
    fn test_rejects_truncated() {
        assert!(LinkingMessage::deser(&[0x23, 0, 0, 0, 1, 0, 0]).is_err());
        assert!(LinkingMessage::deser(&[0x2B]).is_err());
    }
}
