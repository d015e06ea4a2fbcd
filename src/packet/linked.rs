use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::clock::timestamp::Timestamp;
use crate::packet::linking::{deser_timestamp, ser_timestamp};

pub const HEADER_RANGE_START: u8 = 0x30;
pub const HEADER_RANGE_END: u8 = 0x3F;

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum LinkedHeader {
    Report = 0x30,
    ClockTuneRequest = 0x31,
    ClockTuneReply = 0x32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReportData {
    /// RSSI of the last packet the sender received from us
    pub rssi: i8,
    /// last rolling counter the sender accepted from us
    pub receive_counter: u16,
    pub request_reply: bool,
}

/// Link control messages once linked. They travel on the link port with real timestamps.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkedMessage {
    Report(ReportData),
    ClockTuneRequest { estimate: Timestamp },
    ClockTuneReply { error_us: i32 },
}
impl LinkedMessage {
    fn header(&self) -> LinkedHeader {
        match self {
            LinkedMessage::Report(_) => LinkedHeader::Report,
            LinkedMessage::ClockTuneRequest { .. } => LinkedHeader::ClockTuneRequest,
            LinkedMessage::ClockTuneReply { .. } => LinkedHeader::ClockTuneReply,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.header().into());
        match self {
            LinkedMessage::Report(data) => {
                buf.put_i8(data.rssi);
                buf.put_u16(data.receive_counter);
                buf.put_u8(data.request_reply as u8);
            }
            LinkedMessage::ClockTuneRequest { estimate } => ser_timestamp(estimate, buf),
            LinkedMessage::ClockTuneReply { error_us } => buf.put_i32(*error_us),
        }
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<LinkedMessage> {
        let mut buf = buf;
        let header = LinkedHeader::try_from(buf.try_get_u8()?)?;

        Ok(match header {
            LinkedHeader::Report => LinkedMessage::Report(ReportData {
                rssi: buf.try_get_i8()?,
                receive_counter: buf.try_get_u16()?,
                request_reply: buf.try_get_u8()? != 0,
            }),
            LinkedHeader::ClockTuneRequest => LinkedMessage::ClockTuneRequest { estimate: deser_timestamp(&mut buf)? },
            LinkedHeader::ClockTuneReply => LinkedMessage::ClockTuneReply { error_us: buf.try_get_i32()? },
        })
    }
}
