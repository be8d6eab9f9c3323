//! Minimal Data Channel Establishment Protocol support: just enough of
//! the DATA_CHANNEL_OPEN message (RFC 8832 Sec 5.1) to announce inbound
//! DCEP streams and seed their reliability parameters. Answering the open
//! is left to the application.

use bytes::{Buf, Bytes};

use crate::error::{Error, Result};
use crate::stream::ReliabilityType;

pub(crate) const DCEP_MESSAGE_TYPE_OPEN: u8 = 0x03;

pub(crate) const DCEP_CHANNEL_RELIABLE: u8 = 0x00;
pub(crate) const DCEP_CHANNEL_RELIABLE_UNORDERED: u8 = 0x80;
pub(crate) const DCEP_CHANNEL_PARTIAL_RELIABLE_REXMIT: u8 = 0x01;
pub(crate) const DCEP_CHANNEL_PARTIAL_RELIABLE_REXMIT_UNORDERED: u8 = 0x81;
pub(crate) const DCEP_CHANNEL_PARTIAL_RELIABLE_TIMED: u8 = 0x02;
pub(crate) const DCEP_CHANNEL_PARTIAL_RELIABLE_TIMED_UNORDERED: u8 = 0x82;

const DCEP_OPEN_HEADER_LENGTH: usize = 12;

///The DATA_CHANNEL_OPEN message:
///
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|  Message Type |  Channel Type |            Priority           |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                    Reliability Parameter                      |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|         Label Length          |       Protocol Length         |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                             Label                             |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                            Protocol                           |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DcepOpen {
    pub(crate) channel_type: u8,
    pub(crate) priority: u16,
    pub(crate) reliability_parameter: u32,
    pub(crate) label: String,
    pub(crate) protocol: Bytes,
}

impl DcepOpen {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < DCEP_OPEN_HEADER_LENGTH {
            return Err(Error::ErrDcepOpenTooShort);
        }

        let reader = &mut raw.clone();
        if reader.get_u8() != DCEP_MESSAGE_TYPE_OPEN {
            return Err(Error::ErrDcepNotOpen);
        }

        let channel_type = reader.get_u8();
        match channel_type {
            DCEP_CHANNEL_RELIABLE
            | DCEP_CHANNEL_RELIABLE_UNORDERED
            | DCEP_CHANNEL_PARTIAL_RELIABLE_REXMIT
            | DCEP_CHANNEL_PARTIAL_RELIABLE_REXMIT_UNORDERED
            | DCEP_CHANNEL_PARTIAL_RELIABLE_TIMED
            | DCEP_CHANNEL_PARTIAL_RELIABLE_TIMED_UNORDERED => {}
            _ => return Err(Error::ErrDcepInvalidChannelType),
        }

        let priority = reader.get_u16();
        let reliability_parameter = reader.get_u32();
        let label_len = reader.get_u16() as usize;
        let protocol_len = reader.get_u16() as usize;

        if reader.remaining() < label_len + protocol_len {
            return Err(Error::ErrDcepOpenTooShort);
        }

        let label_start = DCEP_OPEN_HEADER_LENGTH;
        let label = String::from_utf8_lossy(&raw[label_start..label_start + label_len]).into_owned();
        let protocol = raw.slice(label_start + label_len..label_start + label_len + protocol_len);

        Ok(DcepOpen {
            channel_type,
            priority,
            reliability_parameter,
            label,
            protocol,
        })
    }

    /// Stream reliability settings this open message asks for.
    pub(crate) fn reliability_params(&self) -> (bool, ReliabilityType, u32) {
        let unordered = self.channel_type & 0x80 != 0;
        let rel_type = match self.channel_type & 0x7f {
            0x01 => ReliabilityType::Rexmit,
            0x02 => ReliabilityType::Timed,
            _ => ReliabilityType::Reliable,
        };
        (unordered, rel_type, self.reliability_parameter)
    }
}
