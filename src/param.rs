use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub(crate) const PARAM_HEADER_LENGTH: usize = 4;

/// Parameter types handled by this crate (RFC 4960, RFC 6525, RFC 5061,
/// RFC 3758). Anything else rides along as [`Param::Unknown`] when its
/// type allows skipping.
pub(crate) const PT_STATE_COOKIE: u16 = 7;
pub(crate) const PT_OUT_SSN_RESET_REQ: u16 = 13;
pub(crate) const PT_RECONFIG_RESP: u16 = 16;
pub(crate) const PT_SUPPORTED_EXT: u16 = 0x8008;
pub(crate) const PT_FORWARD_TSN_SUPPORTED: u16 = 0xc000;

pub(crate) const OUT_SSN_RESET_REQ_MIN_LENGTH: usize = 12;

/// This parameter is used by the sender to request the reset of some or
/// all outgoing streams (RFC 6525 Sec 4.1).
#[derive(Default, Debug, Clone, PartialEq)]
pub(crate) struct OutgoingResetRequest {
    /// Monotonically increasing, initialized to the initial TSN.
    pub(crate) request_sequence_number: u32,
    /// Next expected request sequence number minus 1, unless this request
    /// doubles as a response to an incoming one.
    pub(crate) response_sequence_number: u32,
    /// The last TSN this sender assigned (next TSN minus 1).
    pub(crate) sender_last_tsn: u32,
    /// Streams to reset; empty means all.
    pub(crate) stream_identifiers: Vec<u16>,
}

/// Result carried in a Re-configuration Response Parameter (RFC 6525 Sec 4.4).
#[derive(Default, Debug, Copy, Clone, PartialEq)]
#[repr(C)]
pub(crate) enum ReconfigResult {
    SuccessNop = 0,
    SuccessPerformed = 1,
    Denied = 2,
    ErrorWrongSsn = 3,
    ErrorRequestAlreadyInProgress = 4,
    ErrorBadSequenceNumber = 5,
    InProgress = 6,
    #[default]
    Unknown,
}

impl From<u32> for ReconfigResult {
    fn from(v: u32) -> ReconfigResult {
        match v {
            0 => ReconfigResult::SuccessNop,
            1 => ReconfigResult::SuccessPerformed,
            2 => ReconfigResult::Denied,
            3 => ReconfigResult::ErrorWrongSsn,
            4 => ReconfigResult::ErrorRequestAlreadyInProgress,
            5 => ReconfigResult::ErrorBadSequenceNumber,
            6 => ReconfigResult::InProgress,
            _ => ReconfigResult::Unknown,
        }
    }
}

impl fmt::Display for ReconfigResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ReconfigResult::SuccessNop => "Success - Nothing to do",
            ReconfigResult::SuccessPerformed => "Success - Performed",
            ReconfigResult::Denied => "Denied",
            ReconfigResult::ErrorWrongSsn => "Error - Wrong SSN",
            ReconfigResult::ErrorRequestAlreadyInProgress => "Error - Request already in progress",
            ReconfigResult::ErrorBadSequenceNumber => "Error - Bad Sequence Number",
            ReconfigResult::InProgress => "In progress",
            _ => "Unknown ReconfigResult",
        };
        write!(f, "{s}")
    }
}

#[derive(Default, Debug, Clone, PartialEq)]
pub(crate) struct ReconfigResponse {
    /// Copied from the request to tie the response to it.
    pub(crate) response_sequence_number: u32,
    pub(crate) result: ReconfigResult,
}

/// Optional/variable-length parameter carried by INIT, INIT ACK and
/// RECONFIG chunks, in Type-Length-Value format (RFC 4960 Sec 3.2.1).
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Param {
    StateCookie { cookie: Bytes },
    SupportedExtensions { chunk_types: Vec<u8> },
    ForwardTsnSupported,
    OutgoingResetRequest(OutgoingResetRequest),
    ReconfigResponse(ReconfigResponse),
    Unknown { typ: u16, value: Bytes },
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::StateCookie { cookie } => write!(f, "State Cookie ({} bytes)", cookie.len()),
            Param::SupportedExtensions { chunk_types } => {
                write!(f, "Supported Extensions {chunk_types:?}")
            }
            Param::ForwardTsnSupported => write!(f, "Forward TSN supported"),
            Param::OutgoingResetRequest(r) => write!(
                f,
                "Outgoing SSN Reset Request rsn={} last_tsn={} streams={:?}",
                r.request_sequence_number, r.sender_last_tsn, r.stream_identifiers
            ),
            Param::ReconfigResponse(r) => write!(
                f,
                "Re-configuration Response rsn={} result={}",
                r.response_sequence_number, r.result
            ),
            Param::Unknown { typ, value } => {
                write!(f, "Unknown ParamType {typ} ({} bytes)", value.len())
            }
        }
    }
}

impl Param {
    pub(crate) fn param_type(&self) -> u16 {
        match self {
            Param::StateCookie { .. } => PT_STATE_COOKIE,
            Param::SupportedExtensions { .. } => PT_SUPPORTED_EXT,
            Param::ForwardTsnSupported => PT_FORWARD_TSN_SUPPORTED,
            Param::OutgoingResetRequest(_) => PT_OUT_SSN_RESET_REQ,
            Param::ReconfigResponse(_) => PT_RECONFIG_RESP,
            Param::Unknown { typ, .. } => *typ,
        }
    }

    pub(crate) fn value_length(&self) -> usize {
        match self {
            Param::StateCookie { cookie } => cookie.len(),
            Param::SupportedExtensions { chunk_types } => chunk_types.len(),
            Param::ForwardTsnSupported => 0,
            Param::OutgoingResetRequest(r) => {
                OUT_SSN_RESET_REQ_MIN_LENGTH + r.stream_identifiers.len() * 2
            }
            Param::ReconfigResponse(_) => 8,
            Param::Unknown { value, .. } => value.len(),
        }
    }

    /// Parses one parameter from the front of `raw`. The caller advances by
    /// the padded TLV length.
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < PARAM_HEADER_LENGTH {
            return Err(Error::ErrParamHeaderTooShort);
        }

        let reader = &mut raw.clone();
        let typ = reader.get_u16();
        let len = reader.get_u16() as usize;
        if len < PARAM_HEADER_LENGTH || raw.len() < len {
            return Err(Error::ErrParamHeaderTooShort);
        }
        let value = raw.slice(PARAM_HEADER_LENGTH..len);

        match typ {
            PT_STATE_COOKIE => Ok(Param::StateCookie { cookie: value }),
            PT_SUPPORTED_EXT => Ok(Param::SupportedExtensions {
                chunk_types: value.to_vec(),
            }),
            PT_FORWARD_TSN_SUPPORTED => Ok(Param::ForwardTsnSupported),
            PT_OUT_SSN_RESET_REQ => {
                if value.len() < OUT_SSN_RESET_REQ_MIN_LENGTH {
                    return Err(Error::ErrSsnResetRequestParamTooShort);
                }
                let reader = &mut value.clone();
                let request_sequence_number = reader.get_u32();
                let response_sequence_number = reader.get_u32();
                let sender_last_tsn = reader.get_u32();
                let mut stream_identifiers =
                    Vec::with_capacity((value.len() - OUT_SSN_RESET_REQ_MIN_LENGTH) / 2);
                while reader.remaining() >= 2 {
                    stream_identifiers.push(reader.get_u16());
                }
                Ok(Param::OutgoingResetRequest(OutgoingResetRequest {
                    request_sequence_number,
                    response_sequence_number,
                    sender_last_tsn,
                    stream_identifiers,
                }))
            }
            PT_RECONFIG_RESP => {
                if value.len() < 8 {
                    return Err(Error::ErrReconfigRespParamTooShort);
                }
                let reader = &mut value.clone();
                let response_sequence_number = reader.get_u32();
                let result = reader.get_u32().into();
                Ok(Param::ReconfigResponse(ReconfigResponse {
                    response_sequence_number,
                    result,
                }))
            }
            _ => {
                // RFC 4960 Sec 3.2.1: the upper bit of the type decides
                // whether an unrecognized parameter stops processing.
                if (typ >> 15) & 0x01 == 0 {
                    Err(Error::ErrParamTypeUnhandled { typ })
                } else {
                    Ok(Param::Unknown { typ, value })
                }
            }
        }
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        writer.put_u16(self.param_type());
        writer.put_u16((self.value_length() + PARAM_HEADER_LENGTH) as u16);

        match self {
            Param::StateCookie { cookie } => writer.extend_from_slice(cookie),
            Param::SupportedExtensions { chunk_types } => writer.extend_from_slice(chunk_types),
            Param::ForwardTsnSupported => {}
            Param::OutgoingResetRequest(r) => {
                writer.put_u32(r.request_sequence_number);
                writer.put_u32(r.response_sequence_number);
                writer.put_u32(r.sender_last_tsn);
                for sid in &r.stream_identifiers {
                    writer.put_u16(*sid);
                }
            }
            Param::ReconfigResponse(r) => {
                writer.put_u32(r.response_sequence_number);
                writer.put_u32(r.result as u32);
            }
            Param::Unknown { value, .. } => writer.extend_from_slice(value),
        }

        Ok(writer.len())
    }
}
