use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use portable_atomic::AtomicBool;

use super::{ChunkHeader, CHUNK_HEADER_SIZE, CT_PAYLOAD_DATA};
use crate::error::{Error, Result};

pub(crate) const DATA_ENDING_FRAGMENT_BITMASK: u8 = 1;
pub(crate) const DATA_BEGINNING_FRAGMENT_BITMASK: u8 = 2;
pub(crate) const DATA_UNORDERED_BITMASK: u8 = 4;
pub(crate) const DATA_IMMEDIATE_SACK_BITMASK: u8 = 8;
pub(crate) const DATA_HEADER_SIZE: usize = 12;

/// Payload Protocol Identifier carried by every DATA chunk.
///
/// The WebRTC values are listed at
/// <https://www.iana.org/assignments/sctp-parameters/sctp-parameters.xhtml#sctp-parameters-25>.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub enum PayloadProtocolIdentifier {
    Dcep = 50,
    String = 51,
    Binary = 53,
    StringEmpty = 56,
    BinaryEmpty = 57,
    #[default]
    Unknown,
}

impl fmt::Display for PayloadProtocolIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            PayloadProtocolIdentifier::Dcep => "WebRTC DCEP",
            PayloadProtocolIdentifier::String => "WebRTC String",
            PayloadProtocolIdentifier::Binary => "WebRTC Binary",
            PayloadProtocolIdentifier::StringEmpty => "WebRTC String (Empty)",
            PayloadProtocolIdentifier::BinaryEmpty => "WebRTC Binary (Empty)",
            _ => "Unknown Payload Protocol Identifier",
        };
        write!(f, "{s}")
    }
}

impl From<u32> for PayloadProtocolIdentifier {
    fn from(v: u32) -> PayloadProtocolIdentifier {
        match v {
            50 => PayloadProtocolIdentifier::Dcep,
            51 => PayloadProtocolIdentifier::String,
            53 => PayloadProtocolIdentifier::Binary,
            56 => PayloadProtocolIdentifier::StringEmpty,
            57 => PayloadProtocolIdentifier::BinaryEmpty,
            _ => PayloadProtocolIdentifier::Unknown,
        }
    }
}

///DataChunk represents an SCTP Chunk of type DATA (RFC 4960 Sec 3.3.1).
///
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|   Type = 0    | Reserved|U|B|E|    Length                     |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                              TSN                              |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|      Stream Identifier S      |   Stream Sequence Number n    |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                  Payload Protocol Identifier                  |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                 User Data (seq n of Stream S)                 |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
/// An unfragmented user message has both B and E set; B=1/E=0 begins a
/// fragmented message, B=0/E=0 continues it, and B=0/E=1 ends it.
#[derive(Debug, Clone)]
pub struct DataChunk {
    pub(crate) unordered: bool,
    pub(crate) beginning_fragment: bool,
    pub(crate) ending_fragment: bool,
    pub(crate) immediate_sack: bool,

    pub(crate) tsn: u32,
    pub(crate) stream_identifier: u16,
    pub(crate) stream_sequence_number: u16,
    pub(crate) payload_type: PayloadProtocolIdentifier,
    pub(crate) user_data: Bytes,

    /// Whether this chunk has been acknowledged by the peer.
    pub(crate) acked: bool,
    /// Times this chunk was reported missing by gap-ack blocks.
    pub(crate) miss_indicator: u32,

    /// Time of the first transmission, for RTT measurement and the Timed
    /// partial-reliability policy.
    pub(crate) sent_time: SystemTime,
    /// Number of transmissions made for this chunk.
    pub(crate) n_sent: u32,

    /// Shared across all fragments of one message.
    pub(crate) abandoned: Arc<AtomicBool>,
    /// Set once the last fragment of the message entered the inflight
    /// queue; abandonment only takes effect for fully inflight messages.
    pub(crate) all_inflight: Arc<AtomicBool>,

    /// Marked by the T3-rtx timeout handler while this chunk waits in the
    /// inflight queue.
    pub(crate) retransmit: bool,
}

impl Default for DataChunk {
    fn default() -> Self {
        DataChunk {
            unordered: false,
            beginning_fragment: false,
            ending_fragment: false,
            immediate_sack: false,
            tsn: 0,
            stream_identifier: 0,
            stream_sequence_number: 0,
            payload_type: PayloadProtocolIdentifier::default(),
            user_data: Bytes::new(),
            acked: false,
            miss_indicator: 0,
            sent_time: SystemTime::now(),
            n_sent: 0,
            abandoned: Arc::new(AtomicBool::new(false)),
            all_inflight: Arc::new(AtomicBool::new(false)),
            retransmit: false,
        }
    }
}

impl fmt::Display for DataChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DATA tsn={} si={} ssn={} len={}",
            self.tsn,
            self.stream_identifier,
            self.stream_sequence_number,
            self.user_data.len()
        )
    }
}

impl DataChunk {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.typ != CT_PAYLOAD_DATA {
            return Err(Error::ErrChunkTypeMismatch);
        }

        let immediate_sack = (header.flags & DATA_IMMEDIATE_SACK_BITMASK) != 0;
        let unordered = (header.flags & DATA_UNORDERED_BITMASK) != 0;
        let beginning_fragment = (header.flags & DATA_BEGINNING_FRAGMENT_BITMASK) != 0;
        let ending_fragment = (header.flags & DATA_ENDING_FRAGMENT_BITMASK) != 0;

        if (header.value_length as usize) < DATA_HEADER_SIZE {
            return Err(Error::ErrChunkPayloadSmall);
        }

        let value = header.value_slice(raw);
        let reader = &mut value.clone();
        let tsn = reader.get_u32();
        let stream_identifier = reader.get_u16();
        let stream_sequence_number = reader.get_u16();
        let payload_type: PayloadProtocolIdentifier = reader.get_u32().into();
        let user_data = value.slice(DATA_HEADER_SIZE..);

        Ok(DataChunk {
            unordered,
            beginning_fragment,
            ending_fragment,
            immediate_sack,
            tsn,
            stream_identifier,
            stream_sequence_number,
            payload_type,
            user_data,
            ..Default::default()
        })
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        let mut flags: u8 = 0;
        if self.ending_fragment {
            flags |= DATA_ENDING_FRAGMENT_BITMASK;
        }
        if self.beginning_fragment {
            flags |= DATA_BEGINNING_FRAGMENT_BITMASK;
        }
        if self.unordered {
            flags |= DATA_UNORDERED_BITMASK;
        }
        if self.immediate_sack {
            flags |= DATA_IMMEDIATE_SACK_BITMASK;
        }

        ChunkHeader {
            typ: CT_PAYLOAD_DATA,
            flags,
            value_length: self.value_length() as u16,
        }
        .marshal_to(writer)?;

        writer.put_u32(self.tsn);
        writer.put_u16(self.stream_identifier);
        writer.put_u16(self.stream_sequence_number);
        writer.put_u32(self.payload_type as u32);
        writer.extend_from_slice(&self.user_data);

        Ok(writer.len())
    }

    pub(crate) fn value_length(&self) -> usize {
        DATA_HEADER_SIZE + self.user_data.len()
    }

    pub(crate) fn abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst) && self.all_inflight.load(Ordering::SeqCst)
    }

    pub(crate) fn set_abandoned(&self, abandoned: bool) {
        self.abandoned.store(abandoned, Ordering::SeqCst);
    }

    pub(crate) fn set_all_inflight(&mut self) {
        if self.ending_fragment {
            self.all_inflight.store(true, Ordering::SeqCst);
        }
    }

    /// Size this chunk occupies inside a bundled packet.
    pub(crate) fn serialized_size(&self) -> usize {
        CHUNK_HEADER_SIZE + DATA_HEADER_SIZE + self.user_data.len()
    }
}
