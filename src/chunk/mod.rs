#[cfg(test)]
mod chunk_test;

pub(crate) mod abort;
pub mod data;
pub(crate) mod error;
pub(crate) mod forward_tsn;
pub(crate) mod init;
pub(crate) mod reconfig;
pub(crate) mod sack;
pub(crate) mod shutdown;
pub(crate) mod state;

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::util::get_padding_size;

use abort::AbortChunk;
use data::DataChunk;
use error::ErrorChunk;
use forward_tsn::ForwardTsnChunk;
use init::InitChunk;
use reconfig::ReconfigChunk;
use sack::SackChunk;
use shutdown::{ShutdownAckChunk, ShutdownChunk, ShutdownCompleteChunk};
use state::{CookieAckChunk, CookieEchoChunk};

/// SCTP Chunk Type field values (RFC 4960 Sec 3.2).
pub(crate) const CT_PAYLOAD_DATA: u8 = 0;
pub(crate) const CT_INIT: u8 = 1;
pub(crate) const CT_INIT_ACK: u8 = 2;
pub(crate) const CT_SACK: u8 = 3;
pub(crate) const CT_ABORT: u8 = 6;
pub(crate) const CT_SHUTDOWN: u8 = 7;
pub(crate) const CT_SHUTDOWN_ACK: u8 = 8;
pub(crate) const CT_ERROR: u8 = 9;
pub(crate) const CT_COOKIE_ECHO: u8 = 10;
pub(crate) const CT_COOKIE_ACK: u8 = 11;
pub(crate) const CT_SHUTDOWN_COMPLETE: u8 = 14;
pub(crate) const CT_RECONFIG: u8 = 130;
pub(crate) const CT_FORWARD_TSN: u8 = 192;

pub(crate) const CHUNK_HEADER_SIZE: usize = 4;

///chunkHeader represents a SCTP Chunk header, defined in RFC 4960 Sec 3.2.
///
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|   Chunk Type  | Chunk  Flags  |        Chunk Length           |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                          Chunk Value                          |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Debug, Clone)]
pub(crate) struct ChunkHeader {
    pub(crate) typ: u8,
    pub(crate) flags: u8,
    pub(crate) value_length: u16,
}

impl ChunkHeader {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < CHUNK_HEADER_SIZE {
            return Err(Error::ErrChunkHeaderTooSmall);
        }

        let reader = &mut raw.clone();
        let typ = reader.get_u8();
        let flags = reader.get_u8();
        let length = reader.get_u16();

        if (length as usize) < CHUNK_HEADER_SIZE || (length as usize) > raw.len() {
            return Err(Error::ErrChunkHeaderInvalidLength);
        }

        // The Chunk Length does not count terminating PADDING, which must
        // be all-zero and at most 3 bytes (RFC 4960 Sec 3.2).
        let value_length = length as usize - CHUNK_HEADER_SIZE;
        let length_after_value = raw.len() - length as usize;
        if length_after_value < 4 {
            for i in (1..=length_after_value).rev() {
                let padding_offset = CHUNK_HEADER_SIZE + value_length + i - 1;
                if raw[padding_offset] != 0 {
                    return Err(Error::ErrChunkHeaderPaddingNonZero);
                }
            }
        }

        Ok(ChunkHeader {
            typ,
            flags,
            value_length: value_length as u16,
        })
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        writer.put_u8(self.typ);
        writer.put_u8(self.flags);
        writer.put_u16(self.value_length + CHUNK_HEADER_SIZE as u16);
        Ok(writer.len())
    }

    pub(crate) fn value_slice(&self, raw: &Bytes) -> Bytes {
        raw.slice(CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + self.value_length as usize)
    }
}

/// A chunk whose type this crate does not implement. The upper two bits of
/// the type byte decide how the receiver reacts (RFC 4960 Sec 3.2).
#[derive(Debug, Clone)]
pub(crate) struct UnknownChunk {
    pub(crate) typ: u8,
    pub(crate) flags: u8,
    pub(crate) value: Bytes,
}

impl UnknownChunk {
    fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        Ok(UnknownChunk {
            typ: header.typ,
            flags: header.flags,
            value: header.value_slice(raw),
        })
    }

    fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        ChunkHeader {
            typ: self.typ,
            flags: self.flags,
            value_length: self.value.len() as u16,
        }
        .marshal_to(writer)?;
        writer.extend_from_slice(&self.value);
        Ok(writer.len())
    }

    /// Raw TLV bytes, reported back in Unrecognized Chunk Type causes.
    pub(crate) fn marshal(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + self.value.len());
        self.marshal_to(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// All chunk types the engine sends or receives.
#[derive(Debug)]
pub(crate) enum Chunk {
    Data(DataChunk),
    /// INIT and INIT ACK share a body; `is_ack` discriminates.
    Init(InitChunk),
    Sack(SackChunk),
    Abort(AbortChunk),
    Shutdown(ShutdownChunk),
    ShutdownAck(ShutdownAckChunk),
    Error(ErrorChunk),
    CookieEcho(CookieEchoChunk),
    CookieAck(CookieAckChunk),
    ShutdownComplete(ShutdownCompleteChunk),
    Reconfig(ReconfigChunk),
    ForwardTsn(ForwardTsnChunk),
    Unknown(UnknownChunk),
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chunk::Data(c) => write!(f, "DATA tsn={} len={}", c.tsn, c.user_data.len()),
            Chunk::Init(c) if c.is_ack => write!(f, "INIT-ACK {c}"),
            Chunk::Init(c) => write!(f, "INIT {c}"),
            Chunk::Sack(c) => write!(f, "{c}"),
            Chunk::Abort(c) => write!(f, "{c}"),
            Chunk::Shutdown(_) => write!(f, "SHUTDOWN"),
            Chunk::ShutdownAck(_) => write!(f, "SHUTDOWN-ACK"),
            Chunk::Error(c) => write!(f, "{c}"),
            Chunk::CookieEcho(_) => write!(f, "COOKIE-ECHO"),
            Chunk::CookieAck(_) => write!(f, "COOKIE-ACK"),
            Chunk::ShutdownComplete(_) => write!(f, "SHUTDOWN-COMPLETE"),
            Chunk::Reconfig(c) => write!(f, "{c}"),
            Chunk::ForwardTsn(c) => write!(f, "{c}"),
            Chunk::Unknown(c) => write!(f, "Unknown ChunkType: {}", c.typ),
        }
    }
}

impl Chunk {
    /// Parses one chunk starting at the front of `raw`.
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::ErrChunkHeaderTooSmall);
        }

        Ok(match raw[0] {
            CT_PAYLOAD_DATA => Chunk::Data(DataChunk::unmarshal(raw)?),
            CT_INIT | CT_INIT_ACK => Chunk::Init(InitChunk::unmarshal(raw)?),
            CT_SACK => Chunk::Sack(SackChunk::unmarshal(raw)?),
            CT_ABORT => Chunk::Abort(AbortChunk::unmarshal(raw)?),
            CT_SHUTDOWN => Chunk::Shutdown(ShutdownChunk::unmarshal(raw)?),
            CT_SHUTDOWN_ACK => Chunk::ShutdownAck(ShutdownAckChunk::unmarshal(raw)?),
            CT_ERROR => Chunk::Error(ErrorChunk::unmarshal(raw)?),
            CT_COOKIE_ECHO => Chunk::CookieEcho(CookieEchoChunk::unmarshal(raw)?),
            CT_COOKIE_ACK => Chunk::CookieAck(CookieAckChunk::unmarshal(raw)?),
            CT_SHUTDOWN_COMPLETE => {
                Chunk::ShutdownComplete(ShutdownCompleteChunk::unmarshal(raw)?)
            }
            CT_RECONFIG => Chunk::Reconfig(ReconfigChunk::unmarshal(raw)?),
            CT_FORWARD_TSN => Chunk::ForwardTsn(ForwardTsnChunk::unmarshal(raw)?),
            _ => Chunk::Unknown(UnknownChunk::unmarshal(raw)?),
        })
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        match self {
            Chunk::Data(c) => c.marshal_to(writer),
            Chunk::Init(c) => c.marshal_to(writer),
            Chunk::Sack(c) => c.marshal_to(writer),
            Chunk::Abort(c) => c.marshal_to(writer),
            Chunk::Shutdown(c) => c.marshal_to(writer),
            Chunk::ShutdownAck(c) => c.marshal_to(writer),
            Chunk::Error(c) => c.marshal_to(writer),
            Chunk::CookieEcho(c) => c.marshal_to(writer),
            Chunk::CookieAck(c) => c.marshal_to(writer),
            Chunk::ShutdownComplete(c) => c.marshal_to(writer),
            Chunk::Reconfig(c) => c.marshal_to(writer),
            Chunk::ForwardTsn(c) => c.marshal_to(writer),
            Chunk::Unknown(c) => c.marshal_to(writer),
        }
    }

    pub(crate) fn value_length(&self) -> usize {
        match self {
            Chunk::Data(c) => c.value_length(),
            Chunk::Init(c) => c.value_length(),
            Chunk::Sack(c) => c.value_length(),
            Chunk::Abort(c) => c.value_length(),
            Chunk::Shutdown(_) => shutdown::SHUTDOWN_VALUE_LENGTH,
            Chunk::ShutdownAck(_) | Chunk::ShutdownComplete(_) | Chunk::CookieAck(_) => 0,
            Chunk::Error(c) => c.value_length(),
            Chunk::CookieEcho(c) => c.value_length(),
            Chunk::Reconfig(c) => c.value_length(),
            Chunk::ForwardTsn(c) => c.value_length(),
            Chunk::Unknown(c) => c.value.len(),
        }
    }

    /// Per-chunk validity checks performed before dispatch.
    pub(crate) fn check(&self) -> Result<()> {
        match self {
            Chunk::Init(c) => c.check(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) fn marshal_chunk(chunk: &Chunk) -> Bytes {
    let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + chunk.value_length());
    chunk.marshal_to(&mut buf).expect("marshal chunk");
    buf.freeze()
}

/// Advances past one serialized chunk: header, value, and value padding.
pub(crate) fn serialized_length(value_length: usize) -> usize {
    CHUNK_HEADER_SIZE + value_length + get_padding_size(value_length)
}
