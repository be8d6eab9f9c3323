//! SHUTDOWN, SHUTDOWN ACK and SHUTDOWN COMPLETE (RFC 4960 Sec 3.3.8-3.3.13).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{ChunkHeader, CT_SHUTDOWN, CT_SHUTDOWN_ACK, CT_SHUTDOWN_COMPLETE};
use crate::error::{Error, Result};

pub(crate) const SHUTDOWN_VALUE_LENGTH: usize = 4;

/// SHUTDOWN carries the sender's cumulative TSN ack so in-flight DATA can
/// drain before the association tears down.
#[derive(Default, Debug, Clone)]
pub(crate) struct ShutdownChunk {
    pub(crate) cumulative_tsn_ack: u32,
}

impl ShutdownChunk {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.typ != CT_SHUTDOWN {
            return Err(Error::ErrChunkTypeMismatch);
        }
        if (header.value_length as usize) != SHUTDOWN_VALUE_LENGTH {
            return Err(Error::ErrChunkHeaderInvalidLength);
        }

        let value = header.value_slice(raw);
        let reader = &mut value.clone();
        Ok(ShutdownChunk {
            cumulative_tsn_ack: reader.get_u32(),
        })
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        ChunkHeader {
            typ: CT_SHUTDOWN,
            flags: 0,
            value_length: SHUTDOWN_VALUE_LENGTH as u16,
        }
        .marshal_to(writer)?;
        writer.put_u32(self.cumulative_tsn_ack);
        Ok(writer.len())
    }
}

#[derive(Default, Debug, Clone)]
pub(crate) struct ShutdownAckChunk;

impl ShutdownAckChunk {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.typ != CT_SHUTDOWN_ACK {
            return Err(Error::ErrChunkTypeMismatch);
        }
        Ok(ShutdownAckChunk)
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        ChunkHeader {
            typ: CT_SHUTDOWN_ACK,
            flags: 0,
            value_length: 0,
        }
        .marshal_to(writer)?;
        Ok(writer.len())
    }
}

#[derive(Default, Debug, Clone)]
pub(crate) struct ShutdownCompleteChunk;

impl ShutdownCompleteChunk {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.typ != CT_SHUTDOWN_COMPLETE {
            return Err(Error::ErrChunkTypeMismatch);
        }
        Ok(ShutdownCompleteChunk)
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        ChunkHeader {
            typ: CT_SHUTDOWN_COMPLETE,
            flags: 0,
            value_length: 0,
        }
        .marshal_to(writer)?;
        Ok(writer.len())
    }
}
