//! COOKIE ECHO and COOKIE ACK, the second half of the four-way handshake.

use bytes::{Bytes, BytesMut};

use super::{ChunkHeader, CT_COOKIE_ACK, CT_COOKIE_ECHO};
use crate::error::{Error, Result};

/// CookieEchoChunk represents an SCTP Chunk of type COOKIE ECHO
/// (RFC 4960 Sec 3.3.11). The value is the cookie exactly as received in
/// the INIT ACK.
#[derive(Default, Debug, Clone)]
pub(crate) struct CookieEchoChunk {
    pub(crate) cookie: Bytes,
}

impl CookieEchoChunk {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.typ != CT_COOKIE_ECHO {
            return Err(Error::ErrChunkTypeMismatch);
        }
        Ok(CookieEchoChunk {
            cookie: header.value_slice(raw),
        })
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        ChunkHeader {
            typ: CT_COOKIE_ECHO,
            flags: 0,
            value_length: self.cookie.len() as u16,
        }
        .marshal_to(writer)?;
        writer.extend_from_slice(&self.cookie);
        Ok(writer.len())
    }

    pub(crate) fn value_length(&self) -> usize {
        self.cookie.len()
    }
}

/// CookieAckChunk represents an SCTP Chunk of type COOKIE ACK
/// (RFC 4960 Sec 3.3.12); it carries no value.
#[derive(Default, Debug, Clone)]
pub(crate) struct CookieAckChunk;

impl CookieAckChunk {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.typ != CT_COOKIE_ACK {
            return Err(Error::ErrChunkTypeMismatch);
        }
        Ok(CookieAckChunk)
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        ChunkHeader {
            typ: CT_COOKIE_ACK,
            flags: 0,
            value_length: 0,
        }
        .marshal_to(writer)?;
        Ok(writer.len())
    }
}
