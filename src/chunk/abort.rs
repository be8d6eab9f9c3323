use std::fmt;

use bytes::{Bytes, BytesMut};

use super::{ChunkHeader, CHUNK_HEADER_SIZE, CT_ABORT};
use crate::error::{Error, Result};
use crate::error_cause::ErrorCause;

///AbortChunk is sent to the peer of an association to close the
///association (RFC 4960 Sec 3.3.7). It may carry Cause Parameters to
///inform the receiver about the reason of the abort.
///
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|   Type = 6    |Reserved     |T|           Length              |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                   zero or more Error Causes                   |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Default, Debug, Clone)]
pub(crate) struct AbortChunk {
    pub(crate) error_causes: Vec<ErrorCause>,
}

impl fmt::Display for AbortChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut res = vec!["ABORT".to_string()];
        for cause in &self.error_causes {
            res.push(format!(" - {cause}"));
        }
        write!(f, "{}", res.join("\n"))
    }
}

impl AbortChunk {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.typ != CT_ABORT {
            return Err(Error::ErrChunkTypeMismatch);
        }

        let mut error_causes = vec![];
        let mut offset = CHUNK_HEADER_SIZE;
        let end = CHUNK_HEADER_SIZE + header.value_length as usize;
        while offset + 4 <= end {
            let cause = ErrorCause::unmarshal(&raw.slice(offset..end))?;
            offset += cause.length();
            error_causes.push(cause);
        }

        Ok(AbortChunk { error_causes })
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        ChunkHeader {
            typ: CT_ABORT,
            flags: 0,
            value_length: self.value_length() as u16,
        }
        .marshal_to(writer)?;
        for cause in &self.error_causes {
            cause.marshal_to(writer);
        }
        Ok(writer.len())
    }

    pub(crate) fn value_length(&self) -> usize {
        self.error_causes
            .iter()
            .fold(0, |length, cause| length + cause.length())
    }
}
