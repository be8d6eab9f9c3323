use std::fmt;

use bytes::{Bytes, BytesMut};

use super::{ChunkHeader, CHUNK_HEADER_SIZE, CT_ERROR};
use crate::error::{Error, Result};
use crate::error_cause::ErrorCause;

///Operation Error (ERROR) (RFC 4960 Sec 3.3.10).
///
///An endpoint sends this chunk to its peer endpoint to notify it of
///certain error conditions. It contains one or more error causes and is
///not considered fatal in and of itself.
///
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|   Type = 9    | Chunk  Flags  |           Length              |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                    one or more Error Causes                   |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Default, Debug, Clone)]
pub(crate) struct ErrorChunk {
    pub(crate) error_causes: Vec<ErrorCause>,
}

impl fmt::Display for ErrorChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut res = vec!["ERROR".to_string()];
        for cause in &self.error_causes {
            res.push(format!(" - {cause}"));
        }
        write!(f, "{}", res.join("\n"))
    }
}

impl ErrorChunk {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.typ != CT_ERROR {
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

        Ok(ErrorChunk { error_causes })
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        ChunkHeader {
            typ: CT_ERROR,
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
