use std::fmt;

use bytes::{Bytes, BytesMut};

use super::{ChunkHeader, CT_RECONFIG};
use crate::error::{Error, Result};
use crate::param::{Param, PARAM_HEADER_LENGTH};
use crate::util::get_padding_size;

///ReconfigChunk is used to reconfigure streams (RFC 6525 Sec 3.1). It
///carries one or two Re-configuration Parameters.
///
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///| Type = 130    |  Chunk Flags  |      Chunk Length             |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                  Re-configuration Parameter                   |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|             Re-configuration Parameter (optional)             |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Default, Debug, Clone)]
pub(crate) struct ReconfigChunk {
    pub(crate) params: Vec<Param>,
}

impl fmt::Display for ReconfigChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RECONFIG")?;
        for p in &self.params {
            write!(f, " [{p}]")?;
        }
        Ok(())
    }
}

impl ReconfigChunk {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.typ != CT_RECONFIG {
            return Err(Error::ErrChunkTypeMismatch);
        }

        let value = header.value_slice(raw);
        let mut params = vec![];
        let mut offset = 0;
        while value.len() >= offset + PARAM_HEADER_LENGTH {
            let p = Param::unmarshal(&value.slice(offset..))?;
            let p_len = PARAM_HEADER_LENGTH + p.value_length();
            offset += p_len + get_padding_size(p_len);
            params.push(p);
        }

        if params.is_empty() {
            return Err(Error::ErrChunkReconfigNoParam);
        }

        Ok(ReconfigChunk { params })
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        if self.params.is_empty() {
            return Err(Error::ErrChunkReconfigNoParam);
        }

        ChunkHeader {
            typ: CT_RECONFIG,
            flags: 0,
            value_length: self.value_length() as u16,
        }
        .marshal_to(writer)?;

        for (idx, p) in self.params.iter().enumerate() {
            p.marshal_to(writer)?;
            if idx != self.params.len() - 1 {
                let p_len = PARAM_HEADER_LENGTH + p.value_length();
                writer.extend_from_slice(&[0u8; 4][..get_padding_size(p_len)]);
            }
        }

        Ok(writer.len())
    }

    pub(crate) fn value_length(&self) -> usize {
        let mut l = 0;
        for (idx, p) in self.params.iter().enumerate() {
            let p_len = PARAM_HEADER_LENGTH + p.value_length();
            l += p_len;
            if idx != self.params.len() - 1 {
                l += get_padding_size(p_len);
            }
        }
        l
    }
}
