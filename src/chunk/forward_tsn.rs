use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{ChunkHeader, CT_FORWARD_TSN};
use crate::error::{Error, Result};

pub(crate) const NEW_CUMULATIVE_TSN_LENGTH: usize = 4;
pub(crate) const SKIPPED_STREAM_LENGTH: usize = 4;

///ForwardTsnChunk tells the data receiver to adjust its cumulative
///received TSN point forward because some missing TSNs carry data that
///will not be (re)transmitted (RFC 3758 Sec 3.2).
///
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|   Type = 192  |  Flags = 0x00 |        Length = Variable      |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                      New Cumulative TSN                       |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|         Stream-1              |       Stream Sequence-1       |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|         Stream-N              |       Stream Sequence-N       |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Default, Debug, Clone)]
pub(crate) struct ForwardTsnChunk {
    /// The receiver must consider any missing TSN up to and including this
    /// value as received and stop reporting it in SACK gaps.
    pub(crate) new_cumulative_tsn: u32,
    pub(crate) streams: Vec<SkippedStream>,
}

/// One `(stream, greatest skipped SSN)` entry; lets the receiver release
/// stranded ordered messages from its delivery queues. Unordered chunks
/// are never reported here.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct SkippedStream {
    pub(crate) identifier: u16,
    pub(crate) sequence: u16,
}

impl fmt::Display for ForwardTsnChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FORWARD-TSN newCumulativeTSN={}", self.new_cumulative_tsn)?;
        for s in &self.streams {
            write!(f, " (si={} ssn={})", s.identifier, s.sequence)?;
        }
        Ok(())
    }
}

impl ForwardTsnChunk {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;
        if header.typ != CT_FORWARD_TSN {
            return Err(Error::ErrChunkTypeMismatch);
        }
        if (header.value_length as usize) < NEW_CUMULATIVE_TSN_LENGTH {
            return Err(Error::ErrChunkTooShort);
        }

        let value = header.value_slice(raw);
        let reader = &mut value.clone();
        let new_cumulative_tsn = reader.get_u32();

        let mut streams = vec![];
        while reader.remaining() >= SKIPPED_STREAM_LENGTH {
            streams.push(SkippedStream {
                identifier: reader.get_u16(),
                sequence: reader.get_u16(),
            });
        }

        Ok(ForwardTsnChunk {
            new_cumulative_tsn,
            streams,
        })
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        ChunkHeader {
            typ: CT_FORWARD_TSN,
            flags: 0,
            value_length: self.value_length() as u16,
        }
        .marshal_to(writer)?;

        writer.put_u32(self.new_cumulative_tsn);
        for s in &self.streams {
            writer.put_u16(s.identifier);
            writer.put_u16(s.sequence);
        }

        Ok(writer.len())
    }

    pub(crate) fn value_length(&self) -> usize {
        NEW_CUMULATIVE_TSN_LENGTH + SKIPPED_STREAM_LENGTH * self.streams.len()
    }
}
