use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{ChunkHeader, CT_INIT, CT_INIT_ACK};
use crate::error::{Error, Result};
use crate::param::{Param, PARAM_HEADER_LENGTH};
use crate::util::get_padding_size;

pub(crate) const INIT_CHUNK_MIN_LENGTH: usize = 16;

///InitChunk represents an SCTP Chunk body of type INIT or INIT ACK
///(RFC 4960 Sec 3.3.2 / 3.3.3); the two share a layout.
///
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|   Type = 1    |  Chunk Flags  |      Chunk Length             |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                         Initiate Tag                          |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|           Advertised Receiver Window Credit (a_rwnd)          |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|  Number of Outbound Streams   |  Number of Inbound Streams    |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                          Initial TSN                          |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|              Optional/Variable-Length Parameters              |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Default, Debug, Clone)]
pub(crate) struct InitChunk {
    pub(crate) is_ack: bool,
    pub(crate) initiate_tag: u32,
    pub(crate) advertised_receiver_window_credit: u32,
    pub(crate) num_outbound_streams: u16,
    pub(crate) num_inbound_streams: u16,
    pub(crate) initial_tsn: u32,
    pub(crate) params: Vec<Param>,
}

impl fmt::Display for InitChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tag={} a_rwnd={} os={} is={} tsn={}",
            self.initiate_tag,
            self.advertised_receiver_window_credit,
            self.num_outbound_streams,
            self.num_inbound_streams,
            self.initial_tsn,
        )
    }
}

impl InitChunk {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        let header = ChunkHeader::unmarshal(raw)?;

        if header.typ != CT_INIT && header.typ != CT_INIT_ACK {
            return Err(Error::ErrChunkTypeMismatch);
        }
        if (header.value_length as usize) < INIT_CHUNK_MIN_LENGTH {
            return Err(Error::ErrChunkValueNotLongEnough);
        }

        // The Chunk Flags field in INIT is reserved; all bits are set to 0
        // by the sender and ignored by the receiver.
        if header.flags != 0 {
            return Err(Error::ErrChunkTypeInitFlagZero);
        }

        let value = header.value_slice(raw);
        let reader = &mut value.clone();
        let initiate_tag = reader.get_u32();
        let advertised_receiver_window_credit = reader.get_u32();
        let num_outbound_streams = reader.get_u16();
        let num_inbound_streams = reader.get_u16();
        let initial_tsn = reader.get_u32();

        let mut params = vec![];
        let mut offset = INIT_CHUNK_MIN_LENGTH;
        while value.len() >= offset + PARAM_HEADER_LENGTH {
            let p = Param::unmarshal(&value.slice(offset..))?;
            let p_len = PARAM_HEADER_LENGTH + p.value_length();
            offset += p_len + get_padding_size(p_len);
            params.push(p);
        }

        Ok(InitChunk {
            is_ack: header.typ == CT_INIT_ACK,
            initiate_tag,
            advertised_receiver_window_credit,
            num_outbound_streams,
            num_inbound_streams,
            initial_tsn,
            params,
        })
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        ChunkHeader {
            typ: if self.is_ack { CT_INIT_ACK } else { CT_INIT },
            flags: 0,
            value_length: self.value_length() as u16,
        }
        .marshal_to(writer)?;

        writer.put_u32(self.initiate_tag);
        writer.put_u32(self.advertised_receiver_window_credit);
        writer.put_u16(self.num_outbound_streams);
        writer.put_u16(self.num_inbound_streams);
        writer.put_u32(self.initial_tsn);

        // Parameter padding is included for every parameter except the
        // last one in the chunk (RFC 4960 Sec 3.2).
        for (idx, p) in self.params.iter().enumerate() {
            p.marshal_to(writer)?;
            if idx != self.params.len() - 1 {
                let p_len = PARAM_HEADER_LENGTH + p.value_length();
                writer.extend_from_slice(&[0u8; 4][..get_padding_size(p_len)]);
            }
        }

        Ok(writer.len())
    }

    pub(crate) fn check(&self) -> Result<()> {
        // The Initiate Tag may take any value except 0 (RFC 4960 Sec 5.3.1).
        if self.initiate_tag == 0 {
            return Err(Error::ErrChunkTypeInitInitiateTagZero);
        }

        // Stream counts of 0 must not be used; there is no negotiation of
        // the actual count beyond min(requested, offered).
        if self.num_inbound_streams == 0 {
            return Err(Error::ErrInitInboundStreamRequestZero);
        }
        if self.num_outbound_streams == 0 {
            return Err(Error::ErrInitOutboundStreamRequestZero);
        }

        // An SCTP endpoint must not indicate less than 1500 bytes in its
        // initial a_rwnd.
        if self.advertised_receiver_window_credit < 1500 {
            return Err(Error::ErrInitAdvertisedReceiver1500);
        }

        Ok(())
    }

    pub(crate) fn value_length(&self) -> usize {
        let mut l = INIT_CHUNK_MIN_LENGTH;
        for (idx, p) in self.params.iter().enumerate() {
            let p_len = PARAM_HEADER_LENGTH + p.value_length();
            l += p_len;
            if idx != self.params.len() - 1 {
                l += get_padding_size(p_len);
            }
        }
        l
    }

    /// Advertises the chunk types this implementation negotiates.
    pub(crate) fn set_supported_extensions(&mut self, chunk_types: &[u8]) {
        self.params.push(Param::SupportedExtensions {
            chunk_types: chunk_types.to_vec(),
        });
    }

    pub(crate) fn state_cookie(&self) -> Option<Bytes> {
        self.params.iter().find_map(|p| match p {
            Param::StateCookie { cookie } => Some(cookie.clone()),
            _ => None,
        })
    }

    pub(crate) fn supported_extensions(&self) -> &[u8] {
        self.params
            .iter()
            .find_map(|p| match p {
                Param::SupportedExtensions { chunk_types } => Some(chunk_types.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }
}
