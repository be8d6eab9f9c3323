use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::chunk::{serialized_length, Chunk, CHUNK_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::util::*;

pub(crate) const PACKET_HEADER_SIZE: usize = 12;

///Packet represents an SCTP packet: a common header followed by one or
///more chunks (RFC 4960 Sec 3).
///
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|          Source Port          |      Destination Port         |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                      Verification Tag                         |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                           Checksum                            |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                        Chunk #1 .. #n                         |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Default, Debug)]
pub(crate) struct Packet {
    pub(crate) source_port: u16,
    pub(crate) destination_port: u16,
    pub(crate) verification_tag: u32,
    pub(crate) chunks: Vec<Chunk>,
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet sport={} dport={} vtag={}",
            self.source_port, self.destination_port, self.verification_tag,
        )?;
        for chunk in &self.chunks {
            write!(f, "\n {chunk}")?;
        }
        Ok(())
    }
}

impl Packet {
    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < PACKET_HEADER_SIZE {
            return Err(Error::ErrPacketRawTooSmall);
        }

        let mut header = raw.slice(..PACKET_HEADER_SIZE);
        let source_port = header.get_u16();
        let destination_port = header.get_u16();
        let verification_tag = header.get_u32();
        let their_checksum = header.get_u32_le();

        if their_checksum != generate_packet_checksum(raw) {
            return Err(Error::ErrChecksumMismatch);
        }

        // Walk the chunk train; each TLV advances by its padded length.
        let mut chunks = vec![];
        let mut offset = PACKET_HEADER_SIZE;
        while offset < raw.len() {
            if raw.len() - offset < CHUNK_HEADER_SIZE {
                return Err(Error::ErrParseSctpChunkNotEnoughData);
            }
            let chunk = Chunk::unmarshal(&raw.slice(offset..))?;
            offset += serialized_length(chunk.value_length());
            chunks.push(chunk);
        }

        Ok(Packet {
            source_port,
            destination_port,
            verification_tag,
            chunks,
        })
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        writer.put_u16(self.source_port);
        writer.put_u16(self.destination_port);
        writer.put_u32(self.verification_tag);

        // Zero placeholder; filled in once the chunks are serialized.
        let checksum_at = writer.len();
        writer.put_u32(0);

        for c in &self.chunks {
            c.marshal_to(writer)?;
            let padding = get_padding_size(writer.len());
            writer.extend_from_slice(&[0u8; PADDING_MULTIPLE][..padding]);
        }

        let mut digest = ISCSI_CRC.digest();
        digest.update(writer);
        // The CRC32c travels little-endian relative to the rest of the
        // packet.
        let checksum = digest.finalize().to_le_bytes();
        writer[checksum_at..checksum_at + 4].copy_from_slice(&checksum);

        Ok(writer.len())
    }

    pub(crate) fn marshal(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        self.marshal_to(&mut buf)?;
        Ok(buf.freeze())
    }

    pub(crate) fn check_packet(&self) -> Result<()> {
        // Port number 0 must not be used in either direction
        // (RFC 4960 Sec 8.5.1).
        if self.source_port == 0 {
            return Err(Error::ErrSctpPacketSourcePortZero);
        }
        if self.destination_port == 0 {
            return Err(Error::ErrSctpPacketDestinationPortZero);
        }

        // An INIT travels alone, in a packet whose verification tag is 0.
        let carries_init = self
            .chunks
            .iter()
            .any(|c| matches!(c, Chunk::Init(init) if !init.is_ack));
        if carries_init {
            if self.chunks.len() != 1 {
                return Err(Error::ErrInitChunkBundled);
            }
            if self.verification_tag != 0 {
                return Err(Error::ErrInitChunkVerifyTagNotZero);
            }
        }

        Ok(())
    }
}
