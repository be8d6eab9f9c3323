use std::cmp::Ordering;

use crate::chunk::data::{DataChunk, PayloadProtocolIdentifier};
use crate::error::{Error, Result};
use crate::util::*;

fn sort_chunks_by_tsn(c: &mut [DataChunk]) {
    c.sort_by(|a, b| {
        if sna32_lt(a.tsn, b.tsn) {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    });
}

fn sort_chunk_sets_by_ssn(c: &mut [ChunkSet]) {
    c.sort_by(|a, b| {
        if sna16_lt(a.ssn, b.ssn) {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    });
}

/// Fragments sharing one stream sequence number, i.e. one user message.
#[derive(Debug, Clone)]
pub(crate) struct ChunkSet {
    /// used only with the ordered chunks
    pub(crate) ssn: u16,
    pub(crate) ppi: PayloadProtocolIdentifier,
    pub(crate) chunks: Vec<DataChunk>,
}

impl ChunkSet {
    pub(crate) fn new(ssn: u16, ppi: PayloadProtocolIdentifier) -> Self {
        ChunkSet {
            ssn,
            ppi,
            chunks: vec![],
        }
    }

    pub(crate) fn push(&mut self, chunk: DataChunk) -> bool {
        for c in &self.chunks {
            if c.tsn == chunk.tsn {
                return false;
            }
        }

        self.chunks.push(chunk);
        sort_chunks_by_tsn(&mut self.chunks);

        self.is_complete()
    }

    /// A set is complete when it begins with a beginning fragment, ends
    /// with an ending fragment, and the TSNs in between are strictly
    /// sequential (RFC 4960 Sec 3.3.1).
    pub(crate) fn is_complete(&self) -> bool {
        let n_chunks = self.chunks.len();
        if n_chunks == 0 {
            return false;
        }
        if !self.chunks[0].beginning_fragment {
            return false;
        }
        if !self.chunks[n_chunks - 1].ending_fragment {
            return false;
        }

        let mut last_tsn = 0u32;
        for (i, c) in self.chunks.iter().enumerate() {
            if i > 0 && c.tsn != last_tsn.wrapping_add(1) {
                return false;
            }
            last_tsn = c.tsn;
        }

        true
    }
}

/// Per-stream delivery buffer: holds inbound fragments until a complete
/// message can be handed to the reader in SSN order (or arrival order for
/// unordered messages).
#[derive(Default, Debug)]
pub(crate) struct ReassemblyQueue {
    pub(crate) si: u16,
    /// expected SSN for the next ordered message
    pub(crate) next_ssn: u16,
    pub(crate) ordered: Vec<ChunkSet>,
    pub(crate) unordered: Vec<ChunkSet>,
    pub(crate) unordered_chunks: Vec<DataChunk>,
    pub(crate) n_bytes: usize,
}

impl ReassemblyQueue {
    /// Stream Sequence Numbers start from 0 when the association is
    /// established and wrap at 65535 (RFC 4960 Sec 6.5).
    pub(crate) fn new(si: u16) -> Self {
        ReassemblyQueue {
            si,
            ..Default::default()
        }
    }

    pub(crate) fn push(&mut self, chunk: DataChunk) -> bool {
        if chunk.stream_identifier != self.si {
            return false;
        }

        if chunk.unordered {
            self.n_bytes += chunk.user_data.len();
            self.unordered_chunks.push(chunk);
            sort_chunks_by_tsn(&mut self.unordered_chunks);

            // Move any TSN-contiguous complete run over to the deliverable
            // set list.
            if let Some(cset) = self.find_complete_unordered_chunk_set() {
                self.unordered.push(cset);
                return true;
            }

            false
        } else {
            if sna16_lt(chunk.stream_sequence_number, self.next_ssn) {
                return false;
            }

            self.n_bytes += chunk.user_data.len();

            for s in &mut self.ordered {
                if s.ssn == chunk.stream_sequence_number {
                    return s.push(chunk);
                }
            }

            let mut cset = ChunkSet::new(chunk.stream_sequence_number, chunk.payload_type);
            let ok = cset.push(chunk);
            self.ordered.push(cset);
            sort_chunk_sets_by_ssn(&mut self.ordered);

            ok
        }
    }

    fn find_complete_unordered_chunk_set(&mut self) -> Option<ChunkSet> {
        let mut start_idx = -1isize;
        let mut n_chunks = 0usize;
        let mut last_tsn = 0u32;
        let mut found = false;

        for (i, c) in self.unordered_chunks.iter().enumerate() {
            // seek a beginning fragment
            if c.beginning_fragment {
                start_idx = i as isize;
                n_chunks = 1;
                last_tsn = c.tsn;

                if c.ending_fragment {
                    found = true;
                    break;
                }
                continue;
            }

            if start_idx < 0 {
                continue;
            }

            if c.tsn != last_tsn.wrapping_add(1) {
                start_idx = -1;
                continue;
            }

            last_tsn = c.tsn;
            n_chunks += 1;

            if c.ending_fragment {
                found = true;
                break;
            }
        }

        if !found {
            return None;
        }

        let chunks: Vec<DataChunk> = self
            .unordered_chunks
            .drain(start_idx as usize..(start_idx as usize) + n_chunks)
            .collect();

        let mut chunk_set = ChunkSet::new(0, chunks[0].payload_type);
        chunk_set.chunks = chunks;

        Some(chunk_set)
    }

    pub(crate) fn is_readable(&self) -> bool {
        // Sets in unordered are complete by construction.
        if !self.unordered.is_empty() {
            return true;
        }

        if let Some(cset) = self.ordered.first() {
            if cset.is_complete() && sna16_lte(cset.ssn, self.next_ssn) {
                return true;
            }
        }
        false
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Result<(usize, PayloadProtocolIdentifier)> {
        // Unordered messages deliver first.
        let cset = if !self.unordered.is_empty() {
            self.unordered.remove(0)
        } else if !self.ordered.is_empty() {
            let cset = &self.ordered[0];
            if !cset.is_complete() {
                return Err(Error::ErrTryAgain);
            }
            if sna16_gt(cset.ssn, self.next_ssn) {
                return Err(Error::ErrTryAgain);
            }
            if cset.ssn == self.next_ssn {
                self.next_ssn = self.next_ssn.wrapping_add(1);
            }
            self.ordered.remove(0)
        } else {
            return Err(Error::ErrTryAgain);
        };

        let message_len = cset.chunks.iter().fold(0, |acc, c| acc + c.user_data.len());
        self.subtract_num_bytes(message_len);

        if message_len > buf.len() {
            return Err(Error::ErrShortBuffer { size: buf.len() });
        }

        let mut n_written = 0;
        for c in &cset.chunks {
            buf[n_written..n_written + c.user_data.len()].copy_from_slice(&c.user_data);
            n_written += c.user_data.len();
        }

        Ok((n_written, cset.ppi))
    }

    /// Drops incomplete ordered sets at or below `last_ssn` after a
    /// FORWARD-TSN skipped them, then advances `next_ssn`.
    pub(crate) fn forward_tsn_for_ordered(&mut self, last_ssn: u16) {
        let num_bytes = self
            .ordered
            .iter()
            .filter(|s| sna16_lte(s.ssn, last_ssn) && !s.is_complete())
            .fold(0, |n, s| {
                n + s.chunks.iter().fold(0, |acc, c| acc + c.user_data.len())
            });
        self.subtract_num_bytes(num_bytes);

        self.ordered
            .retain(|s| !sna16_lte(s.ssn, last_ssn) || s.is_complete());

        if sna16_lte(self.next_ssn, last_ssn) {
            self.next_ssn = last_ssn.wrapping_add(1);
        }
    }

    /// Drops stranded unordered fragments at or below the forwarded TSN.
    /// Complete sets already moved to `unordered` remain deliverable.
    pub(crate) fn forward_tsn_for_unordered(&mut self, new_cumulative_tsn: u32) {
        let mut dropped_bytes = 0;
        self.unordered_chunks.retain(|c| {
            if sna32_gt(c.tsn, new_cumulative_tsn) {
                true
            } else {
                dropped_bytes += c.user_data.len();
                false
            }
        });
        self.subtract_num_bytes(dropped_bytes);
    }

    pub(crate) fn subtract_num_bytes(&mut self, n_bytes: usize) {
        self.n_bytes = self.n_bytes.saturating_sub(n_bytes);
    }

    pub(crate) fn get_num_bytes(&self) -> usize {
        self.n_bytes
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    fn ordered_chunk(si: u16, ssn: u16, tsn: u32, data: &'static [u8]) -> DataChunk {
        DataChunk {
            stream_identifier: si,
            stream_sequence_number: ssn,
            tsn,
            beginning_fragment: true,
            ending_fragment: true,
            user_data: Bytes::from_static(data),
            ..Default::default()
        }
    }

    #[test]
    fn test_ordered_delivery_in_ssn_order() -> Result<()> {
        let mut q = ReassemblyQueue::new(0);

        assert!(q.push(ordered_chunk(0, 0, 1, b"ABC")));
        assert!(q.push(ordered_chunk(0, 1, 2, b"DEF")));
        assert_eq!(q.get_num_bytes(), 6);

        let mut buf = [0u8; 16];
        let (n, _) = q.read(&mut buf)?;
        assert_eq!(&buf[..n], b"ABC");
        let (n, _) = q.read(&mut buf)?;
        assert_eq!(&buf[..n], b"DEF");
        assert_eq!(q.get_num_bytes(), 0);

        Ok(())
    }

    #[test]
    fn test_ordered_fragments_assemble() -> Result<()> {
        let mut q = ReassemblyQueue::new(0);

        let mut first = ordered_chunk(0, 0, 1, b"ABC");
        first.ending_fragment = false;
        let mut last = ordered_chunk(0, 0, 2, b"DEFG");
        last.beginning_fragment = false;

        assert!(!q.push(first), "incomplete set is not readable");
        assert!(!q.is_readable());
        assert!(q.push(last));
        assert!(q.is_readable());

        let mut buf = [0u8; 16];
        let (n, _) = q.read(&mut buf)?;
        assert_eq!(&buf[..n], b"ABCDEFG");

        Ok(())
    }

    #[test]
    fn test_out_of_order_ssn_waits() -> Result<()> {
        let mut q = ReassemblyQueue::new(0);

        q.push(ordered_chunk(0, 1, 2, b"LATER"));
        assert!(!q.is_readable(), "ssn=1 must wait for ssn=0");
        let mut buf = [0u8; 16];
        assert_eq!(q.read(&mut buf).unwrap_err(), Error::ErrTryAgain);

        q.push(ordered_chunk(0, 0, 1, b"FIRST"));
        let (n, _) = q.read(&mut buf)?;
        assert_eq!(&buf[..n], b"FIRST");
        let (n, _) = q.read(&mut buf)?;
        assert_eq!(&buf[..n], b"LATER");

        Ok(())
    }

    #[test]
    fn test_unordered_delivers_immediately() -> Result<()> {
        let mut q = ReassemblyQueue::new(0);

        let mut c = ordered_chunk(0, 9, 42, b"NOW");
        c.unordered = true;
        assert!(q.push(c));
        assert!(q.is_readable());

        let mut buf = [0u8; 16];
        let (n, _) = q.read(&mut buf)?;
        assert_eq!(&buf[..n], b"NOW");

        Ok(())
    }

    #[test]
    fn test_short_buffer() {
        let mut q = ReassemblyQueue::new(0);
        q.push(ordered_chunk(0, 0, 1, b"TOO LONG"));

        let mut buf = [0u8; 4];
        assert_eq!(
            q.read(&mut buf).unwrap_err(),
            Error::ErrShortBuffer { size: 4 }
        );
    }

    #[test]
    fn test_forward_tsn_for_ordered_drops_incomplete() {
        let mut q = ReassemblyQueue::new(0);

        let mut stranded = ordered_chunk(0, 0, 1, b"ABC");
        stranded.ending_fragment = false;
        q.push(stranded);
        q.push(ordered_chunk(0, 1, 3, b"DEF"));

        q.forward_tsn_for_ordered(0);
        assert_eq!(q.next_ssn, 1);
        assert!(q.is_readable(), "complete ssn=1 is now deliverable");

        let mut buf = [0u8; 16];
        let (n, _) = q.read(&mut buf).expect("read");
        assert_eq!(&buf[..n], b"DEF");
    }
}
