use std::collections::{HashMap, VecDeque};

use crate::chunk::data::DataChunk;
use crate::chunk::sack::GapAckBlock;
use crate::util::{sna32_gt, sna32_lt, sna32_lte};

/// Received DATA chunks that have not yet been folded into the cumulative
/// TSN, keyed by TSN. Supplies the gap-ack blocks and duplicate list for
/// outgoing SACKs.
#[derive(Default, Debug)]
pub(crate) struct PayloadQueue {
    chunks: HashMap<u32, DataChunk>,
    sorted: VecDeque<u32>,
    dup_tsn: Vec<u32>,
    n_bytes: usize,
}

impl PayloadQueue {
    /// A chunk is pushable unless it is already queued or at/below the
    /// cumulative TSN.
    pub(crate) fn can_push(&self, tsn: u32, cumulative_tsn: u32) -> bool {
        !(self.chunks.contains_key(&tsn) || sna32_lte(tsn, cumulative_tsn))
    }

    /// Queues a received chunk. Duplicates are recorded for the next SACK
    /// instead of being queued.
    pub(crate) fn push(&mut self, c: DataChunk, cumulative_tsn: u32) -> bool {
        let tsn = c.tsn;
        if !self.can_push(tsn, cumulative_tsn) {
            self.dup_tsn.push(tsn);
            return false;
        }

        self.n_bytes += c.user_data.len();
        self.chunks.insert(tsn, c);

        match self.sorted.back() {
            None => self.sorted.push_back(tsn),
            Some(&back) if sna32_gt(tsn, back) => self.sorted.push_back(tsn),
            _ => match self.sorted.front() {
                Some(&front) if sna32_lt(tsn, front) => self.sorted.push_front(tsn),
                _ => {
                    let pos = self
                        .sorted
                        .binary_search_by(|&other| {
                            if sna32_lt(other, tsn) {
                                std::cmp::Ordering::Less
                            } else {
                                std::cmp::Ordering::Greater
                            }
                        })
                        .unwrap_or_else(|pos| pos);
                    self.sorted.insert(pos, tsn);
                }
            },
        }

        true
    }

    /// Pops only if the oldest queued TSN matches, i.e. while the
    /// cumulative TSN advances through contiguous chunks.
    pub(crate) fn pop(&mut self, tsn: u32) -> Option<DataChunk> {
        if Some(&tsn) != self.sorted.front() {
            return None;
        }

        self.sorted.pop_front();
        let c = self.chunks.remove(&tsn)?;
        self.n_bytes -= c.user_data.len();
        Some(c)
    }

    /// Returns TSN values found duplicate since the last SACK, clearing
    /// the log.
    pub(crate) fn pop_duplicates(&mut self) -> Vec<u32> {
        self.dup_tsn.drain(..).collect()
    }

    pub(crate) fn get_gap_ack_blocks(&self, cumulative_tsn: u32) -> Vec<GapAckBlock> {
        if self.chunks.is_empty() {
            return vec![];
        }

        let mut b = GapAckBlock::default();
        let mut gap_ack_blocks = vec![];
        for (i, tsn) in self.sorted.iter().enumerate() {
            let diff = tsn.wrapping_sub(cumulative_tsn) as u16;
            if i == 0 {
                b.start = diff;
                b.end = diff;
            } else if b.end + 1 == diff {
                b.end += 1;
            } else {
                gap_ack_blocks.push(b);
                b.start = diff;
                b.end = diff;
            }
        }
        gap_ack_blocks.push(b);

        gap_ack_blocks
    }

    pub(crate) fn get_gap_ack_blocks_string(&self, cumulative_tsn: u32) -> String {
        let mut s = format!("cumTSN={cumulative_tsn}");
        for b in self.get_gap_ack_blocks(cumulative_tsn) {
            s += format!(",{}-{}", b.start, b.end).as_str();
        }
        s
    }

    pub(crate) fn get_last_tsn_received(&self) -> Option<&u32> {
        self.sorted.back()
    }

    pub(crate) fn len(&self) -> usize {
        self.chunks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[allow(dead_code)]
    pub(crate) fn get_num_bytes(&self) -> usize {
        self.n_bytes
    }
}
