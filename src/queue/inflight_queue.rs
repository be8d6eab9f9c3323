use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use portable_atomic::AtomicUsize;

use crate::chunk::data::DataChunk;
use crate::util::{sna32_gt, sna32_lt};

/// DATA chunks that have been transmitted and await selective
/// acknowledgement, keyed by TSN.
///
/// The queue length is mirrored into a shared atomic so the association
/// handle can consult it without taking the association lock (graceful
/// shutdown checks for drained in-flight data).
#[derive(Default, Debug)]
pub(crate) struct InflightQueue {
    length: Arc<AtomicUsize>,
    chunks: HashMap<u32, DataChunk>,
    sorted: VecDeque<u32>,
    n_bytes: usize,
}

impl InflightQueue {
    pub(crate) fn new(length: Arc<AtomicUsize>) -> Self {
        length.store(0, Ordering::SeqCst);
        InflightQueue {
            length,
            ..Default::default()
        }
    }

    /// Appends a chunk. TSNs are assigned in increasing order as chunks
    /// move out of the pending queue, so insertion is almost always at the
    /// back; out-of-order TSNs still land in their serial position.
    pub(crate) fn push(&mut self, c: DataChunk) {
        let tsn = c.tsn;
        self.n_bytes += c.user_data.len();
        self.chunks.insert(tsn, c);
        self.length.fetch_add(1, Ordering::SeqCst);

        match self.sorted.back() {
            None => self.sorted.push_back(tsn),
            Some(&back) if sna32_gt(tsn, back) => self.sorted.push_back(tsn),
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
        }
    }

    /// Pops only if the oldest chunk's TSN matches the given TSN.
    pub(crate) fn pop(&mut self, tsn: u32) -> Option<DataChunk> {
        if Some(&tsn) != self.sorted.front() {
            return None;
        }

        self.sorted.pop_front();
        let c = self.chunks.remove(&tsn)?;
        self.length.fetch_sub(1, Ordering::SeqCst);
        self.n_bytes -= c.user_data.len();
        Some(c)
    }

    pub(crate) fn get(&self, tsn: u32) -> Option<&DataChunk> {
        self.chunks.get(&tsn)
    }

    /// Queued TSNs in ascending serial order, oldest first.
    pub(crate) fn ordered_tsns(&self) -> impl Iterator<Item = u32> + '_ {
        self.sorted.iter().copied()
    }

    pub(crate) fn get_mut(&mut self, tsn: u32) -> Option<&mut DataChunk> {
        self.chunks.get_mut(&tsn)
    }

    /// Marks the chunk acked and releases its payload; returns the number
    /// of bytes released. The entry stays queued for gap bookkeeping until
    /// the cumulative ack passes it.
    pub(crate) fn mark_as_acked(&mut self, tsn: u32) -> usize {
        if let Some(c) = self.chunks.get_mut(&tsn) {
            c.acked = true;
            c.retransmit = false;
            let n = c.user_data.len();
            self.n_bytes -= n;
            c.user_data.clear();
            n
        } else {
            0
        }
    }

    /// Flags every unacked, unabandoned chunk for retransmission
    /// (T3-rtx expiry).
    pub(crate) fn mark_all_to_retransmit(&mut self) {
        for c in self.chunks.values_mut() {
            if c.acked || c.abandoned() {
                continue;
            }
            c.retransmit = true;
        }
    }

    pub(crate) fn get_num_bytes(&self) -> usize {
        self.n_bytes
    }

    pub(crate) fn len(&self) -> usize {
        self.chunks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
