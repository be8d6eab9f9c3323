use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use portable_atomic::AtomicUsize;
use tokio::sync::Mutex;

use crate::chunk::data::DataChunk;

/// Which of the two delivery lanes a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Ordered,
    Unordered,
}

impl Lane {
    fn of(unordered: bool) -> Lane {
        if unordered {
            Lane::Unordered
        } else {
            Lane::Ordered
        }
    }
}

#[derive(Debug, Default)]
struct PendingInner {
    ordered: VecDeque<DataChunk>,
    unordered: VecDeque<DataChunk>,
    /// Lane currently being drained. Locked in while a fragmented message
    /// is partially popped so its fragments never interleave with another
    /// message's.
    draining: Option<Lane>,
}

impl PendingInner {
    fn lane(&self, lane: Lane) -> &VecDeque<DataChunk> {
        match lane {
            Lane::Ordered => &self.ordered,
            Lane::Unordered => &self.unordered,
        }
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut VecDeque<DataChunk> {
        match lane {
            Lane::Ordered => &mut self.ordered,
            Lane::Unordered => &mut self.unordered,
        }
    }

    /// The lane the next pop will come from: a partially drained message
    /// pins its lane, otherwise unordered data goes first.
    fn next_lane(&self) -> Lane {
        match self.draining {
            Some(lane) => lane,
            None if !self.unordered.is_empty() => Lane::Unordered,
            None => Lane::Ordered,
        }
    }
}

/// User DATA waiting to move into the inflight queue.
///
/// Streams append from outside the association lock while the gather pass
/// pops from under it, so the two lanes sit behind their own mutex; the
/// counters are atomics so `len` and `get_num_bytes` stay lock-free.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    inner: Mutex<PendingInner>,
    queued_chunks: AtomicUsize,
    queued_bytes: AtomicUsize,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        PendingQueue::default()
    }

    pub(crate) async fn push(&self, c: DataChunk) {
        let bytes = c.user_data.len();
        let lane = Lane::of(c.unordered);

        let mut inner = self.inner.lock().await;
        inner.lane_mut(lane).push_back(c);
        self.queued_chunks.fetch_add(1, Ordering::SeqCst);
        self.queued_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Appends all fragments of one message at once so they stay adjacent
    /// in their lane.
    ///
    /// # Panics
    ///
    /// If the fragments mix ordered and unordered delivery.
    pub(crate) async fn append(&self, chunks: Vec<DataChunk>) {
        let Some(first) = chunks.first() else {
            return;
        };
        let lane = Lane::of(first.unordered);
        let count = chunks.len();
        let bytes: usize = chunks.iter().map(|c| c.user_data.len()).sum();

        let mut inner = self.inner.lock().await;
        let queue = inner.lane_mut(lane);
        for c in chunks {
            assert_eq!(
                Lane::of(c.unordered),
                lane,
                "fragments must share one delivery mode"
            );
            queue.push_back(c);
        }
        self.queued_chunks.fetch_add(count, Ordering::SeqCst);
        self.queued_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) async fn peek(&self) -> Option<DataChunk> {
        let inner = self.inner.lock().await;
        inner.lane(inner.next_lane()).front().cloned()
    }

    /// Pops the chunk previously returned by `peek`. A fresh message must
    /// start at its beginning fragment; a partially popped message keeps
    /// its lane until the ending fragment leaves.
    pub(crate) async fn pop(&self, beginning_fragment: bool, unordered: bool) -> Option<DataChunk> {
        let mut inner = self.inner.lock().await;

        let lane = match inner.draining {
            Some(lane) => lane,
            None if !beginning_fragment => return None,
            None => Lane::of(unordered),
        };

        let popped = inner.lane_mut(lane).pop_front()?;
        inner.draining = if popped.ending_fragment {
            None
        } else {
            Some(lane)
        };

        self.queued_chunks.fetch_sub(1, Ordering::SeqCst);
        self.queued_bytes
            .fetch_sub(popped.user_data.len(), Ordering::SeqCst);
        Some(popped)
    }

    pub(crate) fn get_num_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::SeqCst)
    }

    pub(crate) fn len(&self) -> usize {
        self.queued_chunks.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    fn fragment(unordered: bool, begin: bool, end: bool) -> DataChunk {
        DataChunk {
            unordered,
            beginning_fragment: begin,
            ending_fragment: end,
            user_data: Bytes::from_static(b"X"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unordered_takes_priority() {
        let q = PendingQueue::new();
        q.push(fragment(false, true, true)).await;
        q.push(fragment(true, true, true)).await;

        let c = q.peek().await.expect("peek");
        assert!(c.unordered, "unordered chunk should be selected first");
        assert!(q.pop(true, true).await.is_some());
        let c = q.peek().await.expect("peek");
        assert!(!c.unordered);
    }

    #[tokio::test]
    async fn test_fragments_stay_together() {
        let q = PendingQueue::new();
        // ordered fragmented message of three chunks
        q.append(vec![
            fragment(false, true, false),
            fragment(false, false, false),
            fragment(false, false, true),
        ])
        .await;
        // an unordered message arrives while the above is being sent
        q.push(fragment(true, true, true)).await;

        let first = q.peek().await.expect("peek");
        assert!(first.unordered, "nothing selected yet, unordered wins");
        assert!(q.pop(true, true).await.is_some());

        // Start draining the ordered message; the queue must stay on it.
        let c = q.pop(true, false).await.expect("begin fragment");
        assert!(c.beginning_fragment && !c.ending_fragment);
        let c = q.peek().await.expect("peek mid fragment");
        assert!(!c.unordered);
        let c = q.pop(false, false).await.expect("mid fragment");
        assert!(!c.beginning_fragment && !c.ending_fragment);
        let c = q.pop(false, false).await.expect("end fragment");
        assert!(c.ending_fragment);

        assert_eq!(q.len(), 0);
        assert_eq!(q.get_num_bytes(), 0);
    }

    #[tokio::test]
    async fn test_pop_requires_beginning_fragment_when_unselected() {
        let q = PendingQueue::new();
        q.push(fragment(false, true, true)).await;
        assert!(q.pop(false, false).await.is_none());
        assert!(q.pop(true, false).await.is_some());
    }
}
