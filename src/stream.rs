use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use portable_atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, AtomicUsize};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::association::AssociationState;
use crate::chunk::data::{DataChunk, PayloadProtocolIdentifier};
use crate::error::{Error, Result};
use crate::queue::pending_queue::PendingQueue;
use crate::queue::reassembly_queue::ReassemblyQueue;

/// How a stream treats chunks the peer has not acknowledged.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub enum ReliabilityType {
    /// Every chunk is retransmitted until acknowledged.
    #[default]
    Reliable = 0,
    /// A chunk is abandoned after `reliability_value` transmissions.
    Rexmit = 1,
    /// A chunk is abandoned once `reliability_value` milliseconds passed
    /// since its first transmission.
    Timed = 2,
}

impl fmt::Display for ReliabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ReliabilityType::Reliable => "Reliable",
            ReliabilityType::Rexmit => "Rexmit",
            ReliabilityType::Timed => "Timed",
        };
        write!(f, "{s}")
    }
}

impl From<u8> for ReliabilityType {
    fn from(v: u8) -> ReliabilityType {
        match v {
            1 => ReliabilityType::Rexmit,
            2 => ReliabilityType::Timed,
            _ => ReliabilityType::Reliable,
        }
    }
}

/// Invoked when the outbound buffered amount drops below the configured
/// low watermark.
pub type OnBufferedAmountLowFn = Box<
    dyn (FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;

/// One logical SCTP stream: an outbound packetizer feeding the shared
/// pending queue, and an inbound delivery buffer the association pushes
/// received chunks into.
pub struct Stream {
    pub(crate) max_payload_size: u32,
    pub(crate) max_message_size: Arc<AtomicU32>, // clone from association
    pub(crate) state: Arc<AtomicU8>,             // clone from association
    pub(crate) awake_write_loop_ch: Arc<mpsc::Sender<()>>,
    pub(crate) pending_queue: Arc<PendingQueue>,

    pub(crate) stream_identifier: u16,
    pub(crate) label: ArcSwapOption<String>,
    pub(crate) default_payload_type: AtomicU32,
    pub(crate) reassembly_queue: Mutex<ReassemblyQueue>,
    pub(crate) sequence_number: AtomicU16,
    pub(crate) read_notifier: Notify,
    pub(crate) read_shutdown: AtomicBool,
    pub(crate) write_shutdown: AtomicBool,
    pub(crate) unordered: AtomicBool,
    pub(crate) reliability_type: AtomicU8,
    pub(crate) reliability_value: AtomicU32,
    pub(crate) buffered_amount: AtomicUsize,
    pub(crate) buffered_amount_low: AtomicUsize,
    pub(crate) on_buffered_amount_low: ArcSwapOption<Mutex<OnBufferedAmountLowFn>>,
    pub(crate) name: String,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("stream_identifier", &self.stream_identifier)
            .field("sequence_number", &self.sequence_number)
            .field("reliability_type", &self.reliability_type)
            .field("reliability_value", &self.reliability_value)
            .field("read_shutdown", &self.read_shutdown)
            .field("write_shutdown", &self.write_shutdown)
            .field("name", &self.name)
            .finish()
    }
}

impl Stream {
    pub(crate) fn new(
        name: String,
        stream_identifier: u16,
        max_payload_size: u32,
        max_message_size: Arc<AtomicU32>,
        state: Arc<AtomicU8>,
        awake_write_loop_ch: Arc<mpsc::Sender<()>>,
        pending_queue: Arc<PendingQueue>,
    ) -> Self {
        Self {
            max_payload_size,
            max_message_size,
            state,
            awake_write_loop_ch,
            pending_queue,

            stream_identifier,
            label: ArcSwapOption::empty(),
            default_payload_type: AtomicU32::new(0),
            reassembly_queue: Mutex::new(ReassemblyQueue::new(stream_identifier)),
            sequence_number: AtomicU16::new(0),
            read_notifier: Notify::new(),
            read_shutdown: AtomicBool::new(false),
            write_shutdown: AtomicBool::new(false),
            unordered: AtomicBool::new(false),
            reliability_type: AtomicU8::new(0),
            reliability_value: AtomicU32::new(0),
            buffered_amount: AtomicUsize::new(0),
            buffered_amount_low: AtomicUsize::new(0),
            on_buffered_amount_low: ArcSwapOption::empty(),
            name,
        }
    }

    /// stream_identifier returns the Stream identifier associated to the stream.
    pub fn stream_identifier(&self) -> u16 {
        self.stream_identifier
    }

    /// label returns the data-channel label announced by the peer's DCEP
    /// open message, if any.
    pub fn label(&self) -> Option<String> {
        self.label.load().as_ref().map(|l| l.as_ref().clone())
    }

    pub(crate) fn set_label(&self, label: String) {
        self.label.store(Some(Arc::new(label)));
    }

    /// set_default_payload_type sets the payload type used by write.
    pub fn set_default_payload_type(&self, default_payload_type: PayloadProtocolIdentifier) {
        self.default_payload_type
            .store(default_payload_type as u32, Ordering::SeqCst);
    }

    /// set_reliability_params sets reliability parameters for this stream.
    pub fn set_reliability_params(&self, unordered: bool, rel_type: ReliabilityType, rel_val: u32) {
        log::debug!(
            "[{}] reliability params: ordered={} type={} value={}",
            self.name,
            !unordered,
            rel_type,
            rel_val
        );
        self.unordered.store(unordered, Ordering::SeqCst);
        self.reliability_type.store(rel_type as u8, Ordering::SeqCst);
        self.reliability_value.store(rel_val, Ordering::SeqCst);
    }

    /// Reads the next complete message, dropping the Payload Protocol
    /// Identifier.
    ///
    /// Returns `Error::ErrShortBuffer` if `p` is too short.
    /// Returns `0` once the reading half is shut down or the stream reset.
    pub async fn read(&self, p: &mut [u8]) -> Result<usize> {
        let (n, _) = self.read_sctp(p).await?;
        Ok(n)
    }

    /// Reads the next complete message along with its Payload Protocol
    /// Identifier.
    pub async fn read_sctp(&self, p: &mut [u8]) -> Result<(usize, PayloadProtocolIdentifier)> {
        loop {
            if self.read_shutdown.load(Ordering::SeqCst) {
                return Ok((0, PayloadProtocolIdentifier::Unknown));
            }

            let result = {
                let mut reassembly_queue = self.reassembly_queue.lock().await;
                reassembly_queue.read(p)
            };

            match result {
                Ok(_) | Err(Error::ErrShortBuffer { .. }) => return result,
                Err(_) => {
                    // wait for the next chunk to become available
                    self.read_notifier.notified().await;
                }
            }
        }
    }

    /// Inbound delivery from the association: queue the chunk and wake a
    /// pending reader once a complete message is available.
    pub(crate) async fn handle_data(&self, pd: DataChunk) {
        let readable = {
            let mut reassembly_queue = self.reassembly_queue.lock().await;
            if reassembly_queue.push(pd) {
                reassembly_queue.is_readable()
            } else {
                false
            }
        };

        if readable {
            self.read_notifier.notify_one();
        }
    }

    pub(crate) async fn handle_forward_tsn_for_ordered(&self, ssn: u16) {
        if self.unordered.load(Ordering::SeqCst) {
            return; // handled by handle_forward_tsn_for_unordered
        }

        let readable = {
            let mut reassembly_queue = self.reassembly_queue.lock().await;
            reassembly_queue.forward_tsn_for_ordered(ssn);
            reassembly_queue.is_readable()
        };

        if readable {
            self.read_notifier.notify_one();
        }
    }

    pub(crate) async fn handle_forward_tsn_for_unordered(&self, new_cumulative_tsn: u32) {
        if !self.unordered.load(Ordering::SeqCst) {
            return; // handled by handle_forward_tsn_for_ordered
        }

        let readable = {
            let mut reassembly_queue = self.reassembly_queue.lock().await;
            reassembly_queue.forward_tsn_for_unordered(new_cumulative_tsn);
            reassembly_queue.is_readable()
        };

        if readable {
            self.read_notifier.notify_one();
        }
    }

    /// Writes `p` with the default Payload Protocol Identifier.
    pub async fn write(&self, p: &Bytes) -> Result<usize> {
        self.write_sctp(p, self.default_payload_type.load(Ordering::SeqCst).into())
            .await
    }

    /// Writes `p` with the given Payload Protocol Identifier.
    ///
    /// Returns an error if the write half of this stream is shut down or
    /// `p` exceeds the maximum message size.
    pub async fn write_sctp(&self, p: &Bytes, ppi: PayloadProtocolIdentifier) -> Result<usize> {
        if self.write_shutdown.load(Ordering::SeqCst) {
            return Err(Error::ErrStreamClosed);
        }

        if p.len() > self.max_message_size.load(Ordering::SeqCst) as usize {
            return Err(Error::ErrOutboundPacketTooLarge);
        }

        match self.get_state() {
            AssociationState::ShutdownSent
            | AssociationState::ShutdownAckSent
            | AssociationState::ShutdownPending
            | AssociationState::ShutdownReceived => return Err(Error::ErrStreamClosed),
            state if state != AssociationState::Established => {
                return Err(Error::ErrPayloadDataStateNotExist)
            }
            _ => {}
        };

        let chunks = self.packetize(p, ppi);

        // append keeps fragments of one message adjacent in the queue.
        self.pending_queue.append(chunks).await;
        self.awake_write_loop();

        Ok(p.len())
    }

    fn packetize(&self, raw: &Bytes, ppi: PayloadProtocolIdentifier) -> Vec<DataChunk> {
        let mut i = 0;
        let mut remaining = raw.len();

        // DCEP messages are always sent ordered and reliable
        // (RFC 8832 Sec 4).
        let unordered =
            ppi != PayloadProtocolIdentifier::Dcep && self.unordered.load(Ordering::SeqCst);

        let mut chunks = vec![];

        let head_abandoned = Arc::new(AtomicBool::new(false));
        let head_all_inflight = Arc::new(AtomicBool::new(false));
        while remaining != 0 {
            let fragment_size = std::cmp::min(self.max_payload_size as usize, remaining);

            // The user data is sliced, not copied; the Bytes handle keeps
            // it alive until every fragment is acknowledged.
            let user_data = raw.slice(i..i + fragment_size);

            let chunk = DataChunk {
                stream_identifier: self.stream_identifier,
                user_data,
                unordered,
                beginning_fragment: i == 0,
                ending_fragment: remaining - fragment_size == 0,
                payload_type: ppi,
                stream_sequence_number: self.sequence_number.load(Ordering::SeqCst),
                abandoned: head_abandoned.clone(),
                all_inflight: head_all_inflight.clone(),
                ..Default::default()
            };

            chunks.push(chunk);

            remaining -= fragment_size;
            i += fragment_size;
        }

        // The Stream Sequence Number is not incremented for chunks sent
        // with the U flag set (RFC 4960 Sec 6.6).
        if !unordered {
            self.sequence_number.fetch_add(1, Ordering::SeqCst);
        }

        self.buffered_amount.fetch_add(raw.len(), Ordering::SeqCst);

        chunks
    }

    /// Closes the stream and asks the peer to reset it.
    ///
    /// Pending and future reads return 0; writes fail.
    pub async fn shutdown(&self) -> Result<()> {
        if self.read_shutdown.load(Ordering::SeqCst) && self.write_shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.write_shutdown.store(true, Ordering::SeqCst);
        if !self.read_shutdown.swap(true, Ordering::SeqCst) {
            self.read_notifier.notify_waiters();
        }

        // https://tools.ietf.org/html/rfc6525
        self.send_reset_request().await
    }

    /// buffered_amount returns the number of bytes of data currently queued to be sent over this stream.
    pub fn buffered_amount(&self) -> usize {
        self.buffered_amount.load(Ordering::SeqCst)
    }

    /// buffered_amount_low_threshold returns the number of bytes of buffered outgoing data that is
    /// considered "low." Defaults to 0.
    pub fn buffered_amount_low_threshold(&self) -> usize {
        self.buffered_amount_low.load(Ordering::SeqCst)
    }

    /// set_buffered_amount_low_threshold updates the threshold.
    pub fn set_buffered_amount_low_threshold(&self, th: usize) {
        self.buffered_amount_low.store(th, Ordering::SeqCst);
    }

    /// on_buffered_amount_low sets the callback invoked when the amount of
    /// buffered outgoing data falls below the threshold.
    pub fn on_buffered_amount_low(&self, f: OnBufferedAmountLowFn) {
        self.on_buffered_amount_low
            .store(Some(Arc::new(Mutex::new(f))));
    }

    /// Notifies the stream that the peer acknowledged `n_bytes_released`
    /// of its outgoing data.
    pub(crate) async fn on_buffer_released(&self, n_bytes_released: i64) {
        if n_bytes_released <= 0 {
            return;
        }

        let from_amount = self.buffered_amount.load(Ordering::SeqCst);
        let new_amount = if from_amount < n_bytes_released as usize {
            self.buffered_amount.store(0, Ordering::SeqCst);
            log::error!(
                "[{}] released buffer size {} should be <= {}",
                self.name,
                n_bytes_released,
                from_amount,
            );
            0
        } else {
            self.buffered_amount
                .fetch_sub(n_bytes_released as usize, Ordering::SeqCst);
            from_amount - n_bytes_released as usize
        };

        let buffered_amount_low = self.buffered_amount_low.load(Ordering::SeqCst);
        if from_amount > buffered_amount_low && new_amount <= buffered_amount_low {
            if let Some(handler) = &*self.on_buffered_amount_low.load() {
                let mut f = handler.lock().await;
                f().await;
            }
        }
    }

    /// Bytes queued for delivery, counted against the receive window.
    pub(crate) async fn get_num_bytes_in_reassembly_queue(&self) -> usize {
        let reassembly_queue = self.reassembly_queue.lock().await;
        reassembly_queue.get_num_bytes()
    }

    fn get_state(&self) -> AssociationState {
        self.state.load(Ordering::SeqCst).into()
    }

    fn awake_write_loop(&self) {
        let _ = self.awake_write_loop_ch.try_send(());
    }

    async fn send_reset_request(&self) -> Result<()> {
        if self.get_state() != AssociationState::Established {
            return Err(Error::ErrResetPacketInStateNotExist);
        }

        // An empty DATA chunk for this stream is queued as the
        // end-of-stream marker; the gather loop turns it into an outgoing
        // reset request.
        let c = DataChunk {
            stream_identifier: self.stream_identifier,
            beginning_fragment: true,
            ending_fragment: true,
            user_data: Bytes::new(),
            ..Default::default()
        };

        self.pending_queue.push(c).await;
        self.awake_write_loop();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_stream() -> Stream {
        let (awake_tx, _awake_rx) = mpsc::channel(1);
        let state = Arc::new(AtomicU8::new(AssociationState::Established as u8));
        Stream::new(
            "0:test".to_owned(),
            0,
            1200,
            Arc::new(AtomicU32::new(65536)),
            state,
            Arc::new(awake_tx),
            Arc::new(PendingQueue::new()),
        )
    }

    #[tokio::test]
    async fn test_stream_buffered_amount() -> Result<()> {
        let s = test_stream();
        assert_eq!(s.buffered_amount(), 0);
        assert_eq!(s.buffered_amount_low_threshold(), 0);

        s.write(&Bytes::from_static(&[0u8; 10])).await?;
        s.write(&Bytes::from_static(&[0u8; 20])).await?;
        assert_eq!(s.buffered_amount(), 30);
        assert_eq!(s.pending_queue.len(), 2);

        s.on_buffer_released(10).await;
        assert_eq!(s.buffered_amount(), 20);
        s.on_buffer_released(25).await; // released more than buffered
        assert_eq!(s.buffered_amount(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_stream_buffered_amount_low_callback() -> Result<()> {
        let s = Arc::new(test_stream());
        s.set_buffered_amount_low_threshold(5);

        let n_cbs = Arc::new(portable_atomic::AtomicU32::new(0));
        let n_cbs2 = Arc::clone(&n_cbs);
        s.on_buffered_amount_low(Box::new(move || {
            let n_cbs = Arc::clone(&n_cbs2);
            Box::pin(async move {
                n_cbs.fetch_add(1, Ordering::SeqCst);
            })
        }));

        s.write(&Bytes::from_static(&[0u8; 10])).await?;
        s.on_buffer_released(4).await; // 10 -> 6, still above
        assert_eq!(n_cbs.load(Ordering::SeqCst), 0);
        s.on_buffer_released(2).await; // 6 -> 4, crosses the threshold
        assert_eq!(n_cbs.load(Ordering::SeqCst), 1);
        s.on_buffer_released(4).await; // 4 -> 0, already below
        assert_eq!(n_cbs.load(Ordering::SeqCst), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_stream_ssn_increments_for_ordered_only() -> Result<()> {
        let s = test_stream();

        s.write(&Bytes::from_static(b"one")).await?;
        s.write(&Bytes::from_static(b"two")).await?;
        assert_eq!(s.sequence_number.load(Ordering::SeqCst), 2);

        s.set_reliability_params(true, ReliabilityType::Reliable, 0);
        s.write(&Bytes::from_static(b"three")).await?;
        assert_eq!(
            s.sequence_number.load(Ordering::SeqCst),
            2,
            "unordered writes must not bump the SSN"
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_stream_write_after_shutdown_fails() {
        let s = test_stream();
        s.write_shutdown.store(true, Ordering::SeqCst);

        let err = s
            .write(&Bytes::from_static(b"nope"))
            .await
            .expect_err("should fail");
        assert_eq!(err, Error::ErrStreamClosed);
    }
}
