#[cfg(test)]
mod inner_test;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use portable_atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize};
use rand::random;
use tokio::sync::{broadcast, mpsc};

use super::congestion::CongestionController;
use super::stats::AssociationStats;
use super::{
    AckMode, AckState, AssociationListener, AssociationState, Config, RtxTimerId,
    COMMON_HEADER_SIZE, DATA_CHUNK_HEADER_SIZE, DEFAULT_MAX_MESSAGE_SIZE, INITIAL_MTU,
    INITIAL_RECV_BUF_SIZE, LOCAL_EXTENSIONS,
};
use crate::chunk::data::{DataChunk, PayloadProtocolIdentifier};
use crate::chunk::error::ErrorChunk;
use crate::chunk::forward_tsn::{ForwardTsnChunk, SkippedStream};
use crate::chunk::init::InitChunk;
use crate::chunk::reconfig::ReconfigChunk;
use crate::chunk::sack::SackChunk;
use crate::chunk::shutdown::{ShutdownAckChunk, ShutdownChunk, ShutdownCompleteChunk};
use crate::chunk::state::{CookieAckChunk, CookieEchoChunk};
use crate::chunk::{Chunk, UnknownChunk, CT_FORWARD_TSN};
use crate::cookie::{CookieCheck, CookieJar};
use crate::dcep::DcepOpen;
use crate::error::{Error, Result};
use crate::error_cause::{ErrorCause, UNRECOGNIZED_CHUNK_TYPE};
use crate::packet::Packet;
use crate::param::{OutgoingResetRequest, Param, ReconfigResponse, ReconfigResult};
use crate::queue::control_queue::ControlQueue;
use crate::queue::inflight_queue::InflightQueue;
use crate::queue::payload_queue::PayloadQueue;
use crate::queue::pending_queue::PendingQueue;
use crate::stream::{ReliabilityType, Stream};
use crate::timer::ack_timer::{AckTimer, AckTimerObserver};
use crate::timer::rtx_timer::{RtoManager, RtxTimer, RtxTimerObserver};
use crate::util::*;

/// INIT and COOKIE-ECHO retained for T1 retransmissions.
#[derive(Default)]
pub(crate) struct HandshakeStash {
    pub(crate) init: Option<InitChunk>,
    pub(crate) cookie_echo: Option<CookieEchoChunk>,
}

/// The retransmission and delayed-ack timers, wired up by the association
/// handle once the engine sits behind its mutex.
#[derive(Default)]
pub(crate) struct AssociationTimers {
    pub(crate) t1init: Option<RtxTimer<AssociationInner>>,
    pub(crate) t1cookie: Option<RtxTimer<AssociationInner>>,
    pub(crate) t2shutdown: Option<RtxTimer<AssociationInner>>,
    pub(crate) t3rtx: Option<RtxTimer<AssociationInner>>,
    pub(crate) treconfig: Option<RtxTimer<AssociationInner>>,
    pub(crate) ack: Option<AckTimer<AssociationInner>>,
}

/// Control chunk owed to the peer during the shutdown exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownReply {
    Ack,
    Complete,
}

/// What to do with the ack timer once an inbound packet is fully
/// dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckDecision {
    None,
    SendNow,
    Delay,
}

/// Collapses the ack triggers of one inbound packet into at most one
/// scheduled SACK (spec: at-most-one SACK per chunk batch).
#[derive(Default, Debug)]
struct AckScheduler {
    state: AckState,
    delayed_pending: bool,
    immediate_pending: bool,
}

impl AckScheduler {
    fn begin_packet(&mut self) {
        self.delayed_pending = false;
        self.immediate_pending = false;
    }

    /// Records one inbound DATA (or FORWARD-TSN) observation.
    fn on_inbound_data(&mut self, mode: AckMode, sack_now: bool, packet_loss: bool) {
        let delay = match mode {
            AckMode::AlwaysDelay => true,
            AckMode::NoDelay => false,
            AckMode::Normal => {
                self.state != AckState::Immediate && !sack_now && !packet_loss
            }
        };

        if delay && self.state == AckState::Idle {
            self.delayed_pending = true;
        } else {
            self.immediate_pending = true;
        }
    }

    /// RFC 4960 Sec 6.2: a duplicate earns an immediate SACK.
    fn note_duplicate(&mut self) {
        self.immediate_pending = true;
    }

    fn end_packet(&mut self) -> AckDecision {
        if self.immediate_pending {
            self.state = AckState::Immediate;
            AckDecision::SendNow
        } else if self.delayed_pending {
            self.state = AckState::Delay;
            AckDecision::Delay
        } else {
            AckDecision::None
        }
    }

    fn force_immediate(&mut self) {
        self.state = AckState::Immediate;
    }

    /// Consumes a scheduled immediate SACK, if any.
    fn take_pending_sack(&mut self) -> bool {
        if self.state == AckState::Immediate {
            self.state = AckState::Idle;
            true
        } else {
            false
        }
    }
}

/// Outcome of admitting one inbound DATA chunk.
enum PayloadAdmission {
    Delivered,
    Dropped,
    Duplicate,
    NoStream,
}

/// Bytes newly acknowledged by one SACK, plus the highest TSN among them.
struct AckedSummary {
    bytes_per_stream: HashMap<u16, i64>,
    htna: u32,
}

/// The protocol engine behind the association lock. Inbound dispatch, the
/// outbound gather pass, timer callbacks and user-level sends all funnel
/// through the one mutex owned by [`super::Association`].
#[derive(Default)]
pub(crate) struct AssociationInner {
    pub(crate) name: String,
    pub(crate) is_client: bool,

    // Hot fields mirrored into the public handle.
    pub(crate) state: Arc<AtomicU8>,
    pub(crate) max_message_size: Arc<AtomicU32>,
    pub(crate) inflight_queue_length: Arc<AtomicUsize>,
    pub(crate) will_send_shutdown: Arc<AtomicBool>,

    // Wire identity.
    source_port: u16,
    destination_port: u16,
    pub(crate) my_verification_tag: u32,
    peer_verification_tag: u32,

    // Sequencing.
    pub(crate) my_next_tsn: u32,
    cumulative_tsn_ack_point: u32,
    advanced_peer_tsn_ack_point: u32,
    /// Karn's algorithm: no RTT sample from TSNs below this gate.
    min_tsn_to_measure_rtt: u32,
    peer_last_tsn: u32,
    my_next_rsn: u32,

    // Windows.
    cc: CongestionController,
    pub(crate) max_receive_buffer_size: u32,

    // Payload queues.
    pending_queue: Arc<PendingQueue>,
    inflight_queue: InflightQueue,
    payload_queue: PayloadQueue,
    control_queue: ControlQueue,

    // Handshake material.
    pub(crate) handshake: HandshakeStash,
    cookie_jar: CookieJar,

    // Stream registry.
    streams: HashMap<u16, Arc<Stream>>,
    my_next_stream_id: u16,
    pub(crate) my_max_num_inbound_streams: u16,
    pub(crate) my_max_num_outbound_streams: u16,

    // Reconfiguration: local requests awaiting a response, and peer
    // requests not yet performed, both keyed by RSN.
    outgoing_resets: HashMap<u32, OutgoingResetRequest>,
    incoming_resets: HashMap<u32, OutgoingResetRequest>,
    /// Streams whose reset markers surfaced during the last drain of the
    /// pending queue; turned into one outgoing reset request.
    streams_awaiting_reset: Vec<u16>,

    // Negotiated capabilities.
    supported_extensions: Vec<u8>,
    use_forward_tsn: bool,

    // Intents consumed by the next gather pass.
    wants_fast_retransmit: bool,
    wants_forward_tsn: bool,
    wants_reconfig_retransmit: bool,
    pending_shutdown_reply: Option<ShutdownReply>,

    // Ack scheduling.
    acks: AckScheduler,
    pub(crate) ack_mode: AckMode, // for testing

    // Timers.
    pub(crate) rto_mgr: RtoManager,
    pub(crate) timers: AssociationTimers,

    // Plumbing towards the handle, the IO loops and the application.
    awake_write_loop_ch: Option<Arc<mpsc::Sender<()>>>,
    close_loop_ch_tx: Option<broadcast::Sender<()>>,
    accept_ch_tx: Option<mpsc::Sender<Arc<Stream>>>,
    handshake_completed_ch_tx: Option<mpsc::Sender<Option<Error>>>,
    listener: Option<Arc<dyn AssociationListener + Send + Sync>>,

    pub(crate) stats: Arc<AssociationStats>,
}

impl AssociationInner {
    pub(crate) fn new(
        config: Config,
        is_client: bool,
        close_loop_ch_tx: broadcast::Sender<()>,
        accept_ch_tx: mpsc::Sender<Arc<Stream>>,
        handshake_completed_ch_tx: mpsc::Sender<Option<Error>>,
        awake_write_loop_ch: Arc<mpsc::Sender<()>>,
    ) -> Self {
        let max_receive_buffer_size = match config.max_receive_buffer_size {
            0 => INITIAL_RECV_BUF_SIZE,
            n => n,
        };
        let max_message_size = match config.max_message_size {
            0 => DEFAULT_MAX_MESSAGE_SIZE,
            n => n,
        };

        // TSN 0 is reserved for "nothing received yet" bookkeeping.
        let initial_tsn = random::<u32>().max(1);
        let inflight_queue_length = Arc::new(AtomicUsize::new(0));
        let cc = CongestionController::new(INITIAL_MTU);
        log::trace!(
            "[{}] initial cwnd={} (mtu={})",
            config.name,
            cc.cwnd,
            cc.mtu
        );

        AssociationInner {
            name: config.name,
            is_client,
            listener: config.listener,

            max_message_size: Arc::new(AtomicU32::new(max_message_size)),
            state: Arc::new(AtomicU8::new(AssociationState::Closed as u8)),

            my_verification_tag: random::<u32>(),
            my_next_tsn: initial_tsn,
            cumulative_tsn_ack_point: initial_tsn.wrapping_sub(1),
            advanced_peer_tsn_ack_point: initial_tsn.wrapping_sub(1),
            min_tsn_to_measure_rtt: initial_tsn,
            my_next_rsn: initial_tsn,

            cc,
            max_receive_buffer_size,

            pending_queue: Arc::new(PendingQueue::new()),
            inflight_queue: InflightQueue::new(Arc::clone(&inflight_queue_length)),
            inflight_queue_length,

            // New stream identifiers keep the side's parity: even for the
            // client, odd for the server.
            my_next_stream_id: u16::from(!is_client),
            my_max_num_inbound_streams: u16::MAX,
            my_max_num_outbound_streams: u16::MAX,

            rto_mgr: RtoManager::new(),

            awake_write_loop_ch: Some(awake_write_loop_ch),
            close_loop_ch_tx: Some(close_loop_ch_tx),
            accept_ch_tx: Some(accept_ch_tx),
            handshake_completed_ch_tx: Some(handshake_completed_ch_tx),

            ..Default::default()
        }
    }

    /// Largest DATA payload that still fits one packet.
    fn max_payload_size(&self) -> u32 {
        self.cc
            .mtu
            .saturating_sub(COMMON_HEADER_SIZE + DATA_CHUNK_HEADER_SIZE)
    }

    /// Queues a control packet and nudges the send loop.
    fn reply(&mut self, packet: Packet) {
        self.control_queue.push_back(packet);
        self.awake_write_loop();
    }

    /// create_packet wraps chunks in a packet addressed to the peer.
    pub(crate) fn create_packet(&self, chunks: Vec<Chunk>) -> Packet {
        Packet {
            verification_tag: self.peer_verification_tag,
            source_port: self.source_port,
            destination_port: self.destination_port,
            chunks,
        }
    }

    /// caller must hold self.lock
    pub(crate) fn send_init(&mut self) -> Result<()> {
        let init = self
            .handshake
            .init
            .clone()
            .ok_or(Error::ErrInitNotStoredToSend)?;

        log::debug!("[{}] sending INIT", self.name);
        self.source_port = 5000;
        self.destination_port = 5000;

        // An out-of-the-blue INIT travels under verification tag 0.
        let packet = Packet {
            source_port: self.source_port,
            destination_port: self.destination_port,
            verification_tag: 0,
            chunks: vec![Chunk::Init(init)],
        };
        self.reply(packet);
        Ok(())
    }

    /// caller must hold self.lock
    fn send_cookie_echo(&mut self) -> Result<()> {
        let echo = self
            .handshake
            .cookie_echo
            .clone()
            .ok_or(Error::ErrCookieEchoNotStoredToSend)?;

        log::debug!("[{}] sending COOKIE-ECHO", self.name);
        let packet = self.create_packet(vec![Chunk::CookieEcho(echo)]);
        self.reply(packet);
        Ok(())
    }

    pub(crate) async fn close(&mut self) -> Result<()> {
        if self.get_state() == AssociationState::Closed {
            return Ok(());
        }
        self.set_state(AssociationState::Closed);
        log::debug!("[{}] closing association..", self.name);

        self.stop_all_timers().await;

        // Dropping the sender releases both IO loops.
        self.close_loop_ch_tx.take();

        let sids: Vec<u16> = self.streams.keys().copied().collect();
        for sid in sids {
            self.unregister_stream(sid);
        }

        if let Some(listener) = self.listener.take() {
            tokio::spawn(async move {
                listener.on_disassociated().await;
            });
        }

        log::debug!(
            "[{}] closed; stats: data={} sacks={} t3={} ack_timeouts={} fast_rtx={}",
            self.name,
            self.stats.get_num_datas(),
            self.stats.get_num_sacks(),
            self.stats.get_num_t3timeouts(),
            self.stats.get_num_ack_timeouts(),
            self.stats.get_num_fast_retrans()
        );

        Ok(())
    }

    async fn stop_all_timers(&mut self) {
        let rtx = [
            &self.timers.t1init,
            &self.timers.t1cookie,
            &self.timers.t2shutdown,
            &self.timers.t3rtx,
            &self.timers.treconfig,
        ];
        for timer in rtx.into_iter().flatten() {
            timer.stop().await;
        }
        if let Some(ack) = &mut self.timers.ack {
            ack.stop();
        }
    }

    fn awake_write_loop(&self) {
        if let Some(ch) = &self.awake_write_loop_ch {
            let _ = ch.try_send(());
        }
    }

    /// unregister_stream removes a stream from the association and wakes
    /// any blocked reader. The caller should hold the association lock.
    fn unregister_stream(&mut self, stream_identifier: u16) {
        if let Some(s) = self.streams.remove(&stream_identifier) {
            s.write_shutdown.store(true, Ordering::SeqCst);
            if !s.read_shutdown.swap(true, Ordering::SeqCst) {
                s.read_notifier.notify_waiters();
            }
        }
    }

    ///////////////////////////////////////////////////////////////////
    // inbound dispatch
    ///////////////////////////////////////////////////////////////////

    /// handle_inbound parses an incoming datagram and dispatches its
    /// chunks.
    pub(crate) async fn handle_inbound(&mut self, raw: &Bytes) -> Result<()> {
        let packet = match Packet::unmarshal(raw).and_then(|p| {
            p.check_packet()?;
            Ok(p)
        }) {
            Ok(p) => p,
            Err(err) => {
                log::warn!("[{}] dropping inbound packet: {}", self.name, err);
                return Ok(());
            }
        };

        self.acks.begin_packet();
        for chunk in &packet.chunks {
            self.dispatch_chunk(&packet, chunk).await?;
        }
        self.apply_ack_decision();

        Ok(())
    }

    async fn dispatch_chunk(&mut self, p: &Packet, chunk: &Chunk) -> Result<()> {
        chunk.check()?;

        match chunk {
            Chunk::Init(c) if c.is_ack => self.handle_init_ack(p, c).await,
            Chunk::Init(c) => self.handle_init(p, c).await,
            Chunk::Data(c) => self.handle_data(c).await,
            Chunk::Sack(c) => self.handle_sack(c).await,
            Chunk::CookieEcho(c) => self.handle_cookie_echo(c).await,
            Chunk::CookieAck(_) => self.handle_cookie_ack().await,
            Chunk::Reconfig(c) => self.handle_reconfig(c).await,
            Chunk::ForwardTsn(c) => self.handle_forward_tsn(c).await,
            Chunk::Shutdown(c) => self.handle_shutdown(c).await,
            Chunk::ShutdownAck(c) => self.handle_shutdown_ack(c).await,
            Chunk::ShutdownComplete(c) => self.handle_shutdown_complete(c).await,
            Chunk::Abort(c) => {
                log::warn!("[{}] ABORT received: {}", self.name, c);
                Err(Error::ErrAbortChunk)
            }
            Chunk::Error(c) => {
                // An operation error is not fatal by itself
                // (RFC 4960 Sec 3.3.10).
                log::warn!("[{}] ERROR received: {}", self.name, c);
                Ok(())
            }
            Chunk::Unknown(c) => self.handle_unknown_chunk(c),
        }
    }

    fn handle_unknown_chunk(&mut self, c: &UnknownChunk) -> Result<()> {
        // RFC 4960 Sec 3: bit 7 of the type byte allows skipping the
        // chunk, bit 6 asks for an Unrecognized Chunk Type report.
        let keep_processing = c.typ & 0x80 != 0;
        let wants_report = c.typ & 0x40 != 0;

        if wants_report {
            let cause = ErrorCause {
                code: UNRECOGNIZED_CHUNK_TYPE,
                raw: c.marshal()?,
            };
            let packet = self.create_packet(vec![Chunk::Error(ErrorChunk {
                error_causes: vec![cause],
            })]);
            self.reply(packet);
        }

        if keep_processing {
            Ok(())
        } else {
            Err(Error::ErrChunkTypeUnhandled)
        }
    }

    fn apply_ack_decision(&mut self) {
        match self.acks.end_packet() {
            AckDecision::SendNow => {
                if let Some(ack_timer) = &mut self.timers.ack {
                    ack_timer.stop();
                }
                self.awake_write_loop();
            }
            AckDecision::Delay => {
                if let Some(ack_timer) = &mut self.timers.ack {
                    ack_timer.start();
                }
            }
            AckDecision::None => {}
        }
    }

    ///////////////////////////////////////////////////////////////////
    // handshake
    ///////////////////////////////////////////////////////////////////

    /// Adopts the parameters a peer INIT or INIT ACK carries: stream
    /// counts, verification tag, initial TSN, advertised window and the
    /// extension intersection.
    fn adopt_peer_init(&mut self, i: &InitChunk) {
        self.my_max_num_inbound_streams =
            self.my_max_num_inbound_streams.min(i.num_inbound_streams);
        self.my_max_num_outbound_streams = self
            .my_max_num_outbound_streams
            .min(i.num_outbound_streams);
        self.peer_verification_tag = i.initiate_tag;

        // 13.2: the last TSN received in sequence starts one below the
        // peer's initial TSN.
        self.peer_last_tsn = i.initial_tsn.wrapping_sub(1);

        self.cc.seed_peer_window(i.advertised_receiver_window_credit);
        log::debug!("[{}] initial rwnd={}", self.name, self.cc.rwnd);

        self.supported_extensions = LOCAL_EXTENSIONS
            .iter()
            .copied()
            .filter(|ct| i.supported_extensions().contains(ct))
            .collect();
        self.use_forward_tsn = self.supported_extensions.contains(&CT_FORWARD_TSN);
        if !self.use_forward_tsn {
            log::warn!("[{}] peer does not support ForwardTSN", self.name);
        }
    }

    async fn handle_init(&mut self, p: &Packet, i: &InitChunk) -> Result<()> {
        let state = self.get_state();
        log::debug!("[{}] INIT received in state '{}'", self.name, state);

        // RFC 4960 Sec 5.2.1: an INIT during COOKIE-WAIT/COOKIE-ECHOED is
        // the simultaneous-open collision; answer it and keep the current
        // state. Later states make it an unexpected INIT (Sec 5.2.2).
        match state {
            AssociationState::Closed
            | AssociationState::CookieWait
            | AssociationState::CookieEchoed => {}
            _ => return Err(Error::ErrHandleInitState),
        }

        self.source_port = p.destination_port;
        self.destination_port = p.source_port;
        self.adopt_peer_init(i);

        let mut ack = InitChunk {
            is_ack: true,
            initiate_tag: self.my_verification_tag,
            initial_tsn: self.my_next_tsn,
            advertised_receiver_window_credit: self.max_receive_buffer_size,
            num_outbound_streams: self.my_max_num_outbound_streams,
            num_inbound_streams: self.my_max_num_inbound_streams,
            params: vec![Param::StateCookie {
                cookie: self.cookie_jar.issue(),
            }],
        };
        ack.set_supported_extensions(&LOCAL_EXTENSIONS);

        let packet = self.create_packet(vec![Chunk::Init(ack)]);
        self.reply(packet);
        Ok(())
    }

    async fn handle_init_ack(&mut self, p: &Packet, i: &InitChunk) -> Result<()> {
        let state = self.get_state();
        log::debug!("[{}] INIT-ACK received in state '{}'", self.name, state);

        // RFC 4960 Sec 5.2.3: outside COOKIE-WAIT an INIT ACK is stale and
        // silently discarded.
        if state != AssociationState::CookieWait {
            return Ok(());
        }
        if (self.source_port, self.destination_port) != (p.destination_port, p.source_port) {
            log::warn!("[{}] INIT-ACK port mismatch", self.name);
            return Ok(());
        }

        self.adopt_peer_init(i);

        if let Some(t1init) = &self.timers.t1init {
            t1init.stop().await;
        }
        self.handshake.init = None;

        let cookie = i.state_cookie().ok_or(Error::ErrInitAckNoCookie)?;
        self.handshake.cookie_echo = Some(CookieEchoChunk { cookie });
        self.send_cookie_echo()?;

        if let Some(t1cookie) = &self.timers.t1cookie {
            t1cookie.start(self.rto_mgr.get_rto()).await;
        }
        self.set_state(AssociationState::CookieEchoed);
        Ok(())
    }

    async fn handle_cookie_echo(&mut self, c: &CookieEchoChunk) -> Result<()> {
        let state = self.get_state();
        log::debug!("[{}] COOKIE-ECHO received in state '{}'", self.name, state);

        match (state, self.cookie_jar.check(&c.cookie)) {
            // Replayed valid echo on an established association: ack it
            // again, change nothing.
            (AssociationState::Established, CookieCheck::Valid) => {}

            (
                AssociationState::Closed
                | AssociationState::CookieWait
                | AssociationState::CookieEchoed,
                CookieCheck::Valid,
            ) => {
                self.cookie_jar.retain_only(&c.cookie);
                if let Some(t1init) = &self.timers.t1init {
                    t1init.stop().await;
                }
                self.handshake.init = None;
                if let Some(t1cookie) = &self.timers.t1cookie {
                    t1cookie.stop().await;
                }
                self.handshake.cookie_echo = None;

                self.set_state(AssociationState::Established);
                self.notify_established().await;
            }

            (
                AssociationState::Closed
                | AssociationState::CookieWait
                | AssociationState::CookieEchoed,
                CookieCheck::Stale { staleness_us },
            ) => {
                // RFC 4960 Sec 3.3.10.3: answer with the overflow in
                // microseconds; the association is untouched.
                log::debug!(
                    "[{}] stale COOKIE-ECHO ({} us over)",
                    self.name,
                    staleness_us
                );
                let packet = self.create_packet(vec![Chunk::Error(ErrorChunk {
                    error_causes: vec![ErrorCause::stale_cookie(staleness_us)],
                })]);
                self.reply(packet);
                return Ok(());
            }

            // Unknown cookies and shutdown states: silently discard.
            _ => return Ok(()),
        }

        let ack = self.create_packet(vec![Chunk::CookieAck(CookieAckChunk)]);
        self.reply(ack);
        Ok(())
    }

    async fn handle_cookie_ack(&mut self) -> Result<()> {
        let state = self.get_state();
        log::debug!("[{}] COOKIE-ACK received in state '{}'", self.name, state);

        // RFC 4960 Sec 5.2.5: only meaningful in COOKIE-ECHOED.
        if state != AssociationState::CookieEchoed {
            return Ok(());
        }

        if let Some(t1cookie) = &self.timers.t1cookie {
            t1cookie.stop().await;
        }
        self.handshake.cookie_echo = None;

        self.set_state(AssociationState::Established);
        self.notify_established().await;
        Ok(())
    }

    async fn notify_established(&mut self) {
        if let Some(tx) = &self.handshake_completed_ch_tx {
            let _ = tx.send(None).await;
        }
        if let Some(listener) = self.listener.clone() {
            tokio::spawn(async move {
                listener.on_associated().await;
            });
        }
    }

    ///////////////////////////////////////////////////////////////////
    // inbound DATA
    ///////////////////////////////////////////////////////////////////

    async fn handle_data(&mut self, d: &DataChunk) -> Result<()> {
        log::trace!(
            "[{}] DATA: tsn={} immediateSack={} len={}",
            self.name,
            d.tsn,
            d.immediate_sack,
            d.user_data.len()
        );
        self.stats.inc_datas();

        match self.admit_payload(d).await {
            PayloadAdmission::NoStream => {
                // No stream to deliver to; stay silent and let the sender
                // retry on T3-rtx.
                log::debug!("discard {}", d.stream_sequence_number);
                return Ok(());
            }
            PayloadAdmission::Duplicate => self.acks.note_duplicate(),
            PayloadAdmission::Delivered | PayloadAdmission::Dropped => {}
        }

        self.roll_cumulative_tsn(d.immediate_sack);
        Ok(())
    }

    /// Decides what happens to one inbound DATA chunk: queued and handed
    /// to its stream, logged as a duplicate, or dropped for lack of
    /// receive credit.
    async fn admit_payload(&mut self, d: &DataChunk) -> PayloadAdmission {
        if !self.payload_queue.can_push(d.tsn, self.peer_last_tsn) {
            // push on a duplicate only records it for the next SACK
            self.payload_queue.push(d.clone(), self.peer_last_tsn);
            return PayloadAdmission::Duplicate;
        }

        let is_new_stream = !self.streams.contains_key(&d.stream_identifier);
        let Some(stream) = self.get_or_create_stream(d.stream_identifier) else {
            return PayloadAdmission::NoStream;
        };
        if is_new_stream {
            self.announce_stream(&stream, d);
        }

        // The buffer cap only yields for chunks that fill an existing gap.
        let admitted = self.get_my_receiver_window_credit().await > 0 || self.fills_a_gap(d.tsn);
        if !admitted {
            log::debug!(
                "[{}] receive buffer full, dropping DATA tsn={} ssn={}",
                self.name,
                d.tsn,
                d.stream_sequence_number
            );
            return PayloadAdmission::Dropped;
        }

        self.payload_queue.push(d.clone(), self.peer_last_tsn);
        stream.handle_data(d.clone()).await;
        PayloadAdmission::Delivered
    }

    fn fills_a_gap(&self, tsn: u32) -> bool {
        match self.payload_queue.get_last_tsn_received() {
            Some(last) => sna32_lt(tsn, *last),
            None => false,
        }
    }

    /// Folds contiguously received TSNs into the cumulative point, serves
    /// reset requests that matured along the way, and schedules the ack.
    fn roll_cumulative_tsn(&mut self, sack_now: bool) {
        // RFC 3758 Sec 3.6: advance while the successor TSN is on hand.
        while self
            .payload_queue
            .pop(self.peer_last_tsn.wrapping_add(1))
            .is_some()
        {
            self.peer_last_tsn = self.peer_last_tsn.wrapping_add(1);
            self.flush_matured_resets();
        }

        let packet_loss = !self.payload_queue.is_empty();
        if packet_loss {
            log::trace!(
                "[{}] packetloss: {}",
                self.name,
                self.payload_queue
                    .get_gap_ack_blocks_string(self.peer_last_tsn)
            );
        }

        self.acks.on_inbound_data(self.ack_mode, sack_now, packet_loss);
    }

    /// Re-evaluates every pending incoming reset request against the new
    /// cumulative TSN.
    fn flush_matured_resets(&mut self) {
        let pending: Vec<OutgoingResetRequest> = self.incoming_resets.values().cloned().collect();
        for req in pending {
            let response = self.perform_or_defer_reset(&req);
            self.reply(response);
        }
    }

    ///////////////////////////////////////////////////////////////////
    // SACK processing
    ///////////////////////////////////////////////////////////////////

    async fn handle_sack(&mut self, sack: &SackChunk) -> Result<()> {
        log::trace!(
            "[{}] SACK: cumTSN={} a_rwnd={} (ack point {})",
            self.name,
            sack.cumulative_tsn_ack,
            sack.advertised_receiver_window_credit,
            self.cumulative_tsn_ack_point
        );

        let state = self.get_state();
        if !matches!(
            state,
            AssociationState::Established
                | AssociationState::ShutdownPending
                | AssociationState::ShutdownReceived
        ) {
            return Ok(());
        }
        self.stats.inc_sacks();

        // RFC 4960 Sec 6.2.1 D i): a cumulative ack below the ack point is
        // an out-of-order SACK; drop it.
        if sna32_gt(self.cumulative_tsn_ack_point, sack.cumulative_tsn_ack) {
            log::debug!(
                "[{}] dropping SACK: cumTSN={} is behind ack point {}",
                self.name,
                sack.cumulative_tsn_ack,
                self.cumulative_tsn_ack_point
            );
            return Ok(());
        }

        let advanced = sna32_lt(self.cumulative_tsn_ack_point, sack.cumulative_tsn_ack);
        let summary = self.retire_acked_chunks(sack).await?;
        let total_bytes_acked: i64 = summary.bytes_per_stream.values().sum();

        if advanced {
            log::trace!(
                "[{}] cumTSN advanced: {} -> {}",
                self.name,
                self.cumulative_tsn_ack_point,
                sack.cumulative_tsn_ack
            );
            self.cumulative_tsn_ack_point = sack.cumulative_tsn_ack;
            self.restart_or_stop_t3().await;
            self.cc.on_cumulative_ack(
                total_bytes_acked as u32,
                self.pending_queue.len() > 0,
                &self.name,
            );
        }

        for (si, released) in &summary.bytes_per_stream {
            if let Some(s) = self.streams.get(si) {
                s.on_buffer_released(*released).await;
            }
        }

        self.cc.refresh_peer_window(
            sack.advertised_receiver_window_credit,
            self.inflight_queue.get_num_bytes() as u32,
        );

        self.count_misses(summary.htna, advanced);

        if self.use_forward_tsn {
            self.advance_abandoned_point();
            self.awake_write_loop();
        }

        self.after_sack_transition(state, advanced).await;
        Ok(())
    }

    /// Retires chunks the SACK acknowledged: everything at or below the
    /// cumulative ack leaves the inflight queue, gap-reported chunks stay
    /// queued but release their payload.
    async fn retire_acked_chunks(&mut self, sack: &SackChunk) -> Result<AckedSummary> {
        let mut summary = AckedSummary {
            bytes_per_stream: HashMap::new(),
            htna: sack.cumulative_tsn_ack,
        };

        let span = sack
            .cumulative_tsn_ack
            .wrapping_sub(self.cumulative_tsn_ack_point);
        let mut tsn = self.cumulative_tsn_ack_point;
        for _ in 0..span {
            tsn = tsn.wrapping_add(1);
            let chunk = self
                .inflight_queue
                .pop(tsn)
                .ok_or(Error::ErrInflightQueueTsnPop)?;

            if self.cc.covers_recovery_exit(tsn) {
                log::debug!("[{}] exit fast-recovery", self.name);
            }
            if chunk.acked {
                // payload already released by an earlier gap report
                continue;
            }

            *summary
                .bytes_per_stream
                .entry(chunk.stream_identifier)
                .or_insert(0) += chunk.user_data.len() as i64;
            self.try_measure_rtt(chunk.n_sent, chunk.tsn, chunk.sent_time);
        }

        for block in &sack.gap_ack_blocks {
            for offset in block.start..=block.end {
                let tsn = sack.cumulative_tsn_ack.wrapping_add(u32::from(offset));

                let (already_acked, si, n_sent, sent_time) = {
                    let c = self
                        .inflight_queue
                        .get(tsn)
                        .ok_or(Error::ErrTsnRequestNotExist)?;
                    (c.acked, c.stream_identifier, c.n_sent, c.sent_time)
                };
                if already_acked {
                    continue;
                }

                let released = self.inflight_queue.mark_as_acked(tsn);
                *summary.bytes_per_stream.entry(si).or_insert(0) += released as i64;
                self.try_measure_rtt(n_sent, tsn, sent_time);

                if sna32_lt(summary.htna, tsn) {
                    summary.htna = tsn;
                }
            }
        }

        Ok(summary)
    }

    /// Karn's algorithm: only first-transmission chunks at or above the
    /// measurement gate contribute an RTT sample, one per round trip.
    fn try_measure_rtt(&mut self, n_sent: u32, tsn: u32, sent_time: SystemTime) {
        if n_sent != 1 || !sna32_gte(tsn, self.min_tsn_to_measure_rtt) {
            return;
        }
        self.min_tsn_to_measure_rtt = self.my_next_tsn;

        // A skewed clock just skips the sample.
        let Ok(rtt) = SystemTime::now().duration_since(sent_time) else {
            return;
        };
        let srtt = self.rto_mgr.set_new_rtt(rtt.as_millis() as u64);
        log::trace!(
            "[{}] measured rtt={}ms srtt={} rto={}",
            self.name,
            rtt.as_millis(),
            srtt,
            self.rto_mgr.get_rto()
        );
    }

    /// RFC 4960 Sec 6.3.2 R2/R3: an ack covering the earliest outstanding
    /// TSN restarts T3-rtx from a full RTO; with nothing outstanding it
    /// stops.
    async fn restart_or_stop_t3(&mut self) {
        let Some(t3rtx) = &self.timers.t3rtx else {
            return;
        };
        t3rtx.stop().await;
        if !self.inflight_queue.is_empty() {
            t3rtx.start(self.rto_mgr.get_rto()).await;
        }
    }

    /// HTNA miss counting (RFC 4960 Sec 7.2.4): outside fast recovery only
    /// TSNs below the highest newly acked count as missing; inside it,
    /// with the ack point advanced, every queued TSN does.
    fn count_misses(&mut self, htna: u32, advanced: bool) {
        if self.cc.in_fast_recovery() && !advanced {
            return;
        }

        let limit = if self.cc.in_fast_recovery() {
            None
        } else {
            Some(htna)
        };
        let reported_missing: Vec<u32> = self
            .inflight_queue
            .ordered_tsns()
            .take_while(|tsn| limit.map_or(true, |l| sna32_lt(*tsn, l)))
            .collect();

        let mut hit_threshold = false;
        for tsn in reported_missing {
            let Some(c) = self.inflight_queue.get_mut(tsn) else {
                continue;
            };
            if c.acked || c.abandoned() || c.miss_indicator >= 3 {
                continue;
            }
            c.miss_indicator += 1;
            if c.miss_indicator == 3 {
                hit_threshold = true;
            }
        }

        if hit_threshold && !self.cc.in_fast_recovery() {
            self.cc.enter_fast_recovery(htna, &self.name);
            self.wants_fast_retransmit = true;
        } else if self.cc.in_fast_recovery() && advanced {
            self.wants_fast_retransmit = true;
        }
    }

    /// RFC 3758 Sec 3.5 C1-C3: moves the advanced peer ack point past
    /// abandoned chunks and flags a FORWARD-TSN when it leads the
    /// cumulative point.
    fn advance_abandoned_point(&mut self) {
        if sna32_lt(self.advanced_peer_tsn_ack_point, self.cumulative_tsn_ack_point) {
            self.advanced_peer_tsn_ack_point = self.cumulative_tsn_ack_point;
        }

        let mut next = self.advanced_peer_tsn_ack_point.wrapping_add(1);
        while self
            .inflight_queue
            .get(next)
            .map_or(false, |c| c.abandoned())
        {
            self.advanced_peer_tsn_ack_point = next;
            next = next.wrapping_add(1);
        }

        if sna32_gt(self.advanced_peer_tsn_ack_point, self.cumulative_tsn_ack_point) {
            self.wants_forward_tsn = true;
        }
    }

    /// Keeps T3 alive while data is outstanding; once drained, a pending
    /// graceful shutdown may proceed.
    async fn after_sack_transition(&mut self, state: AssociationState, advanced: bool) {
        let mut wake = advanced;

        if !self.inflight_queue.is_empty() {
            // noop if already running
            if let Some(t3rtx) = &self.timers.t3rtx {
                t3rtx.start(self.rto_mgr.get_rto()).await;
            }
        } else if state == AssociationState::ShutdownPending {
            wake = true;
            self.will_send_shutdown.store(true, Ordering::SeqCst);
            self.set_state(AssociationState::ShutdownSent);
        } else if state == AssociationState::ShutdownReceived {
            wake = true;
            self.pending_shutdown_reply = Some(ShutdownReply::Ack);
            self.set_state(AssociationState::ShutdownAckSent);
        }

        if wake {
            self.awake_write_loop();
        }
    }

    ///////////////////////////////////////////////////////////////////
    // FORWARD-TSN and reconfiguration
    ///////////////////////////////////////////////////////////////////

    async fn handle_forward_tsn(&mut self, c: &ForwardTsnChunk) -> Result<()> {
        log::trace!("[{}] {}", self.name, c);

        if !self.use_forward_tsn {
            log::warn!("[{}] FORWARD-TSN received but not negotiated", self.name);
            let packet = self.create_packet(vec![Chunk::Error(ErrorChunk {
                error_causes: vec![ErrorCause {
                    code: UNRECOGNIZED_CHUNK_TYPE,
                    raw: Bytes::new(),
                }],
            })]);
            self.reply(packet);
            return Ok(());
        }

        // RFC 3758 Sec 3.6: an out-of-date forward point still earns a
        // SACK, since the previous one may have been lost.
        if sna32_lte(c.new_cumulative_tsn, self.peer_last_tsn) {
            self.acks.force_immediate();
            if let Some(ack_timer) = &mut self.timers.ack {
                ack_timer.stop();
            }
            self.awake_write_loop();
            return Ok(());
        }

        while sna32_lt(self.peer_last_tsn, c.new_cumulative_tsn) {
            self.peer_last_tsn = self.peer_last_tsn.wrapping_add(1);
            self.payload_queue.pop(self.peer_last_tsn); // discard if queued
        }

        // Release stranded ordered messages per reported stream; unordered
        // skips carry no stream attribution, so every stream prunes.
        for skipped in &c.streams {
            if let Some(s) = self.streams.get(&skipped.identifier) {
                s.handle_forward_tsn_for_ordered(skipped.sequence).await;
            }
        }
        for s in self.streams.values() {
            s.handle_forward_tsn_for_unordered(c.new_cumulative_tsn).await;
        }

        self.roll_cumulative_tsn(false);
        Ok(())
    }

    async fn handle_reconfig(&mut self, c: &ReconfigChunk) -> Result<()> {
        log::trace!("[{}] handle_reconfig", self.name);

        for param in &c.params {
            match param {
                Param::OutgoingResetRequest(req) => {
                    self.incoming_resets
                        .insert(req.request_sequence_number, req.clone());
                    let response = self.perform_or_defer_reset(req);
                    self.reply(response);
                }
                Param::ReconfigResponse(resp) => {
                    self.outgoing_resets.remove(&resp.response_sequence_number);
                    if self.outgoing_resets.is_empty() {
                        if let Some(treconfig) = &self.timers.treconfig {
                            treconfig.stop().await;
                        }
                    }
                }
                other => {
                    log::warn!("[{}] unexpected reconfig param: {}", self.name, other);
                }
            }
        }

        Ok(())
    }

    /// Performs an incoming reset once the peer's last TSN is covered,
    /// otherwise reports it in progress (RFC 6525 Sec 5.2.2).
    fn perform_or_defer_reset(&mut self, req: &OutgoingResetRequest) -> Packet {
        let performable = sna32_lte(req.sender_last_tsn, self.peer_last_tsn);
        log::debug!(
            "[{}] reset rsn={}: sender_last_tsn={} peer_last_tsn={} performable={}",
            self.name,
            req.request_sequence_number,
            req.sender_last_tsn,
            self.peer_last_tsn,
            performable
        );

        let result = if performable {
            for sid in &req.stream_identifiers {
                self.unregister_stream(*sid);
            }
            self.incoming_resets.remove(&req.request_sequence_number);
            ReconfigResult::SuccessPerformed
        } else {
            ReconfigResult::InProgress
        };

        self.create_packet(vec![Chunk::Reconfig(ReconfigChunk {
            params: vec![Param::ReconfigResponse(ReconfigResponse {
                response_sequence_number: req.request_sequence_number,
                result,
            })],
        })])
    }

    ///////////////////////////////////////////////////////////////////
    // shutdown exchange
    ///////////////////////////////////////////////////////////////////

    async fn handle_shutdown(&mut self, _c: &ShutdownChunk) -> Result<()> {
        match self.get_state() {
            AssociationState::Established if self.inflight_queue.is_empty() => {
                self.pending_shutdown_reply = Some(ShutdownReply::Ack);
                self.set_state(AssociationState::ShutdownAckSent);
                self.awake_write_loop();
            }
            AssociationState::Established => {
                // drain in-flight data first
                self.set_state(AssociationState::ShutdownReceived);
            }
            AssociationState::ShutdownSent => {
                self.pending_shutdown_reply = Some(ShutdownReply::Ack);
                self.set_state(AssociationState::ShutdownAckSent);
                self.awake_write_loop();
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_shutdown_ack(&mut self, _c: &ShutdownAckChunk) -> Result<()> {
        if matches!(
            self.get_state(),
            AssociationState::ShutdownSent | AssociationState::ShutdownAckSent
        ) {
            if let Some(t2shutdown) = &self.timers.t2shutdown {
                t2shutdown.stop().await;
            }
            self.pending_shutdown_reply = Some(ShutdownReply::Complete);
            self.awake_write_loop();
        }
        Ok(())
    }

    async fn handle_shutdown_complete(&mut self, _c: &ShutdownCompleteChunk) -> Result<()> {
        if self.get_state() == AssociationState::ShutdownAckSent {
            if let Some(t2shutdown) = &self.timers.t2shutdown {
                t2shutdown.stop().await;
            }
            self.close().await?;
        }
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////
    // outbound gather pass
    ///////////////////////////////////////////////////////////////////

    /// gather_outbound produces the packets of one send-loop pass. A
    /// `false` in the second slot tells the loop to close down after the
    /// final send.
    pub(crate) async fn gather_outbound(&mut self) -> (Vec<Packet>, bool) {
        let mut out: Vec<Packet> = self.control_queue.drain(..).collect();
        let mut keep_running = true;

        match self.get_state() {
            AssociationState::Established => {
                self.flush_retransmissions(&mut out);
                self.flush_new_data(&mut out).await;
                self.flush_reconfig(&mut out).await;
                self.flush_fast_retransmit(&mut out);
                self.flush_sack(&mut out).await;
                self.flush_forward_tsn(&mut out);
            }
            AssociationState::ShutdownPending
            | AssociationState::ShutdownSent
            | AssociationState::ShutdownReceived => {
                self.flush_retransmissions(&mut out);
                self.flush_fast_retransmit(&mut out);
                self.flush_sack(&mut out).await;
                keep_running = self.flush_shutdown(&mut out).await;
            }
            AssociationState::ShutdownAckSent => {
                keep_running = self.flush_shutdown(&mut out).await;
            }
            _ => {}
        }

        (out, keep_running)
    }

    /// Collects chunks flagged by the T3-rtx timeout, bounded by
    /// min(cwnd, rwnd); the earliest outstanding chunk may go out as a
    /// zero-window probe.
    fn flush_retransmissions(&mut self, out: &mut Vec<Packet>) {
        let awnd = self.cc.awnd() as usize;
        let rwnd = self.cc.rwnd as usize;
        let mut batch: Vec<DataChunk> = vec![];
        let mut batched_bytes = 0usize;

        let tsns: Vec<u32> = self.inflight_queue.ordered_tsns().collect();
        for (pos, tsn) in tsns.into_iter().enumerate() {
            let Some(c) = self.inflight_queue.get_mut(tsn) else {
                break;
            };
            if !c.retransmit {
                continue;
            }

            let len = c.user_data.len();
            let zero_window_probe = pos == 0 && rwnd < len;
            if !zero_window_probe && batched_bytes + len > awnd {
                break;
            }

            // cleared so the chunk is not re-sent before the next T3 expiry
            c.retransmit = false;
            c.n_sent += 1;
            batched_bytes += len;

            if let Some(c) = self.inflight_queue.get(tsn) {
                self.apply_abandonment_policy(c);
                log::trace!(
                    "[{}] retransmitting tsn={} ssn={} sent={}",
                    self.name,
                    c.tsn,
                    c.stream_sequence_number,
                    c.n_sent
                );
                batch.push(c.clone());
            }

            if zero_window_probe {
                break;
            }
        }

        if !batch.is_empty() {
            self.bundle_into(out, batch);
        }
    }

    /// Moves fresh DATA into the inflight queue as far as the windows
    /// allow and bundles it.
    async fn flush_new_data(&mut self, out: &mut Vec<Packet>) {
        let batch = self.drain_pending_queue().await;
        if batch.is_empty() {
            return;
        }

        // noop if already started
        if let Some(t3rtx) = &self.timers.t3rtx {
            t3rtx.start(self.rto_mgr.get_rto()).await;
        }
        self.bundle_into(out, batch);
    }

    /// Pops pending chunks within cwnd and rwnd; empty chunks are reset
    /// markers and end up in `streams_awaiting_reset` instead. One chunk
    /// may always probe a closed window (RFC 4960 Sec 6.1 A).
    async fn drain_pending_queue(&mut self) -> Vec<DataChunk> {
        let mut batch = vec![];

        while let Some(head) = self.pending_queue.peek().await {
            if head.user_data.is_empty() {
                self.streams_awaiting_reset.push(head.stream_identifier);
                self.pending_queue
                    .pop(head.beginning_fragment, head.unordered)
                    .await;
                continue;
            }

            let len = head.user_data.len();
            let fits_cwnd =
                self.inflight_queue.get_num_bytes() + len <= self.cc.cwnd as usize;
            let fits_rwnd = len <= self.cc.rwnd as usize;

            if fits_cwnd && fits_rwnd {
                self.cc.reserve(len as u32);
            } else if !batch.is_empty() || !self.inflight_queue.is_empty() {
                break;
            }
            // otherwise: zero-window probe, a single unbudgeted chunk

            if let Some(chunk) = self
                .stage_for_transmission(head.beginning_fragment, head.unordered)
                .await
            {
                batch.push(chunk);
            }

            if !(fits_cwnd && fits_rwnd) {
                break;
            }
        }

        batch
    }

    /// Assigns the TSN and transmission bookkeeping to the pending chunk
    /// just peeked, and moves it into the inflight queue.
    async fn stage_for_transmission(
        &mut self,
        beginning_fragment: bool,
        unordered: bool,
    ) -> Option<DataChunk> {
        let Some(mut chunk) = self.pending_queue.pop(beginning_fragment, unordered).await else {
            log::error!("[{}] staged chunk vanished from the pending queue", self.name);
            return None;
        };

        chunk.tsn = self.take_next_tsn();
        chunk.n_sent = 1;
        chunk.sent_time = SystemTime::now();
        if chunk.ending_fragment {
            // the whole message is in flight once its tail is
            chunk.set_all_inflight();
        }
        self.apply_abandonment_policy(&chunk);

        log::trace!(
            "[{}] staging tsn={} si={} ssn={} len={} ({},{})",
            self.name,
            chunk.tsn,
            chunk.stream_identifier,
            chunk.stream_sequence_number,
            chunk.user_data.len(),
            chunk.beginning_fragment,
            chunk.ending_fragment
        );

        self.inflight_queue.push(chunk.clone());
        Some(chunk)
    }

    /// Splits a run of DATA chunks into packets no larger than the path
    /// MTU (RFC 4960 Sec 6.1).
    fn bundle_into(&self, out: &mut Vec<Packet>, chunks: Vec<DataChunk>) {
        let budget = self.cc.mtu as usize - COMMON_HEADER_SIZE as usize;
        let mut load = 0usize;
        let mut bundle: Vec<Chunk> = vec![];

        for c in chunks {
            let size = c.serialized_size();
            if !bundle.is_empty() && load + size > budget {
                out.push(self.create_packet(std::mem::take(&mut bundle)));
                load = 0;
            }
            load += size;
            bundle.push(Chunk::Data(c));
        }

        if !bundle.is_empty() {
            out.push(self.create_packet(bundle));
        }
    }

    /// Emits reset requests for freshly closed streams and retransmits the
    /// outstanding ones when the reconfig timer fired.
    async fn flush_reconfig(&mut self, out: &mut Vec<Packet>) {
        let mut emitted = false;

        if std::mem::take(&mut self.wants_reconfig_retransmit) {
            log::debug!(
                "[{}] retransmitting {} reset request(s)",
                self.name,
                self.outgoing_resets.len()
            );
            for req in self.outgoing_resets.values() {
                let chunk = ReconfigChunk {
                    params: vec![Param::OutgoingResetRequest(req.clone())],
                };
                out.push(self.create_packet(vec![Chunk::Reconfig(chunk)]));
                emitted = true;
            }
        }

        let sids = std::mem::take(&mut self.streams_awaiting_reset);
        if !sids.is_empty() {
            let req = OutgoingResetRequest {
                request_sequence_number: self.take_next_rsn(),
                sender_last_tsn: self.my_next_tsn.wrapping_sub(1),
                stream_identifiers: sids,
                ..Default::default()
            };
            log::debug!(
                "[{}] sending reset request: rsn={} last_tsn={} streams={:?}",
                self.name,
                req.request_sequence_number,
                req.sender_last_tsn,
                req.stream_identifiers
            );
            // kept for retransmission until the peer responds
            self.outgoing_resets
                .insert(req.request_sequence_number, req.clone());
            let chunk = ReconfigChunk {
                params: vec![Param::OutgoingResetRequest(req)],
            };
            out.push(self.create_packet(vec![Chunk::Reconfig(chunk)]));
            emitted = true;
        }

        if emitted && !self.outgoing_resets.is_empty() {
            if let Some(treconfig) = &self.timers.treconfig {
                treconfig.start(self.rto_mgr.get_rto()).await;
            }
        }
    }

    /// RFC 4960 Sec 7.2.4: bundles the earliest chunks with three miss
    /// indications into a single packet, ignoring cwnd.
    fn flush_fast_retransmit(&mut self, out: &mut Vec<Packet>) {
        if !std::mem::take(&mut self.wants_fast_retransmit) {
            return;
        }

        let mut room = self.cc.mtu as usize - COMMON_HEADER_SIZE as usize;
        let mut rtx: Vec<Chunk> = vec![];

        let tsns: Vec<u32> = self.inflight_queue.ordered_tsns().collect();
        for tsn in tsns {
            let Some(c) = self.inflight_queue.get_mut(tsn) else {
                break;
            };
            if c.acked || c.abandoned() || c.n_sent != 1 || c.miss_indicator < 3 {
                continue;
            }

            let size = c.serialized_size();
            if size > room {
                break;
            }
            room -= size;
            c.n_sent += 1;
            self.stats.inc_fast_retrans();

            if let Some(c) = self.inflight_queue.get(tsn) {
                self.apply_abandonment_policy(c);
                log::trace!(
                    "[{}] fast-retransmitting tsn={} sent={}",
                    self.name,
                    c.tsn,
                    c.n_sent
                );
                rtx.push(Chunk::Data(c.clone()));
            }
        }

        if !rtx.is_empty() {
            out.push(self.create_packet(rtx));
        }
    }

    async fn flush_sack(&mut self, out: &mut Vec<Packet>) {
        if !self.acks.take_pending_sack() {
            return;
        }

        let sack = SackChunk {
            cumulative_tsn_ack: self.peer_last_tsn,
            advertised_receiver_window_credit: self.get_my_receiver_window_credit().await,
            gap_ack_blocks: self.payload_queue.get_gap_ack_blocks(self.peer_last_tsn),
            duplicate_tsn: self.payload_queue.pop_duplicates(),
        };
        log::debug!("[{}] sending SACK: {}", self.name, sack);
        out.push(self.create_packet(vec![Chunk::Sack(sack)]));
    }

    fn flush_forward_tsn(&mut self, out: &mut Vec<Packet>) {
        if !std::mem::take(&mut self.wants_forward_tsn) {
            return;
        }
        if !sna32_gt(self.advanced_peer_tsn_ack_point, self.cumulative_tsn_ack_point) {
            return;
        }

        let chunk = self.build_forward_tsn();
        out.push(self.create_packet(vec![Chunk::ForwardTsn(chunk)]));
    }

    /// Builds the FORWARD-TSN advancing the peer past abandoned chunks.
    /// Each stream in the skipped range is reported once with its greatest
    /// skipped SSN (RFC 3758 Sec 3.5 C4).
    fn build_forward_tsn(&self) -> ForwardTsnChunk {
        let new_cumulative_tsn = self.advanced_peer_tsn_ack_point;

        let mut last_ssn_by_stream: HashMap<u16, u16> = HashMap::new();
        for tsn in self.inflight_queue.ordered_tsns() {
            if sna32_gt(tsn, new_cumulative_tsn) {
                break;
            }
            let Some(c) = self.inflight_queue.get(tsn) else {
                break;
            };
            last_ssn_by_stream
                .entry(c.stream_identifier)
                .and_modify(|ssn| {
                    if sna16_lt(*ssn, c.stream_sequence_number) {
                        *ssn = c.stream_sequence_number;
                    }
                })
                .or_insert(c.stream_sequence_number);
        }

        log::trace!(
            "[{}] FORWARD-TSN: new_cumulative_tsn={} (ack point {})",
            self.name,
            new_cumulative_tsn,
            self.cumulative_tsn_ack_point
        );

        ForwardTsnChunk {
            new_cumulative_tsn,
            streams: last_ssn_by_stream
                .into_iter()
                .map(|(identifier, sequence)| SkippedStream {
                    identifier,
                    sequence,
                })
                .collect(),
        }
    }

    /// Emits whatever the shutdown exchange owes the peer. Returns `false`
    /// once SHUTDOWN-COMPLETE goes out and the loops should wind down.
    async fn flush_shutdown(&mut self, out: &mut Vec<Packet>) -> bool {
        if self.will_send_shutdown.swap(false, Ordering::SeqCst) {
            let chunk = ShutdownChunk {
                cumulative_tsn_ack: self.cumulative_tsn_ack_point,
            };
            out.push(self.create_packet(vec![Chunk::Shutdown(chunk)]));
            self.start_t2shutdown().await;
            return true;
        }

        match self.pending_shutdown_reply.take() {
            Some(ShutdownReply::Ack) => {
                out.push(self.create_packet(vec![Chunk::ShutdownAck(ShutdownAckChunk)]));
                self.start_t2shutdown().await;
                true
            }
            Some(ShutdownReply::Complete) => {
                out.push(self.create_packet(vec![Chunk::ShutdownComplete(
                    ShutdownCompleteChunk,
                )]));
                false
            }
            None => true,
        }
    }

    async fn start_t2shutdown(&self) {
        if let Some(t2shutdown) = &self.timers.t2shutdown {
            t2shutdown.start(self.rto_mgr.get_rto()).await;
        }
    }

    ///////////////////////////////////////////////////////////////////
    // partial reliability
    ///////////////////////////////////////////////////////////////////

    /// Applies the stream's partial-reliability policy to a chunk about to
    /// be (re)transmitted.
    fn apply_abandonment_policy(&self, c: &DataChunk) {
        // DCEP control messages are always fully reliable (RFC 8832 Sec 4).
        if !self.use_forward_tsn || c.payload_type == PayloadProtocolIdentifier::Dcep {
            return;
        }
        let Some(s) = self.streams.get(&c.stream_identifier) else {
            log::error!(
                "[{}] no stream {} for outbound chunk",
                self.name,
                c.stream_identifier
            );
            return;
        };

        let value = s.reliability_value.load(Ordering::SeqCst);
        let expired = match s.reliability_type.load(Ordering::SeqCst).into() {
            ReliabilityType::Reliable => false,
            ReliabilityType::Rexmit => c.n_sent >= value,
            ReliabilityType::Timed => SystemTime::now()
                .duration_since(c.sent_time)
                .map_or(false, |elapsed| elapsed.as_millis() as u32 >= value),
        };

        if expired {
            c.set_abandoned(true);
            log::trace!(
                "[{}] abandoning tsn={} ppi={} after {} send(s)",
                self.name,
                c.tsn,
                c.payload_type,
                c.n_sent
            );
        }
    }

    ///////////////////////////////////////////////////////////////////
    // stream registry
    ///////////////////////////////////////////////////////////////////

    pub(crate) async fn get_my_receiver_window_credit(&self) -> u32 {
        let mut bytes_queued = 0;
        for s in self.streams.values() {
            bytes_queued += s.get_num_bytes_in_reassembly_queue().await as u32;
        }

        self.max_receive_buffer_size.saturating_sub(bytes_queued)
    }

    pub(crate) fn open_stream(
        &mut self,
        stream_identifier: u16,
        default_payload_type: PayloadProtocolIdentifier,
    ) -> Result<Arc<Stream>> {
        if self.streams.contains_key(&stream_identifier) {
            return Err(Error::ErrStreamAlreadyExist);
        }

        let s = self
            .create_stream(stream_identifier, false)
            .ok_or(Error::ErrStreamCreateFailed)?;
        s.set_default_payload_type(default_payload_type);
        Ok(s)
    }

    /// Picks the next locally originated stream identifier, skipping ones
    /// already in use. Identifiers keep the side's parity and grow by two.
    pub(crate) fn allocate_stream_identifier(&mut self) -> u16 {
        while self.streams.contains_key(&self.my_next_stream_id) {
            self.my_next_stream_id = self.my_next_stream_id.wrapping_add(2);
        }
        let sid = self.my_next_stream_id;
        self.my_next_stream_id = self.my_next_stream_id.wrapping_add(2);
        sid
    }

    /// create_stream creates a stream. The caller should hold the lock and
    /// check no stream exists for this id.
    fn create_stream(&mut self, stream_identifier: u16, accept: bool) -> Option<Arc<Stream>> {
        let s = Arc::new(Stream::new(
            format!("{}:{}", stream_identifier, self.name),
            stream_identifier,
            self.max_payload_size(),
            Arc::clone(&self.max_message_size),
            Arc::clone(&self.state),
            self.awake_write_loop_ch
                .clone()
                .unwrap_or_else(|| Arc::new(mpsc::channel(1).0)),
            Arc::clone(&self.pending_queue),
        ));

        if accept {
            let delivered = self
                .accept_ch_tx
                .as_ref()
                .map(|ch| ch.try_send(Arc::clone(&s)).is_ok())
                .unwrap_or(false);
            if !delivered {
                log::debug!(
                    "[{}] dropped a new stream (accept channel unavailable)",
                    self.name
                );
                return None;
            }
            log::debug!(
                "[{}] accepted a new stream (streamIdentifier: {})",
                self.name,
                stream_identifier
            );
        }

        self.streams.insert(stream_identifier, Arc::clone(&s));
        Some(s)
    }

    /// get_or_create_stream gets or creates a stream. The caller should
    /// hold the lock.
    fn get_or_create_stream(&mut self, stream_identifier: u16) -> Option<Arc<Stream>> {
        match self.streams.get(&stream_identifier) {
            Some(s) => Some(Arc::clone(s)),
            None => self.create_stream(stream_identifier, true),
        }
    }

    /// Dispatches the listener callback for a stream the peer just opened.
    /// A complete DCEP open message decides between the raw and the
    /// data-channel flavor and seeds the stream's reliability settings.
    fn announce_stream(&self, stream: &Arc<Stream>, d: &DataChunk) {
        let Some(listener) = self.listener.clone() else {
            return;
        };
        let stream = Arc::clone(stream);

        if d.payload_type == PayloadProtocolIdentifier::Dcep
            && d.beginning_fragment
            && d.ending_fragment
        {
            match DcepOpen::unmarshal(&d.user_data) {
                Ok(open) => {
                    let (unordered, rel_type, rel_val) = open.reliability_params();
                    stream.set_reliability_params(unordered, rel_type, rel_val);
                    stream.set_label(open.label.clone());
                    let ppi = d.payload_type;
                    tokio::spawn(async move {
                        listener.on_dcep_stream(stream, open.label, ppi).await;
                    });
                    return;
                }
                Err(err) => {
                    log::warn!("[{}] failed to parse DCEP open: {:?}", self.name, err);
                }
            }
        }

        tokio::spawn(async move {
            listener.on_raw_stream(stream).await;
        });
    }

    ///////////////////////////////////////////////////////////////////
    // counters
    ///////////////////////////////////////////////////////////////////

    /// take_next_tsn hands out my_next_tsn and advances it. The caller
    /// should hold the lock.
    fn take_next_tsn(&mut self) -> u32 {
        let tsn = self.my_next_tsn;
        self.my_next_tsn = tsn.wrapping_add(1);
        tsn
    }

    /// take_next_rsn hands out my_next_rsn and advances it. The caller
    /// should hold the lock.
    fn take_next_rsn(&mut self) -> u32 {
        let rsn = self.my_next_rsn;
        self.my_next_rsn = rsn.wrapping_add(1);
        rsn
    }

    /// set_state atomically sets the state of the Association.
    pub(crate) fn set_state(&self, new_state: AssociationState) {
        let old_state = AssociationState::from(self.state.swap(new_state as u8, Ordering::SeqCst));
        if new_state != old_state {
            log::debug!(
                "[{}] state change: '{}' => '{}'",
                self.name,
                old_state,
                new_state,
            );
        }
    }

    /// get_state atomically returns the state of the Association.
    fn get_state(&self) -> AssociationState {
        self.state.load(Ordering::SeqCst).into()
    }

    /// buffered_amount returns the total bytes of user data queued or in
    /// flight. This is used only by testing.
    #[cfg(test)]
    pub(crate) fn buffered_amount(&self) -> usize {
        self.pending_queue.get_num_bytes() + self.inflight_queue.get_num_bytes()
    }
}

#[async_trait]
impl AckTimerObserver for AssociationInner {
    async fn on_ack_timeout(&mut self) {
        log::trace!("[{}] ack timer expired", self.name);
        self.stats.inc_ack_timeouts();
        self.acks.force_immediate();
        self.awake_write_loop();
    }
}

#[async_trait]
impl RtxTimerObserver for AssociationInner {
    async fn on_retransmission_timeout(&mut self, id: RtxTimerId, n_rtos: usize) {
        match id {
            RtxTimerId::T1Init => {
                if let Err(err) = self.send_init() {
                    log::debug!(
                        "[{}] failed to retransmit init (n_rtos={}): {:?}",
                        self.name,
                        n_rtos,
                        err
                    );
                }
            }

            RtxTimerId::T1Cookie => {
                if let Err(err) = self.send_cookie_echo() {
                    log::debug!(
                        "[{}] failed to retransmit cookie-echo (n_rtos={}): {:?}",
                        self.name,
                        n_rtos,
                        err
                    );
                }
            }

            RtxTimerId::T2Shutdown => {
                log::debug!(
                    "[{}] retransmission of shutdown timeout (n_rtos={})",
                    self.name,
                    n_rtos
                );
                match self.get_state() {
                    AssociationState::ShutdownSent => {
                        self.will_send_shutdown.store(true, Ordering::SeqCst);
                        self.awake_write_loop();
                    }
                    AssociationState::ShutdownAckSent => {
                        self.pending_shutdown_reply = Some(ShutdownReply::Ack);
                        self.awake_write_loop();
                    }
                    _ => {}
                }
            }

            RtxTimerId::T3RTX => {
                self.stats.inc_t3timeouts();
                self.cc.on_rtx_timeout(&self.name);

                // RFC 3758 Sec 3.5 A5: every T3 expiry tries to advance
                // the forward-TSN point past abandoned chunks.
                if self.use_forward_tsn {
                    self.advance_abandoned_point();
                }

                log::debug!(
                    "[{}] T3-rtx expired: n_rtos={} cwnd={} ssthresh={}",
                    self.name,
                    n_rtos,
                    self.cc.cwnd,
                    self.cc.ssthresh
                );

                self.inflight_queue.mark_all_to_retransmit();
                self.awake_write_loop();
            }

            RtxTimerId::Reconfig => {
                self.wants_reconfig_retransmit = true;
                self.awake_write_loop();
            }
        }
    }

    async fn on_retransmission_failure(&mut self, id: RtxTimerId) {
        match id {
            RtxTimerId::T1Init => {
                log::error!("[{}] retransmission failure: T1-init", self.name);
                self.set_state(AssociationState::Closed);
                if let Some(tx) = &self.handshake_completed_ch_tx {
                    let _ = tx.send(Some(Error::ErrHandshakeInitAck)).await;
                }
            }
            RtxTimerId::T1Cookie => {
                log::error!("[{}] retransmission failure: T1-cookie", self.name);
                self.set_state(AssociationState::Closed);
                if let Some(tx) = &self.handshake_completed_ch_tx {
                    let _ = tx.send(Some(Error::ErrHandshakeCookieEcho)).await;
                }
            }
            RtxTimerId::T2Shutdown => {
                log::error!("[{}] retransmission failure: T2-shutdown", self.name);
            }
            RtxTimerId::T3RTX => {
                // T3-rtx runs without a retry cap; connectivity loss
                // surfaces through the transport instead.
                log::error!("[{}] retransmission failure: T3-rtx (DATA)", self.name);
            }
            _ => {}
        }
    }
}
