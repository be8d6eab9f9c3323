
mod congestion;
mod inner;
mod stats;

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use portable_atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::chunk::data::PayloadProtocolIdentifier;
use crate::chunk::init::InitChunk;
use crate::chunk::{CT_FORWARD_TSN, CT_RECONFIG};
use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::timer::ack_timer::{AckTimer, ACK_INTERVAL};
use crate::timer::rtx_timer::{RtxTimer, MAX_INIT_RETRANS, NO_MAX_RETRANS};
use crate::transport::DatagramTransport;

pub(crate) use inner::AssociationInner;

/// MTU for inbound packets (from DTLS).
pub(crate) const RECEIVE_MTU: usize = 8192;
/// Initial MTU for outgoing packets (to DTLS).
pub(crate) const INITIAL_MTU: u32 = 1228;
pub(crate) const INITIAL_RECV_BUF_SIZE: u32 = 1024 * 1024;
pub(crate) const COMMON_HEADER_SIZE: u32 = 12;
pub(crate) const DATA_CHUNK_HEADER_SIZE: u32 = 16;
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE: u32 = 65536;

/// Chunk types negotiated through the supported-extensions parameter.
pub(crate) const LOCAL_EXTENSIONS: [u8; 2] = [CT_RECONFIG, CT_FORWARD_TSN];

pub(crate) const ACCEPT_CH_SIZE: usize = 16;

/// Heartbeat of the two IO tasks: the receive timeout and the periodic
/// write-loop wakeup.
pub(crate) const TICK: Duration = Duration::from_secs(1);

/// Per-association state (RFC 4960 Sec 13.2).
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum AssociationState {
    Closed = 0,
    CookieWait = 1,
    CookieEchoed = 2,
    Established = 3,
    ShutdownAckSent = 4,
    ShutdownPending = 5,
    ShutdownReceived = 6,
    ShutdownSent = 7,
}

impl From<u8> for AssociationState {
    fn from(v: u8) -> AssociationState {
        match v {
            1 => AssociationState::CookieWait,
            2 => AssociationState::CookieEchoed,
            3 => AssociationState::Established,
            4 => AssociationState::ShutdownAckSent,
            5 => AssociationState::ShutdownPending,
            6 => AssociationState::ShutdownReceived,
            7 => AssociationState::ShutdownSent,
            _ => AssociationState::Closed,
        }
    }
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            AssociationState::Closed => "Closed",
            AssociationState::CookieWait => "CookieWait",
            AssociationState::CookieEchoed => "CookieEchoed",
            AssociationState::Established => "Established",
            AssociationState::ShutdownPending => "ShutdownPending",
            AssociationState::ShutdownSent => "ShutdownSent",
            AssociationState::ShutdownReceived => "ShutdownReceived",
            AssociationState::ShutdownAckSent => "ShutdownAckSent",
        };
        write!(f, "{s}")
    }
}

/// Retransmission timer IDs.
#[derive(Default, Debug, Copy, Clone, PartialEq)]
pub(crate) enum RtxTimerId {
    #[default]
    T1Init,
    T1Cookie,
    T2Shutdown,
    T3RTX,
    Reconfig,
}

impl fmt::Display for RtxTimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            RtxTimerId::T1Init => "T1Init",
            RtxTimerId::T1Cookie => "T1Cookie",
            RtxTimerId::T2Shutdown => "T2Shutdown",
            RtxTimerId::T3RTX => "T3RTX",
            RtxTimerId::Reconfig => "Reconfig",
        };
        write!(f, "{s}")
    }
}

/// Ack mode (for testing).
#[derive(Default, Debug, Copy, Clone, PartialEq)]
pub(crate) enum AckMode {
    #[default]
    Normal,
    NoDelay,
    AlwaysDelay,
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            AckMode::Normal => "Normal",
            AckMode::NoDelay => "NoDelay",
            AckMode::AlwaysDelay => "AlwaysDelay",
        };
        write!(f, "{s}")
    }
}

/// Ack transmission state.
#[derive(Default, Debug, Copy, Clone, PartialEq)]
pub(crate) enum AckState {
    /// ack timer is off
    #[default]
    Idle,
    /// will send ack immediately
    Immediate,
    /// ack timer is on (ack is being delayed)
    Delay,
}

impl fmt::Display for AckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            AckState::Idle => "Idle",
            AckState::Immediate => "Immediate",
            AckState::Delay => "Delay",
        };
        write!(f, "{s}")
    }
}

/// Events the association surfaces to the application. All methods have
/// no-op defaults; implementations must not block, callbacks run on their
/// own tasks.
#[async_trait]
pub trait AssociationListener {
    /// The four-way handshake completed.
    async fn on_associated(&self) {}

    /// The association closed; fired exactly once.
    async fn on_disassociated(&self) {}

    /// The peer opened a stream without a data-channel open message.
    async fn on_raw_stream(&self, _stream: Arc<Stream>) {}

    /// The peer opened a stream announcing a data channel.
    async fn on_dcep_stream(
        &self,
        _stream: Arc<Stream>,
        _label: String,
        _ppi: PayloadProtocolIdentifier,
    ) {
    }
}

/// Config collects the arguments for association construction into a
/// single structure.
pub struct Config {
    pub transport: Arc<dyn DatagramTransport + Send + Sync>,
    pub max_receive_buffer_size: u32,
    pub max_message_size: u32,
    pub name: String,
    pub listener: Option<Arc<dyn AssociationListener + Send + Sync>>,
}

///Association represents an SCTP association.
///
///An association is identified by its verification tags and runs the
///whole protocol machine for one peer: handshake, reliable transfer,
///congestion control and stream reconfiguration. All protocol state lives
///in [`AssociationInner`] behind one mutex; this handle mirrors a few
///hot fields into atomics so user-facing calls stay lock-free.
pub struct Association {
    name: String,
    state: Arc<AtomicU8>,
    max_message_size: Arc<AtomicU32>,
    inflight_queue_length: Arc<AtomicUsize>,
    will_send_shutdown: Arc<AtomicBool>,
    awake_write_loop_ch: Arc<mpsc::Sender<()>>,
    close_loop_ch_rx: Mutex<broadcast::Receiver<()>>,
    accept_ch_rx: Mutex<mpsc::Receiver<Arc<Stream>>>,
    transport: Arc<dyn DatagramTransport + Send + Sync>,
    bytes_received: Arc<AtomicUsize>,
    bytes_sent: Arc<AtomicUsize>,

    pub(crate) inner: Arc<Mutex<AssociationInner>>,
}

impl Association {
    /// server waits for an inbound handshake over the transport.
    pub async fn server(config: Config) -> Result<Self> {
        let (a, mut handshake_completed_ch_rx) = Association::new(config, false).await?;

        match handshake_completed_ch_rx.recv().await {
            Some(None) => Ok(a),
            Some(Some(err)) => Err(err),
            None => Err(Error::ErrAssociationHandshakeClosed),
        }
    }

    /// client initiates the handshake over the transport.
    pub async fn client(config: Config) -> Result<Self> {
        let (a, mut handshake_completed_ch_rx) = Association::new(config, true).await?;

        match handshake_completed_ch_rx.recv().await {
            Some(None) => Ok(a),
            Some(Some(err)) => Err(err),
            None => Err(Error::ErrAssociationHandshakeClosed),
        }
    }

    /// shutdown initiates the graceful shutdown sequence and blocks until
    /// the association is closed.
    pub async fn shutdown(&self) -> Result<()> {
        if self.get_state() != AssociationState::Established {
            return Err(Error::ErrShutdownNonEstablished);
        }
        log::debug!("[{}] shutting down gracefully..", self.name);
        self.set_state(AssociationState::ShutdownPending);

        // With nothing in flight the SHUTDOWN chunk can go out right away;
        // otherwise the SACK processing path sends it once drained.
        if self.inflight_queue_length.load(Ordering::SeqCst) == 0 {
            self.set_state(AssociationState::ShutdownSent);
            self.will_send_shutdown.store(true, Ordering::SeqCst);
            let _ = self.awake_write_loop_ch.try_send(());
        }

        let _ = self.close_loop_ch_rx.lock().await.recv().await;
        Ok(())
    }

    /// close ends the association immediately and cleans up any state.
    pub async fn close(&self) -> Result<()> {
        log::debug!("[{}] closing association..", self.name);

        let _ = self.transport.close().await;

        let mut inner = self.inner.lock().await;
        inner.close().await
    }

    async fn new(config: Config, is_client: bool) -> Result<(Self, mpsc::Receiver<Option<Error>>)> {
        let transport = Arc::clone(&config.transport);

        let (awake_write_loop_ch_tx, awake_write_loop_ch_rx) = mpsc::channel(1);
        let (accept_ch_tx, accept_ch_rx) = mpsc::channel(ACCEPT_CH_SIZE);
        let (handshake_completed_ch_tx, handshake_completed_ch_rx) = mpsc::channel(1);
        let (close_loop_ch_tx, close_loop_ch_rx) = broadcast::channel(1);
        let (close_loop_ch_rx1, close_loop_ch_rx2) =
            (close_loop_ch_tx.subscribe(), close_loop_ch_tx.subscribe());
        let awake_write_loop_ch = Arc::new(awake_write_loop_ch_tx);

        let inner = AssociationInner::new(
            config,
            is_client,
            close_loop_ch_tx,
            accept_ch_tx,
            handshake_completed_ch_tx,
            Arc::clone(&awake_write_loop_ch),
        );

        let bytes_received = Arc::new(AtomicUsize::new(0));
        let bytes_sent = Arc::new(AtomicUsize::new(0));
        let name = inner.name.clone();
        let state = Arc::clone(&inner.state);
        let max_message_size = Arc::clone(&inner.max_message_size);
        let inflight_queue_length = Arc::clone(&inner.inflight_queue_length);
        let will_send_shutdown = Arc::clone(&inner.will_send_shutdown);

        let mut init = InitChunk {
            initial_tsn: inner.my_next_tsn,
            num_outbound_streams: inner.my_max_num_outbound_streams,
            num_inbound_streams: inner.my_max_num_inbound_streams,
            initiate_tag: inner.my_verification_tag,
            advertised_receiver_window_credit: inner.max_receive_buffer_size,
            ..Default::default()
        };
        init.set_supported_extensions(&LOCAL_EXTENSIONS);

        let inner = Arc::new(Mutex::new(inner));

        {
            let weak = Arc::downgrade(&inner);
            let mut ai = inner.lock().await;
            ai.timers.t1init = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::T1Init,
                MAX_INIT_RETRANS,
            ));
            ai.timers.t1cookie = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::T1Cookie,
                MAX_INIT_RETRANS,
            ));
            ai.timers.t2shutdown = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::T2Shutdown,
                NO_MAX_RETRANS,
            ));
            ai.timers.t3rtx = Some(RtxTimer::new(weak.clone(), RtxTimerId::T3RTX, NO_MAX_RETRANS));
            ai.timers.treconfig = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::Reconfig,
                NO_MAX_RETRANS,
            ));
            ai.timers.ack = Some(AckTimer::new(weak, ACK_INTERVAL));
        }

        {
            let name = name.clone();
            let bytes_received = Arc::clone(&bytes_received);
            let transport = Arc::clone(&transport);
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                Association::read_loop(name, bytes_received, transport, close_loop_ch_rx1, inner)
                    .await;
            });
        }

        {
            let name = name.clone();
            let bytes_sent = Arc::clone(&bytes_sent);
            let transport = Arc::clone(&transport);
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                Association::write_loop(
                    name,
                    bytes_sent,
                    transport,
                    close_loop_ch_rx2,
                    inner,
                    awake_write_loop_ch_rx,
                )
                .await;
            });
        }

        if is_client {
            let mut ai = inner.lock().await;
            ai.set_state(AssociationState::CookieWait);
            ai.handshake.init = Some(init);
            ai.send_init()?;
            let rto = ai.rto_mgr.get_rto();
            if let Some(t1init) = &ai.timers.t1init {
                t1init.start(rto).await;
            }
        }

        Ok((
            Association {
                name,
                state,
                max_message_size,
                inflight_queue_length,
                will_send_shutdown,
                awake_write_loop_ch,
                close_loop_ch_rx: Mutex::new(close_loop_ch_rx),
                accept_ch_rx: Mutex::new(accept_ch_rx),
                transport,
                bytes_received,
                bytes_sent,
                inner,
            },
            handshake_completed_ch_rx,
        ))
    }

    /// Receive task: blocks on the transport with a timeout so the close
    /// signal is observed even when the peer goes quiet, and dispatches
    /// each datagram under the association lock.
    async fn read_loop(
        name: String,
        bytes_received: Arc<AtomicUsize>,
        transport: Arc<dyn DatagramTransport + Send + Sync>,
        mut close_loop_ch: broadcast::Receiver<()>,
        inner: Arc<Mutex<AssociationInner>>,
    ) {
        log::debug!("[{}] read_loop entered", name);

        let mut buffer = vec![0u8; RECEIVE_MTU];
        let mut done = false;
        while !done {
            let n = tokio::select! {
                _ = close_loop_ch.recv() => break,
                result = tokio::time::timeout(TICK, transport.recv(&mut buffer)) => {
                    match result {
                        Err(_) => continue, // receive timeout, check the close signal again
                        Ok(Ok(n)) => n,
                        Ok(Err(err)) => {
                            log::warn!("[{}] failed to read packets on transport: {}", name, err);
                            break;
                        }
                    }
                }
            };

            // The bytes are copied out of the receive buffer because the
            // payload is handed to the streams without further copies.
            let inbound = Bytes::from(buffer[..n].to_vec());
            bytes_received.fetch_add(n, Ordering::SeqCst);

            {
                let mut ai = inner.lock().await;
                if let Err(err) = ai.handle_inbound(&inbound).await {
                    log::warn!("[{}] failed to handle_inbound: {:?}", name, err);
                    done = true;
                }
            }
        }

        {
            let mut ai = inner.lock().await;
            if let Err(err) = ai.close().await {
                log::warn!("[{}] failed to close association: {:?}", name, err);
            }
        }

        log::debug!("[{}] read_loop exited", name);
    }

    /// Send task: wakes on a nudge, the close signal or the periodic tick,
    /// gathers packets under the association lock and writes them outside
    /// of it.
    async fn write_loop(
        name: String,
        bytes_sent: Arc<AtomicUsize>,
        transport: Arc<dyn DatagramTransport + Send + Sync>,
        mut close_loop_ch: broadcast::Receiver<()>,
        inner: Arc<Mutex<AssociationInner>>,
        mut awake_write_loop_ch: mpsc::Receiver<()>,
    ) {
        log::debug!("[{}] write_loop entered", name);

        let mut done = false;
        let mut buf = BytesMut::with_capacity(16 * 1024);
        while !done {
            let (packets, continue_loop) = {
                let mut ai = inner.lock().await;
                ai.gather_outbound().await
            };

            for raw in packets {
                buf.clear();
                if let Err(err) = raw.marshal_to(&mut buf) {
                    log::warn!("[{}] failed to serialize a packet: {:?}", name, err);
                    continue;
                }
                if let Err(err) = transport.send(buf.as_ref()).await {
                    log::warn!("[{}] failed to write packets on transport: {}", name, err);
                    done = true;
                    break;
                }
                bytes_sent.fetch_add(buf.len(), Ordering::SeqCst);
            }

            if !continue_loop || done {
                break;
            }

            tokio::select! {
                _ = awake_write_loop_ch.recv() => {}
                _ = tokio::time::sleep(TICK) => {}
                _ = close_loop_ch.recv() => {
                    done = true;
                }
            };
        }

        {
            let mut ai = inner.lock().await;
            if let Err(err) = ai.close().await {
                log::warn!("[{}] failed to close association: {:?}", name, err);
            }
        }

        log::debug!("[{}] write_loop exited", name);
    }

    /// bytes_sent returns the number of bytes sent.
    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    /// bytes_received returns the number of bytes received.
    pub fn bytes_received(&self) -> usize {
        self.bytes_received.load(Ordering::SeqCst)
    }

    /// open_stream opens a stream with the given identifier.
    pub async fn open_stream(
        &self,
        stream_identifier: u16,
        default_payload_type: PayloadProtocolIdentifier,
    ) -> Result<Arc<Stream>> {
        let mut ai = self.inner.lock().await;
        ai.open_stream(stream_identifier, default_payload_type)
    }

    /// open_next_stream opens a stream on the next free locally allocated
    /// identifier: clients use even identifiers, servers odd ones.
    pub async fn open_next_stream(
        &self,
        default_payload_type: PayloadProtocolIdentifier,
    ) -> Result<Arc<Stream>> {
        let mut ai = self.inner.lock().await;
        let stream_identifier = ai.allocate_stream_identifier();
        ai.open_stream(stream_identifier, default_payload_type)
    }

    /// accept_stream waits for the peer to open a stream.
    pub async fn accept_stream(&self) -> Option<Arc<Stream>> {
        let mut accept_ch_rx = self.accept_ch_rx.lock().await;
        accept_ch_rx.recv().await
    }

    /// max_message_size returns the maximum message size you can send.
    pub fn max_message_size(&self) -> u32 {
        self.max_message_size.load(Ordering::SeqCst)
    }

    /// set_max_message_size sets the maximum message size you can send.
    pub fn set_max_message_size(&self, max_message_size: u32) {
        self.max_message_size
            .store(max_message_size, Ordering::SeqCst);
    }

    fn set_state(&self, new_state: AssociationState) {
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

    fn get_state(&self) -> AssociationState {
        self.state.load(Ordering::SeqCst).into()
    }
}
