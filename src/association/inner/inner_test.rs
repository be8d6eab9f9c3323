use std::time::{Duration, Instant};

use super::*;
use crate::association::congestion::CongestionController;
use crate::association::ACCEPT_CH_SIZE;
use crate::chunk::sack::GapAckBlock;
use crate::cookie::VALID_COOKIE_LIFE;
use crate::error_cause::STALE_COOKIE_ERROR;
use crate::transport::DatagramTransport;

struct DumbTransport;

#[async_trait]
impl DatagramTransport for DumbTransport {
    async fn recv(&self, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    async fn send(&self, b: &[u8]) -> Result<usize> {
        Ok(b.len())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn create_association_inner(max_message_size: u32) -> AssociationInner {
    let (close_loop_ch_tx, _close_loop_ch_rx) = broadcast::channel(1);
    let (accept_ch_tx, _accept_ch_rx) = mpsc::channel(1);
    let (handshake_completed_ch_tx, _handshake_completed_ch_rx) = mpsc::channel(1);
    let (awake_write_loop_ch_tx, _awake_write_loop_ch_rx) = mpsc::channel(1);
    AssociationInner::new(
        Config {
            transport: Arc::new(DumbTransport),
            max_receive_buffer_size: 0,
            max_message_size,
            name: "client".to_owned(),
            listener: None,
        },
        true,
        close_loop_ch_tx,
        accept_ch_tx,
        handshake_completed_ch_tx,
        Arc::new(awake_write_loop_ch_tx),
    )
}

fn inflight_chunk(tsn: u32, si: u16, ssn: u16, data: &'static [u8]) -> DataChunk {
    let mut c = DataChunk {
        beginning_fragment: true,
        ending_fragment: true,
        tsn,
        stream_identifier: si,
        stream_sequence_number: ssn,
        user_data: Bytes::from_static(data),
        n_sent: 1,
        ..Default::default()
    };
    c.set_all_inflight();
    c
}

/// A sender mid-association with the given TSNs in flight, 4 bytes each.
fn established_sender(tsns: std::ops::RangeInclusive<u32>) -> AssociationInner {
    let first = *tsns.start();
    let mut a = AssociationInner {
        cumulative_tsn_ack_point: first.wrapping_sub(1),
        advanced_peer_tsn_ack_point: first.wrapping_sub(1),
        my_next_tsn: *tsns.end() + 1,
        min_tsn_to_measure_rtt: *tsns.end() + 1,
        max_receive_buffer_size: INITIAL_RECV_BUF_SIZE,
        ..Default::default()
    };
    a.cc = CongestionController::new(INITIAL_MTU);
    a.cc.rwnd = 1024 * 1024;
    a.set_state(AssociationState::Established);
    for tsn in tsns {
        a.inflight_queue.push(inflight_chunk(tsn, 0, 0, b"DATA"));
    }
    a
}

fn sack(cum_ack: u32, arwnd: u32, gaps: &[(u16, u16)]) -> SackChunk {
    SackChunk {
        cumulative_tsn_ack: cum_ack,
        advertised_receiver_window_credit: arwnd,
        gap_ack_blocks: gaps
            .iter()
            .map(|(start, end)| GapAckBlock {
                start: *start,
                end: *end,
            })
            .collect(),
        duplicate_tsn: vec![],
    }
}

fn sole_sack(packets: &[Packet]) -> &SackChunk {
    let sacks: Vec<&SackChunk> = packets
        .iter()
        .flat_map(|p| p.chunks.iter())
        .filter_map(|c| match c {
            Chunk::Sack(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(sacks.len(), 1, "expected exactly one SACK");
    sacks[0]
}

///////////////////////////////////////////////////////////////////
//build_forward_tsn
///////////////////////////////////////////////////////////////////

#[test]
fn test_build_forward_tsn_one_abandoned() {
    let mut a = AssociationInner {
        cumulative_tsn_ack_point: 9,
        advanced_peer_tsn_ack_point: 10,
        ..Default::default()
    };

    let mut c = inflight_chunk(10, 1, 2, b"ABC");
    c.set_abandoned(true);
    a.inflight_queue.push(c);

    let fwdtsn = a.build_forward_tsn();

    assert_eq!(fwdtsn.new_cumulative_tsn, 10);
    assert_eq!(fwdtsn.streams.len(), 1, "there should be one stream");
    assert_eq!(fwdtsn.streams[0].identifier, 1, "si should be 1");
    assert_eq!(fwdtsn.streams[0].sequence, 2, "ssn should be 2");
}

#[test]
fn test_build_forward_tsn_reports_greatest_ssn_per_stream() {
    let mut a = AssociationInner {
        cumulative_tsn_ack_point: 9,
        advanced_peer_tsn_ack_point: 12,
        ..Default::default()
    };

    for (tsn, si, ssn, data) in [
        (10, 1, 2, b"ABC" as &'static [u8]),
        (11, 1, 3, b"DEF"),
        (12, 2, 1, b"123"),
    ] {
        let mut c = inflight_chunk(tsn, si, ssn, data);
        c.set_abandoned(true);
        a.inflight_queue.push(c);
    }

    let fwdtsn = a.build_forward_tsn();

    assert_eq!(fwdtsn.new_cumulative_tsn, 12);
    assert_eq!(fwdtsn.streams.len(), 2, "one entry per stream");

    for s in &fwdtsn.streams {
        match s.identifier {
            1 => assert_eq!(3, s.sequence, "si=1 keeps its greatest ssn"),
            2 => assert_eq!(1, s.sequence, "si=2 keeps its only ssn"),
            _ => panic!("unexpected stream identifier"),
        }
    }
}

///////////////////////////////////////////////////////////////////
//handle_forward_tsn
///////////////////////////////////////////////////////////////////

#[tokio::test]
async fn test_handle_forward_tsn_forward_3unreceived_chunks() -> Result<()> {
    let mut a = AssociationInner {
        use_forward_tsn: true,
        ..Default::default()
    };

    let prev_tsn = a.peer_last_tsn;

    let fwdtsn = ForwardTsnChunk {
        new_cumulative_tsn: a.peer_last_tsn.wrapping_add(3),
        streams: vec![SkippedStream {
            identifier: 0,
            sequence: 0,
        }],
    };

    a.handle_forward_tsn(&fwdtsn).await?;

    assert_eq!(
        a.peer_last_tsn,
        prev_tsn + 3,
        "peer_last_tsn should advance by 3"
    );
    assert!(a.acks.delayed_pending, "delayed sack should be pending");
    assert!(
        !a.acks.immediate_pending,
        "immediate sack should NOT be pending"
    );
    assert!(a.control_queue.is_empty(), "no reply expected");

    Ok(())
}

#[tokio::test]
async fn test_handle_forward_tsn_forward_1for1_missing() -> Result<()> {
    let mut a = AssociationInner {
        use_forward_tsn: true,
        ..Default::default()
    };

    let prev_tsn = a.peer_last_tsn;

    // this chunk is blocked by the missing chunk at tsn+1
    a.payload_queue.push(
        DataChunk {
            beginning_fragment: true,
            ending_fragment: true,
            tsn: a.peer_last_tsn.wrapping_add(2),
            stream_identifier: 0,
            stream_sequence_number: 1,
            user_data: Bytes::from_static(b"ABC"),
            ..Default::default()
        },
        a.peer_last_tsn,
    );

    let fwdtsn = ForwardTsnChunk {
        new_cumulative_tsn: a.peer_last_tsn.wrapping_add(1),
        streams: vec![SkippedStream {
            identifier: 0,
            sequence: 1,
        }],
    };

    a.handle_forward_tsn(&fwdtsn).await?;

    assert_eq!(
        a.peer_last_tsn,
        prev_tsn + 2,
        "peer_last_tsn should advance by 2"
    );
    assert!(a.acks.delayed_pending, "delayed sack should be pending");
    assert!(
        !a.acks.immediate_pending,
        "immediate sack should NOT be pending"
    );

    Ok(())
}

#[tokio::test]
async fn test_handle_forward_tsn_forward_1for2_missing() -> Result<()> {
    let mut a = AssociationInner {
        use_forward_tsn: true,
        ..Default::default()
    };

    let prev_tsn = a.peer_last_tsn;

    // this chunk is blocked by two missing chunks
    a.payload_queue.push(
        DataChunk {
            beginning_fragment: true,
            ending_fragment: true,
            tsn: a.peer_last_tsn.wrapping_add(3),
            stream_identifier: 0,
            stream_sequence_number: 1,
            user_data: Bytes::from_static(b"ABC"),
            ..Default::default()
        },
        a.peer_last_tsn,
    );

    let fwdtsn = ForwardTsnChunk {
        new_cumulative_tsn: a.peer_last_tsn.wrapping_add(1),
        streams: vec![SkippedStream {
            identifier: 0,
            sequence: 1,
        }],
    };

    a.handle_forward_tsn(&fwdtsn).await?;

    assert_eq!(
        a.peer_last_tsn,
        prev_tsn + 1,
        "peer_last_tsn should advance by 1"
    );
    assert!(
        a.acks.immediate_pending,
        "immediate sack should be pending (gap remains)"
    );

    Ok(())
}

#[tokio::test]
async fn test_handle_forward_tsn_dup_should_generate_sack() -> Result<()> {
    let mut a = AssociationInner {
        use_forward_tsn: true,
        ..Default::default()
    };

    let prev_tsn = a.peer_last_tsn;

    let fwdtsn = ForwardTsnChunk {
        new_cumulative_tsn: a.peer_last_tsn,
        streams: vec![SkippedStream {
            identifier: 0,
            sequence: 1,
        }],
    };

    a.handle_forward_tsn(&fwdtsn).await?;

    assert_eq!(a.peer_last_tsn, prev_tsn, "peer_last_tsn should not move");
    assert_eq!(a.acks.state, AckState::Immediate, "sack should be requested");

    Ok(())
}

///////////////////////////////////////////////////////////////////
//stream creation
///////////////////////////////////////////////////////////////////

#[tokio::test]
async fn test_assoc_create_new_stream() -> Result<()> {
    let (accept_ch_tx, _accept_ch_rx) = mpsc::channel(ACCEPT_CH_SIZE);
    let mut a = AssociationInner {
        accept_ch_tx: Some(accept_ch_tx),
        ..Default::default()
    };

    for i in 0..ACCEPT_CH_SIZE {
        let s = a.create_stream(i as u16, true);
        if let Some(s) = s {
            assert!(
                a.streams.contains_key(&s.stream_identifier),
                "should be in a.streams map"
            );
        } else {
            panic!("{i} should succeed");
        }
    }

    // The accept channel is full now; the next inbound stream is refused.
    let new_si = ACCEPT_CH_SIZE as u16;
    assert!(a.create_stream(new_si, true).is_none());
    assert!(!a.streams.contains_key(&new_si));

    let to_be_ignored = DataChunk {
        beginning_fragment: true,
        ending_fragment: true,
        tsn: a.peer_last_tsn.wrapping_add(1),
        stream_identifier: new_si,
        user_data: Bytes::from_static(b"ABC"),
        ..Default::default()
    };

    a.handle_data(&to_be_ignored).await?;
    assert!(a.control_queue.is_empty(), "silently discarded");

    Ok(())
}

#[test]
fn test_allocate_stream_identifier_parity() {
    let mut client = create_association_inner(0);
    assert!(client.is_client);
    assert_eq!(client.allocate_stream_identifier(), 0);
    assert_eq!(client.allocate_stream_identifier(), 2);

    let mut server = AssociationInner {
        my_next_stream_id: 1,
        ..Default::default()
    };
    assert_eq!(server.allocate_stream_identifier(), 1);
    assert_eq!(server.allocate_stream_identifier(), 3);
}

///////////////////////////////////////////////////////////////////
//handle_init
///////////////////////////////////////////////////////////////////

async fn handle_init_test(name: &str, initial_state: AssociationState, expect_err: bool) {
    let mut a = create_association_inner(0);
    a.set_state(initial_state);
    let pkt = Packet {
        source_port: 5001,
        destination_port: 5002,
        ..Default::default()
    };
    let mut init = InitChunk {
        initial_tsn: 1234,
        num_outbound_streams: 1001,
        num_inbound_streams: 1002,
        initiate_tag: 5678,
        advertised_receiver_window_credit: 512 * 1024,
        ..Default::default()
    };
    init.set_supported_extensions(&LOCAL_EXTENSIONS);

    let result = a.handle_init(&pkt, &init).await;
    if expect_err {
        assert!(result.is_err(), "{name} should fail");
        return;
    }
    assert!(result.is_ok(), "{name} should be ok");

    assert_eq!(a.peer_last_tsn, init.initial_tsn - 1, "{name} should match");
    assert_eq!(a.my_max_num_outbound_streams, 1001, "{name} should match");
    assert_eq!(a.my_max_num_inbound_streams, 1002, "{name} should match");
    assert_eq!(a.peer_verification_tag, 5678, "{name} should match");
    assert_eq!(a.destination_port, pkt.source_port, "{name} should match");
    assert_eq!(a.source_port, pkt.destination_port, "{name} should match");
    assert_eq!(a.cc.rwnd, 512 * 1024, "{name} should seed rwnd");
    assert!(a.use_forward_tsn, "{name} should negotiate ForwardTSN");
    assert!(!a.cookie_jar.is_empty(), "{name} should issue a cookie");

    // the INIT-ACK is queued for the send loop
    assert_eq!(a.control_queue.len(), 1, "{name} should queue an INIT-ACK");
    match &a.control_queue[0].chunks[0] {
        Chunk::Init(ack) => assert!(ack.is_ack, "{name} reply should be an ack"),
        other => panic!("{name}: expected INIT-ACK, got {other}"),
    }
}

#[tokio::test]
async fn test_assoc_handle_init() {
    handle_init_test("normal", AssociationState::Closed, false).await;
    handle_init_test("collision cookieWait", AssociationState::CookieWait, false).await;
    handle_init_test(
        "collision cookieEchoed",
        AssociationState::CookieEchoed,
        false,
    )
    .await;

    handle_init_test(
        "unexpected state established",
        AssociationState::Established,
        true,
    )
    .await;
    handle_init_test(
        "unexpected state shutdownAckSent",
        AssociationState::ShutdownAckSent,
        true,
    )
    .await;
    handle_init_test(
        "unexpected state shutdownSent",
        AssociationState::ShutdownSent,
        true,
    )
    .await;
}

#[tokio::test]
async fn test_assoc_handle_init_ack_outside_cookie_wait_is_discarded() -> Result<()> {
    let mut a = create_association_inner(0);
    // still Closed
    let pkt = Packet {
        source_port: 5000,
        destination_port: 5000,
        ..Default::default()
    };
    let init_ack = InitChunk {
        is_ack: true,
        initial_tsn: 1234,
        num_outbound_streams: 1,
        num_inbound_streams: 1,
        initiate_tag: 5678,
        advertised_receiver_window_credit: 512 * 1024,
        ..Default::default()
    };

    a.handle_init_ack(&pkt, &init_ack).await?;
    assert!(a.control_queue.is_empty(), "should be silently discarded");
    assert_eq!(a.get_state(), AssociationState::Closed, "state unchanged");

    Ok(())
}

///////////////////////////////////////////////////////////////////
//cookie echo validation
///////////////////////////////////////////////////////////////////

#[tokio::test]
async fn test_assoc_handle_cookie_echo_valid() -> Result<()> {
    let mut a = create_association_inner(0);
    let cookie = a.cookie_jar.issue();

    a.handle_cookie_echo(&CookieEchoChunk { cookie }).await?;

    assert_eq!(a.get_state(), AssociationState::Established);
    assert_eq!(a.control_queue.len(), 1, "should reply COOKIE-ACK");
    assert!(matches!(a.control_queue[0].chunks[0], Chunk::CookieAck(_)));

    Ok(())
}

#[tokio::test]
async fn test_assoc_handle_cookie_echo_replay_is_idempotent() -> Result<()> {
    let mut a = create_association_inner(0);
    let cookie = a.cookie_jar.issue();

    a.handle_cookie_echo(&CookieEchoChunk {
        cookie: cookie.clone(),
    })
    .await?;
    assert_eq!(a.get_state(), AssociationState::Established);
    assert_eq!(a.control_queue.len(), 1);
    a.control_queue.clear();

    // A replayed valid echo keeps the state and is acked again.
    a.handle_cookie_echo(&CookieEchoChunk { cookie }).await?;
    assert_eq!(a.get_state(), AssociationState::Established);
    assert_eq!(a.control_queue.len(), 1);
    assert!(matches!(a.control_queue[0].chunks[0], Chunk::CookieAck(_)));

    Ok(())
}

#[tokio::test]
async fn test_assoc_handle_cookie_echo_unknown_is_discarded() -> Result<()> {
    let mut a = create_association_inner(0);
    let _ = a.cookie_jar.issue();

    a.handle_cookie_echo(&CookieEchoChunk {
        cookie: Bytes::from_static(&[0u8; 32]),
    })
    .await?;

    assert!(a.control_queue.is_empty(), "unknown cookie is discarded");
    assert_eq!(a.get_state(), AssociationState::Closed, "state unchanged");

    Ok(())
}

#[tokio::test]
async fn test_assoc_handle_cookie_echo_stale_replies_error() -> Result<()> {
    let mut a = create_association_inner(0);
    let cookie = a.cookie_jar.issue();
    a.cookie_jar.issued[0].issued_at =
        Instant::now() - VALID_COOKIE_LIFE - Duration::from_millis(10);

    a.handle_cookie_echo(&CookieEchoChunk { cookie }).await?;

    assert_eq!(a.get_state(), AssociationState::Closed, "state unchanged");
    assert_eq!(a.control_queue.len(), 1);
    match &a.control_queue[0].chunks[0] {
        Chunk::Error(e) => {
            assert_eq!(e.error_causes.len(), 1);
            assert_eq!(e.error_causes[0].code, STALE_COOKIE_ERROR);
            assert!(!e.error_causes[0].raw.is_empty(), "should carry the measure");
        }
        other => panic!("expected ERROR chunk, got {other}"),
    }

    Ok(())
}

///////////////////////////////////////////////////////////////////
//max message size
///////////////////////////////////////////////////////////////////

#[tokio::test]
async fn test_assoc_max_message_size_default() -> Result<()> {
    let mut a = create_association_inner(0);
    assert_eq!(a.max_message_size.load(Ordering::SeqCst), 65536);

    let stream = a.create_stream(1, false).expect("should succeed");
    let p = Bytes::from(vec![0u8; 65537]);
    let ppi = PayloadProtocolIdentifier::from(stream.default_payload_type.load(Ordering::SeqCst));

    let err = stream
        .write_sctp(&p.slice(..65536), ppi)
        .await
        .expect_err("should be error");
    assert_ne!(err, Error::ErrOutboundPacketTooLarge);

    let err = stream
        .write_sctp(&p.slice(..65537), ppi)
        .await
        .expect_err("should be error");
    assert_eq!(err, Error::ErrOutboundPacketTooLarge);

    Ok(())
}

#[tokio::test]
async fn test_assoc_max_message_size_explicit() -> Result<()> {
    let mut a = create_association_inner(30000);
    assert_eq!(a.max_message_size.load(Ordering::SeqCst), 30000);

    let stream = a.create_stream(1, false).expect("should succeed");
    let p = Bytes::from(vec![0u8; 30001]);
    let ppi = PayloadProtocolIdentifier::from(stream.default_payload_type.load(Ordering::SeqCst));

    let err = stream
        .write_sctp(&p.slice(..30000), ppi)
        .await
        .expect_err("should be error");
    assert_ne!(err, Error::ErrOutboundPacketTooLarge);

    let err = stream
        .write_sctp(&p.slice(..30001), ppi)
        .await
        .expect_err("should be error");
    assert_eq!(err, Error::ErrOutboundPacketTooLarge);

    Ok(())
}

///////////////////////////////////////////////////////////////////
//SACK processing and congestion control
///////////////////////////////////////////////////////////////////

#[tokio::test]
async fn test_sack_older_than_ack_point_is_dropped() -> Result<()> {
    let mut a = established_sender(10..=14);
    a.cumulative_tsn_ack_point = 12;

    a.handle_sack(&sack(11, 1024, &[])).await?;
    assert_eq!(a.cumulative_tsn_ack_point, 12, "ack point must not regress");

    Ok(())
}

#[tokio::test]
async fn test_sack_advances_ack_point_and_rwnd() -> Result<()> {
    let mut a = established_sender(10..=12);

    a.handle_sack(&sack(11, 1000, &[])).await?;

    assert_eq!(a.cumulative_tsn_ack_point, 11);
    assert_eq!(a.inflight_queue.len(), 1, "tsn=12 still in flight");
    // rwnd = arwnd - bytes outstanding (4 bytes of tsn=12)
    assert_eq!(a.cc.rwnd, 996);

    Ok(())
}

#[tokio::test]
async fn test_fast_retransmit_after_three_miss_indications() -> Result<()> {
    let mut a = established_sender(10..=17);
    let cwnd_before = a.cc.cwnd;

    // Three SACKs with growing gap reports: 12,14 then 16 then 17.
    a.handle_sack(&sack(10, 1024 * 1024, &[(2, 2), (4, 4)]))
        .await?;
    assert!(!a.cc.in_fast_recovery());
    a.handle_sack(&sack(10, 1024 * 1024, &[(2, 2), (4, 4), (6, 6)]))
        .await?;
    assert!(!a.cc.in_fast_recovery());
    a.handle_sack(&sack(10, 1024 * 1024, &[(2, 2), (4, 4), (6, 7)]))
        .await?;

    // tsn=11 has now been reported missing three times.
    assert_eq!(a.inflight_queue.get(11).unwrap().miss_indicator, 3);
    assert!(a.cc.in_fast_recovery(), "should enter fast recovery");
    assert_eq!(a.cc.fast_recovery_exit, Some(17), "exit point is the htna");
    assert_eq!(
        a.cc.ssthresh,
        (cwnd_before / 2).max(4 * a.cc.mtu),
        "ssthresh should follow RFC 4960 Sec 7.2.3"
    );
    assert_eq!(a.cc.cwnd, a.cc.ssthresh, "cwnd collapses to ssthresh");
    assert!(a.wants_fast_retransmit);

    // The fast retransmission goes out in one packet bundling every
    // eligible chunk (tsn=11 and tsn=13).
    let (packets, _) = a.gather_outbound().await;
    assert_eq!(packets.len(), 1, "single fast-rtx packet");
    let tsns: Vec<u32> = packets[0]
        .chunks
        .iter()
        .map(|c| match c {
            Chunk::Data(d) => d.tsn,
            other => panic!("expected DATA, got {other}"),
        })
        .collect();
    assert_eq!(tsns, vec![11, 13]);
    assert_eq!(a.stats.get_num_fast_retrans(), 2);

    Ok(())
}

#[tokio::test]
async fn test_fast_recovery_exits_when_exit_point_is_covered() -> Result<()> {
    let mut a = established_sender(10..=17);

    a.handle_sack(&sack(10, 1024 * 1024, &[(2, 2), (4, 4)]))
        .await?;
    a.handle_sack(&sack(10, 1024 * 1024, &[(2, 2), (4, 4), (6, 6)]))
        .await?;
    a.handle_sack(&sack(10, 1024 * 1024, &[(2, 2), (4, 4), (6, 7)]))
        .await?;
    assert!(a.cc.in_fast_recovery());

    // An ack covering the exit point (17) leaves fast recovery.
    a.handle_sack(&sack(17, 1024 * 1024, &[])).await?;
    assert!(!a.cc.in_fast_recovery(), "should exit fast recovery");
    assert!(a.inflight_queue.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_t3_rtx_timeout_collapses_cwnd_and_flags_retransmission() -> Result<()> {
    let mut a = established_sender(20..=20);
    let cwnd_before = a.cc.cwnd;

    a.on_retransmission_timeout(RtxTimerId::T3RTX, 1).await;

    assert_eq!(a.cc.cwnd, a.cc.mtu, "cwnd collapses to one MTU");
    assert_eq!(a.cc.ssthresh, (cwnd_before / 2).max(4 * a.cc.mtu));
    assert!(a.inflight_queue.get(20).unwrap().retransmit);

    // The next gather retransmits the chunk and bumps its n_sent.
    let (packets, _) = a.gather_outbound().await;
    assert_eq!(packets.len(), 1);
    assert!(matches!(&packets[0].chunks[0], Chunk::Data(d) if d.tsn == 20));
    assert_eq!(a.inflight_queue.get(20).unwrap().n_sent, 2);
    assert_eq!(a.stats.get_num_t3timeouts(), 1);

    Ok(())
}

#[tokio::test]
async fn test_rexmit_policy_abandons_and_forwards_tsn() -> Result<()> {
    let mut a = create_association_inner(0);
    a.set_state(AssociationState::Established);
    a.use_forward_tsn = true;
    a.cc.rwnd = 1024;

    let s = a.create_stream(1, false).expect("create stream");
    s.set_reliability_params(false, ReliabilityType::Rexmit, 2);

    s.write_sctp(
        &Bytes::from_static(b"PARTIAL"),
        PayloadProtocolIdentifier::Binary,
    )
    .await?;

    // First transmission.
    let (packets, _) = a.gather_outbound().await;
    assert_eq!(packets.len(), 1);
    let tsn = match &packets[0].chunks[0] {
        Chunk::Data(d) => d.tsn,
        other => panic!("expected DATA, got {other}"),
    };
    assert!(!a.inflight_queue.get(tsn).unwrap().abandoned());

    // T3-rtx expiry and retransmission; the rexmit policy (value=2)
    // abandons the chunk on this attempt.
    a.on_retransmission_timeout(RtxTimerId::T3RTX, 1).await;
    let (packets, _) = a.gather_outbound().await;
    assert_eq!(packets.len(), 1);
    assert!(a.inflight_queue.get(tsn).unwrap().abandoned());

    // The next timeout advances the forward-TSN point past the abandoned
    // chunk and schedules a FORWARD-TSN.
    a.on_retransmission_timeout(RtxTimerId::T3RTX, 2).await;
    assert_eq!(a.advanced_peer_tsn_ack_point, tsn);
    assert!(a.wants_forward_tsn);

    let (packets, _) = a.gather_outbound().await;
    let fwd = packets
        .iter()
        .flat_map(|p| p.chunks.iter())
        .find_map(|c| match c {
            Chunk::ForwardTsn(f) => Some(f),
            _ => None,
        })
        .expect("should emit FORWARD-TSN");
    assert_eq!(fwd.new_cumulative_tsn, tsn);
    assert_eq!(fwd.streams.len(), 1);
    assert_eq!(fwd.streams[0].identifier, 1);

    Ok(())
}

///////////////////////////////////////////////////////////////////
//inbound DATA and SACK scheduling
///////////////////////////////////////////////////////////////////

#[tokio::test]
async fn test_single_sack_scheduled_per_packet() -> Result<()> {
    let (accept_ch_tx, _accept_ch_rx) = mpsc::channel(ACCEPT_CH_SIZE);
    let mut a = AssociationInner {
        accept_ch_tx: Some(accept_ch_tx),
        max_receive_buffer_size: INITIAL_RECV_BUF_SIZE,
        ..Default::default()
    };
    a.set_state(AssociationState::Established);

    // Two in-order DATA chunks in one inbound packet: a single delayed
    // SACK is scheduled.
    a.acks.begin_packet();
    for tsn in 1..=2u32 {
        let d = DataChunk {
            beginning_fragment: true,
            ending_fragment: true,
            tsn,
            stream_identifier: 0,
            stream_sequence_number: (tsn - 1) as u16,
            user_data: Bytes::from_static(b"ABC"),
            ..Default::default()
        };
        a.handle_data(&d).await?;
    }
    a.apply_ack_decision();

    assert_eq!(a.peer_last_tsn, 2, "cumulative point should advance");
    assert_eq!(a.acks.state, AckState::Delay, "one delayed SACK scheduled");

    // A gap (tsn=4 while 3 is missing) turns the pending ack immediate.
    a.acks.begin_packet();
    let d = DataChunk {
        beginning_fragment: true,
        ending_fragment: true,
        tsn: 4,
        stream_identifier: 0,
        stream_sequence_number: 2,
        user_data: Bytes::from_static(b"ABC"),
        ..Default::default()
    };
    a.handle_data(&d).await?;
    a.apply_ack_decision();

    assert_eq!(
        a.acks.state,
        AckState::Immediate,
        "loss triggers an immediate SACK"
    );

    let (packets, _) = a.gather_outbound().await;
    let sack = sole_sack(&packets);
    assert_eq!(sack.cumulative_tsn_ack, 2);
    assert_eq!(sack.gap_ack_blocks, vec![GapAckBlock { start: 2, end: 2 }]);
    assert_eq!(a.acks.state, AckState::Idle, "ack state resets after the SACK");

    Ok(())
}

#[tokio::test]
async fn test_duplicate_data_is_reported_in_sack() -> Result<()> {
    let (accept_ch_tx, _accept_ch_rx) = mpsc::channel(ACCEPT_CH_SIZE);
    let mut a = AssociationInner {
        accept_ch_tx: Some(accept_ch_tx),
        max_receive_buffer_size: INITIAL_RECV_BUF_SIZE,
        ..Default::default()
    };
    a.set_state(AssociationState::Established);

    let d = DataChunk {
        beginning_fragment: true,
        ending_fragment: true,
        tsn: 1,
        stream_identifier: 0,
        user_data: Bytes::from_static(b"ABC"),
        ..Default::default()
    };

    a.acks.begin_packet();
    a.handle_data(&d).await?;
    a.handle_data(&d).await?;
    a.apply_ack_decision();

    let (packets, _) = a.gather_outbound().await;
    let sack = sole_sack(&packets);
    assert_eq!(sack.duplicate_tsn, vec![1], "duplicate should be reported");

    Ok(())
}
