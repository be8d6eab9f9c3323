use bytes::Bytes;

use super::abort::AbortChunk;
use super::forward_tsn::{ForwardTsnChunk, SkippedStream};
use super::init::InitChunk;
use super::reconfig::ReconfigChunk;
use super::sack::SackChunk;
use super::*;
use crate::error_cause::{ErrorCause, PROTOCOL_VIOLATION, STALE_COOKIE_ERROR};
use crate::param::{OutgoingResetRequest, Param, ReconfigResponse, ReconfigResult};

///////////////////////////////////////////////////////////////////
//chunk_abort_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_abort_one_error_cause() -> crate::error::Result<()> {
    let abort = AbortChunk {
        error_causes: vec![ErrorCause {
            code: PROTOCOL_VIOLATION,
            raw: Bytes::new(),
        }],
    };

    let raw = marshal_chunk(&Chunk::Abort(abort));
    let parsed = AbortChunk::unmarshal(&raw)?;

    assert_eq!(parsed.error_causes.len(), 1, "should have one cause");
    assert_eq!(parsed.error_causes[0].code, PROTOCOL_VIOLATION);

    Ok(())
}

#[test]
fn test_abort_with_stale_cookie_cause() -> crate::error::Result<()> {
    let abort = AbortChunk {
        error_causes: vec![ErrorCause::stale_cookie(123_456)],
    };

    let raw = marshal_chunk(&Chunk::Abort(abort));
    let parsed = AbortChunk::unmarshal(&raw)?;

    assert_eq!(parsed.error_causes.len(), 1);
    assert_eq!(parsed.error_causes[0].code, STALE_COOKIE_ERROR);
    assert_eq!(&parsed.error_causes[0].raw[..], 123_456u32.to_be_bytes());

    Ok(())
}

///////////////////////////////////////////////////////////////////
//chunk_forward_tsn_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_forward_tsn_round_trip() -> crate::error::Result<()> {
    let chunk = ForwardTsnChunk {
        new_cumulative_tsn: 3,
        streams: vec![
            SkippedStream {
                identifier: 1,
                sequence: 2,
            },
            SkippedStream {
                identifier: 4,
                sequence: 8,
            },
        ],
    };

    let raw = marshal_chunk(&Chunk::ForwardTsn(chunk));
    assert_eq!(raw.len(), CHUNK_HEADER_SIZE + 4 + 2 * 4);

    let parsed = ForwardTsnChunk::unmarshal(&raw)?;
    assert_eq!(parsed.new_cumulative_tsn, 3);
    assert_eq!(
        parsed.streams,
        vec![
            SkippedStream {
                identifier: 1,
                sequence: 2
            },
            SkippedStream {
                identifier: 4,
                sequence: 8
            },
        ]
    );

    Ok(())
}

///////////////////////////////////////////////////////////////////
//chunk_sack_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_sack_from_capture() -> crate::error::Result<()> {
    const BYTES: &[u8] = &[
        0x03, 0x00, 0x00, 0x1c, 0x36, 0x9d, 0xd0, 0x0b, 0x00, 0x01, 0xed, 0x73, 0x00, 0x02, 0x00,
        0x01, 0x00, 0x02, 0x00, 0x06, 0x00, 0x08, 0x00, 0x08, 0x36, 0x9d, 0xd0, 0x11,
    ];
    let sack = SackChunk::unmarshal(&Bytes::from_static(BYTES))?;

    let cum_ack_tsn: u32 = 916312075;
    assert_eq!(sack.cumulative_tsn_ack, cum_ack_tsn);
    assert_eq!(sack.advertised_receiver_window_credit, 126323);
    assert_eq!(sack.gap_ack_blocks.len(), 2);
    assert_eq!(sack.gap_ack_blocks[0].start as u32, 916312077 - cum_ack_tsn);
    assert_eq!(sack.gap_ack_blocks[0].end as u32, 916312081 - cum_ack_tsn);
    assert_eq!(sack.gap_ack_blocks[1].start as u32, 916312083 - cum_ack_tsn);
    assert_eq!(sack.gap_ack_blocks[1].end as u32, 916312083 - cum_ack_tsn);
    assert_eq!(sack.duplicate_tsn, vec![916312081]);

    Ok(())
}

///////////////////////////////////////////////////////////////////
//chunk_reconfig_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_reconfig_request_and_response_params() -> crate::error::Result<()> {
    let chunk = ReconfigChunk {
        params: vec![
            Param::OutgoingResetRequest(OutgoingResetRequest {
                request_sequence_number: 10,
                response_sequence_number: 0,
                sender_last_tsn: 99,
                stream_identifiers: vec![4],
            }),
            Param::ReconfigResponse(ReconfigResponse {
                response_sequence_number: 9,
                result: ReconfigResult::SuccessPerformed,
            }),
        ],
    };

    let raw = marshal_chunk(&Chunk::Reconfig(chunk));
    let parsed = ReconfigChunk::unmarshal(&raw)?;

    assert_eq!(parsed.params.len(), 2, "should have both params");
    match &parsed.params[0] {
        Param::OutgoingResetRequest(req) => {
            assert_eq!(req.request_sequence_number, 10);
            assert_eq!(req.sender_last_tsn, 99);
            assert_eq!(req.stream_identifiers, vec![4]);
        }
        other => panic!("expected reset request, got {other}"),
    }
    match &parsed.params[1] {
        Param::ReconfigResponse(resp) => {
            assert_eq!(resp.response_sequence_number, 9);
            assert_eq!(resp.result, ReconfigResult::SuccessPerformed);
        }
        other => panic!("expected reconfig response, got {other}"),
    }

    Ok(())
}

#[test]
fn test_reconfig_without_params_is_rejected() {
    let raw = Bytes::from_static(&[0x82, 0x00, 0x00, 0x04]);
    assert!(ReconfigChunk::unmarshal(&raw).is_err());
}

///////////////////////////////////////////////////////////////////
//chunk_init_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_init_round_trip_with_params() -> crate::error::Result<()> {
    let mut init = InitChunk {
        is_ack: true,
        initiate_tag: 0xb0b0_cafe,
        advertised_receiver_window_credit: 512 * 1024,
        num_outbound_streams: 1001,
        num_inbound_streams: 1002,
        initial_tsn: 4242,
        params: vec![Param::StateCookie {
            cookie: Bytes::from_static(&[0xaa; 32]),
        }],
    };
    init.set_supported_extensions(&[CT_RECONFIG, CT_FORWARD_TSN]);

    let raw = marshal_chunk(&Chunk::Init(init));
    let parsed = InitChunk::unmarshal(&raw)?;

    assert!(parsed.is_ack);
    assert_eq!(parsed.initiate_tag, 0xb0b0_cafe);
    assert_eq!(parsed.advertised_receiver_window_credit, 512 * 1024);
    assert_eq!(parsed.num_outbound_streams, 1001);
    assert_eq!(parsed.num_inbound_streams, 1002);
    assert_eq!(parsed.initial_tsn, 4242);
    assert_eq!(
        parsed.state_cookie(),
        Some(Bytes::from_static(&[0xaa; 32]))
    );
    assert_eq!(
        parsed.supported_extensions(),
        &[CT_RECONFIG, CT_FORWARD_TSN]
    );
    parsed.check()?;

    Ok(())
}

#[test]
fn test_init_check_rejects_bad_values() {
    let valid = InitChunk {
        initiate_tag: 1,
        advertised_receiver_window_credit: 1500,
        num_outbound_streams: 1,
        num_inbound_streams: 1,
        initial_tsn: 0,
        ..Default::default()
    };
    assert!(valid.check().is_ok());

    let mut zero_tag = valid.clone();
    zero_tag.initiate_tag = 0;
    assert!(zero_tag.check().is_err(), "initiate tag 0 must be rejected");

    let mut zero_streams = valid.clone();
    zero_streams.num_inbound_streams = 0;
    assert!(zero_streams.check().is_err(), "MIS of 0 must be rejected");

    let mut small_rwnd = valid;
    small_rwnd.advertised_receiver_window_credit = 1499;
    assert!(small_rwnd.check().is_err(), "a_rwnd < 1500 must be rejected");
}

///////////////////////////////////////////////////////////////////
//chunk_dispatch_test
///////////////////////////////////////////////////////////////////

#[test]
fn test_unknown_chunk_type_is_carried() -> crate::error::Result<()> {
    // Type 0xc1 (upper bits 11): skip and report.
    let raw = Bytes::from_static(&[0xc1, 0x00, 0x00, 0x08, 0x01, 0x02, 0x03, 0x04]);
    let chunk = Chunk::unmarshal(&raw)?;
    match chunk {
        Chunk::Unknown(u) => {
            assert_eq!(u.typ, 0xc1);
            assert_eq!(&u.value[..], &[0x01, 0x02, 0x03, 0x04]);
        }
        other => panic!("expected unknown chunk, got {other}"),
    }

    Ok(())
}
