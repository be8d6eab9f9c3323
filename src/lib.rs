//! SCTP association engine over a caller-supplied datagram transport
//!
//! [SCTP](https://en.wikipedia.org/wiki/Stream_Control_Transmission_Protocol), defined in RFC 4960,
//! is used in WebRTC for peer-to-peer arbitrary data delivery across browsers, where it runs as an
//! application layer protocol over a DTLS connection.
//!
//! This crate implements the per-association protocol machine: the four-way
//! handshake, reliable and partially reliable DATA transfer multiplexed over
//! streams, selective acknowledgements, congestion and flow control,
//! retransmission timers, and stream reconfiguration. The caller supplies the
//! datagram transport (see [`DatagramTransport`]); each stream can be
//! configured independently, which is what WebRTC data channels build on.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

mod association;
mod chunk;
mod cookie;
mod dcep;
mod error;
mod error_cause;
mod packet;
mod param;
mod queue;
mod stream;
mod timer;
mod transport;
mod util;

pub use crate::association::{Association, AssociationListener, AssociationState, Config};
pub use crate::chunk::data::PayloadProtocolIdentifier;
pub use crate::error::{Error, Result};
pub use crate::stream::{OnBufferedAmountLowFn, ReliabilityType, Stream};
pub use crate::transport::DatagramTransport;
