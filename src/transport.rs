use async_trait::async_trait;

use crate::error::Result;

/// Datagram transport the association runs over, typically a DTLS
/// connection carrying one SCTP packet per record.
///
/// The engine drives `recv` with a timeout (see the association read loop)
/// so a quiet transport never wedges shutdown. A closed transport reports
/// `Err` from `recv`/`send`; there is no in-band EOF value.
#[async_trait]
pub trait DatagramTransport {
    /// Receives one datagram into `buf` and returns its length.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Sends `buf` as one datagram.
    async fn send(&self, buf: &[u8]) -> Result<usize>;

    /// Tears the transport down. Implementations must make any blocked
    /// `recv` return an error.
    async fn close(&self) -> Result<()>;
}
