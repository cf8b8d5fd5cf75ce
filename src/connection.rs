use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::{debug, trace, warn};
use crate::error::ProtocolError;
use crate::header::Header;
use crate::util::buf::{BufExt, I32_SIZE, I64_SIZE};

/// A session with exactly one peer, abstracting over the stream and the datagram transport.
///  Request dispatching and measurement operations are written against this trait only.
///
/// Sending or reading on a direction that is not active fails with
///  [ProtocolError::ConnectionInactive] without touching the network.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Send {
    async fn send_bytes(&mut self, buf: &[u8]) -> anyhow::Result<()>;

    async fn send_byte(&mut self, b: u8) -> anyhow::Result<()>;

    /// Fill the entire buffer. This either reads exactly `buf.len()` bytes or fails, it never
    ///  returns with a partially filled buffer.
    async fn read_exact(&mut self, buf: &mut [u8]) -> anyhow::Result<()>;

    async fn read_byte(&mut self) -> anyhow::Result<u8>;

    fn is_output_active(&self) -> bool;

    fn is_input_active(&self) -> bool;

    /// Release the underlying socket. Both directions are inactive afterwards, and closing an
    ///  inactive connection is a no-op.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Convenience operations built on the primitive [Connection] operations. This is an extension
///  trait rather than provided methods so that mocks of [Connection] do not need to mock them.
#[async_trait]
pub trait ConnectionExt: Connection {
    fn is_connected(&self) -> bool {
        self.is_output_active() && self.is_input_active()
    }

    async fn send_i32(&mut self, value: i32) -> anyhow::Result<()> {
        self.send_bytes(&value.to_be_bytes()).await
    }

    async fn send_i64(&mut self, value: i64) -> anyhow::Result<()> {
        self.send_bytes(&value.to_be_bytes()).await
    }

    async fn read_i32(&mut self) -> anyhow::Result<i32> {
        let mut buf = [0u8; I32_SIZE];
        self.read_exact(&mut buf).await?;
        let mut b: &[u8] = &buf;
        b.checked_get_i32()
    }

    async fn read_i64(&mut self) -> anyhow::Result<i64> {
        let mut buf = [0u8; I64_SIZE];
        self.read_exact(&mut buf).await?;
        let mut b: &[u8] = &buf;
        b.checked_get_i64()
    }

    async fn read_vec(&mut self, len: usize) -> anyhow::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// read a single byte, failing if it is anything but the expected ACK value
    async fn read_ack(&mut self, ack: u8) -> anyhow::Result<()> {
        let b = self.read_byte().await?;
        if b != ack {
            return Err(ProtocolError::violation(format!("expected ACK {}, received {}", ack, b)).into());
        }
        Ok(())
    }

    async fn send_header(&mut self, header: &Header) -> anyhow::Result<()> {
        trace!("sending header {:?}", header);
        self.send_bytes(&header.to_bytes()).await
    }

    /// Read header-sized blocks until one starts with the header sentinel. Blocks with a
    ///  different start are discarded as a whole - there is no resynchronization within a block.
    async fn read_header(&mut self) -> anyhow::Result<Header> {
        let mut buf = [0u8; Header::SERIALIZED_LEN];
        loop {
            self.read_exact(&mut buf).await?;
            if Header::has_sentinel(&buf) {
                break;
            }
            warn!("discarding {} bytes that do not start with a header sentinel", buf.len());
        }

        let header = Header::deser(&mut &buf[..])?;
        trace!("received header {:?}", header);
        Ok(header)
    }

    /// Tell the peer that the session ends, then close. The peer is notified on a best-effort
    ///  basis: a failure to send the notification is logged and the connection is closed anyway.
    async fn disconnect(&mut self) -> anyhow::Result<()> {
        if self.is_output_active() {
            if let Err(e) = self.send_header(&Header::close_connection()).await {
                warn!("failed to send close connection header: {}", e);
            }
        }
        else {
            debug!("disconnecting an inactive connection - not notifying the peer");
        }
        self.close().await
    }
}

impl <T: Connection + ?Sized> ConnectionExt for T {
}
