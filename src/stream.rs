use std::net::SocketAddr;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};
use crate::connection::Connection;
use crate::error::ProtocolError;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// [Connection] over a reliable, order-preserving byte stream (TCP in production). The stream
///  has no message boundaries of its own, they are implied by the sizes declared in headers.
pub struct StreamConnection {
    peer_addr: Option<SocketAddr>,
    reader: Option<BoxedReader>,
    writer: Option<BoxedWriter>,
}

impl StreamConnection {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<StreamConnection> {
        let stream = TcpStream::connect(addr).await?;
        info!("connected to {:?}", addr);
        Ok(Self::from_tcp(stream))
    }

    pub fn from_tcp(stream: TcpStream) -> StreamConnection {
        // the protocol is strictly request / response with small messages, batching only adds latency
        if let Err(e) = stream.set_nodelay(true) {
            debug!("unable to set TCP_NODELAY: {}", e);
        }
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();

        StreamConnection {
            peer_addr,
            reader: Some(Box::new(reader)),
            writer: Some(Box::new(writer)),
        }
    }

    /// wrap arbitrary stream halves, e.g. an in-memory `tokio::io::duplex` pair for testing
    pub fn from_split(reader: impl AsyncRead + Send + Unpin + 'static, writer: impl AsyncWrite + Send + Unpin + 'static) -> StreamConnection {
        StreamConnection {
            peer_addr: None,
            reader: Some(Box::new(reader)),
            writer: Some(Box::new(writer)),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn writer(&mut self) -> anyhow::Result<&mut BoxedWriter> {
        self.writer.as_mut()
            .ok_or_else(|| ProtocolError::ConnectionInactive.into())
    }

    fn reader(&mut self) -> anyhow::Result<&mut BoxedReader> {
        self.reader.as_mut()
            .ok_or_else(|| ProtocolError::ConnectionInactive.into())
    }
}

#[async_trait]
impl Connection for StreamConnection {
    async fn send_bytes(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        let writer = self.writer()?;
        writer.write_all(buf).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn send_byte(&mut self, b: u8) -> anyhow::Result<()> {
        self.send_bytes(&[b]).await
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> anyhow::Result<()> {
        let reader = self.reader()?;

        let mut num_read = 0;
        while num_read < buf.len() {
            let n = reader.read(&mut buf[num_read..]).await
                .map_err(ProtocolError::read_failure)?;
            if n == 0 {
                return Err(ProtocolError::ReadFailure(format!("peer closed the stream after {} of {} bytes", num_read, buf.len())).into());
            }
            trace!("read {} bytes", n);
            num_read += n;
        }
        Ok(())
    }

    async fn read_byte(&mut self) -> anyhow::Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf).await?;
        Ok(buf[0])
    }

    fn is_output_active(&self) -> bool {
        self.writer.is_some()
    }

    fn is_input_active(&self) -> bool {
        self.reader.is_some()
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.reader = None;
        if let Some(mut writer) = self.writer.take() {
            debug!("closing stream connection to {:?}", self.peer_addr);
            writer.shutdown().await?;
        }
        Ok(())
    }
}
