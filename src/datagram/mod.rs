//! The datagram transport. There is no protocol level connection: the listener learns its peer
//!  from a one-byte handshake datagram and then exchanges datagrams with that peer only.
//!
//! A message is sent in one of two ways, depending on its length:
//! * Messages shorter than `large_message_threshold` are split into datagrams of up to
//!   `max_datagram_size` bytes, without any numbering or loss detection. The receiver relies on
//!   receiving exactly the datagrams that were sent, in the order they were sent. A lost datagram
//!   blocks the receiver, and a reordered or duplicated datagram desynchronizes the session.
//! * Longer messages use [reliable bulk transfer](bulk).

pub mod bulk;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};
use crate::config::ProbeConfig;
use crate::connection::Connection;
use crate::datagram::bulk::{recv_bulk, send_bulk, BulkTransferStats};
use crate::error::ProtocolError;

/// Raw datagram I/O with a single, fixed peer
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramChannel: Send + Sync {
    async fn send_datagram(&self, buf: &[u8]) -> anyhow::Result<()>;

    /// Receive a single datagram into `buf`, returning its length. A datagram that is longer than
    ///  the buffer is truncated. With a timeout, `None` is returned if no datagram arrived in
    ///  time; without a timeout, this waits indefinitely.
    async fn recv_datagram(&self, buf: &mut [u8], timeout: Option<Duration>) -> anyhow::Result<Option<usize>>;
}

/// This requires the socket to be connected to its peer
#[async_trait]
impl DatagramChannel for UdpSocket {
    async fn send_datagram(&self, buf: &[u8]) -> anyhow::Result<()> {
        self.send(buf).await?;
        Ok(())
    }

    async fn recv_datagram(&self, buf: &mut [u8], timeout: Option<Duration>) -> anyhow::Result<Option<usize>> {
        let recv = self.recv(buf);
        let result = match timeout {
            None => recv.await,
            Some(timeout) => match tokio::time::timeout(timeout, recv).await {
                Ok(result) => result,
                Err(_) => return Ok(None),
            }
        };
        let len = result.map_err(ProtocolError::read_failure)?;
        Ok(Some(len))
    }
}

/// Send `data` over the small-message path, as a sequence of datagrams of up to
///  `max_datagram_size` bytes
pub async fn send_small<C: DatagramChannel + ?Sized>(channel: &C, data: &[u8], max_datagram_size: usize) -> anyhow::Result<()> {
    for chunk in data.chunks(max_datagram_size) {
        trace!("sending datagram of {} bytes", chunk.len());
        channel.send_datagram(chunk).await?;
    }
    Ok(())
}

/// The counterpart to [send_small]: this expects one datagram for each `max_datagram_size`
///  slice of `buf`. A datagram that is shorter than its slice is a protocol violation.
pub async fn recv_small<C: DatagramChannel + ?Sized>(channel: &C, buf: &mut [u8], max_datagram_size: usize) -> anyhow::Result<()> {
    for chunk in buf.chunks_mut(max_datagram_size) {
        let len = channel.recv_datagram(chunk, None).await?
            .ok_or_else(|| ProtocolError::read_failure("unexpected timeout"))?;
        if len < chunk.len() {
            return Err(ProtocolError::violation(format!("received a datagram of {} bytes, expected {}", len, chunk.len())).into());
        }
        trace!("received datagram of {} bytes", len);
    }
    Ok(())
}

/// Send a message using the path its length calls for. The peer must [receive](recv_message)
///  it with a buffer of the same length. Bulk transfer statistics are returned if the message
///  was large.
pub async fn send_message<C: DatagramChannel + ?Sized>(channel: &C, config: &ProbeConfig, data: &[u8]) -> anyhow::Result<Option<BulkTransferStats>> {
    if config.is_large_message(data.len()) {
        Ok(Some(send_bulk(channel, config, data).await?))
    }
    else {
        send_small(channel, data, config.max_datagram_size).await?;
        Ok(None)
    }
}

pub async fn recv_message<C: DatagramChannel + ?Sized>(channel: &C, config: &ProbeConfig, buf: &mut [u8]) -> anyhow::Result<Option<BulkTransferStats>> {
    if config.is_large_message(buf.len()) {
        Ok(Some(recv_bulk(channel, config, buf).await?))
    }
    else {
        recv_small(channel, buf, config.max_datagram_size).await?;
        Ok(None)
    }
}

/// The listening half of the datagram handshake
pub struct DatagramListener {
    config: Arc<ProbeConfig>,
    socket: UdpSocket,
}

impl DatagramListener {
    pub async fn bind(config: Arc<ProbeConfig>, addr: SocketAddr) -> anyhow::Result<DatagramListener> {
        let socket = UdpSocket::bind(addr).await?;
        debug!("bound datagram listener to {:?}", socket.local_addr()?);
        Ok(DatagramListener {
            config,
            socket,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait for a connector's handshake datagram. The listener's socket becomes the connection's
    ///  socket, talking exclusively to the connector.
    pub async fn accept(self) -> anyhow::Result<DatagramConnection> {
        let mut buf = [0u8; 1];
        let recv = self.socket.recv_from(&mut buf);
        let received = match self.config.handshake_timeout {
            None => recv.await,
            Some(timeout) => tokio::time::timeout(timeout, recv).await
                .map_err(|_| ProtocolError::HandshakeFailure(format!("no handshake within {:?}", timeout)))?,
        };
        let (len, peer_addr) = received
            .map_err(|e| ProtocolError::HandshakeFailure(e.to_string()))?;

        if len != 1 || buf[0] != self.config.ack {
            debug!("unexpected handshake datagram from {:?} - accepting the peer anyway", peer_addr);
        }

        self.socket.connect(peer_addr).await
            .map_err(|e| ProtocolError::HandshakeFailure(e.to_string()))?;
        info!("accepted datagram session from {:?}", peer_addr);

        Ok(DatagramConnection {
            config: self.config,
            socket: Some(self.socket),
            peer_addr,
        })
    }
}

/// [Connection] over an unreliable datagram socket, see the [module documentation](self)
pub struct DatagramConnection {
    config: Arc<ProbeConfig>,
    socket: Option<UdpSocket>,
    peer_addr: SocketAddr,
}

impl DatagramConnection {
    /// The connecting half of the handshake: send a single ACK byte to register with a listener
    pub async fn connect(config: Arc<ProbeConfig>, addr: SocketAddr) -> anyhow::Result<DatagramConnection> {
        let local_addr: SocketAddr = match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local_addr).await?;
        socket.connect(addr).await?;
        socket.send(&[config.ack]).await?;
        info!("registered datagram session with {:?}", addr);

        Ok(DatagramConnection {
            config,
            socket: Some(socket),
            peer_addr: addr,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn socket(&self) -> anyhow::Result<&UdpSocket> {
        self.socket.as_ref()
            .ok_or_else(|| ProtocolError::ConnectionInactive.into())
    }
}

#[async_trait]
impl Connection for DatagramConnection {
    async fn send_bytes(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        send_message(self.socket()?, &self.config, buf).await?;
        Ok(())
    }

    async fn send_byte(&mut self, b: u8) -> anyhow::Result<()> {
        self.send_bytes(&[b]).await
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> anyhow::Result<()> {
        recv_message(self.socket()?, &self.config, buf).await?;
        Ok(())
    }

    async fn read_byte(&mut self) -> anyhow::Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf).await?;
        Ok(buf[0])
    }

    fn is_output_active(&self) -> bool {
        self.socket.is_some()
    }

    fn is_input_active(&self) -> bool {
        self.socket.is_some()
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if self.socket.take().is_some() {
            debug!("closed datagram session with {:?}", self.peer_addr);
        }
        Ok(())
    }
}
