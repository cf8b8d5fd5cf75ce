//! Utilities for testing code built on this crate's transports without real sockets. They are
//!  part of the crate's regular (non-#[cfg(test)]) code so that applications can use them in
//!  their own tests.

use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;
use crate::datagram::DatagramChannel;
use crate::error::ProtocolError;
use crate::stream::StreamConnection;

/// Two [StreamConnection]s connected by an in-memory pipe that buffers up to `max_buf_size`
///  bytes in each direction
pub fn stream_pair(max_buf_size: usize) -> (StreamConnection, StreamConnection) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    (StreamConnection::from_split(a_read, a_write), StreamConnection::from_split(b_read, b_write))
}

type DropFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// One end of an in-memory datagram link. Datagrams are delivered in order, and a
///  [drop filter](MemoryChannel::with_drop_filter) can simulate loss of outbound datagrams.
pub struct MemoryChannel {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    injector: mpsc::WeakUnboundedSender<Vec<u8>>,
    drop_filter: Mutex<Option<DropFilter>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MemoryChannel {
    /// Create two connected ends of a loss-free link. Receiving on one end fails with
    ///  [ProtocolError::ReadFailure] once the other end is dropped and all queued datagrams are
    ///  consumed.
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        let (a_send, a_recv) = mpsc::unbounded_channel();
        let (b_send, b_recv) = mpsc::unbounded_channel();
        // the peer owns the only strong sender into each end's queue
        let a_injector = b_send.downgrade();
        let b_injector = a_send.downgrade();
        (
            MemoryChannel::new(a_send, b_recv, a_injector),
            MemoryChannel::new(b_send, a_recv, b_injector),
        )
    }

    fn new(outbound: mpsc::UnboundedSender<Vec<u8>>, inbound: mpsc::UnboundedReceiver<Vec<u8>>, injector: mpsc::WeakUnboundedSender<Vec<u8>>) -> MemoryChannel {
        MemoryChannel {
            outbound,
            inbound: tokio::sync::Mutex::new(inbound),
            injector,
            drop_filter: Mutex::new(None),
            sent: Default::default(),
        }
    }

    /// The filter is called for every datagram sent through this end. If it returns `true`,
    ///  the datagram is silently lost.
    pub fn with_drop_filter(self, filter: impl FnMut(&[u8]) -> bool + Send + 'static) -> MemoryChannel {
        *self.drop_filter.lock().unwrap() = Some(Box::new(filter));
        self
    }

    /// all datagrams sent through this end so far, including those that were dropped
    pub fn sent_datagrams(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// queue a datagram for this end as if the peer had sent it, unless the peer is gone
    pub fn inject(&self, datagram: &[u8]) {
        if let Some(injector) = self.injector.upgrade() {
            let _ = injector.send(datagram.to_vec());
        }
    }

    fn should_drop(&self, datagram: &[u8]) -> bool {
        match self.drop_filter.lock().unwrap().as_mut() {
            Some(filter) => filter(datagram),
            None => false,
        }
    }
}

#[async_trait]
impl DatagramChannel for MemoryChannel {
    async fn send_datagram(&self, buf: &[u8]) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(buf.to_vec());
        if self.should_drop(buf) {
            trace!("dropping datagram of {} bytes", buf.len());
            return Ok(());
        }
        // lost if the peer end is gone
        let _ = self.outbound.send(buf.to_vec());
        Ok(())
    }

    async fn recv_datagram(&self, buf: &mut [u8], timeout: Option<Duration>) -> anyhow::Result<Option<usize>> {
        let mut inbound = self.inbound.lock().await;
        let received = match timeout {
            None => inbound.recv().await,
            Some(timeout) => match tokio::time::timeout(timeout, inbound.recv()).await {
                Ok(received) => received,
                Err(_) => return Ok(None),
            },
        };

        let datagram = received
            .ok_or_else(|| ProtocolError::read_failure("in-memory peer is gone"))?;

        // excess bytes are truncated, as for a UDP socket
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok(Some(len))
    }
}
