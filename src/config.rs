use std::time::Duration;
use anyhow::bail;
use crate::datagram::bulk::PACKET_NUMBER_SIZE;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// The port a listening endpoint binds for both transports
    pub port: u16,

    /// The byte value that is sent as an acknowledgement, both as a reply to `AckRequest` chunks
    ///  and in the throughput exchange. Any other value where an ACK is expected is a protocol
    ///  violation.
    pub ack: u8,

    /// This is the maximum size of a single datagram on the wire (`MAX_MSG_SIZE`). Small messages
    ///  are split into datagrams of this size, bulk transfers use it for packet number + payload.
    ///
    /// The default of 512 bytes stays clear of fragmentation on pretty much any route. Choosing
    ///  it bigger reduces per-datagram overhead, but oversized datagrams get dropped or fragmented
    ///  on the way, and the protocol has no way of detecting that for small messages.
    pub max_datagram_size: usize,

    /// Messages of at least this length are sent using reliable bulk transfer, shorter messages
    ///  go over the (unnumbered, unprotected) small-message path.
    pub large_message_threshold: usize,

    /// The bounded wait a bulk-transfer receiver applies after the first packet of a transfer
    ///  arrived. When it expires, the receiver requests a resend of everything still missing.
    ///
    /// This should be above the expected jitter, but small relative to the total transfer time:
    ///  it bounds the latency of recovering from a lost packet.
    pub next_packet_timeout: Duration,

    /// After a completed bulk transfer, the receiver drains trailing control traffic until the
    ///  sender's END_OF_TRANSMISSION arrives or this much time passes without a datagram
    pub end_of_transmission_timeout: Duration,

    /// Upper bound for the datagram listener's wait for the handshake byte. `None` waits forever.
    pub handshake_timeout: Option<Duration>,

    /// The largest total byte count a server accepts in a request header
    pub max_request_size: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            port: 2691,
            ack: 6,
            max_datagram_size: 512,
            large_message_threshold: 64*1024,
            next_packet_timeout: Duration::from_millis(10),
            end_of_transmission_timeout: Duration::from_millis(100),
            handshake_timeout: None,
            max_request_size: 16*1024*1024,
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size <= PACKET_NUMBER_SIZE {
            bail!("datagram size of {} leaves no room for payload after the packet number", self.max_datagram_size);
        }
        if self.max_datagram_size > u16::MAX as usize {
            bail!("datagram size of {} exceeds what fits into a UDP datagram", self.max_datagram_size);
        }
        if self.large_message_threshold == 0 {
            bail!("large message threshold must be positive");
        }
        if self.next_packet_timeout.is_zero() {
            bail!("next packet timeout must be positive");
        }
        if self.end_of_transmission_timeout.is_zero() {
            bail!("end of transmission timeout must be positive");
        }
        if i32::try_from(self.max_request_size).is_err() {
            bail!("max request size of {} does not fit the header's 32 bit size fields", self.max_request_size);
        }

        Ok(())
    }

    /// the payload a single bulk-transfer datagram can carry (`MAX_PAYLOAD_SIZE`)
    pub fn max_payload_size(&self) -> usize {
        self.max_datagram_size - PACKET_NUMBER_SIZE
    }

    pub fn is_large_message(&self, len: usize) -> bool {
        len >= self.large_message_threshold
    }
}
