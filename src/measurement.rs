//! Client-side measurements. Each operation sends exactly one request and consumes its complete
//!  reply sequence, so operations can be run back to back on the same connection.

use std::time::{Duration, Instant};
use rand::RngCore;
use tracing::debug;
use crate::config::ProbeConfig;
use crate::connection::{Connection, ConnectionExt};
use crate::error::ProtocolError;
use crate::header::{Header, RequestKind};

/// The two legs of a throughput measurement
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ThroughputSample {
    /// from sending the payload until the server's ACK arrived, measured by the client
    pub client_to_server: Duration,
    /// from sending the echo until the client's ACK arrived, measured and reported by the server
    pub server_to_client: Duration,
}

fn ensure_connected<C: Connection + ?Sized>(conn: &C) -> anyhow::Result<()> {
    if !conn.is_connected() {
        return Err(ProtocolError::ConnectionInactive.into());
    }
    Ok(())
}

fn wire_size(size: usize) -> anyhow::Result<i32> {
    i32::try_from(size)
        .map_err(|_| anyhow::anyhow!("size {} does not fit into a request header", size))
}

fn random_payload(size: usize, rng: &mut impl RngCore) -> Vec<u8> {
    let mut payload = vec![0u8; size];
    rng.fill_bytes(&mut payload);
    payload
}

/// Round-trip time of a `size` byte message: the time from sending it until its echo was read
///  completely
pub async fn echo_test<C: Connection + ?Sized>(conn: &mut C, size: usize, rng: &mut impl RngCore) -> anyhow::Result<Duration> {
    ensure_connected(conn)?;

    let len = wire_size(size)?;
    conn.send_header(&Header::new(RequestKind::EchoRequest, len, len)).await?;
    let payload = random_payload(size, rng);

    let start = Instant::now();
    conn.send_bytes(&payload).await?;
    let echo = conn.read_vec(size).await?;
    let elapsed = start.elapsed();

    if echo != payload {
        return Err(ProtocolError::violation("echoed payload differs from the payload that was sent").into());
    }
    debug!("echo of {} bytes: {:?}", size, elapsed);
    Ok(elapsed)
}

/// Measure both directions of transferring a `size` byte message
pub async fn throughput_test<C: Connection + ?Sized>(conn: &mut C, config: &ProbeConfig, size: usize, rng: &mut impl RngCore) -> anyhow::Result<ThroughputSample> {
    ensure_connected(conn)?;

    let len = wire_size(size)?;
    conn.send_header(&Header::new(RequestKind::ThroughputMetricsRequest, len, len)).await?;
    let payload = random_payload(size, rng);

    let start = Instant::now();
    conn.send_bytes(&payload).await?;
    conn.read_ack(config.ack).await?;
    let client_to_server = start.elapsed();

    conn.read_vec(size).await?;
    conn.send_byte(config.ack).await?;

    let reported_nanos = conn.read_i64().await?;
    let reported_nanos = u64::try_from(reported_nanos)
        .map_err(|_| ProtocolError::violation(format!("server reported a negative duration of {} ns", reported_nanos)))?;

    let sample = ThroughputSample {
        client_to_server,
        server_to_client: Duration::from_nanos(reported_nanos),
    };
    debug!("throughput with {} bytes: {:?}", size, sample);
    Ok(sample)
}

/// Time sending `total_size` bytes in chunks of `chunk_size` bytes, waiting for the server's ACK
///  after each chunk. The last chunk holds the remainder if `total_size` is not a multiple of
///  `chunk_size`.
///
/// Use this on a [StreamConnection](crate::stream::StreamConnection) only: on the datagram
///  transport, every chunk below the large message threshold would be unprotected against loss.
pub async fn packet_transfer_test<C: Connection + ?Sized>(conn: &mut C, config: &ProbeConfig, total_size: usize, chunk_size: usize, rng: &mut impl RngCore) -> anyhow::Result<Duration> {
    ensure_connected(conn)?;
    if chunk_size == 0 && total_size > 0 {
        return Err(anyhow::anyhow!("chunk size must be positive"));
    }

    conn.send_header(&Header::new(RequestKind::AckRequest, wire_size(total_size)?, wire_size(chunk_size)?)).await?;
    let chunk = random_payload(chunk_size, rng);

    let start = Instant::now();
    let mut num_sent = 0;
    while num_sent < total_size {
        let len = chunk_size.min(total_size - num_sent);
        conn.send_bytes(&chunk[..len]).await?;
        conn.read_ack(config.ack).await?;
        num_sent += len;
    }
    let elapsed = start.elapsed();

    debug!("transfer of {} bytes in chunks of {}: {:?}", total_size, chunk_size, elapsed);
    Ok(elapsed)
}
