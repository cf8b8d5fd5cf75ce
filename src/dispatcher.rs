//! The server side of a session: read a request header, consume the request's payload in chunks
//!  of the declared size, and answer each chunk as the request kind prescribes.

use std::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::ProbeConfig;
use crate::connection::{Connection, ConnectionExt};
use crate::error::ProtocolError;
use crate::header::{Header, RequestKind};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReplyOutcome {
    /// a request was answered completely, the session continues
    Served,
    /// the peer announced the end of the session
    Closed,
}

/// how each chunk of a request's payload is answered
enum ChunkReply {
    Ack,
    Echo,
    /// ACK, then echo the chunk and report the nanoseconds until the peer's ACK
    TimedEcho,
}

/// check a header's sizes and return them as total byte count and chunk size
fn validated_sizes(header: &Header, config: &ProbeConfig) -> anyhow::Result<(usize, usize)> {
    let total = usize::try_from(header.total_byte_count)
        .map_err(|_| ProtocolError::violation(format!("negative total byte count {}", header.total_byte_count)))?;
    if total > config.max_request_size {
        return Err(ProtocolError::violation(format!("total byte count {} exceeds the maximum of {}", total, config.max_request_size)).into());
    }
    if total > 0 && header.chunk_size <= 0 {
        return Err(ProtocolError::violation(format!("chunk size {} for a total byte count of {}", header.chunk_size, total)).into());
    }
    Ok((total, header.chunk_size.max(0) as usize))
}

/// Read one request and answer it completely
pub async fn reply<C: Connection + ?Sized>(conn: &mut C, config: &ProbeConfig) -> anyhow::Result<ReplyOutcome> {
    let header = conn.read_header().await?;
    let chunk_reply = match header.request_kind {
        RequestKind::CloseConnection => {
            debug!("peer closed the session");
            return Ok(ReplyOutcome::Closed);
        }
        RequestKind::AckRequest => ChunkReply::Ack,
        RequestKind::EchoRequest => ChunkReply::Echo,
        RequestKind::ThroughputMetricsRequest => ChunkReply::TimedEcho,
    };

    let (total, chunk_size) = validated_sizes(&header, config)?;
    debug!("serving {:?}: {} bytes in chunks of {}", header.request_kind, total, chunk_size);

    let mut num_read = 0;
    while num_read < total {
        let chunk = conn.read_vec(chunk_size.min(total - num_read)).await?;
        num_read += chunk.len();
        trace!("received chunk of {} bytes, {} of {}", chunk.len(), num_read, total);

        match chunk_reply {
            ChunkReply::Ack => {
                conn.send_byte(config.ack).await?;
            }
            ChunkReply::Echo => {
                conn.send_bytes(&chunk).await?;
            }
            ChunkReply::TimedEcho => {
                conn.send_byte(config.ack).await?;
                let start = Instant::now();
                conn.send_bytes(&chunk).await?;
                conn.read_ack(config.ack).await?;
                let nanos = start.elapsed().as_nanos();
                conn.send_i64(i64::try_from(nanos).unwrap_or(i64::MAX)).await?;
            }
        }
    }
    Ok(ReplyOutcome::Served)
}

/// Answer requests until the peer closes the session, returning the number of requests served.
///  The connection is closed afterwards, also if serving failed.
pub async fn serve_requests<C: Connection + ?Sized>(conn: &mut C, config: &ProbeConfig) -> anyhow::Result<usize> {
    let mut num_served = 0;
    let result = loop {
        match reply(conn, config).await {
            Ok(ReplyOutcome::Served) => num_served += 1,
            Ok(ReplyOutcome::Closed) => break Ok(num_served),
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = conn.close().await {
        warn!("error closing connection: {}", e);
    }
    result
}
