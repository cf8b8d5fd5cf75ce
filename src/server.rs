//! Listening endpoints for both transports. Sessions are served one after the other. A failing
//!  session is logged and does not stop the server.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use crate::config::ProbeConfig;
use crate::datagram::DatagramListener;
use crate::dispatcher::serve_requests;
use crate::stream::StreamConnection;

/// Accept stream connections and serve each of them until its peer closes it. `max_connections`
///  limits the number of connections before the server returns, `None` serves forever.
pub async fn serve_stream(config: Arc<ProbeConfig>, listener: TcpListener, max_connections: Option<usize>) -> anyhow::Result<()> {
    info!("serving stream connections on {:?}", listener.local_addr()?);

    let mut num_connections = 0;
    while max_connections.map_or(true, |max| num_connections < max) {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("error accepting a stream connection: {}", e);
                continue;
            }
        };
        num_connections += 1;

        info!("serving stream connection from {:?}", peer_addr);
        let mut conn = StreamConnection::from_tcp(stream);
        match serve_requests(&mut conn, &config).await {
            Ok(num_requests) => info!("stream connection from {:?} closed after {} requests", peer_addr, num_requests),
            Err(e) => error!("stream connection from {:?} failed: {}", peer_addr, e),
        }
    }
    Ok(())
}

/// Serve datagram sessions one after the other. The socket of a session is bound to its peer, so
///  after a session ends, a fresh socket is bound to the same address for the next one.
///  `max_sessions` works like `max_connections` for [serve_stream].
pub async fn serve_datagram(config: Arc<ProbeConfig>, listener: DatagramListener, max_sessions: Option<usize>) -> anyhow::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!("serving datagram sessions on {:?}", addr);

    let mut listener = Some(listener);
    let mut num_sessions = 0;
    while max_sessions.map_or(true, |max| num_sessions < max) {
        let current = match listener.take() {
            Some(l) => l,
            None => DatagramListener::bind(config.clone(), addr).await?,
        };

        let mut conn = match current.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("datagram handshake failed: {}", e);
                continue;
            }
        };
        num_sessions += 1;

        let peer_addr = conn.peer_addr();
        match serve_requests(&mut conn, &config).await {
            Ok(num_requests) => info!("datagram session with {:?} closed after {} requests", peer_addr, num_requests),
            Err(e) => error!("datagram session with {:?} failed: {}", peer_addr, e),
        }
    }
    Ok(())
}
