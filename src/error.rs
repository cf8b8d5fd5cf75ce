use std::fmt::{Display, Formatter};

/// Failure kinds of the probe protocol. They are raised as `anyhow::Error` and can be recovered
///  with `downcast_ref::<ProtocolError>()`.
///
/// All of them are fatal for the connection they occur on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// I/O was attempted on a direction that is not established (or already closed). The network
    ///  is not touched in this case.
    ConnectionInactive,
    /// The peer closed the connection in the middle of a read, or a read timed out unexpectedly
    ReadFailure(String),
    /// The peer sent something that does not fit the protocol: unknown request kind, invalid
    ///  sizes, a missing ACK, out-of-range packet numbers etc.
    ProtocolViolation(String),
    /// The datagram listener never received the connector's handshake byte
    HandshakeFailure(String),
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::ConnectionInactive => write!(f, "connection is inactive"),
            ProtocolError::ReadFailure(msg) => write!(f, "read failure: {}", msg),
            ProtocolError::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            ProtocolError::HandshakeFailure(msg) => write!(f, "handshake failure: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl ProtocolError {
    pub fn read_failure(e: impl Display) -> ProtocolError {
        ProtocolError::ReadFailure(e.to_string())
    }

    pub fn violation(msg: impl Into<String>) -> ProtocolError {
        ProtocolError::ProtocolViolation(msg.into())
    }

    /// convenience for tests and callers that need to branch on the failure kind
    pub fn of(e: &anyhow::Error) -> Option<&ProtocolError> {
        e.downcast_ref::<ProtocolError>()
    }
}
