use crate::protocol::ProtocolError;
use crate::transport::TransportKind;

/// Failures while establishing or running one physical connection.
///
/// None of these reach UI callers directly: open failures surface as
/// `ConnectionState::Disconnected`, drops as `Reconnecting`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("negotiation failed: {0}")]
    Negotiate(String),

    #[error("server does not offer the {0} transport")]
    Unavailable(TransportKind),

    #[error("{kind} connect failed: {message}")]
    Connect {
        kind: TransportKind,
        message: String,
    },

    #[error("handshake failed: {0}")]
    Handshake(#[from] ProtocolError),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("server closed the connection: {0}")]
    ServerClosed(String),

    #[error("no transport configured")]
    NoTransport,

    #[error("session was already opened")]
    AlreadyOpened,

    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn connect(kind: TransportKind, err: impl std::fmt::Display) -> Self {
        Self::Connect {
            kind,
            message: err.to_string(),
        }
    }

    pub fn lost(err: impl std::fmt::Display) -> Self {
        Self::ConnectionLost(err.to_string())
    }
}
