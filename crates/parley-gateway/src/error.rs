use thiserror::Error;

/// Relay failure taxonomy. Every variant is contained to the session that
/// hit it; none of them crosses into another user's session.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The connection handshake could not be resolved to a user identity.
    /// The session never starts and never touches the registry.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// A single inbound frame could not be parsed. Logged and skipped; the
    /// session keeps running.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The durable store rejected a write. The sender must be told — the
    /// message was not persisted.
    #[error("store write failed: {0}")]
    StoreWriteFailure(#[from] anyhow::Error),

    /// A live connection's transport broke or its outbound buffer is full.
    /// Triggers registry eviction, never a process-level error.
    #[error("recipient transport failed")]
    TransportFailed,
}
