//! Shared error types for the handshake and engine layers. Module-local
//! errors that callers need to match on live here; everything else
//! propagates as `anyhow::Error` with added context at each layer.

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake connection timed out")]
    Timeout,
    #[error("peer closed the connection before completing the handshake")]
    ConnectionClosed,
    #[error("malformed join request: {0}")]
    MalformedRequest(serde_json::Error),
    #[error("session {0} is busy and not accepting new clients")]
    SessionBusy(Uuid),
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("transfer was cancelled")]
    Cancelled,
    #[error(transparent)]
    Wire(#[from] crate::wire::WireError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
