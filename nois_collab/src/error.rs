use thiserror::Error;

use crate::protocol::ErrorCode;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad frame length {0}")]
    Framing(u32),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("connection closed by remote")]
    ConnectionClosed,
    #[error("not connected")]
    NotConnected,
    #[error("operation not permitted for this role")]
    NotAuthorized,
    #[error("session is not active")]
    SessionClosed,
    #[error("server error {code:?}: {description}")]
    Server { code: ErrorCode, description: String },
    #[error("timed out waiting for acknowledgement")]
    AckTimeout,
}
