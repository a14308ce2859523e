// Error taxonomy for everything above the crypto-provider layer. Crypto
// leaf errors (`crate::error::CryptoError`) fold into `CryptoError` here at
// the component boundary.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessengerError {
    #[error("cryptography error: {0}")]
    CryptoError(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("session error: {0}")]
    SessionError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("denied: {0}")]
    Denied(String),

    #[error("busy, retry: {0}")]
    Busy(String),

    #[error("corrupted state: {0}")]
    Corrupted(String),

    #[error("version mismatch: {0}")]
    VersionMismatch(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("ratchet out of sync: {0}")]
    OutOfSync(String),

    #[error("too many skipped messages: {0}")]
    TooManySkipped(String),

    #[error("transport closed: {0}")]
    TransportClosed(String),

    #[error("backpressure: {0}")]
    Backpressure(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("file hash mismatch: {0}")]
    HashMismatch(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<crate::error::CryptoError> for MessengerError {
    fn from(error: crate::error::CryptoError) -> Self {
        MessengerError::CryptoError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MessengerError>;
