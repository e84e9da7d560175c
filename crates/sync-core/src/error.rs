//! Error types shared by the sync protocol crates.

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Sync protocol error taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    /// JSON (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A received beacon or wire message could not be parsed
    #[error("malformed beacon: {0}")]
    MalformedBeacon(String),

    /// A signature did not verify
    #[error("invalid signature")]
    InvalidSignature,

    /// A public key was the wrong length or otherwise malformed
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Peer claims a different user_id than ours
    #[error("peer belongs to a different user")]
    WrongUser,

    /// Challenge/response authentication failed
    #[error("unauthorized")]
    Unauthorized,

    /// AEAD decryption failed (wrong key or tampered ciphertext)
    #[error("decryption failed")]
    DecryptionFailed,

    /// Underlying network I/O or transport error
    #[error("network error: {0}")]
    NetworkError(String),

    /// An operation did not complete within its deadline
    #[error("timeout")]
    Timeout,

    /// Durable storage failure
    #[error("storage error: {0}")]
    StorageError(String),

    /// Two distinct events hashed to the same prefix
    #[error("hash collision on {0}")]
    HashCollision(String),
}
