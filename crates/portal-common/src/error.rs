//! Common error taxonomy for Portal.

use thiserror::Error;

/// Result type alias using Portal's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Portal operations.
///
/// Fatal stream errors terminate the owning channel; manager operations
/// return these as values and never abort the process.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any failure during the Noise handshake: framing, cipher, ALPN,
    /// identity binding. Responders close silently; initiators surface
    /// this generic kind.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Operation attempted on a closed channel.
    #[error("channel closed")]
    ChannelClosed,

    /// Auth-tag failure or malformed frame after the handshake. Terminal
    /// for the channel.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Oversized length prefix or short ciphertext.
    #[error("framing error: {0}")]
    Framing(String),

    /// Lease registration/refresh rejected.
    #[error("lease rejected: {0}")]
    LeaseRejected(String),

    /// Connection limit reached. Transient.
    #[error("connection limit exceeded")]
    LimitExceeded,

    /// Token bucket could not satisfy the request in time. Transient.
    #[error("rate limited")]
    RateLimited,

    /// Bad secret key or locked IP.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// No route registered for the extracted SNI.
    #[error("no route for sni: {0}")]
    SniNotMatched(String),

    /// TLS peek did not find a ClientHello carrying an SNI.
    #[error("no sni or not a client hello")]
    NoSni,

    /// The multipath router has no active path.
    #[error("no path available")]
    PathUnavailable,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a handshake error from any displayable type.
    pub fn handshake(msg: impl std::fmt::Display) -> Self {
        Self::Handshake(msg.to_string())
    }

    /// Create a decryption error from any displayable type.
    pub fn decryption(msg: impl std::fmt::Display) -> Self {
        Self::Decryption(msg.to_string())
    }

    /// Create a framing error from any displayable type.
    pub fn framing(msg: impl std::fmt::Display) -> Self {
        Self::Framing(msg.to_string())
    }

    /// Create a lease-rejection error from any displayable type.
    pub fn lease_rejected(msg: impl std::fmt::Display) -> Self {
        Self::LeaseRejected(msg.to_string())
    }

    /// Create an auth error from any displayable type.
    pub fn auth(msg: impl std::fmt::Display) -> Self {
        Self::Auth(msg.to_string())
    }

    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}
