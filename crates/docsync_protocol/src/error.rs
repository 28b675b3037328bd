//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while framing or interpreting messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Frame could not be decoded.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// A required property is absent.
    #[error("missing property: {0}")]
    MissingProperty(String),

    /// A property has an unusable value.
    #[error("invalid property {name}: {value:?}")]
    InvalidProperty {
        /// Property name.
        name: String,
        /// Offending value.
        value: String,
    },

    /// A message body could not be interpreted.
    #[error("invalid body: {0}")]
    InvalidBody(String),

    /// The profile is not one this protocol knows.
    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    /// The message was not the expected profile.
    #[error("expected profile {expected}, got {actual}")]
    UnexpectedProfile {
        /// Expected profile.
        expected: &'static str,
        /// Actual profile.
        actual: String,
    },

    /// Compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(String),
}

impl ProtocolError {
    /// Creates an invalid-property error.
    pub fn invalid(name: &str, value: &str) -> Self {
        ProtocolError::InvalidProperty {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    /// HTTP-style status reported when the peer sent something malformed.
    pub fn status_code(&self) -> u16 {
        match self {
            ProtocolError::UnknownProfile(_) => 404,
            ProtocolError::Encoding(_) | ProtocolError::Compression(_) => 500,
            _ => 400,
        }
    }
}
