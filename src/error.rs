//! Error types for PetraClient
//!
//! Only configuration mistakes and total loss of the server set reach the
//! caller. Everything that goes wrong on the wire degrades to a miss or an
//! unconfirmed write and is reported through logs and metrics instead.

use thiserror::Error;

/// Main error type for PetraClient
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("No servers configured")]
    NoServers,

    #[error("No memcached servers available")]
    NoServerAvailable,

    #[error("Invalid ttl {0}: must be 0, at most 30 days, or a future Unix timestamp")]
    InvalidTtl(u64),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Cache is read-only")]
    ReadOnly,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while restoring a stored payload into a [`Value`](crate::codec::Value)
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid escape sequence at byte {0}")]
    Escape(usize),

    #[error("Decompression failed: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("Deserialization failed: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error("Not a numeric value")]
    NotNumeric,
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            CacheError::NoServerAvailable.to_string(),
            "No memcached servers available"
        );
        assert!(CacheError::InvalidTtl(99_999_999).to_string().contains("99999999"));
        assert_eq!(CodecError::NotNumeric.to_string(), "Not a numeric value");
    }
}
