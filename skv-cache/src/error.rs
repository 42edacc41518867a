//! Error types for the sharded cache.

use skv_client::ClientError;
use thiserror::Error;

/// Result type alias for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Main error type for the sharded cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Bad node address, port, db, parser name, or an empty node set.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The key an operation depends on does not exist.
    #[error("key not found: {0}")]
    NotFound(String),

    /// The node rejected the command (e.g. increment on a non-integer).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport-level failure; not retried here.
    #[error("connection error: {0}")]
    Connection(ClientError),

    /// Value could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Caller passed an argument the operation cannot honor.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<ClientError> for CacheError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Server { message } => CacheError::Protocol(String::from_utf8_lossy(&message).into_owned()),
            ClientError::NotFound => CacheError::NotFound("no such key".to_string()),
            ClientError::InvalidAddress(addr) => CacheError::Configuration(format!("invalid address: {addr}")),
            ClientError::UnknownParser(name) => {
                CacheError::Configuration(format!("could not find parser variant '{name}'"))
            }
            other => CacheError::Connection(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_client_errors_onto_taxonomy() {
        let err: CacheError = ClientError::Server {
            message: b"ERR value is not an integer".to_vec(),
        }
        .into();
        assert!(matches!(err, CacheError::Protocol(ref msg) if msg.contains("not an integer")));

        let err: CacheError = ClientError::NotFound.into();
        assert!(matches!(err, CacheError::NotFound(_)));

        let err: CacheError = ClientError::PoolExhausted.into();
        assert!(matches!(err, CacheError::Connection(ClientError::PoolExhausted)));

        let err: CacheError = ClientError::UnknownParser("fast".to_string()).into();
        assert!(matches!(err, CacheError::Configuration(_)));
    }
}
