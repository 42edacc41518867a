//! Error types for the node client.

use thiserror::Error;

/// Result type for the node client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the node client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// RESP framing or parse error.
    #[error("protocol error")]
    Protocol,
    /// Server returned an error reply.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Server { message: Vec<u8> },
    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// Pool is at capacity and no idle connections are available.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Address could not be parsed or resolved.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// Parser variant name is not recognized.
    #[error("unknown parser variant: {0}")]
    UnknownParser(String),
    /// The key a command depends on does not exist.
    #[error("no such key")]
    NotFound,
}

impl ClientError {
    /// Returns true when the node answered with an error reply, as opposed to
    /// a transport or framing failure.
    pub fn is_server_error(&self) -> bool {
        matches!(self, ClientError::Server { .. })
    }

    pub(crate) fn server(message: Vec<u8>) -> Self {
        ClientError::Server { message }
    }
}
