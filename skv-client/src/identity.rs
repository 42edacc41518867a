//! # Node Identity
//!
//! Purpose: Describe exactly which node endpoint and session a pool serves.
//! Two identical identities always share one pool in the registry.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ClientError;

/// Where a node listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeAddress {
    /// TCP endpoint, e.g. "127.0.0.1:6379".
    Tcp { host: String, port: u16 },
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl FromStr for NodeAddress {
    type Err = ClientError;

    /// Parses `host:port`; anything without a colon is a socket path.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ClientError::InvalidAddress(raw.to_string()));
        }
        match raw.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ClientError::InvalidAddress(format!("port must be an integer: {raw}")))?;
                if host.is_empty() {
                    return Err(ClientError::InvalidAddress(raw.to_string()));
                }
                Ok(NodeAddress::Tcp {
                    host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
                    port,
                })
            }
            None => Ok(NodeAddress::Unix(PathBuf::from(raw))),
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeAddress::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            NodeAddress::Tcp { host, port } => write!(f, "{}:{}", host, port),
            NodeAddress::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Reply parser variant negotiated with the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ParserKind {
    /// RESP2 replies, no protocol negotiation.
    #[default]
    Resp2,
    /// RESP3 replies, negotiated with `HELLO 3` on connect.
    Resp3,
}

impl FromStr for ParserKind {
    type Err = ClientError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "default" | "resp2" => Ok(ParserKind::Resp2),
            "resp3" => Ok(ParserKind::Resp3),
            _ => Err(ClientError::UnknownParser(raw.to_string())),
        }
    }
}

/// Full identity of a node session; the registry lookup key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
    pub address: NodeAddress,
    /// Logical database index selected after connect.
    pub db: u32,
    pub password: Option<String>,
    pub parser: ParserKind,
}

impl NodeIdentity {
    /// Identity with db 0, no password, and the default parser.
    pub fn new(address: NodeAddress) -> Self {
        NodeIdentity {
            address,
            db: 0,
            password: None,
            parser: ParserKind::default(),
        }
    }

    pub fn with_db(mut self, db: u32) -> Self {
        self.db = db;
        self
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    pub fn with_parser(mut self, parser: ParserKind) -> Self {
        self.parser = parser;
        self
    }
}

// Password stays out of logs.
impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("address", &self.address)
            .field("db", &self.db)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("parser", &self.parser)
            .finish()
    }
}
