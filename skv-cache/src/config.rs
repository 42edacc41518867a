//! Configuration types for the sharded cache.

use std::time::Duration;

use serde::Deserialize;
use skv_client::{NodeAddress, NodeIdentity, ParserKind, PoolSettings};

use crate::error::{CacheError, CacheResult};

/// Main configuration for the sharded cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Node addresses: `host:port` or a unix socket path.
    pub servers: Vec<String>,

    /// Logical database index selected on every connection.
    pub db: u32,

    /// Optional node password.
    pub password: Option<String>,

    /// Reply parser variant name (`resp2`, `resp3`); `None` means default.
    pub parser: Option<String>,

    /// Namespace prefix placed in front of every key.
    pub key_prefix: String,

    /// Timeout in seconds used when a call passes none.
    pub default_timeout: i64,

    /// Version used when a call passes none.
    pub version: u64,

    /// Connection pool options.
    pub pool: PoolOptions,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            db: 1,
            password: None,
            parser: None,
            key_prefix: String::new(),
            default_timeout: 300,
            version: 1,
            pool: PoolOptions::default(),
        }
    }
}

/// Connection pool options as written in configuration files.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    pub max_idle: usize,
    pub max_total: usize,
    /// Socket read/write timeout; absent means block indefinitely.
    pub socket_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    /// Wait for a free connection at `max_total`; `null` waits indefinitely.
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        let settings = PoolSettings::default();
        Self {
            max_idle: settings.max_idle,
            max_total: settings.max_total,
            socket_timeout_ms: None,
            connect_timeout_ms: None,
            acquire_timeout_ms: settings.acquire_timeout.map(|timeout| timeout.as_millis() as u64),
        }
    }
}

impl CacheConfig {
    /// Config for the given servers with every other field defaulted.
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parses a JSON document and validates it.
    pub fn from_json(raw: &str) -> CacheResult<Self> {
        let config: CacheConfig =
            serde_json::from_str(raw).map_err(|err| CacheError::Configuration(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field that would otherwise fail on first use.
    pub fn validate(&self) -> CacheResult<()> {
        self.identities().map(|_| ())
    }

    pub fn parser_kind(&self) -> CacheResult<ParserKind> {
        match &self.parser {
            Some(name) => Ok(name.parse::<ParserKind>()?),
            None => Ok(ParserKind::default()),
        }
    }

    /// Resolves every server entry into a node identity.
    pub fn identities(&self) -> CacheResult<Vec<NodeIdentity>> {
        if self.servers.is_empty() {
            return Err(CacheError::Configuration("at least one server is required".to_string()));
        }
        let parser = self.parser_kind()?;
        self.servers
            .iter()
            .map(|server| -> CacheResult<NodeIdentity> {
                let address: NodeAddress = server.parse()?;
                Ok(NodeIdentity::new(address)
                    .with_db(self.db)
                    .with_password(self.password.clone())
                    .with_parser(parser))
            })
            .collect()
    }

    /// Pool settings for the registry that will serve this cache.
    pub fn pool_settings(&self) -> PoolSettings {
        let socket_timeout = self.pool.socket_timeout_ms.map(Duration::from_millis);
        PoolSettings {
            max_idle: self.pool.max_idle,
            max_total: self.pool.max_total.max(1),
            read_timeout: socket_timeout,
            write_timeout: socket_timeout,
            connect_timeout: self.pool.connect_timeout_ms.map(Duration::from_millis),
            acquire_timeout: self.pool.acquire_timeout_ms.map(Duration::from_millis),
        }
    }
}
