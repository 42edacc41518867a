//! # Node Client
//!
//! Purpose: Expose the cache-node verbs as a compact, blocking API over a
//! shared connection pool.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `NodeClient` hides pooling and protocol details.
//! 2. **Borrow-Friendly API**: Accept `&[u8]` to avoid unnecessary copies.
//! 3. **Fail Fast**: Protocol violations surface immediately as errors.
//! 4. **Shared Pools**: The pool comes from a [`PoolRegistry`], never owned.

use crate::error::{ClientError, ClientResult};
use crate::identity::NodeIdentity;
use crate::pipeline::Pipeline;
use crate::pool::ConnectionPool;
use crate::registry::PoolRegistry;
use crate::resp::RespValue;

/// Blocking client for one cache node.
///
/// Each call acquires a pooled connection, executes one command, and returns
/// the connection to the pool.
#[derive(Clone)]
pub struct NodeClient {
    identity: NodeIdentity,
    pool: ConnectionPool,
}

impl NodeClient {
    /// Builds a client whose pool is looked up (or created) in `registry`.
    pub fn new(identity: NodeIdentity, registry: &PoolRegistry) -> Self {
        let pool = registry.get_or_create(&identity);
        NodeClient { identity, pool }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn call(&self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let mut conn = self.pool.acquire()?;
        match conn.exec(args)? {
            RespValue::Error(message) => Err(ClientError::server(message)),
            reply => Ok(reply),
        }
    }

    /// Pings the node. Returns the raw reply payload.
    pub fn ping(&self) -> ClientResult<Vec<u8>> {
        match self.call(&[b"PING"])? {
            RespValue::Simple(text) => Ok(text),
            RespValue::Bulk(Some(data)) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Returns true when the key is present.
    pub fn exists(&self, key: &[u8]) -> ClientResult<bool> {
        match self.call(&[b"EXISTS", key])? {
            RespValue::Integer(count) => Ok(count > 0),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        match self.call(&[b"GET", key])? {
            RespValue::Bulk(data) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a value for a key without expiration.
    pub fn set(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        match self.call(&[b"SET", key, value])? {
            RespValue::Simple(_) => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a value only when the key is absent. Returns true when written.
    pub fn set_if_absent(&self, key: &[u8], value: &[u8]) -> ClientResult<bool> {
        reply_flag(self.call(&[b"SETNX", key, value])?)
    }

    /// Sets a value with an expiry only when the key is absent, in a single
    /// atomic `SET .. NX EX` command. Returns true when written.
    pub fn set_if_absent_with_expiry(&self, key: &[u8], value: &[u8], ttl_secs: u64) -> ClientResult<bool> {
        let (seconds, len) = encode_u64(ttl_secs);
        reply_flag(self.call(&[b"SET", key, value, b"NX", b"EX", &seconds[..len]])?)
    }

    /// Sets a value and attaches an expiration in seconds.
    pub fn set_with_expiry(&self, key: &[u8], value: &[u8], ttl_secs: u64) -> ClientResult<bool> {
        let (seconds, len) = encode_u64(ttl_secs);
        reply_flag(self.call(&[b"SETEX", key, &seconds[..len], value])?)
    }

    /// Sets a time-to-live on a key. Returns true when the TTL was set.
    pub fn expire(&self, key: &[u8], ttl_secs: u64) -> ClientResult<bool> {
        let (seconds, len) = encode_u64(ttl_secs);
        reply_flag(self.call(&[b"EXPIRE", key, &seconds[..len]])?)
    }

    /// Atomically adds `delta` to an integer value.
    ///
    /// A value the node cannot treat as an integer yields
    /// [`ClientError::Server`].
    pub fn increment(&self, key: &[u8], delta: i64) -> ClientResult<i64> {
        let delta = delta.to_string();
        match self.call(&[b"INCRBY", key, delta.as_bytes()])? {
            RespValue::Integer(value) => Ok(value),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Deletes keys. Returns the number of keys removed.
    pub fn delete(&self, keys: &[&[u8]]) -> ClientResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut args: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
        args.push(b"DEL");
        args.extend_from_slice(keys);
        match self.call(&args)? {
            RespValue::Integer(count) => Ok(count.max(0) as u64),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Lists keys matching a glob pattern.
    pub fn keys_matching(&self, pattern: &[u8]) -> ClientResult<Vec<Vec<u8>>> {
        match self.call(&[b"KEYS", pattern])? {
            RespValue::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    RespValue::Bulk(Some(key)) | RespValue::Simple(key) => Ok(key),
                    _ => Err(ClientError::UnexpectedResponse),
                })
                .collect(),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Renames a key, overwriting `new` when present.
    ///
    /// Fails with [`ClientError::NotFound`] when `old` does not exist.
    pub fn rename(&self, old: &[u8], new: &[u8]) -> ClientResult<()> {
        match self.call(&[b"RENAME", old, new]) {
            Ok(RespValue::Simple(_)) => Ok(()),
            Ok(_) => Err(ClientError::UnexpectedResponse),
            Err(ClientError::Server { message }) if is_missing_key(&message) => Err(ClientError::NotFound),
            Err(err) => Err(err),
        }
    }

    /// Removes every key in the selected database of this node.
    ///
    /// Not scoped by any key prefix or version.
    pub fn flush_all(&self) -> ClientResult<()> {
        match self.call(&[b"FLUSHDB"])? {
            RespValue::Simple(_) => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Fetches many keys in one round trip. Replies line up with `keys`.
    pub fn get_many(&self, keys: &[&[u8]]) -> ClientResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut args: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
        args.push(b"MGET");
        args.extend_from_slice(keys);
        match self.call(&args)? {
            RespValue::Array(items) if items.len() == keys.len() => items
                .into_iter()
                .map(|item| match item {
                    RespValue::Bulk(data) => Ok(data),
                    _ => Err(ClientError::UnexpectedResponse),
                })
                .collect(),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Starts a batch; nothing is sent until [`Pipeline::execute`].
    pub fn pipeline(&self) -> Pipeline<'_> {
        Pipeline::new(&self.pool)
    }
}

/// Decodes the boolean-ish replies of SETNX/SETEX/EXPIRE/SET NX.
pub(crate) fn reply_flag(reply: RespValue) -> ClientResult<bool> {
    match reply {
        RespValue::Integer(value) => Ok(value == 1),
        RespValue::Simple(_) => Ok(true),
        RespValue::Bulk(None) => Ok(false),
        RespValue::Error(message) => Err(ClientError::server(message)),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn is_missing_key(message: &[u8]) -> bool {
    String::from_utf8_lossy(message).to_ascii_lowercase().contains("no such key")
}

pub(crate) fn encode_u64(mut value: u64) -> ([u8; 20], usize) {
    // Stack buffer keeps conversion allocation-free.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        return (buf, 1);
    }
    while value > 0 {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
    }
    buf[..len].reverse();
    (buf, len)
}
