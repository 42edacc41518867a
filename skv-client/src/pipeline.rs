//! # Pipelines
//!
//! Commands are encoded into one buffer as they are queued and written to a
//! single pooled connection on [`Pipeline::execute`]. Replies come back in
//! submission order. There is no MULTI/EXEC wrapping: other clients may
//! observe the batch half-applied.

use crate::client::encode_u64;
use crate::error::ClientResult;
use crate::pool::ConnectionPool;
use crate::resp::{encode_command, RespValue};

/// Queued batch of commands for one node.
pub struct Pipeline<'a> {
    pool: &'a ConnectionPool,
    buf: Vec<u8>,
    count: usize,
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(pool: &'a ConnectionPool) -> Self {
        Pipeline {
            pool,
            buf: Vec::with_capacity(512),
            count: 0,
        }
    }

    /// Queues an arbitrary command.
    pub fn command(&mut self, args: &[&[u8]]) -> &mut Self {
        encode_command(args, &mut self.buf);
        self.count += 1;
        self
    }

    pub fn get(&mut self, key: &[u8]) -> &mut Self {
        self.command(&[b"GET", key])
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        self.command(&[b"SET", key, value])
    }

    pub fn set_if_absent(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        self.command(&[b"SETNX", key, value])
    }

    pub fn set_if_absent_with_expiry(&mut self, key: &[u8], value: &[u8], ttl_secs: u64) -> &mut Self {
        let (seconds, len) = encode_u64(ttl_secs);
        self.command(&[b"SET", key, value, b"NX", b"EX", &seconds[..len]])
    }

    pub fn set_with_expiry(&mut self, key: &[u8], value: &[u8], ttl_secs: u64) -> &mut Self {
        let (seconds, len) = encode_u64(ttl_secs);
        self.command(&[b"SETEX", key, &seconds[..len], value])
    }

    pub fn expire(&mut self, key: &[u8], ttl_secs: u64) -> &mut Self {
        let (seconds, len) = encode_u64(ttl_secs);
        self.command(&[b"EXPIRE", key, &seconds[..len]])
    }

    pub fn increment(&mut self, key: &[u8], delta: i64) -> &mut Self {
        let delta = delta.to_string();
        self.command(&[b"INCRBY", key, delta.as_bytes()])
    }

    pub fn delete(&mut self, key: &[u8]) -> &mut Self {
        self.command(&[b"DEL", key])
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Sends every queued command and returns one reply per command.
    ///
    /// Per-command error replies come back as [`RespValue::Error`]; only
    /// transport and framing failures fail the whole call.
    pub fn execute(self) -> ClientResult<Vec<RespValue>> {
        if self.count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.acquire()?;
        conn.exec_encoded(&self.buf, self.count)
    }
}
