//! # Sharded-Cache Node Client
//!
//! Purpose: Provide a lightweight, synchronous client for one cache node,
//! with connection pools shared through an explicit registry.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse connections to avoid repeated connects.
//! 2. **Explicit Registry**: Pools are keyed by [`NodeIdentity`] in a
//!    [`PoolRegistry`] the caller constructs and passes around.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Protocol Clarity**: Encode/parse RESP explicitly for correctness.

mod client;
mod error;
mod identity;
mod pipeline;
mod pool;
mod registry;
mod resp;

pub use client::NodeClient;
pub use error::{ClientError, ClientResult};
pub use identity::{NodeAddress, NodeIdentity, ParserKind};
pub use pipeline::Pipeline;
pub use pool::{ConnectionPool, PoolSettings, PooledConnection, DEFAULT_ACQUIRE_TIMEOUT};
pub use registry::PoolRegistry;
pub use resp::RespValue;
