//! # Sharded Cache
//!
//! Purpose: One logical key-value cache spread over a pool of independent
//! cache nodes. Each key is routed to exactly one node by consistent hashing;
//! batch calls fan out per node and merge the replies.
//!
//! ## Design Principles
//! 1. **Explicit Wiring**: Connection pools live in a caller-owned
//!    [`PoolRegistry`]; nothing is a process-wide singleton.
//! 2. **Tagged Values**: [`CacheValue`] decides at the call site whether a
//!    value is a native integer or a serialized payload.
//! 3. **Stable Routing**: Node labels, not insertion order, define the ring.
//! 4. **Honest Contracts**: Non-atomic paths (`add`, the `incr` fallback,
//!    cross-node batches) are documented as such.
//!
//! ## Usage
//!
//! ```no_run
//! use skv_cache::{Cache, CacheConfig, PoolRegistry};
//!
//! let config = CacheConfig::from_json(r#"{"servers": ["127.0.0.1:6379", "127.0.0.1:6380"]}"#)?;
//! let registry = PoolRegistry::new(config.pool_settings());
//! let cache = Cache::new(&config, &registry)?;
//! cache.set("greeting", "hello", Some(60.0), None)?;
//! let greeting: Option<String> = cache.get_as("greeting", None)?;
//! # Ok::<(), skv_cache::CacheError>(())
//! ```

mod cache;
mod config;
mod error;
mod key;
mod sharder;
mod value;

pub use cache::Cache;
pub use config::{CacheConfig, PoolOptions};
pub use error::{CacheError, CacheResult};
pub use key::{CacheKey, EncodedKey, KeyCodec};
pub use sharder::{Sharder, POINTS_PER_NODE};
pub use value::{decode_on_read, deserialize, serialize, CacheValue};

pub use skv_client::{NodeClient, PoolRegistry, PoolSettings};
