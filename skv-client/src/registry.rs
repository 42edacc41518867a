//! # Pool Registry
//!
//! Purpose: Hand out one shared [`ConnectionPool`] per [`NodeIdentity`] so
//! building many clients for the same node does not multiply sockets.
//!
//! The registry is an ordinary value: construct it at startup and pass it by
//! reference to every [`NodeClient`](crate::NodeClient) constructor. Entries
//! are never evicted; pools are dropped together with the registry and the
//! clients that still hold them.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::identity::NodeIdentity;
use crate::pool::{ConnectionPool, PoolSettings};

/// Identity-keyed pool cache.
pub struct PoolRegistry {
    settings: PoolSettings,
    pools: Mutex<HashMap<NodeIdentity, ConnectionPool>>,
}

impl PoolRegistry {
    pub fn new(settings: PoolSettings) -> Self {
        PoolRegistry {
            settings,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Returns the pool for `identity`, creating it on first request.
    ///
    /// Lookup and insert happen under one lock so concurrent callers asking
    /// for the same new identity receive the same pool.
    pub fn get_or_create(&self, identity: &NodeIdentity) -> ConnectionPool {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(identity) {
            return pool.clone();
        }
        debug!(node = %identity.address, db = identity.db, "creating connection pool");
        let pool = ConnectionPool::new(identity.clone(), self.settings.clone());
        pools.insert(identity.clone(), pool.clone());
        pool
    }

    /// Number of distinct pools created so far.
    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        PoolRegistry::new(PoolSettings::default())
    }
}
