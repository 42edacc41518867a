//! # Cache Facade
//!
//! Purpose: Present one logical key-value cache over many independent nodes.
//!
//! ## Flow
//! ```text
//! caller key ──► KeyCodec ──► EncodedKey ──► Sharder ──► NodeClient ──► node
//!                                                                        │
//! caller value ◄── CacheValue ◄── decode_on_read ◄── raw bytes ◄─────────┘
//! ```
//!
//! ## Consistency notes
//! - Batch calls (`get_many`, `set_many`, `delete_many`) issue one request
//!   per node touched. There is no cross-node atomicity: if one node fails
//!   the nodes already written stay written and the error is returned.
//! - `add` checks existence and then writes with a conditional set. Another
//!   writer can slip in between; the conditional set still refuses to
//!   overwrite, so the race only decides which writer wins.
//! - `incr` falls back to read-modify-write when the node refuses the native
//!   increment. That fallback is not atomic under concurrent incrementers.
//! - `clear` flushes whole node databases, including keys of other prefixes
//!   and versions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use skv_client::{NodeClient, NodeIdentity, ParserKind, Pipeline, PoolRegistry, RespValue};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::key::{CacheKey, EncodedKey, KeyCodec};
use crate::sharder::Sharder;
use crate::value::{decode_on_read, CacheValue};

/// How a single write is issued, after timeout resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePlan {
    /// Negative timeout: nothing is stored.
    Skip,
    Set,
    SetIfAbsent,
    SetWithExpiry(u64),
    SetIfAbsentWithExpiry(u64),
}

/// Session settings applied to nodes registered after construction.
#[derive(Debug, Clone)]
struct NodeTemplate {
    db: u32,
    password: Option<String>,
    parser: ParserKind,
}

/// Sharded cache over a set of nodes.
///
/// Timeouts are in seconds: `None` uses the configured default, `0` stores
/// without expiry, negative values store nothing, and fractions are
/// truncated.
pub struct Cache {
    keys: KeyCodec,
    default_timeout: i64,
    template: NodeTemplate,
    nodes: RwLock<Sharder<Arc<NodeClient>>>,
}

impl Cache {
    /// Builds a cache whose node clients draw their pools from `registry`.
    ///
    /// Every configuration problem is reported here rather than on first use.
    /// Pool limits and I/O timeouts belong to the registry: build it with
    /// [`CacheConfig::pool_settings`] or `config.pool` has no effect. A
    /// mismatch is logged.
    pub fn new(config: &CacheConfig, registry: &PoolRegistry) -> CacheResult<Self> {
        let identities = config.identities()?;
        if !registry_matches(config, registry) {
            warn!(
                configured = ?config.pool_settings(),
                registry = ?registry.settings(),
                "registry pool settings differ from config.pool; the registry's apply"
            );
        }
        let mut sharder = Sharder::new();
        for identity in identities {
            let label = identity.address.to_string();
            sharder.add(Arc::new(NodeClient::new(identity, registry)), label)?;
        }
        info!(nodes = sharder.len(), prefix = %config.key_prefix, "cache configured");

        Ok(Cache {
            keys: KeyCodec::new(config.key_prefix.clone(), config.version),
            default_timeout: config.default_timeout,
            template: NodeTemplate {
                db: config.db,
                password: config.password.clone(),
                parser: config.parser_kind()?,
            },
            nodes: RwLock::new(sharder),
        })
    }

    /// Encodes a key the way every operation on this cache does.
    pub fn make_key<K: CacheKey + ?Sized>(&self, key: &K, version: Option<u64>) -> EncodedKey {
        self.keys.make_key(key, version)
    }

    /// Registers another node. Roughly `1/N` of existing keys move to it.
    pub fn add_node(&self, address: &str, registry: &PoolRegistry) -> CacheResult<()> {
        let identity = NodeIdentity::new(address.parse()?)
            .with_db(self.template.db)
            .with_password(self.template.password.clone())
            .with_parser(self.template.parser);
        let label = identity.address.to_string();
        let client = Arc::new(NodeClient::new(identity, registry));
        self.nodes.write().add(client, label.clone())?;
        info!(node = %label, "node added");
        Ok(())
    }

    /// Unregisters a node by label. Returns false when no such node exists.
    pub fn remove_node(&self, label: &str) -> bool {
        let removed = self.nodes.write().remove(label).is_some();
        if removed {
            info!(node = %label, "node removed");
        }
        removed
    }

    /// Labels of the registered nodes.
    pub fn nodes(&self) -> Vec<String> {
        self.nodes.read().labels().map(str::to_string).collect()
    }

    /// Label of the node that owns `key`.
    pub fn node_for<K: CacheKey + ?Sized>(&self, key: &K, version: Option<u64>) -> CacheResult<String> {
        let encoded = self.make_key(key, version);
        let nodes = self.nodes.read();
        let label = nodes.get_label(encoded.raw_key().as_bytes())?.to_string();
        Ok(label)
    }

    /// Routing ignores prefix and version so every version of a key shares a
    /// node.
    fn client_for(&self, key: &EncodedKey) -> CacheResult<Arc<NodeClient>> {
        let nodes = self.nodes.read();
        let client = nodes.get_client(key.raw_key().as_bytes())?.clone();
        Ok(client)
    }

    fn all_clients(&self) -> Vec<Arc<NodeClient>> {
        self.nodes.read().clients().cloned().collect()
    }

    /// Groups items by owning node, keeping each group's input order.
    fn partition<T>(&self, items: Vec<(EncodedKey, T)>) -> CacheResult<Vec<(Arc<NodeClient>, Vec<(EncodedKey, T)>)>> {
        let nodes = self.nodes.read();
        let mut groups: BTreeMap<usize, Vec<(EncodedKey, T)>> = BTreeMap::new();
        for (key, item) in items {
            let idx = nodes.locate(key.raw_key().as_bytes())?;
            groups.entry(idx).or_default().push((key, item));
        }
        let mut partitioned = Vec::with_capacity(groups.len());
        for (idx, group) in groups {
            let client = nodes
                .client(idx)
                .cloned()
                .ok_or_else(|| CacheError::Configuration(format!("node index {idx} vanished")))?;
            partitioned.push((client, group));
        }
        Ok(partitioned)
    }

    /// Non-finite or out-of-range timeouts are rejected.
    fn plan(&self, timeout: Option<f64>, add_only: bool) -> CacheResult<WritePlan> {
        let seconds = match timeout {
            Some(timeout) if !timeout.is_finite() || timeout.abs() >= i64::MAX as f64 => {
                return Err(CacheError::InvalidArgument(format!("timeout {timeout} is not a valid number of seconds")));
            }
            Some(timeout) => timeout as i64,
            None => self.default_timeout,
        };
        Ok(match (seconds, add_only) {
            (s, _) if s < 0 => WritePlan::Skip,
            (0, false) => WritePlan::Set,
            (0, true) => WritePlan::SetIfAbsent,
            (s, false) => WritePlan::SetWithExpiry(s as u64),
            (s, true) => WritePlan::SetIfAbsentWithExpiry(s as u64),
        })
    }

    fn store(&self, client: &NodeClient, key: &EncodedKey, value: &CacheValue, plan: WritePlan) -> CacheResult<bool> {
        let payload = value.to_wire();
        let key = key.as_bytes();
        let stored = match plan {
            WritePlan::Skip => false,
            WritePlan::Set => {
                client.set(key, &payload)?;
                true
            }
            WritePlan::SetIfAbsent => client.set_if_absent(key, &payload)?,
            WritePlan::SetWithExpiry(ttl) => client.set_with_expiry(key, &payload, ttl)?,
            WritePlan::SetIfAbsentWithExpiry(ttl) => client.set_if_absent_with_expiry(key, &payload, ttl)?,
        };
        Ok(stored)
    }

    fn queue(pipeline: &mut Pipeline<'_>, key: &EncodedKey, value: &CacheValue, plan: WritePlan) {
        let payload = value.to_wire();
        let key = key.as_bytes();
        match plan {
            WritePlan::Skip => {}
            WritePlan::Set => {
                pipeline.set(key, &payload);
            }
            WritePlan::SetIfAbsent => {
                pipeline.set_if_absent(key, &payload);
            }
            WritePlan::SetWithExpiry(ttl) => {
                pipeline.set_with_expiry(key, &payload, ttl);
            }
            WritePlan::SetIfAbsentWithExpiry(ttl) => {
                pipeline.set_if_absent_with_expiry(key, &payload, ttl);
            }
        }
    }

    /// Stores `value` only when the key is absent.
    ///
    /// Returns false when the key already exists or the timeout is negative.
    /// Not linearizable: the existence check and the conditional write are
    /// two round trips.
    pub fn add<K: CacheKey + ?Sized>(
        &self,
        key: &K,
        value: impl Into<CacheValue>,
        timeout: Option<f64>,
        version: Option<u64>,
    ) -> CacheResult<bool> {
        let plan = self.plan(timeout, true)?;
        let encoded = self.make_key(key, version);
        let client = self.client_for(&encoded)?;
        if client.exists(encoded.as_bytes())? {
            return Ok(false);
        }
        self.store(&client, &encoded, &value.into(), plan)
    }

    /// Stores `value`. Returns false when the timeout is negative.
    pub fn set<K: CacheKey + ?Sized>(
        &self,
        key: &K,
        value: impl Into<CacheValue>,
        timeout: Option<f64>,
        version: Option<u64>,
    ) -> CacheResult<bool> {
        let encoded = self.make_key(key, version);
        let client = self.client_for(&encoded)?;
        self.store(&client, &encoded, &value.into(), self.plan(timeout, false)?)
    }

    /// Fetches a value; `None` when absent.
    pub fn get<K: CacheKey + ?Sized>(&self, key: &K, version: Option<u64>) -> CacheResult<Option<CacheValue>> {
        let encoded = self.make_key(key, version);
        let client = self.client_for(&encoded)?;
        Ok(client.get(encoded.as_bytes())?.map(decode_on_read))
    }

    /// Fetches a value, substituting `default` when absent.
    pub fn get_or<K: CacheKey + ?Sized>(
        &self,
        key: &K,
        default: impl Into<CacheValue>,
        version: Option<u64>,
    ) -> CacheResult<CacheValue> {
        Ok(self.get(key, version)?.unwrap_or_else(|| default.into()))
    }

    /// Fetches and decodes a typed value.
    pub fn get_as<T: DeserializeOwned, K: CacheKey + ?Sized>(
        &self,
        key: &K,
        version: Option<u64>,
    ) -> CacheResult<Option<T>> {
        self.get(key, version)?.map(|value| value.decode()).transpose()
    }

    pub fn has_key<K: CacheKey + ?Sized>(&self, key: &K, version: Option<u64>) -> CacheResult<bool> {
        let encoded = self.make_key(key, version);
        let client = self.client_for(&encoded)?;
        Ok(client.exists(encoded.as_bytes())?)
    }

    /// Removes a key. Returns true when something was deleted.
    pub fn delete<K: CacheKey + ?Sized>(&self, key: &K, version: Option<u64>) -> CacheResult<bool> {
        let encoded = self.make_key(key, version);
        let client = self.client_for(&encoded)?;
        Ok(client.delete(&[encoded.as_bytes()])? > 0)
    }

    /// Removes many keys with one DEL per node. Returns the number removed.
    pub fn delete_many<I, K>(&self, keys: I, version: Option<u64>) -> CacheResult<u64>
    where
        I: IntoIterator<Item = K>,
        K: CacheKey,
    {
        let encoded: Vec<(EncodedKey, ())> = keys.into_iter().map(|key| (self.make_key(&key, version), ())).collect();
        let mut removed = 0;
        for (client, group) in self.partition(encoded)? {
            let refs: Vec<&[u8]> = group.iter().map(|(key, _)| key.as_bytes()).collect();
            removed += client.delete(&refs)?;
        }
        Ok(removed)
    }

    /// Deletes every key matching a glob pattern (within prefix and version)
    /// on every node. Returns the number removed.
    pub fn delete_pattern(&self, pattern: &str, version: Option<u64>) -> CacheResult<u64> {
        let pattern = self.make_key(pattern, version);
        let mut removed = 0;
        for client in self.all_clients() {
            let keys = client.keys_matching(pattern.as_bytes())?;
            if keys.is_empty() {
                continue;
            }
            let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
            removed += client.delete(&refs)?;
        }
        Ok(removed)
    }

    /// Flushes the configured database on every node.
    ///
    /// Destructive beyond this cache: keys with other prefixes or versions in
    /// the same node databases are removed too.
    pub fn clear(&self) -> CacheResult<()> {
        let clients = self.all_clients();
        warn!(nodes = clients.len(), "flushing every node database");
        for client in clients {
            client.flush_all()?;
        }
        Ok(())
    }

    /// Fetches many keys with one MGET per node.
    ///
    /// Absent keys are left out of the result. The map is keyed by the
    /// caller's key (without prefix or version).
    pub fn get_many<I, K>(&self, keys: I, version: Option<u64>) -> CacheResult<HashMap<String, CacheValue>>
    where
        I: IntoIterator<Item = K>,
        K: CacheKey,
    {
        let encoded: Vec<(EncodedKey, ())> = keys.into_iter().map(|key| (self.make_key(&key, version), ())).collect();
        let mut found = HashMap::with_capacity(encoded.len());
        for (client, group) in self.partition(encoded)? {
            let refs: Vec<&[u8]> = group.iter().map(|(key, _)| key.as_bytes()).collect();
            let values = client.get_many(&refs)?;
            for ((key, _), value) in group.into_iter().zip(values) {
                if let Some(raw) = value {
                    found.insert(key.raw_key().to_string(), decode_on_read(raw));
                }
            }
        }
        Ok(found)
    }

    /// Stores many values with one pipeline per node.
    pub fn set_many<I, K, V>(&self, data: I, timeout: Option<f64>, version: Option<u64>) -> CacheResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: CacheKey,
        V: Into<CacheValue>,
    {
        let plan = self.plan(timeout, false)?;
        if plan == WritePlan::Skip {
            return Ok(());
        }
        let items: Vec<(EncodedKey, CacheValue)> = data
            .into_iter()
            .map(|(key, value)| (self.make_key(&key, version), value.into()))
            .collect();

        let groups = self.partition(items)?;
        let total = groups.len();
        for (done, (client, group)) in groups.into_iter().enumerate() {
            let mut pipeline = client.pipeline();
            for (key, value) in &group {
                Self::queue(&mut pipeline, key, value, plan);
            }
            debug!(node = %client.identity().address, commands = pipeline.len(), "executing set_many batch");
            let replies = pipeline.execute().map_err(|err| {
                warn!(node = %client.identity().address, applied = done, total, "set_many batch failed");
                CacheError::from(err)
            })?;
            if let Some(RespValue::Error(message)) = replies.iter().find(|reply| matches!(reply, RespValue::Error(_))) {
                warn!(node = %client.identity().address, applied = done, total, "set_many batch rejected");
                return Err(CacheError::Protocol(String::from_utf8_lossy(message).into_owned()));
            }
        }
        Ok(())
    }

    /// Adds `delta` to an existing numeric value and returns the result.
    ///
    /// Missing keys fail with [`CacheError::NotFound`]. When the node refuses
    /// the native increment, the value is read, incremented locally, and
    /// written back with the default timeout; that path is not atomic.
    pub fn incr<K: CacheKey + ?Sized>(&self, key: &K, delta: i64, version: Option<u64>) -> CacheResult<i64> {
        let encoded = self.make_key(key, version);
        let client = self.client_for(&encoded)?;
        if !client.exists(encoded.as_bytes())? {
            return Err(CacheError::NotFound(encoded.to_string()));
        }
        match client.increment(encoded.as_bytes(), delta) {
            Ok(value) => Ok(value),
            Err(err) if err.is_server_error() => {
                warn!(key = %encoded, "native increment refused, falling back to read-modify-write");
                let raw = client
                    .get(encoded.as_bytes())?
                    .ok_or_else(|| CacheError::NotFound(encoded.to_string()))?;
                let current = match numeric_value(&decode_on_read(raw)) {
                    Some(current) => current,
                    None => return Err(err.into()),
                };
                let next = current
                    .checked_add(delta)
                    .ok_or_else(|| CacheError::Protocol(format!("increment of '{encoded}' overflows")))?;
                self.store(&client, &encoded, &CacheValue::Integer(next), self.plan(None, false)?)?;
                Ok(next)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn decr<K: CacheKey + ?Sized>(&self, key: &K, delta: i64, version: Option<u64>) -> CacheResult<i64> {
        let delta = delta
            .checked_neg()
            .ok_or_else(|| CacheError::InvalidArgument(format!("cannot negate delta {delta}")))?;
        self.incr(key, delta, version)
    }

    /// Moves a key from `version` to `version + delta` and returns the new
    /// version.
    ///
    /// The stored bytes and TTL move unchanged; reads at the old version miss
    /// afterwards. Missing keys fail with [`CacheError::NotFound`].
    pub fn incr_version(&self, key: &str, delta: i64, version: Option<u64>) -> CacheResult<u64> {
        let version = self.keys.version_or_default(version);
        let new_version = version
            .checked_add_signed(delta)
            .ok_or_else(|| CacheError::InvalidArgument(format!("version {version} + {delta} is out of range")))?;
        let old = self.make_key(key, Some(version));
        let new = self.make_key(key, Some(new_version));
        let client = self.client_for(&old)?;
        match client.rename(old.as_bytes(), new.as_bytes()) {
            Ok(()) => Ok(new_version),
            Err(skv_client::ClientError::NotFound) => Err(CacheError::NotFound(old.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    pub fn decr_version(&self, key: &str, delta: i64, version: Option<u64>) -> CacheResult<u64> {
        let delta = delta
            .checked_neg()
            .ok_or_else(|| CacheError::InvalidArgument(format!("cannot negate delta {delta}")))?;
        self.incr_version(key, delta, version)
    }
}

fn registry_matches(config: &CacheConfig, registry: &PoolRegistry) -> bool {
    *registry.settings() == config.pool_settings()
}

/// Integer view of a stored value for the increment fallback: native
/// integers, JSON integers, and JSON floats without a fractional part.
fn numeric_value(value: &CacheValue) -> Option<i64> {
    match value {
        CacheValue::Integer(int) => Some(*int),
        CacheValue::Opaque(_) => {
            let number = match value.decode::<serde_json::Value>().ok()? {
                serde_json::Value::Number(number) => number,
                _ => return None,
            };
            number.as_i64().or_else(|| {
                let float = number.as_f64()?;
                let in_range = float >= i64::MIN as f64 && float < i64::MAX as f64;
                (float.fract() == 0.0 && in_range).then_some(float as i64)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_cache(default_timeout: i64) -> Cache {
        // Nothing is contacted until an operation runs.
        let mut config = CacheConfig::with_servers(["127.0.0.1:1", "127.0.0.1:2"]);
        config.default_timeout = default_timeout;
        config.key_prefix = "t".to_string();
        Cache::new(&config, &PoolRegistry::default()).unwrap()
    }

    #[test]
    fn timeout_plans() {
        let cache = offline_cache(300);
        assert_eq!(cache.plan(None, false).unwrap(), WritePlan::SetWithExpiry(300));
        assert_eq!(cache.plan(Some(0.0), false).unwrap(), WritePlan::Set);
        assert_eq!(cache.plan(Some(0.0), true).unwrap(), WritePlan::SetIfAbsent);
        assert_eq!(cache.plan(Some(-1.0), false).unwrap(), WritePlan::Skip);
        assert_eq!(cache.plan(Some(9.9), false).unwrap(), WritePlan::SetWithExpiry(9));
        assert_eq!(cache.plan(Some(0.5), true).unwrap(), WritePlan::SetIfAbsent);
        assert_eq!(cache.plan(Some(60.0), true).unwrap(), WritePlan::SetIfAbsentWithExpiry(60));
    }

    #[test]
    fn non_finite_timeouts_are_rejected() {
        let cache = offline_cache(300);
        for timeout in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1e19, -1e19] {
            assert!(matches!(cache.plan(Some(timeout), false), Err(CacheError::InvalidArgument(_))));
        }
        assert!(matches!(cache.set("k", 1, Some(f64::NAN), None), Err(CacheError::InvalidArgument(_))));
        assert!(matches!(
            cache.set_many([("a", 1)], Some(f64::INFINITY), None),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn zero_default_timeout_means_no_expiry() {
        let cache = offline_cache(0);
        assert_eq!(cache.plan(None, false).unwrap(), WritePlan::Set);
    }

    #[test]
    fn versions_of_a_key_share_a_node() {
        let cache = offline_cache(300);
        for i in 0..100 {
            let key = format!("k{i}");
            assert_eq!(
                cache.node_for(key.as_str(), Some(1)).unwrap(),
                cache.node_for(key.as_str(), Some(7)).unwrap()
            );
        }
    }

    #[test]
    fn empty_config_fails_at_construction() {
        let config = CacheConfig::default();
        let err = Cache::new(&config, &PoolRegistry::default()).err().unwrap();
        assert!(matches!(err, CacheError::Configuration(_)));
    }

    #[test]
    fn duplicate_servers_fail_at_construction() {
        let config = CacheConfig::with_servers(["127.0.0.1:1", "127.0.0.1:1"]);
        assert!(Cache::new(&config, &PoolRegistry::default()).is_err());
    }

    #[test]
    fn negative_timeout_skips_without_network() {
        let cache = offline_cache(300);
        assert!(!cache.set("k", 1, Some(-1.0), None).unwrap());
        cache.set_many([("a", 1), ("b", 2)], Some(-5.0), None).unwrap();
    }

    #[test]
    fn registry_settings_are_compared_with_config() {
        let mut config = CacheConfig::with_servers(["127.0.0.1:1"]);
        assert!(registry_matches(&config, &PoolRegistry::default()));
        assert!(registry_matches(&config, &PoolRegistry::new(config.pool_settings())));

        config.pool.socket_timeout_ms = Some(250);
        assert!(!registry_matches(&config, &PoolRegistry::default()));
        assert!(registry_matches(&config, &PoolRegistry::new(config.pool_settings())));
        assert!(Cache::new(&config, &PoolRegistry::default()).is_ok());
    }

    #[test]
    fn numeric_fallback_view() {
        assert_eq!(numeric_value(&CacheValue::Integer(3)), Some(3));
        assert_eq!(numeric_value(&CacheValue::Opaque(b"5.0".to_vec())), Some(5));
        assert_eq!(numeric_value(&CacheValue::Opaque(b"5.5".to_vec())), None);
        assert_eq!(numeric_value(&CacheValue::Opaque(b"\"5\"".to_vec())), None);
    }

    #[test]
    fn node_management() {
        let cache = offline_cache(300);
        let registry = PoolRegistry::default();
        cache.add_node("127.0.0.1:3", &registry).unwrap();
        assert_eq!(cache.nodes().len(), 3);
        assert!(cache.add_node("127.0.0.1:3", &registry).is_err());
        assert!(cache.remove_node("127.0.0.1:3"));
        assert!(!cache.remove_node("127.0.0.1:3"));
        assert!(matches!(cache.add_node("bad:port", &registry), Err(CacheError::Configuration(_))));
    }
}
