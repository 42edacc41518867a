//! # Sharder
//!
//! Ketama-style consistent hashing. Every node label contributes
//! `POINTS_PER_NODE` points to a ring of `u32` positions derived from MD5
//! digests; a key belongs to the first point at or after its own hash,
//! wrapping around. Adding or removing a node only moves the keys that fall
//! between its points and their predecessors, roughly `1/N` of the keyspace.
//!
//! The ring depends only on the set of labels, so two sharders built from the
//! same labels route identically regardless of insertion order.

use crate::error::{CacheError, CacheResult};

/// Digests per node; each MD5 digest yields four ring points.
const DIGESTS_PER_NODE: u32 = 40;

/// Total ring points per node.
pub const POINTS_PER_NODE: usize = DIGESTS_PER_NODE as usize * 4;

/// Routes keys to one of several labeled nodes.
#[derive(Debug, Clone)]
pub struct Sharder<C> {
    nodes: Vec<(String, C)>,
    /// Sorted (point, node index) pairs.
    ring: Vec<(u32, usize)>,
}

impl<C> Default for Sharder<C> {
    fn default() -> Self {
        Sharder {
            nodes: Vec::new(),
            ring: Vec::new(),
        }
    }
}

impl<C> Sharder<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node under `label`. Labels must be unique.
    pub fn add(&mut self, client: C, label: impl Into<String>) -> CacheResult<()> {
        let label = label.into();
        if self.nodes.iter().any(|(existing, _)| *existing == label) {
            return Err(CacheError::Configuration(format!("node '{label}' is already registered")));
        }
        self.nodes.push((label, client));
        self.rebuild();
        Ok(())
    }

    /// Unregisters the node with `label`, returning its client.
    pub fn remove(&mut self, label: &str) -> Option<C> {
        let idx = self.nodes.iter().position(|(existing, _)| existing == label)?;
        let (_, client) = self.nodes.remove(idx);
        self.rebuild();
        Some(client)
    }

    /// Index of the node owning `key`.
    ///
    /// An empty node set is a configuration error.
    pub fn locate(&self, key: &[u8]) -> CacheResult<usize> {
        if self.ring.is_empty() {
            return Err(CacheError::Configuration("no cache nodes are registered".to_string()));
        }
        let hash = key_hash(key);
        let pos = self.ring.partition_point(|(point, _)| *point < hash);
        let (_, idx) = self.ring[pos % self.ring.len()];
        Ok(idx)
    }

    /// Client owning `key`.
    pub fn get_client(&self, key: &[u8]) -> CacheResult<&C> {
        let idx = self.locate(key)?;
        Ok(&self.nodes[idx].1)
    }

    /// Label owning `key`.
    pub fn get_label(&self, key: &[u8]) -> CacheResult<&str> {
        let idx = self.locate(key)?;
        Ok(&self.nodes[idx].0)
    }

    pub fn client(&self, idx: usize) -> Option<&C> {
        self.nodes.get(idx).map(|(_, client)| client)
    }

    pub fn clients(&self) -> impl Iterator<Item = &C> {
        self.nodes.iter().map(|(_, client)| client)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|(label, _)| label.as_str())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn rebuild(&mut self) {
        let mut ring = Vec::with_capacity(self.nodes.len() * POINTS_PER_NODE);
        for (idx, (label, _)) in self.nodes.iter().enumerate() {
            for digest_no in 0..DIGESTS_PER_NODE {
                let digest = md5::compute(format!("{label}-{digest_no}").as_bytes());
                for chunk in digest.0.chunks_exact(4) {
                    let point = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    ring.push((point, idx));
                }
            }
        }
        // Ties resolve by label so insertion order never matters.
        ring.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| self.nodes[a.1].0.cmp(&self.nodes[b.1].0)));
        self.ring = ring;
    }
}

fn key_hash(key: &[u8]) -> u32 {
    let digest = md5::compute(key);
    u32::from_le_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]])
}
