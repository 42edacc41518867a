//! # Key Codec
//!
//! Builds wire keys of the form `<prefix>:<version>:<key>`. An [`EncodedKey`]
//! remembers where the caller's key starts so routing can ignore prefix and
//! version, and encoding an `EncodedKey` again returns it unchanged.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Fully-qualified key as stored on a node.
#[derive(Clone)]
pub struct EncodedKey {
    wire: String,
    key_start: usize,
}

impl EncodedKey {
    pub fn as_str(&self) -> &str {
        &self.wire
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.wire.as_bytes()
    }

    /// The caller-supplied key segment.
    pub fn raw_key(&self) -> &str {
        &self.wire[self.key_start..]
    }
}

impl PartialEq for EncodedKey {
    fn eq(&self, other: &Self) -> bool {
        self.wire == other.wire
    }
}

impl Eq for EncodedKey {}

impl Hash for EncodedKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.wire.hash(state);
    }
}

impl fmt::Debug for EncodedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.wire, f)
    }
}

impl fmt::Display for EncodedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire)
    }
}

/// Something that can name a cache entry.
///
/// Raw strings are encoded with the codec's prefix and a version; an
/// [`EncodedKey`] passes through as-is.
pub trait CacheKey {
    fn encode(&self, codec: &KeyCodec, version: Option<u64>) -> EncodedKey;
}

impl CacheKey for str {
    fn encode(&self, codec: &KeyCodec, version: Option<u64>) -> EncodedKey {
        codec.encode_raw(self, version)
    }
}

impl CacheKey for String {
    fn encode(&self, codec: &KeyCodec, version: Option<u64>) -> EncodedKey {
        codec.encode_raw(self, version)
    }
}

impl CacheKey for EncodedKey {
    fn encode(&self, _codec: &KeyCodec, _version: Option<u64>) -> EncodedKey {
        self.clone()
    }
}

impl<K: CacheKey + ?Sized> CacheKey for &K {
    fn encode(&self, codec: &KeyCodec, version: Option<u64>) -> EncodedKey {
        (**self).encode(codec, version)
    }
}

/// Namespacing and versioning rules for one cache.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    prefix: String,
    default_version: u64,
}

impl KeyCodec {
    pub fn new(prefix: impl Into<String>, default_version: u64) -> Self {
        KeyCodec {
            prefix: prefix.into(),
            default_version,
        }
    }

    /// Resolves `None` to the configured version.
    pub fn version_or_default(&self, version: Option<u64>) -> u64 {
        version.unwrap_or(self.default_version)
    }

    /// Encodes `key` at `version`; already-encoded keys come back unchanged.
    pub fn make_key<K: CacheKey + ?Sized>(&self, key: &K, version: Option<u64>) -> EncodedKey {
        key.encode(self, version)
    }

    fn encode_raw(&self, key: &str, version: Option<u64>) -> EncodedKey {
        let version = self.version_or_default(version);
        let wire = format!("{}:{}:{}", self.prefix, version, key);
        let key_start = wire.len() - key.len();
        EncodedKey { wire, key_start }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_prefix_version_and_key() {
        let codec = KeyCodec::new("app", 1);
        let key = codec.make_key("user:7", None);
        assert_eq!(key.as_str(), "app:1:user:7");
        assert_eq!(key.raw_key(), "user:7");
        assert_eq!(codec.make_key("user:7", Some(4)).as_str(), "app:4:user:7");
    }

    #[test]
    fn encoding_is_idempotent() {
        let codec = KeyCodec::new("app", 1);
        let once = codec.make_key("k", Some(2));
        let twice = codec.make_key(&once, Some(9));
        assert_eq!(once, twice);
        assert_eq!(twice.as_str(), "app:2:k");
    }

    #[test]
    fn empty_prefix_still_delimits() {
        let codec = KeyCodec::new("", 1);
        assert_eq!(codec.make_key("k", None).as_str(), ":1:k");
    }

    #[test]
    fn same_inputs_same_key() {
        let codec = KeyCodec::new("ns", 3);
        assert_eq!(codec.make_key("a", None), codec.make_key(&"a".to_string(), Some(3)));
    }
}
