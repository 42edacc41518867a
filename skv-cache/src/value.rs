//! # Value Codec
//!
//! Integers are stored as their decimal text so the node's INCR family can
//! operate on them; everything else is stored as JSON.
//!
//! ## Known ambiguity
//! Reads cannot tell a stored integer from a serialized payload whose bytes
//! happen to be a decimal integer. [`decode_on_read`] tries integer parsing
//! first and only then falls back to JSON, so such payloads read back as
//! [`CacheValue::Integer`]. With JSON this only affects values that
//! serialize to a plain integer, which decode to the same number either way.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CacheResult;

/// A value as it crosses the cache boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    /// Native integer, stored verbatim as decimal text.
    Integer(i64),
    /// Serialized payload (JSON bytes).
    Opaque(Vec<u8>),
}

impl CacheValue {
    /// Encodes any serializable value, taking the integer fast path when the
    /// value is an integer that fits in `i64`. Booleans are never integers.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> CacheResult<Self> {
        let json = serde_json::to_value(value)?;
        if let serde_json::Value::Number(number) = &json {
            if let Some(int) = number.as_i64() {
                return Ok(CacheValue::Integer(int));
            }
        }
        Ok(CacheValue::Opaque(serde_json::to_vec(&json)?))
    }

    /// Decodes into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> CacheResult<T> {
        match self {
            CacheValue::Integer(int) => Ok(serde_json::from_value(serde_json::Value::from(*int))?),
            CacheValue::Opaque(bytes) => deserialize(bytes),
        }
    }

    /// Bytes written to the node.
    pub fn to_wire(&self) -> Vec<u8> {
        match self {
            CacheValue::Integer(int) => int.to_string().into_bytes(),
            CacheValue::Opaque(bytes) => bytes.clone(),
        }
    }
}

impl From<i64> for CacheValue {
    fn from(value: i64) -> Self {
        CacheValue::Integer(value)
    }
}

impl From<i32> for CacheValue {
    fn from(value: i32) -> Self {
        CacheValue::Integer(value.into())
    }
}

impl From<bool> for CacheValue {
    fn from(value: bool) -> Self {
        CacheValue::Opaque(serde_json::Value::Bool(value).to_string().into_bytes())
    }
}

impl From<f64> for CacheValue {
    fn from(value: f64) -> Self {
        CacheValue::Opaque(serde_json::Value::from(value).to_string().into_bytes())
    }
}

impl From<&str> for CacheValue {
    fn from(value: &str) -> Self {
        CacheValue::Opaque(serde_json::Value::from(value).to_string().into_bytes())
    }
}

impl From<String> for CacheValue {
    fn from(value: String) -> Self {
        CacheValue::Opaque(serde_json::Value::String(value).to_string().into_bytes())
    }
}

/// Serializes a value with the generic format.
pub fn serialize<T: Serialize + ?Sized>(value: &T) -> CacheResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Deserializes a value produced by [`serialize`].
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> CacheResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Interprets raw bytes read from a node: integer first, payload otherwise.
pub fn decode_on_read(raw: Vec<u8>) -> CacheValue {
    let parsed = std::str::from_utf8(&raw).ok().and_then(|text| text.parse::<i64>().ok());
    match parsed {
        Some(int) => CacheValue::Integer(int),
        None => CacheValue::Opaque(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        tags: Vec<String>,
    }

    #[test]
    fn integers_take_the_fast_path() {
        assert_eq!(CacheValue::encode(&42u8).unwrap(), CacheValue::Integer(42));
        assert_eq!(CacheValue::encode(&-7i64).unwrap(), CacheValue::Integer(-7));
        assert_eq!(CacheValue::Integer(42).to_wire(), b"42".to_vec());
    }

    #[test]
    fn booleans_and_floats_are_serialized() {
        assert_eq!(CacheValue::encode(&true).unwrap(), CacheValue::Opaque(b"true".to_vec()));
        assert_eq!(CacheValue::encode(&1.5f64).unwrap(), CacheValue::Opaque(b"1.5".to_vec()));
    }

    #[test]
    fn structured_values_roundtrip() {
        let profile = Profile {
            name: "ada".to_string(),
            tags: vec!["admin".to_string()],
        };
        let bytes = serialize(&profile).unwrap();
        assert_eq!(deserialize::<Profile>(&bytes).unwrap(), profile);

        let value = CacheValue::encode(&profile).unwrap();
        let read = decode_on_read(value.to_wire());
        assert_eq!(read.decode::<Profile>().unwrap(), profile);
    }

    #[test]
    fn reads_try_integer_before_payload() {
        assert_eq!(decode_on_read(b"17".to_vec()), CacheValue::Integer(17));
        assert_eq!(decode_on_read(b"\"17\"".to_vec()), CacheValue::Opaque(b"\"17\"".to_vec()));
        assert_eq!(decode_on_read(vec![0xff, 0x00]), CacheValue::Opaque(vec![0xff, 0x00]));
    }

    #[test]
    fn conversions_match_encode() {
        assert_eq!(CacheValue::from("v1"), CacheValue::encode("v1").unwrap());
        assert_eq!(CacheValue::from(2.5), CacheValue::encode(&2.5).unwrap());
        assert_eq!(CacheValue::from(false), CacheValue::encode(&false).unwrap());
        assert_eq!(CacheValue::from(9), CacheValue::Integer(9));
    }

    #[test]
    fn integer_decodes_into_wider_types() {
        let value = CacheValue::Integer(8);
        assert_eq!(value.decode::<u32>().unwrap(), 8);
        assert_eq!(value.decode::<f64>().unwrap(), 8.0);
    }

    #[test]
    fn oversized_unsigned_stays_opaque() {
        let value = CacheValue::encode(&u64::MAX).unwrap();
        assert!(matches!(value, CacheValue::Opaque(_)));
        assert_eq!(decode_on_read(value.to_wire()).decode::<u64>().unwrap(), u64::MAX);
    }
}
