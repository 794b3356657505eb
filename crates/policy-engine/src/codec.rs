//! Binary encoding of persisted policy state
//!
//! bincode only. Types that pass through here must not rely on
//! `deserialize_any` (no `untagged`, no `flatten`, no `serde_json::Value`).

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PolicyError;

    #[test]
    fn test_truncated_bytes_are_a_codec_error() {
        let bytes = serialize(&("policy", 42u64)).unwrap();
        let err = deserialize::<(String, u64)>(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, PolicyError::Codec(_)));
        assert_eq!(err.code(), "CODEC");
    }
}
