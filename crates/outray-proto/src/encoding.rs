//! Base64 payload encoding
//!
//! TCP chunks, UDP datagrams and HTTP bodies travel as standard (padded)
//! base64 strings inside the JSON frames.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::ProtoError;

/// Encode raw bytes for a frame payload
pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode a frame payload back into raw bytes
pub fn decode(data: &str) -> Result<Vec<u8>, ProtoError> {
    Ok(STANDARD.decode(data)?)
}

/// Required base64 field
pub(crate) mod base64_bytes {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        super::decode(&text).map_err(D::Error::custom)
    }
}

/// Optional base64 field: missing or `null` decodes as an empty payload
pub(crate) mod base64_body {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => super::decode(&text).map_err(D::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

/// Treat an explicit `null` like a missing field
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + serde::Deserialize<'de>,
{
    use serde::Deserialize;
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
