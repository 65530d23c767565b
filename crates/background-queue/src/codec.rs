//! Wire transport codec shared by the remote brokers.
//!
//! Payloads travel inside a self-describing [`Envelope`]:
//!
//! ```json
//! {"contentType": "application/json", "data": "eyJpZCI6MX0="}
//! ```
//!
//! `data` is the JSON-encoded payload, base64 encoded. Payloads at or above
//! [`COMPRESSION_THRESHOLD`] bytes are zlib-deflated with best compression and
//! tagged `application/octet-stream` instead.

use crate::error::SerializationError;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Encoded payload size from which envelopes carry compressed data
pub const COMPRESSION_THRESHOLD: usize = 256 * 1024;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_DEFLATE: &str = "application/octet-stream";

/// Self-describing transport wrapper around an encoded payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "contentType")]
    pub content_type: String,
    #[serde(with = "base64_data")]
    pub data: Vec<u8>,
}

impl Envelope {
    /// Wrap JSON bytes, compressing them when they reach the threshold
    pub fn wrap(json: Vec<u8>) -> Result<Self, SerializationError> {
        if json.len() < COMPRESSION_THRESHOLD {
            return Ok(Self {
                content_type: CONTENT_TYPE_JSON.to_string(),
                data: json,
            });
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder
            .write_all(&json)
            .map_err(SerializationError::Compression)?;
        let data = encoder.finish().map_err(SerializationError::Compression)?;

        Ok(Self {
            content_type: CONTENT_TYPE_DEFLATE.to_string(),
            data,
        })
    }

    /// Recover the JSON bytes carried by this envelope
    pub fn into_json(self) -> Result<Vec<u8>, SerializationError> {
        match self.content_type.as_str() {
            CONTENT_TYPE_JSON => Ok(self.data),
            CONTENT_TYPE_DEFLATE => {
                let mut json = Vec::new();
                ZlibDecoder::new(self.data.as_slice())
                    .read_to_end(&mut json)
                    .map_err(SerializationError::Decompression)?;
                Ok(json)
            }
            other => Err(SerializationError::UnknownContentType {
                content_type: other.to_string(),
            }),
        }
    }
}

/// Serialize a payload into envelope bytes
pub fn marshal<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, SerializationError> {
    encode_json(serde_json::to_vec(payload)?)
}

/// Wrap already JSON-encoded bytes into envelope bytes
pub fn encode_json(json: Vec<u8>) -> Result<Vec<u8>, SerializationError> {
    let envelope = Envelope::wrap(json)?;
    Ok(serde_json::to_vec(&envelope)?)
}

/// Decode envelope bytes back into a payload
pub fn unmarshal<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SerializationError> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    let json = envelope.into_json()?;
    Ok(serde_json::from_slice(&json)?)
}

/// Base64 (standard alphabet, padded) encoding for envelope data
mod base64_data {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(data);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
