//! Request and response types for the HTTP API.
//!
//! Keys travel as strings. Values are rendered according to the
//! `encoding` query parameter (see [`ValueEncoding`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::store::{GetRequest, KeyValue};

/// How values are represented on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValueEncoding {
    /// UTF-8 text in a JSON string.
    #[default]
    String,
    /// Lowercase hex in a JSON string.
    Hex,
    /// The value is itself a JSON document, embedded as-is.
    Json,
}

impl FromStr for ValueEncoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "string" => Ok(Self::String),
            "hex" => Ok(Self::Hex),
            "json" => Ok(Self::Json),
            other => Err(Error::validation(format!(
                "unknown encoding '{other}' (expected string, hex or json)"
            ))),
        }
    }
}

impl ValueEncoding {
    /// Parses the optional `encoding` query parameter.
    pub fn from_query(query: &EncodingQuery) -> Result<Self> {
        query
            .encoding
            .as_deref()
            .map_or(Ok(Self::default()), str::parse)
    }

    /// Renders stored bytes for a response.
    pub fn encode(self, key: &[u8], value: &[u8]) -> Result<Value> {
        match self {
            Self::String => std::str::from_utf8(value)
                .map(|s| Value::String(s.to_string()))
                .map_err(|_| {
                    Error::validation(format!(
                        "value of '{}' is not valid UTF-8, request encoding=hex",
                        String::from_utf8_lossy(key)
                    ))
                }),
            Self::Hex => Ok(Value::String(hex::encode(value))),
            Self::Json => serde_json::from_slice(value).map_err(|e| {
                Error::validation(format!(
                    "value of '{}' is not a JSON document: {e}",
                    String::from_utf8_lossy(key)
                ))
            }),
        }
    }

    /// Turns a request value into the bytes to store.
    pub fn decode(self, key: &str, value: Value) -> Result<Vec<u8>> {
        match (self, value) {
            (Self::String, Value::String(s)) => Ok(s.into_bytes()),
            (Self::Hex, Value::String(s)) => hex::decode(s.as_bytes())
                .map_err(|e| Error::validation(format!("value of '{key}' is not valid hex: {e}"))),
            (Self::Json, value) => serde_json::to_vec(&value)
                .map_err(|e| Error::validation(format!("value of '{key}': {e}"))),
            (_, _) => Err(Error::validation(format!(
                "value of '{key}' must be a JSON string for this encoding"
            ))),
        }
    }
}

/// `?encoding=` query parameter shared by every data route.
#[derive(Debug, Default, Deserialize)]
pub struct EncodingQuery {
    pub encoding: Option<String>,
}

/// One wire key/value pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub key: String,
    pub value: Value,
}

impl Message {
    pub fn from_entry(entry: &KeyValue, encoding: ValueEncoding) -> Result<Self> {
        Ok(Self {
            key: String::from_utf8_lossy(&entry.key).into_owned(),
            value: encoding.encode(&entry.key, &entry.value)?,
        })
    }
}

/// Renders a batch of entries.
pub fn encode_batch(entries: &[KeyValue], encoding: ValueEncoding) -> Result<Vec<Message>> {
    entries
        .iter()
        .map(|entry| Message::from_entry(entry, encoding))
        .collect()
}

/// One requested key or prefix.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GetItem {
    pub key: String,
    #[serde(default)]
    pub is_prefix: bool,
}

impl From<GetItem> for GetRequest {
    fn from(item: GetItem) -> Self {
        Self {
            key: item.key.into_bytes(),
            is_prefix: item.is_prefix,
        }
    }
}

/// POST /v1/get body.
#[derive(Debug, Deserialize, Serialize)]
pub struct GetValuesRequest {
    pub requests: Vec<GetItem>,
}

/// POST /v1/set body.
#[derive(Debug, Deserialize, Serialize)]
pub struct SetValuesRequest {
    pub messages: Vec<Message>,
    /// Time to live shared by every message, in milliseconds.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

/// POST /v1/subscribe body.
#[derive(Debug, Deserialize, Serialize)]
pub struct SubscribeRequest {
    pub prefixes: Vec<String>,
}

/// Response carrying a list of messages (Get result or one subscription batch).
#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
}

/// Empty acknowledgement for Set.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SetValuesResponse {}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub backend: String,
}

/// Error body, also the terminal line of a failed subscription stream.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
