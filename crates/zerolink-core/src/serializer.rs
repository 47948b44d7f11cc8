//! Byte encoding of envelopes.
//!
//! The protocol only ever hands maps and values to a [`Serializer`]; which bytes
//! end up on the wire is the serializer's business. Both ends of a connection
//! must agree on it.

use crate::{Result, ZerolinkError};
use serde_json::Value;

/// Converts envelopes to bytes and back.
pub trait Serializer: Send + Sync + 'static {
    fn serialize(&self, data: &Value) -> Result<Vec<u8>>;

    fn deserialize(&self, data: &[u8]) -> Result<Value>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Compact JSON via `serde_json`. The default serializer.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, data: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(data)?)
    }

    fn deserialize(&self, data: &[u8]) -> Result<Value> {
        serde_json::from_slice(data).map_err(|e| ZerolinkError::Serialization {
            message: format!("Invalid JSON payload: {}", e),
            source: Some(e),
        })
    }

    fn name(&self) -> &'static str {
        "json"
    }
}
