//! # Shared Substrate Adapter
//!
//! Capability facade over the shared key-value + pub/sub service that joins
//! operator replicas into one logical request space. The dispatcher stores a
//! serialized [`BroadcastPayload`] under a correlation-derived key and
//! announces the correlation id on a single topic; whichever replica holds
//! the pending request consumes the payload exactly once.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{OperatorError, Result};

pub mod postgres;

/// The single topic fulfillment notifications are broadcast on.
pub const RESULT_TOPIC: &str = "experiment_results";

/// Substrate key holding the relayed result for one correlation id.
pub fn result_key(correlation_id: &str) -> String {
    format!("r:{correlation_id}:i")
}

/// A fulfillment crossing replica boundaries: either the result archive or
/// the worker's error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastPayload {
    pub success: bool,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub error_msg: String,
}

impl BroadcastPayload {
    pub fn success(data: Vec<u8>) -> Self {
        Self {
            success: true,
            data,
            error_msg: String::new(),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Vec::new(),
            error_msg: msg.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| OperatorError::substrate(format!("encode: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| OperatorError::substrate(format!("decode: {e}")))
    }
}

/// Base64 wire representation for the binary result field; raw byte arrays
/// in JSON would quadruple the substrate footprint of a tarball.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Capability facade over the shared key-value + pub/sub substrate.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Store `value` under `key` for at most `ttl`.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Atomically fetch and remove `key`. `None` when the key is absent,
    /// expired, or was already consumed.
    async fn get_and_delete(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Broadcast `message` on `topic`.
    async fn publish(&self, topic: &str, message: &str) -> Result<()>;

    /// Store `value` under `key` and broadcast `message` on `topic` in one
    /// atomic step, such that no subscriber can observe the message before
    /// the stored value is visible.
    async fn set_and_publish(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        topic: &str,
        message: &str,
    ) -> Result<()>;

    /// Subscribe to `topic`. The subscription is live once this returns.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>>;

    /// Liveness check.
    async fn ping(&self) -> Result<()>;
}
