use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A single versioned entry in the key-value state table.
///
/// `schema_version` belongs to the writer of `payload`; readers compare it
/// against the newest version they understand before decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub key: String,
    pub schema_version: u32,
    pub payload: String,
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    #[must_use]
    pub fn new(key: impl Into<String>, schema_version: u32, payload: String) -> Self {
        Self {
            key: key.into(),
            schema_version,
            payload,
            updated_at: Utc::now(),
        }
    }

    /// Payload size in bytes
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Decode the JSON payload
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not decode as `T`
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.payload)
            .with_context(|| format!("Failed to decode state record '{}'", self.key))
    }
}
