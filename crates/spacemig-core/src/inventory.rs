use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadRef {
    pub root: String,
    #[serde(default)]
    pub inserted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("inventory error: {message}")]
pub struct InventoryError {
    pub message: String,
}

impl InventoryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Uploads registered to a space in the legacy provider, in stable order. `cursor`
/// is the root of the last upload already processed.
pub trait UploadSource {
    fn uploads_after(
        &self,
        space: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UploadRef>, InventoryError>;
}

/// Locally recorded shard metadata: byte size of a shard stored for a space.
pub trait ShardRecords {
    fn shard_size(&self, space: &str, shard: &str) -> Result<Option<u64>, InventoryError>;
}
