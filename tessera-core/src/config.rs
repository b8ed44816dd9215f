use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use crate::assignment::AssignmentStrategy;
pub use crate::ingestion::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Upper bound on records pulled per poll; also the in-flight bound.
    pub max_batch_records: usize,
    pub idle_poll_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_batch_records: 500,
            idle_poll_interval_ms: 50,
            shutdown_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl IngestionConfig {
    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_records == 0 {
            return Err(TesseraError::Config(
                "ingestion.max_batch_records must be greater than 0".to_string(),
            ));
        }
        self.retry.validate()
    }
}

/// Parts are held in memory on the requester while verified.
pub const MAX_PART_SIZE_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobTransferConfig {
    pub enabled: bool,
    pub part_size_bytes: u64,
    /// Replay the log from offset 0 when every candidate fails; otherwise the
    /// partition is moved to ERROR.
    pub fallback_to_replay: bool,
    pub session_ttl_secs: u64,
    pub request_timeout_ms: u64,
}

impl Default for BlobTransferConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            part_size_bytes: 8 * 1024 * 1024,
            fallback_to_replay: true,
            session_ttl_secs: 600,
            request_timeout_ms: 30_000,
        }
    }
}

impl BlobTransferConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.part_size_bytes == 0 || self.part_size_bytes > MAX_PART_SIZE_BYTES {
            return Err(TesseraError::Config(format!(
                "blob_transfer.part_size_bytes must be between 1 and {}",
                MAX_PART_SIZE_BYTES
            )));
        }
        Ok(())
    }
}
