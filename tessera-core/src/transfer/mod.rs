//! Peer-to-peer partition snapshot transfer.
//!
//! ```text
//! requester                               source (READY copy)
//!    | discover(store, version, p)  ---->  each peer's /blob_discovery
//!    | open_session                 ---->  VACUUM INTO + split into parts
//!    | <---- manifest {files[name,size,sha256], snapshot_offset}
//!    | fetch_file (per part)        ---->  part bytes
//!    | verify, assemble, swap into current/
//!    | close_session                ---->  drop session files
//! ```

mod client;
mod manager;
mod source;

pub use client::{HttpBlobTransferClient, HttpPeerDiscovery};
pub use manager::{BlobTransferManager, TransferOutcome};
pub use source::SnapshotSource;

use crate::error::{Result, TesseraError};
use crate::meta::PartitionKey;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub size: u64,
    pub sha256: String,
}

/// File list of one transfer session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferManifest {
    pub session_id: String,
    pub partition: PartitionKey,
    /// Last log offset reflected in the files.
    pub snapshot_offset: Option<u64>,
    pub files: Vec<ManifestFile>,
}

impl TransferManifest {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }
}

/// Body of the discovery endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDiscoveryResponse {
    pub is_error: bool,
    pub available_nodes: Vec<String>,
    pub message: Option<String>,
}

/// Requester side of the session protocol.
#[async_trait]
pub trait BlobTransferClient: Send + Sync {
    async fn open_session(
        &self,
        peer_url: &str,
        partition: &PartitionKey,
    ) -> Result<TransferManifest>;

    async fn fetch_file(&self, peer_url: &str, session_id: &str, name: &str) -> Result<Bytes>;

    async fn close_session(&self, peer_url: &str, session_id: &str) -> Result<()>;
}

/// Finds nodes whose copy of a partition is READY, in preference order.
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    async fn discover(&self, partition: &PartitionKey) -> Result<Vec<String>>;
}

/// Fixed candidate list.
#[derive(Debug, Clone, Default)]
pub struct StaticPeerDiscovery {
    urls: Vec<String>,
}

impl StaticPeerDiscovery {
    pub fn new(urls: Vec<String>) -> Self {
        Self { urls }
    }
}

#[async_trait]
impl PeerDiscovery for StaticPeerDiscovery {
    async fn discover(&self, _partition: &PartitionKey) -> Result<Vec<String>> {
        Ok(self.urls.clone())
    }
}

pub fn compute_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn verify_file(file: &ManifestFile, data: &[u8]) -> Result<()> {
    if data.len() as u64 != file.size {
        return Err(TesseraError::Transfer(format!(
            "{} is {} bytes, manifest says {}",
            file.name,
            data.len(),
            file.size
        )));
    }

    let actual = compute_hash(data);
    if actual != file.sha256 {
        return Err(TesseraError::HashMismatch {
            expected: file.sha256.clone(),
            actual,
        });
    }
    Ok(())
}

pub fn part_name(index: usize) -> String {
    format!("part.{:08}", index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_file() {
        let data = b"snapshot bytes";
        let file = ManifestFile {
            name: part_name(0),
            size: data.len() as u64,
            sha256: compute_hash(data),
        };
        assert!(verify_file(&file, data).is_ok());
        assert!(matches!(
            verify_file(&file, b"snapshot bytez"),
            Err(TesseraError::HashMismatch { .. })
        ));
        assert!(matches!(
            verify_file(&file, b"short"),
            Err(TesseraError::Transfer(_))
        ));
        assert_eq!(file.name, "part.00000000");
    }

    #[test]
    fn test_discovery_response_shape() {
        let body = r#"{"is_error":false,"available_nodes":["http://a:7070"],"message":null}"#;
        let response: BlobDiscoveryResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.available_nodes, vec!["http://a:7070"]);
    }
}
