use super::{BlobTransferClient, PeerDiscovery, TransferManifest, verify_file};
use crate::config::BlobTransferConfig;
use crate::error::{Result, TesseraError};
use crate::meta::{PartitionKey, PartitionState};
use crate::storage::{DATA_FILE_NAME, PartitionReplica};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Transferred {
        source: String,
        snapshot_offset: Option<u64>,
    },
    /// Discovery found no READY peer.
    NoCandidates,
    /// Every candidate failed; `(peer, error)` per attempt.
    Exhausted { failures: Vec<(String, String)> },
}

/// Download directory removed on drop unless its contents were moved away.
struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    fn create(path: PathBuf) -> Result<Self> {
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to clean staging dir {:?}: {}", self.path, e);
            }
        }
    }
}

/// Requester side of the transfer protocol.
pub struct BlobTransferManager {
    self_url: Option<String>,
    discovery: Arc<dyn PeerDiscovery>,
    client: Arc<dyn BlobTransferClient>,
    config: BlobTransferConfig,
}

impl BlobTransferManager {
    pub fn new(
        discovery: Arc<dyn PeerDiscovery>,
        client: Arc<dyn BlobTransferClient>,
        config: BlobTransferConfig,
    ) -> Self {
        Self {
            self_url: None,
            discovery,
            client,
            config,
        }
    }

    /// This node's advertised URL; never picked as a candidate.
    pub fn with_self_url(mut self, url: impl Into<String>) -> Self {
        self.self_url = Some(normalize_url(&url.into()));
        self
    }

    /// READY peers for `key` in discovery order, minus this node and repeats.
    /// A failing discovery yields no candidates.
    pub async fn discover(&self, key: &PartitionKey) -> Vec<String> {
        let urls = match self.discovery.discover(key).await {
            Ok(urls) => urls,
            Err(e) => {
                warn!("Discovery for {} failed: {}", key, e);
                return Vec::new();
            }
        };

        let mut candidates: Vec<String> = Vec::with_capacity(urls.len());
        for url in urls {
            let url = normalize_url(&url);
            if self.self_url.as_deref() == Some(url.as_str()) || candidates.contains(&url) {
                continue;
            }
            candidates.push(url);
        }
        candidates
    }

    /// Full bootstrap of an UNASSIGNED partition: TRANSFERRING, then
    /// INGESTING on success, on no candidates, or on exhaustion with replay
    /// fallback; ERROR on exhaustion without fallback.
    pub async fn bootstrap_partition(
        &self,
        replica: &Arc<PartitionReplica>,
    ) -> Result<TransferOutcome> {
        replica.transition(PartitionState::Transferring)?;

        let outcome = match self.transfer(replica).await {
            Ok(outcome) => outcome,
            Err(e) => TransferOutcome::Exhausted {
                failures: vec![("local".to_string(), e.to_string())],
            },
        };

        match &outcome {
            TransferOutcome::Transferred {
                source,
                snapshot_offset,
            } => {
                info!(
                    "Partition {} bootstrapped from {} at offset {:?}",
                    replica.key(),
                    source,
                    snapshot_offset
                );
                replica.transition(PartitionState::Ingesting)?;
            }
            TransferOutcome::NoCandidates => {
                info!(
                    "No READY peer for {}, ingesting from offset 0",
                    replica.key()
                );
                replica.transition(PartitionState::Ingesting)?;
            }
            TransferOutcome::Exhausted { failures } if self.config.fallback_to_replay => {
                warn!(
                    "All {} transfer candidates failed for {}, falling back to replay",
                    failures.len(),
                    replica.key()
                );
                replica.transition(PartitionState::Ingesting)?;
            }
            TransferOutcome::Exhausted { failures } => {
                replica.fail(format!(
                    "blob transfer failed on {} candidates: {:?}",
                    failures.len(),
                    failures
                ))?;
            }
        }

        Ok(outcome)
    }

    /// Tries each candidate in order until one installs a snapshot. The
    /// partition must be TRANSFERRING; its state is not changed here.
    pub async fn transfer(&self, replica: &PartitionReplica) -> Result<TransferOutcome> {
        let state = replica.state()?;
        if state != PartitionState::Transferring {
            return Err(TesseraError::PartitionUnavailable {
                partition: replica.key().clone(),
                state,
            });
        }

        let candidates = self.discover(replica.key()).await;
        if candidates.is_empty() {
            return Ok(TransferOutcome::NoCandidates);
        }

        let mut failures = Vec::new();
        for peer in candidates {
            info!("Transferring {} from {}", replica.key(), peer);
            match self.transfer_from(replica, &peer).await {
                Ok(snapshot_offset) => {
                    return Ok(TransferOutcome::Transferred {
                        source: peer,
                        snapshot_offset,
                    });
                }
                Err(e) => {
                    warn!("Transfer of {} from {} failed: {}", replica.key(), peer, e);
                    failures.push((peer, e.to_string()));
                }
            }
        }

        Ok(TransferOutcome::Exhausted { failures })
    }

    async fn transfer_from(&self, replica: &PartitionReplica, peer: &str) -> Result<Option<u64>> {
        let manifest = self.client.open_session(peer, replica.key()).await?;
        debug!(
            "Session {} from {}: {} files, {} bytes, offset {:?}",
            manifest.session_id,
            peer,
            manifest.files.len(),
            manifest.total_size(),
            manifest.snapshot_offset
        );

        let result = self.download_and_install(replica, peer, &manifest).await;

        if let Err(e) = self.client.close_session(peer, &manifest.session_id).await {
            debug!("Closing session {} on {} failed: {}", manifest.session_id, peer, e);
        }
        result
    }

    async fn download_and_install(
        &self,
        replica: &PartitionReplica,
        peer: &str,
        manifest: &TransferManifest,
    ) -> Result<Option<u64>> {
        if &manifest.partition != replica.key() {
            return Err(TesseraError::Transfer(format!(
                "peer {} answered with partition {}",
                peer, manifest.partition
            )));
        }

        // Session ids are peer-supplied; staging names stay local.
        let staging = StagingDir::create(replica.staging_root().join(Ulid::new().to_string()))?;
        let assembled = staging.path().join(DATA_FILE_NAME);
        let mut out = tokio::fs::File::create(&assembled).await?;

        for file in &manifest.files {
            let data = self
                .client
                .fetch_file(peer, &manifest.session_id, &file.name)
                .await?;
            verify_file(file, &data)?;
            out.write_all(&data).await?;
        }
        out.sync_all().await?;
        drop(out);

        replica.install_snapshot(&assembled, manifest.snapshot_offset)?;
        Ok(manifest.snapshot_offset)
    }
}

fn normalize_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
