use super::partition::PartitionReplica;
use super::repository::StoreRepository;
use crate::assignment::{AssignmentStrategy, ClusterMetadata, NodeAssignment};
use crate::error::{Result, TesseraError};
use crate::meta::{PartitionKey, PartitionState, StoreVersion};
use crate::orchestrator::NodeService;
use crate::transfer::BlobTransferManager;
use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Opens the engines and partitions assigned to this node and moves each
/// partition out of UNASSIGNED, through a peer transfer when one applies.
pub struct StorageService {
    node_id: String,
    repository: Arc<StoreRepository>,
    metadata: Arc<dyn ClusterMetadata>,
    strategy: AssignmentStrategy,
    transfer: Option<Arc<BlobTransferManager>>,
    assignment: RwLock<NodeAssignment>,
}

impl StorageService {
    pub fn new(
        node_id: impl Into<String>,
        repository: Arc<StoreRepository>,
        metadata: Arc<dyn ClusterMetadata>,
        strategy: AssignmentStrategy,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            repository,
            metadata,
            strategy,
            transfer: None,
            assignment: RwLock::new(NodeAssignment::default()),
        }
    }

    /// Bootstraps fresh partitions from peers before ingestion.
    pub fn with_blob_transfer(mut self, manager: Arc<BlobTransferManager>) -> Self {
        self.transfer = Some(manager);
        self
    }

    pub fn repository(&self) -> &Arc<StoreRepository> {
        &self.repository
    }

    pub async fn assignment(&self) -> NodeAssignment {
        self.assignment.read().await.clone()
    }

    /// Recomputes this node's assignment from cluster metadata.
    pub async fn refresh_assignment(&self) -> Result<NodeAssignment> {
        let live_nodes = self.metadata.live_nodes().await?;
        let stores = self.metadata.stores().await?;
        let scheme = self.strategy.scheme();

        let assignment =
            NodeAssignment::compute(&self.node_id, scheme.as_ref(), &stores, &live_nodes)?;
        info!(
            "Node {} assigned {} partitions across {} store-versions ({})",
            self.node_id,
            assignment.partition_keys().len(),
            assignment.partitions.len(),
            scheme.name()
        );

        *self.assignment.write().await = assignment.clone();
        Ok(assignment)
    }

    /// Opens the partition's engine and database. Opening twice returns the
    /// same replica.
    pub async fn open_partition(&self, key: &PartitionKey) -> Result<Arc<PartitionReplica>> {
        let engine = self.repository.open(&key.store_version).await?;
        engine.open_partition(key.partition)
    }

    /// Takes an UNASSIGNED partition to TRANSFERRING or INGESTING. Partitions
    /// already past UNASSIGNED are left alone.
    pub async fn activate_partition(&self, replica: &Arc<PartitionReplica>) -> Result<()> {
        let status = replica.status()?;
        if status.state != PartitionState::Unassigned {
            return Ok(());
        }

        match &self.transfer {
            Some(manager) if status.committed_offset.is_none() => {
                manager.bootstrap_partition(replica).await?;
            }
            _ => {
                replica.transition(PartitionState::Ingesting)?;
            }
        }
        Ok(())
    }

    /// Releases one partition without touching its data. The engine goes
    /// away with its last partition.
    pub async fn close_partition(&self, key: &PartitionKey) -> Result<()> {
        let Some(engine) = self.repository.engine(&key.store_version).await else {
            return Ok(());
        };

        if let Some(replica) = engine.partition(key.partition) {
            ensure_idle(&replica)?;
        }
        engine.release_partition(key.partition)?;

        if engine.partition_ids().is_empty() {
            self.repository.close(&key.store_version).await?;
        }
        Ok(())
    }

    /// Closes the store-version and deletes its data directory.
    pub async fn remove_store_version(&self, store_version: &StoreVersion) -> Result<()> {
        if let Some(engine) = self.repository.engine(store_version).await {
            for replica in engine.partitions() {
                ensure_idle(&replica)?;
            }
        }

        self.repository.remove(store_version).await?;
        self.assignment
            .write()
            .await
            .partitions
            .remove(store_version);
        info!("Removed store-version {}", store_version);
        Ok(())
    }
}

fn ensure_idle(replica: &PartitionReplica) -> Result<()> {
    let state = replica.state()?;
    if state.is_consuming() || state == PartitionState::Transferring {
        return Err(TesseraError::Storage(format!(
            "partition {} is still {}",
            replica.key(),
            state
        )));
    }
    Ok(())
}

#[async_trait]
impl NodeService for StorageService {
    fn name(&self) -> &str {
        "storage"
    }

    async fn start(&self) -> Result<()> {
        let assignment = self.refresh_assignment().await?;

        let mut replicas = Vec::new();
        for key in assignment.partition_keys() {
            replicas.push(self.open_partition(&key).await?);
        }

        let results =
            join_all(replicas.iter().map(|replica| self.activate_partition(replica))).await;
        for (replica, result) in replicas.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to activate partition {}: {}", replica.key(), e);
                if replica.state()? == PartitionState::Transferring {
                    replica.fail(e.to_string())?;
                }
            }
        }

        info!("Storage service opened {} partitions", replicas.len());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut first_error = None;
        for engine in self.repository.engines().await {
            let store_version = engine.store_version().clone();
            if let Err(e) = self.repository.close(&store_version).await {
                warn!("Failed to close engine {}: {}", store_version, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
