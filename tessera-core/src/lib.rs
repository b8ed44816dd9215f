//! Tessera Core - data plane of a partitioned, replicated key-value serving node
//!
//! A storage node materializes change-log partitions into local engines:
//! - deterministic partition-to-node assignment
//! - one SQLite database per partition, grouped per store-version
//! - one consumer task per ingesting partition
//! - peer-to-peer snapshot transfer for fast bootstrap
//! - ordered service lifecycle

pub mod assignment;
pub mod changelog;
pub mod config;
pub mod error;
pub mod ingestion;
pub mod meta;
pub mod orchestrator;
pub mod storage;
pub mod transfer;

pub use assignment::{
    AssignmentScheme, AssignmentStrategy, ClusterMetadata, ConsistentHashScheme, NodeAssignment,
    PartitionAssignment, RoundRobinScheme, StaticClusterMetadata, compute_cluster_assignment,
};
pub use changelog::{
    ChangeLog, ChangeRecord, InMemoryChangeLog, LogEntry, LogSubscription, Operation,
    decode_record, encode_delete, encode_put,
};
pub use config::{BlobTransferConfig, IngestionConfig, StorageConfig};
pub use error::{Result, TesseraError};
pub use ingestion::{IngestionProgress, IngestionService, RetryPolicy, retry_with_backoff};
pub use meta::{
    LiveNode, PartitionKey, PartitionState, StoreDefinition, StoreVersion, VersionDefinition,
    VersionStatus,
};
pub use orchestrator::{LifecycleState, NodeService, ServiceOrchestrator};
pub use storage::{
    PartitionReplica, PartitionStatus, StorageEngine, StorageService, StoreRepository,
};
pub use transfer::{
    BlobDiscoveryResponse, BlobTransferClient, BlobTransferManager, HttpBlobTransferClient,
    HttpPeerDiscovery, ManifestFile, PeerDiscovery, SnapshotSource, StaticPeerDiscovery,
    TransferManifest, TransferOutcome,
};
