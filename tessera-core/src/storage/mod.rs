//! Local storage: per-partition SQLite databases, the engine registry and the
//! service that opens assigned partitions.

pub mod partition;
pub mod repository;
pub mod service;

pub use partition::{DATA_FILE_NAME, PartitionReplica, PartitionStatus};
pub use repository::{StorageEngine, StoreRepository, WriterGuard};
pub use service::StorageService;
