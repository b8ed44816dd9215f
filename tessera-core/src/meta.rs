//! Store, version and partition identities shared by every component.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A store name plus version number; the unit that owns one storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreVersion {
    pub store: String,
    pub version: u32,
}

impl StoreVersion {
    pub fn new(store: impl Into<String>, version: u32) -> Self {
        Self {
            store: store.into(),
            version,
        }
    }

    /// Change-log topic carrying this version's mutations.
    pub fn topic_name(&self) -> String {
        format!("{}_v{}", self.store, self.version)
    }

    pub fn partition(&self, partition: u32) -> PartitionKey {
        PartitionKey {
            store_version: self.clone(),
            partition,
        }
    }
}

impl fmt::Display for StoreVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_v{}", self.store, self.version)
    }
}

/// (store, version, partition) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub store_version: StoreVersion,
    pub partition: u32,
}

impl PartitionKey {
    pub fn new(store: impl Into<String>, version: u32, partition: u32) -> Self {
        StoreVersion::new(store, version).partition(partition)
    }

    pub fn store(&self) -> &str {
        &self.store_version.store
    }

    pub fn version(&self) -> u32 {
        self.store_version.version
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/p{}", self.store_version, self.partition)
    }
}

/// Local state of one partition replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionState {
    Unassigned,
    Transferring,
    Ingesting,
    Error,
    Ready,
}

impl PartitionState {
    pub fn can_transition_to(self, next: PartitionState) -> bool {
        use PartitionState::*;

        matches!(
            (self, next),
            (Unassigned, Transferring)
                | (Unassigned, Ingesting)
                | (Transferring, Ingesting)
                | (Transferring, Error)
                | (Transferring, Unassigned)
                | (Ingesting, Ready)
                | (Ingesting, Error)
                | (Ingesting, Unassigned)
                | (Ready, Error)
                | (Ready, Unassigned)
                | (Error, Ingesting)
                | (Error, Unassigned)
        )
    }

    /// Whether reads may be answered as current data.
    pub fn is_readable(self) -> bool {
        matches!(self, PartitionState::Ingesting | PartitionState::Ready)
    }

    /// States during which a consumer task is attached.
    pub fn is_consuming(self) -> bool {
        matches!(self, PartitionState::Ingesting | PartitionState::Ready)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PartitionState::Unassigned => "UNASSIGNED",
            PartitionState::Transferring => "TRANSFERRING",
            PartitionState::Ingesting => "INGESTING",
            PartitionState::Error => "ERROR",
            PartitionState::Ready => "READY",
        }
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Bootstrapping,
    Online,
    Retired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionDefinition {
    pub version: u32,
    #[serde(default = "default_version_status")]
    pub status: VersionStatus,
}

fn default_version_status() -> VersionStatus {
    VersionStatus::Online
}

/// Store metadata as published by the controller. Read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreDefinition {
    pub name: String,
    pub replication_factor: usize,
    pub partition_count: u32,
    #[serde(default)]
    pub versions: Vec<VersionDefinition>,
}

impl StoreDefinition {
    /// Versions that should hold data on their assigned nodes.
    pub fn hosted_versions(&self) -> impl Iterator<Item = StoreVersion> + '_ {
        self.versions
            .iter()
            .filter(|version| version.status != VersionStatus::Retired)
            .map(|version| StoreVersion::new(self.name.clone(), version.version))
    }
}

/// A cluster member that may own partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveNode {
    pub node_id: String,
    pub url: String,
}
