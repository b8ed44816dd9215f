//! Partition-to-node assignment.
//!
//! Assignment is a pure function of the ordered live node list, the replication
//! factor and the partition count. The strategy is picked from a closed set by a
//! configuration key.

mod consistent_hash;
mod round_robin;

pub use consistent_hash::ConsistentHashScheme;
pub use round_robin::RoundRobinScheme;

use crate::error::{Result, TesseraError};
use crate::meta::{LiveNode, PartitionKey, StoreDefinition, StoreVersion};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tokio::sync::RwLock;

pub trait AssignmentScheme: Send + Sync {
    fn name(&self) -> &'static str;

    /// Maps every partition in `0..partition_count` to `replication_factor`
    /// distinct node ids.
    fn assign(
        &self,
        nodes: &[String],
        replication_factor: usize,
        partition_count: u32,
    ) -> Result<PartitionAssignment>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssignmentStrategy {
    #[default]
    RoundRobin,
    ConsistentHash,
}

impl AssignmentStrategy {
    pub fn scheme(self) -> Box<dyn AssignmentScheme> {
        match self {
            AssignmentStrategy::RoundRobin => Box::new(RoundRobinScheme),
            AssignmentStrategy::ConsistentHash => Box::new(ConsistentHashScheme::default()),
        }
    }
}

/// Both directions of one store-version's placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionAssignment {
    pub replication_factor: usize,
    pub partition_count: u32,
    pub by_partition: BTreeMap<u32, Vec<String>>,
    pub by_node: BTreeMap<String, BTreeSet<u32>>,
}

impl PartitionAssignment {
    pub(crate) fn empty(nodes: &[String], replication_factor: usize, partition_count: u32) -> Self {
        Self {
            replication_factor,
            partition_count,
            by_partition: BTreeMap::new(),
            by_node: nodes
                .iter()
                .map(|node| (node.clone(), BTreeSet::new()))
                .collect(),
        }
    }

    pub(crate) fn place(&mut self, partition: u32, node: &str) {
        self.by_partition
            .entry(partition)
            .or_default()
            .push(node.to_string());
        self.by_node
            .entry(node.to_string())
            .or_default()
            .insert(partition);
    }

    pub fn owners(&self, partition: u32) -> &[String] {
        self.by_partition
            .get(&partition)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn partitions_for(&self, node_id: &str) -> BTreeSet<u32> {
        self.by_node.get(node_id).cloned().unwrap_or_default()
    }

    /// Largest minus smallest per-node partition count.
    pub fn load_spread(&self) -> usize {
        let loads = self.by_node.values().map(BTreeSet::len);
        let max = loads.clone().max().unwrap_or(0);
        let min = loads.min().unwrap_or(0);
        max - min
    }
}

pub(crate) fn validate_inputs(nodes: &[String], replication_factor: usize) -> Result<()> {
    if replication_factor == 0 {
        return Err(TesseraError::Config(
            "replication factor must be at least 1".to_string(),
        ));
    }

    let mut seen = HashSet::with_capacity(nodes.len());
    for node in nodes {
        if node.is_empty() {
            return Err(TesseraError::Config("node id must not be empty".to_string()));
        }
        if !seen.insert(node.as_str()) {
            return Err(TesseraError::Config(format!("duplicate node id: {}", node)));
        }
    }

    if replication_factor > nodes.len() {
        return Err(TesseraError::Config(format!(
            "replication factor {} exceeds live node count {}",
            replication_factor,
            nodes.len()
        )));
    }

    Ok(())
}

/// Placement of every hosted store-version on the given live nodes.
pub fn compute_cluster_assignment(
    scheme: &dyn AssignmentScheme,
    stores: &[StoreDefinition],
    live_nodes: &[LiveNode],
) -> Result<BTreeMap<StoreVersion, PartitionAssignment>> {
    let node_ids: Vec<String> = live_nodes.iter().map(|node| node.node_id.clone()).collect();
    let mut result = BTreeMap::new();

    for store in stores {
        for store_version in store.hosted_versions() {
            let assignment =
                scheme.assign(&node_ids, store.replication_factor, store.partition_count)?;
            result.insert(store_version, assignment);
        }
    }

    Ok(result)
}

/// Partitions one node must serve, per store-version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeAssignment {
    pub node_id: String,
    pub partitions: BTreeMap<StoreVersion, BTreeSet<u32>>,
}

impl NodeAssignment {
    pub fn compute(
        node_id: &str,
        scheme: &dyn AssignmentScheme,
        stores: &[StoreDefinition],
        live_nodes: &[LiveNode],
    ) -> Result<Self> {
        let cluster = compute_cluster_assignment(scheme, stores, live_nodes)?;
        let partitions = cluster
            .into_iter()
            .filter_map(|(store_version, assignment)| {
                let owned = assignment.partitions_for(node_id);
                (!owned.is_empty()).then_some((store_version, owned))
            })
            .collect();

        Ok(Self {
            node_id: node_id.to_string(),
            partitions,
        })
    }

    pub fn store_versions(&self) -> impl Iterator<Item = &StoreVersion> {
        self.partitions.keys()
    }

    pub fn partition_keys(&self) -> Vec<PartitionKey> {
        self.partitions
            .iter()
            .flat_map(|(store_version, partitions)| {
                partitions
                    .iter()
                    .map(move |partition| store_version.partition(*partition))
            })
            .collect()
    }

    pub fn contains(&self, key: &PartitionKey) -> bool {
        self.partitions
            .get(&key.store_version)
            .is_some_and(|partitions| partitions.contains(&key.partition))
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// Read side of the controller's cluster state.
#[async_trait]
pub trait ClusterMetadata: Send + Sync {
    async fn live_nodes(&self) -> Result<Vec<LiveNode>>;

    async fn stores(&self) -> Result<Vec<StoreDefinition>>;
}

/// Cluster state loaded from configuration.
pub struct StaticClusterMetadata {
    live_nodes: RwLock<Vec<LiveNode>>,
    stores: RwLock<Vec<StoreDefinition>>,
}

impl StaticClusterMetadata {
    pub fn new(live_nodes: Vec<LiveNode>, stores: Vec<StoreDefinition>) -> Self {
        Self {
            live_nodes: RwLock::new(live_nodes),
            stores: RwLock::new(stores),
        }
    }

    pub async fn set_stores(&self, stores: Vec<StoreDefinition>) {
        *self.stores.write().await = stores;
    }

    pub async fn set_live_nodes(&self, live_nodes: Vec<LiveNode>) {
        *self.live_nodes.write().await = live_nodes;
    }
}

#[async_trait]
impl ClusterMetadata for StaticClusterMetadata {
    async fn live_nodes(&self) -> Result<Vec<LiveNode>> {
        Ok(self.live_nodes.read().await.clone())
    }

    async fn stores(&self) -> Result<Vec<StoreDefinition>> {
        Ok(self.stores.read().await.clone())
    }
}
