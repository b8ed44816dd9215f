use super::{AssignmentScheme, PartitionAssignment, validate_inputs};
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

const DEFAULT_VIRTUAL_NODES: usize = 64;

/// Hash ring with virtual nodes.
///
/// Each partition walks the ring clockwise from its own position to get a
/// preference order over all nodes, then takes the `R` least-loaded nodes,
/// breaking ties by that order. Picking least-loaded first keeps the per-node
/// spread at most one; the ring makes placement independent of the order in
/// which live nodes are listed.
#[derive(Debug, Clone)]
pub struct ConsistentHashScheme {
    virtual_nodes: usize,
}

impl Default for ConsistentHashScheme {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

impl ConsistentHashScheme {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
        }
    }

    fn ring<'a>(&self, nodes: &'a [String]) -> BTreeMap<u64, &'a str> {
        let mut ring = BTreeMap::new();
        for node in nodes {
            for replica in 0..self.virtual_nodes {
                ring.insert(hash_position(&format!("{}#{}", node, replica)), node.as_str());
            }
        }
        ring
    }

    fn preference<'a>(
        &self,
        ring: &BTreeMap<u64, &'a str>,
        partition: u32,
        node_count: usize,
    ) -> Vec<&'a str> {
        let start = hash_position(&format!("partition-{}", partition));
        let mut order: Vec<&'a str> = Vec::with_capacity(node_count);

        for (_, node) in ring.range(start..).chain(ring.range(..start)) {
            if !order.contains(node) {
                order.push(*node);
                if order.len() == node_count {
                    break;
                }
            }
        }

        order
    }
}

fn hash_position(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

impl AssignmentScheme for ConsistentHashScheme {
    fn name(&self) -> &'static str {
        "consistent-hash"
    }

    fn assign(
        &self,
        nodes: &[String],
        replication_factor: usize,
        partition_count: u32,
    ) -> Result<PartitionAssignment> {
        validate_inputs(nodes, replication_factor)?;

        let ring = self.ring(nodes);
        let mut loads: HashMap<&str, usize> = nodes.iter().map(|node| (node.as_str(), 0)).collect();
        let mut assignment = PartitionAssignment::empty(nodes, replication_factor, partition_count);

        for partition in 0..partition_count {
            let mut candidates = self.preference(&ring, partition, nodes.len());
            // Stable sort keeps ring order among equally loaded nodes.
            candidates.sort_by_key(|node| loads.get(node).copied().unwrap_or(0));

            for node in candidates.into_iter().take(replication_factor) {
                assignment.place(partition, node);
                *loads.entry(node).or_default() += 1;
            }
        }

        Ok(assignment)
    }
}
