use super::{AssignmentScheme, PartitionAssignment, validate_inputs};
use crate::error::Result;

/// Replica slot `s = p * R + i` goes to node `s mod n`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinScheme;

impl AssignmentScheme for RoundRobinScheme {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn assign(
        &self,
        nodes: &[String],
        replication_factor: usize,
        partition_count: u32,
    ) -> Result<PartitionAssignment> {
        validate_inputs(nodes, replication_factor)?;

        let mut assignment = PartitionAssignment::empty(nodes, replication_factor, partition_count);
        for partition in 0..partition_count {
            let base = partition as usize * replication_factor;
            for replica in 0..replication_factor {
                let node = &nodes[(base + replica) % nodes.len()];
                assignment.place(partition, node);
            }
        }

        Ok(assignment)
    }
}
