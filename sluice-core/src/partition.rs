use xxhash_rust::xxh3::xxh3_64;

use crate::Record;

/// Deterministic key to partition mapping.
///
/// Uses a stable 64-bit hash (xxh3) modulo the partition count, so two streams
/// assigned with the same partition count co-locate equal keys on the same worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionAssigner {
    partitions: u32,
}

impl PartitionAssigner {
    /// A zero partition count is treated as one.
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn assign(&self, key: &[u8]) -> u32 {
        (xxh3_64(key) % u64::from(self.partitions)) as u32
    }

    /// Re-key a record and recompute its partition.
    ///
    /// This only computes where the record now belongs; moving it there is the
    /// executor's shuffle step (`Executor::repartition`).
    pub fn repartition(&self, mut record: Record, new_key: Vec<u8>) -> Record {
        record.partition = self.assign(&new_key);
        record.key = new_key;
        record
    }
}
