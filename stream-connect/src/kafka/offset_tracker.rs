//! Offset Tracker - Tracks the last committed offset per partition
//!
//! Commits only ever move forward. A commit computed from a redelivered batch
//! can trail what an earlier batch already committed; those are dropped here
//! instead of rewinding the group.

use std::collections::BTreeMap;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::kafka::types::Partition;
use crate::metrics_consts::ACKNOWLEDGE_REGRESSION_SKIPPED_TOTAL;

#[derive(Default)]
pub struct OffsetTracker {
    /// Next offset to consume, as last committed to the group
    committed: DashMap<Partition, i64>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only the entries that advance past what was already committed.
    pub fn advancing(&self, offsets: &BTreeMap<Partition, i64>) -> BTreeMap<Partition, i64> {
        offsets
            .iter()
            .filter(|(partition, next_offset)| {
                match self.committed.get(*partition).map(|r| *r.value()) {
                    Some(committed) if **next_offset <= committed => {
                        if **next_offset < committed {
                            warn!(
                                topic = partition.topic(),
                                partition = partition.partition_number(),
                                committed = committed,
                                requested = **next_offset,
                                "Skipping offset commit that would move backwards"
                            );
                            metrics::counter!(
                                ACKNOWLEDGE_REGRESSION_SKIPPED_TOTAL,
                                "topic" => partition.topic().to_string(),
                                "partition" => partition.partition_number().to_string()
                            )
                            .increment(1);
                        }
                        false
                    }
                    _ => true,
                }
            })
            .map(|(p, o)| (p.clone(), *o))
            .collect()
    }

    /// Record offsets the group accepted.
    pub fn mark_committed(&self, offsets: &BTreeMap<Partition, i64>) {
        for (partition, next_offset) in offsets {
            self.committed
                .entry(partition.clone())
                .and_modify(|current| {
                    // Only advance offset, never go backwards
                    if *next_offset > *current {
                        debug!(
                            topic = partition.topic(),
                            partition = partition.partition_number(),
                            previous_offset = *current,
                            new_offset = *next_offset,
                            "Advancing committed offset"
                        );
                        *current = *next_offset;
                    }
                })
                .or_insert(*next_offset);
        }
    }

    pub fn committed_offset(&self, partition: &Partition) -> Option<i64> {
        self.committed.get(partition).map(|r| *r.value())
    }

    /// Forget a partition, e.g. after it was revoked from this consumer.
    pub fn clear_partition(&self, partition: &Partition) {
        if self.committed.remove(partition).is_some() {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Cleared offset tracking for partition"
            );
        }
    }

    pub fn partition_count(&self) -> usize {
        self.committed.len()
    }
}
