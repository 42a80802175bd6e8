use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::kafka::types::Partition;

/// Final state of one source offset after dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// Published, filtered out, unmatched or undecodable: nothing left to do.
    Settled,
    /// Failed past its retry budget or gave up.
    Abandoned,
}

/// Every source offset a batch carried, per partition, with its final status.
#[derive(Debug, Default, Clone)]
pub struct BatchLedger {
    partitions: BTreeMap<Partition, BTreeMap<i64, RecordStatus>>,
}

impl BatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// An abandoned offset stays abandoned even if settled again later.
    pub fn record(&mut self, partition: &Partition, offset: i64, status: RecordStatus) {
        let offsets = self.partitions.entry(partition.clone()).or_default();
        offsets
            .entry(offset)
            .and_modify(|s| {
                if status == RecordStatus::Abandoned {
                    *s = status;
                }
            })
            .or_insert(status);
    }

    pub fn settle(&mut self, partition: &Partition, offset: i64) {
        self.record(partition, offset, RecordStatus::Settled);
    }

    pub fn abandon(&mut self, partition: &Partition, offset: i64) {
        self.record(partition, offset, RecordStatus::Abandoned);
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn status(&self, partition: &Partition, offset: i64) -> Option<RecordStatus> {
        self.partitions.get(partition)?.get(&offset).copied()
    }

    pub fn abandoned_count(&self) -> usize {
        self.partitions
            .values()
            .flat_map(|o| o.values())
            .filter(|s| **s == RecordStatus::Abandoned)
            .count()
    }

    /// Next offset to consume after the whole batch, per partition.
    pub fn batch_end_offsets(&self) -> BTreeMap<Partition, i64> {
        self.partitions
            .iter()
            .filter_map(|(p, offsets)| {
                offsets
                    .keys()
                    .next_back()
                    .map(|last| (p.clone(), last + 1))
            })
            .collect()
    }

    /// First offset that must be consumed again, for partitions where
    /// `committed` (next-offset convention) stops short of the batch end.
    pub fn redelivery_offsets(
        &self,
        committed: &BTreeMap<Partition, i64>,
    ) -> BTreeMap<Partition, i64> {
        self.partitions
            .iter()
            .filter_map(|(p, offsets)| {
                let first = *offsets.keys().next()?;
                let last = *offsets.keys().next_back()?;
                let resume = committed.get(p).copied().unwrap_or(first);
                (resume <= last).then(|| (p.clone(), resume))
            })
            .collect()
    }

    /// Last offset of the gap-free settled run starting at the batch's lowest
    /// offset, per partition. Partitions whose lowest offset is abandoned are
    /// left out.
    pub fn committable_prefix(&self) -> BTreeMap<Partition, i64> {
        self.partitions
            .iter()
            .filter_map(|(p, offsets)| contiguous_settled_end(offsets).map(|end| (p.clone(), end)))
            .collect()
    }
}

fn contiguous_settled_end(offsets: &BTreeMap<i64, RecordStatus>) -> Option<i64> {
    let mut last: Option<i64> = None;
    for (&offset, &status) in offsets {
        if status == RecordStatus::Abandoned {
            break;
        }
        if let Some(prev) = last {
            if offset != prev + 1 {
                break;
            }
        }
        last = Some(offset);
    }
    last
}

/// What to commit once a batch has settled. Offsets are Kafka's next-offset
/// convention: the first offset not yet processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckAction {
    CommitBatch(BTreeMap<Partition, i64>),
    CommitPrefix(BTreeMap<Partition, i64>),
}

impl AckAction {
    pub fn kind(&self) -> &'static str {
        match self {
            AckAction::CommitBatch(_) => "commit",
            AckAction::CommitPrefix(_) => "prefix",
        }
    }

    pub fn offsets(&self) -> &BTreeMap<Partition, i64> {
        match self {
            AckAction::CommitBatch(offsets) | AckAction::CommitPrefix(offsets) => offsets,
        }
    }
}

/// Consistency tier: whether failures are retried and what gets committed.
pub trait QoS: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_retry(&self) -> bool;

    /// Whether publish results are awaited before acknowledging.
    fn awaits_delivery(&self) -> bool {
        true
    }

    fn acknowledge_action(&self, ledger: &BatchLedger) -> AckAction;
}

/// Acknowledge immediately, never retry.
pub struct Force;

impl Force {
    pub const NAME: &'static str = "FORCE";
}

impl QoS for Force {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn supports_retry(&self) -> bool {
        false
    }

    fn awaits_delivery(&self) -> bool {
        false
    }

    fn acknowledge_action(&self, ledger: &BatchLedger) -> AckAction {
        AckAction::CommitBatch(ledger.batch_end_offsets())
    }
}

/// Retry within budget, then acknowledge the whole batch regardless.
pub struct AtMostOnce;

impl AtMostOnce {
    pub const NAME: &'static str = "AT_MOST_ONCE";
}

impl QoS for AtMostOnce {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn supports_retry(&self) -> bool {
        true
    }

    fn acknowledge_action(&self, ledger: &BatchLedger) -> AckAction {
        AckAction::CommitBatch(ledger.batch_end_offsets())
    }
}

/// Retry within budget, then commit only the gap-free settled prefix per
/// partition. Everything after the first gap is redelivered.
pub struct Strict;

impl Strict {
    pub const NAME: &'static str = "STRICT";
}

impl QoS for Strict {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn supports_retry(&self) -> bool {
        true
    }

    fn acknowledge_action(&self, ledger: &BatchLedger) -> AckAction {
        AckAction::CommitPrefix(
            ledger
                .committable_prefix()
                .into_iter()
                .map(|(p, last)| (p, last + 1))
                .collect(),
        )
    }
}

pub fn qos_by_name(name: &str) -> Result<Arc<dyn QoS>, ConfigError> {
    match name {
        Force::NAME => Ok(Arc::new(Force)),
        AtMostOnce::NAME => Ok(Arc::new(AtMostOnce)),
        Strict::NAME => Ok(Arc::new(Strict)),
        other => Err(ConfigError::UnknownType {
            kind: "qos",
            name: other.to_string(),
        }),
    }
}
