use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Offset, TopicPartitionList};

use crate::error::AckError;
use crate::kafka::context::ConnectConsumerContext;
use crate::kafka::types::Partition;

/// Commits source offsets (next-offset convention) back to the group.
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    async fn commit(&self, offsets: &BTreeMap<Partition, i64>) -> Result<(), AckError>;

    /// Rewind the consumer so the given offsets are delivered again.
    async fn seek(&self, offsets: &BTreeMap<Partition, i64>) -> Result<(), AckError>;
}

pub struct KafkaOffsetCommitter {
    consumer: Arc<StreamConsumer<ConnectConsumerContext>>,
    seek_timeout: Duration,
}

impl KafkaOffsetCommitter {
    pub fn new(consumer: Arc<StreamConsumer<ConnectConsumerContext>>, seek_timeout: Duration) -> Self {
        Self {
            consumer,
            seek_timeout,
        }
    }
}

pub fn to_partition_list(offsets: &BTreeMap<Partition, i64>) -> Result<TopicPartitionList, AckError> {
    let mut list = TopicPartitionList::with_capacity(offsets.len());
    for (partition, next_offset) in offsets {
        list.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(*next_offset),
        )?;
    }
    Ok(list)
}

#[async_trait]
impl OffsetCommitter for KafkaOffsetCommitter {
    async fn commit(&self, offsets: &BTreeMap<Partition, i64>) -> Result<(), AckError> {
        let list = to_partition_list(offsets)?;
        // Sync so the tracker only records what the group really holds
        self.consumer.commit(&list, CommitMode::Sync)?;
        Ok(())
    }

    async fn seek(&self, offsets: &BTreeMap<Partition, i64>) -> Result<(), AckError> {
        for (partition, offset) in offsets {
            self.consumer.seek(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*offset),
                self.seek_timeout,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_list_carries_next_offsets() {
        let offsets = BTreeMap::from([
            (Partition::new("events".into(), 0), 8),
            (Partition::new("events".into(), 3), 120),
        ]);

        let list = to_partition_list(&offsets).unwrap();

        assert_eq!(list.count(), 2);
        let elem = list.find_partition("events", 0).unwrap();
        assert_eq!(elem.offset(), Offset::Offset(8));
        let elem = list.find_partition("events", 3).unwrap();
        assert_eq!(elem.offset(), Offset::Offset(120));
    }
}
