use std::sync::Arc;

use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::types::Partition;

/// Source consumer context. Revoked partitions are dropped from the offset
/// tracker so a later reassignment starts from whatever the group holds.
pub struct ConnectConsumerContext {
    offset_tracker: Arc<OffsetTracker>,
}

impl ConnectConsumerContext {
    pub fn new(offset_tracker: Arc<OffsetTracker>) -> Self {
        Self { offset_tracker }
    }
}

impl ClientContext for ConnectConsumerContext {}

impl ConsumerContext for ConnectConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!("Revoking {} partitions", partitions.count());
                for elem in partitions.elements() {
                    self.offset_tracker.clear_partition(&Partition::from(elem));
                }
            }
            Rebalance::Assign(partitions) => {
                debug!("Pre-rebalance assign of {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                error!("Pre-rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!("Assigned {} partitions", partitions.count());
            }
            Rebalance::Revoke(_) => {
                info!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        match result {
            Ok(_) => {
                debug!("Committed offsets for {} partitions", offsets.count());
            }
            Err(e) => {
                warn!("Failed to commit offsets: {}", e);
            }
        }
    }
}
