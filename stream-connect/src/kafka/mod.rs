// Kafka module - source batch consumption and offset commits
pub mod batch_consumer;
pub mod committer;
pub mod context;
pub mod metrics_consts;
pub mod offset_tracker;
pub mod record;
pub mod types;

pub use committer::{KafkaOffsetCommitter, OffsetCommitter};
pub use offset_tracker::OffsetTracker;
pub use record::{Batch, BatchError, SourceRecord};
pub use types::Partition;
