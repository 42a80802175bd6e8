//! Batch dispatch: match, filter/map, publish, acknowledge.

pub mod dispatcher;
pub mod executor;
pub mod matcher;
pub mod publisher;
pub mod retry;

pub use dispatcher::{BatchDispatcher, BatchSummary};
pub use executor::{ExecutorSettings, FilterMapExecutor, TaskHandle};
pub use matcher::{match_records, MatchResult};
pub use publisher::{CheckpointPublisher, KafkaProducerFactory, ProducerFactory, PublisherSettings};
pub use retry::{AbandonReason, RetryDecision, RetryPolicy};
