use std::fmt;

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Configuration problems. These are never retried: they surface to the
/// owning pipeline, which halts instead of silently dropping records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    ZeroSize { field: &'static str },
    #[error("unknown {kind} type: {name}")]
    UnknownType { kind: &'static str, name: String },
    #[error("subscriber {subscriber_id} has no routing policy to derive a tenant from")]
    MissingTenant { subscriber_id: String },
    #[error("no source configuration for tenant {tenant_id} in pipeline {pipeline}")]
    MissingTenantSource { pipeline: String, tenant_id: String },
    #[error("producer pool for tenant {tenant_id} is empty")]
    MissingProducer { tenant_id: String },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failure raised by filter or map logic for one record.
#[derive(Error, Debug, Clone)]
pub enum ProcessError {
    /// Non-retryable: the record is abandoned immediately whatever the budget.
    #[error("gave up processing: {0}")]
    GiveUp(String),
    #[error("processing failed: {0}")]
    Failed(String),
    #[error("task was canceled before completing")]
    Canceled,
}

impl ProcessError {
    pub fn is_give_up(&self) -> bool {
        matches!(self, ProcessError::GiveUp(_))
    }
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("worker pool {0} is shut down")]
    PoolClosed(String),
    #[error("worker pool {0} queue is full")]
    QueueFull(String),
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build producer: {0}")]
    ProducerCreation(KafkaError),
    #[error("failed to serialize checkpoint record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to produce to kafka: {0}")]
    Produce(KafkaError),
    #[error("failed to produce to kafka (canceled)")]
    Canceled,
    #[error("failed to flush producer: {0}")]
    Flush(KafkaError),
}

impl PublishError {
    pub fn is_config(&self) -> bool {
        matches!(self, PublishError::Config(_))
    }

    /// A payload that cannot be encoded will not encode on a retry either.
    pub fn is_give_up(&self) -> bool {
        matches!(self, PublishError::Serialization(_))
    }

    /// Configuration failures escalate to the pipeline as `Err`; everything
    /// else comes back as a per-record failure for the retry budget.
    pub fn escalate(self) -> Result<PublishError, DispatchError> {
        match self {
            PublishError::Config(c) => Err(DispatchError::Config(c)),
            other => Ok(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum AdminError {
    /// The broker does not implement the requested admin API version.
    #[error("admin operation not supported by broker: {0}")]
    Unsupported(String),
    #[error("admin operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("kafka admin error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("admin operation failed for {resource}: {reason}")]
    Resource { resource: String, reason: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Error, Debug)]
pub enum AckError {
    #[error("offset commit rejected: {0}")]
    Commit(#[from] KafkaError),
    #[error("offset commit rejected: {0}")]
    Other(String),
}

/// Outcome of dispatching one batch that the consumer loop has to act on.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl DispatchError {
    /// Fatal errors stop the pipeline; the uncommitted batch is redelivered
    /// once the operator fixes the configuration.
    pub fn is_fatal(&self) -> bool {
        match self {
            DispatchError::Config(_) => true,
            DispatchError::Executor(ExecutorError::PoolClosed(_)) => true,
            DispatchError::Executor(ExecutorError::QueueFull(_)) => false,
        }
    }
}

/// Stage of the dispatch pipeline a task failed in, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FilterMap,
    Publish,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::FilterMap => "filter_map",
            Stage::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_fatal() {
        let err = DispatchError::from(ConfigError::MissingTenant {
            subscriber_id: "s1".to_string(),
        });
        assert!(err.is_fatal());
        assert!(!DispatchError::from(ExecutorError::QueueFull("shared".into())).is_fatal());
    }

    #[test]
    fn test_only_config_publish_errors_escalate() {
        let config = PublishError::from(ConfigError::MissingProducer {
            tenant_id: "t1".to_string(),
        });
        assert!(config.escalate().is_err());
        assert!(PublishError::Canceled.escalate().is_ok());
    }
}
