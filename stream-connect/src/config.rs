use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use common_kafka::config::KafkaConfig;
use envconfig::Envconfig;

use crate::dispatch::executor::ExecutorSettings;
use crate::dispatch::retry::RetryPolicy;
use crate::error::ConfigError;
use crate::process::ProcessChain;
use crate::qos::qos_by_name;
use crate::sharding::{strategy_by_name, ServerInstance};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    // Pretty logs instead of JSON
    #[envconfig(from = "DEBUG", default = "false")]
    pub debug: bool,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    // Source consumer
    #[envconfig(default = "default")]
    pub pipeline_name: String,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "stream-connect")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "500")]
    pub batch_size: usize,

    #[envconfig(default = "1000")]
    pub batch_timeout_ms: u64,

    // JSON file with subscribers and tenant source configs per pipeline
    #[envconfig(default = "subscribers.json")]
    pub subscribers_path: String,

    // FORCE, AT_MOST_ONCE or STRICT
    #[envconfig(default = "STRICT")]
    pub qos: String,

    // Retry budget
    #[envconfig(default = "3")]
    pub max_retry_times: u32,

    #[envconfig(default = "60000")]
    pub max_retry_window_ms: u64,

    #[envconfig(default = "100")]
    pub retry_initial_interval_ms: u64,

    #[envconfig(default = "2")]
    pub retry_backoff_coefficient: u32,

    #[envconfig(default = "5000")]
    pub retry_maximum_interval_ms: u64,

    // Filter/map executor
    #[envconfig(default = "8")]
    pub shared_executor_pool_size: usize,

    #[envconfig(default = "1024")]
    pub shared_executor_queue_size: usize,

    #[envconfig(default = "4")]
    pub sequence_executor_count: usize,

    #[envconfig(default = "256")]
    pub sequence_executor_queue_size: usize,

    // Comma separated type names, run in order
    #[envconfig(default = "POLICY_FILTER")]
    pub filter_types: String,

    #[envconfig(default = "FIELD_MASK_MAPPER")]
    pub mapper_types: String,

    // Checkpoint publishing
    #[envconfig(default = "true")]
    pub checkpoint_enabled: bool,

    #[envconfig(default = "checkpoint_")]
    pub checkpoint_topic_prefix: String,

    #[envconfig(default = "10")]
    pub checkpoint_topic_partitions: i32,

    #[envconfig(default = "1")]
    pub checkpoint_replication_factor: i32,

    #[envconfig(default = "4")]
    pub producer_pool_size: usize,

    #[envconfig(default = "10000")]
    pub producer_flush_timeout_ms: u64,

    #[envconfig(default = "6000")]
    pub admin_timeout_ms: u64,

    // Sharding
    #[envconfig(default = "AVG_SHARDING")]
    pub sharding_strategy: String,

    #[envconfig(default = "64")]
    pub sharding_total_count: u32,

    // Comma separated instance ids
    #[envconfig(default = "stream-connect-0")]
    pub server_instances: String,

    #[envconfig(default = "stream-connect-0")]
    pub instance_id: String,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::ZeroSize { field });
    }
    Ok(())
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Reject settings the service cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("batch_size", self.batch_size)?;
        positive("shared_executor_pool_size", self.shared_executor_pool_size)?;
        positive("shared_executor_queue_size", self.shared_executor_queue_size)?;
        positive("sequence_executor_count", self.sequence_executor_count)?;
        positive("sequence_executor_queue_size", self.sequence_executor_queue_size)?;
        positive("producer_pool_size", self.producer_pool_size)?;
        positive("sharding_total_count", self.sharding_total_count as usize)?;

        if self.checkpoint_topic_partitions <= 0 {
            return Err(ConfigError::Invalid {
                field: "checkpoint_topic_partitions",
                reason: format!("must be positive, got {}", self.checkpoint_topic_partitions),
            });
        }
        if self.checkpoint_replication_factor <= 0 {
            return Err(ConfigError::Invalid {
                field: "checkpoint_replication_factor",
                reason: format!("must be positive, got {}", self.checkpoint_replication_factor),
            });
        }
        if self.retry_backoff_coefficient == 0 {
            return Err(ConfigError::Invalid {
                field: "retry_backoff_coefficient",
                reason: "must be at least 1".to_string(),
            });
        }
        let instances = self.server_instances();
        if instances.is_empty() {
            return Err(ConfigError::Invalid {
                field: "server_instances",
                reason: "at least one instance is required".to_string(),
            });
        }
        // A repeated id takes a second slot that no live instance owns
        let mut seen = HashSet::new();
        if let Some(duplicate) = instances.iter().find(|i| !seen.insert(i.id.as_str())) {
            return Err(ConfigError::Invalid {
                field: "server_instances",
                reason: format!("instance {} is listed more than once", duplicate.id),
            });
        }
        if !seen.contains(self.instance_id.as_str()) {
            return Err(ConfigError::Invalid {
                field: "instance_id",
                reason: format!("{} is not one of server_instances", self.instance_id),
            });
        }

        qos_by_name(&self.qos)?;
        strategy_by_name(&self.sharding_strategy)?;
        self.process_chain()?;
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn subscribers_path_buf(&self) -> PathBuf {
        PathBuf::from(&self.subscribers_path)
    }

    pub fn filter_types(&self) -> Vec<String> {
        parse_list(&self.filter_types)
    }

    pub fn mapper_types(&self) -> Vec<String> {
        parse_list(&self.mapper_types)
    }

    pub fn process_chain(&self) -> Result<ProcessChain, ConfigError> {
        ProcessChain::from_names(&self.filter_types(), &self.mapper_types())
    }

    pub fn server_instances(&self) -> Vec<ServerInstance> {
        parse_list(&self.server_instances)
            .into_iter()
            .map(ServerInstance::new)
            .collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(
            self.retry_backoff_coefficient,
            Duration::from_millis(self.retry_initial_interval_ms),
        )
        .maximum_interval(Duration::from_millis(self.retry_maximum_interval_ms))
        .max_retry_times(self.max_retry_times)
        .max_retry_window(self.retry_window())
        .provide()
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            shared_pool_size: self.shared_executor_pool_size,
            shared_queue_size: self.shared_executor_queue_size,
            isolated_pool_count: self.sequence_executor_count,
            isolated_queue_size: self.sequence_executor_queue_size,
        }
    }

    pub fn retry_window(&self) -> Duration {
        Duration::from_millis(self.max_retry_window_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn producer_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.producer_flush_timeout_ms)
    }

    pub fn admin_timeout(&self) -> Duration {
        Duration::from_millis(self.admin_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
