use rdkafka::ClientConfig;

use crate::config::KafkaConfig;

/// Builder for the shared-group source consumer.
///
/// Offsets are never stored or committed automatically: the dispatcher decides
/// per batch what is safe to commit, so both `enable.auto.offset.store` and
/// `enable.auto.commit` are forced off.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    pub fn from_kafka_config(kafka: &KafkaConfig, group_id: &str) -> Self {
        Self::new(&kafka.kafka_hosts, group_id)
            .with_tls(kafka.kafka_tls)
            .with_offset_reset(&kafka.kafka_consumer_offset_reset)
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_commit_and_store_are_disabled() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "group-a").build();

        assert_eq!(config.get("group.id"), Some("group-a"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
    }

    #[test]
    fn test_overrides_apply_last() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "group-a")
            .with_offset_reset("latest")
            .set("client.id", "pod-1")
            .build();

        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("max.poll.interval.ms"), Some("300000"));
        assert_eq!(config.get("client.id"), Some("pod-1"));
    }
}
