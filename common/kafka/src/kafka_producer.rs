use rdkafka::error::KafkaError;
use rdkafka::producer::FutureProducer;
use rdkafka::ClientConfig;
use tracing::debug;

use crate::config::KafkaConfig;

const PRODUCER_QUEUE_MESSAGES_GAUGE: &str = "kafka_producer_queue_messages";
const PRODUCER_QUEUE_BYTES_GAUGE: &str = "kafka_producer_queue_bytes";

/// Client context that turns librdkafka statistics callbacks into gauges,
/// labelled with the client id so pooled producers can be told apart.
#[derive(Default)]
pub struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        metrics::gauge!(PRODUCER_QUEUE_MESSAGES_GAUGE, "client" => stats.name.clone())
            .set(stats.msg_cnt as f64);
        metrics::gauge!(PRODUCER_QUEUE_BYTES_GAUGE, "client" => stats.name)
            .set(stats.msg_size as f64);
    }
}

pub fn producer_client_config(config: &KafkaConfig, client_id: &str) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("client.id", client_id)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            config.kafka_producer_queue_messages.to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    client_config
}

/// Build a producer without contacting the brokers. librdkafka connects lazily,
/// so this is safe to call while holding a map entry lock.
pub fn create_kafka_producer(
    config: &KafkaConfig,
    client_id: &str,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let client_config = producer_client_config(config, client_id);
    debug!("rdkafka configuration: {:?}", client_config);
    client_config.create_with_context(KafkaContext)
}
