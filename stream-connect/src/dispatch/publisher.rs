use std::sync::Arc;
use std::time::Duration;

use common_kafka::config::KafkaConfig;
use common_kafka::kafka_producer::{create_kafka_producer, KafkaContext};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{ConfigError, PublishError};
use crate::kafka::record::RecordHeader;
use crate::metrics_consts::PRODUCER_POOLS_CREATED_TOTAL;
use crate::registry::{SourceConfig, TenantSourceResolver};
use crate::subscriber::{Attempt, SubscriberInfo, SubscriberRecord};

pub const TENANT_HEADER: &str = "tenant";
pub const SEQUENCE_HEADER: &str = "sequence";

pub fn checkpoint_topic_name(prefix: &str, pipeline: &str, subscriber_id: &str) -> String {
    format!("{prefix}{pipeline}{subscriber_id}")
}

/// Routing metadata attached to every checkpoint record. Only turned into
/// headers when the record is handed to a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointMetadata {
    pub tenant: String,
    pub sequence: bool,
}

impl CheckpointMetadata {
    pub fn for_subscriber(subscriber: &SubscriberInfo) -> Self {
        Self {
            tenant: subscriber.id.clone(),
            sequence: subscriber.is_sequence(),
        }
    }

    /// Source headers first, then the metadata headers.
    pub fn to_headers(&self, original: &[RecordHeader]) -> Vec<RecordHeader> {
        let mut headers = original.to_vec();
        headers.push(RecordHeader {
            key: TENANT_HEADER.to_string(),
            value: Some(self.tenant.as_bytes().to_vec()),
        });
        headers.push(RecordHeader {
            key: SEQUENCE_HEADER.to_string(),
            value: Some(self.sequence.to_string().into_bytes()),
        });
        headers
    }
}

/// One outbound checkpoint record, ready for a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMessage {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: Vec<RecordHeader>,
}

pub type DeliveryFuture = BoxFuture<'static, Result<(), PublishError>>;

/// A producer that enqueues without blocking and reports delivery later.
pub trait CheckpointProducer: Send + Sync {
    fn client_id(&self) -> &str;

    fn send(&self, message: CheckpointMessage) -> Result<DeliveryFuture, PublishError>;

    /// Blocking.
    fn flush(&self, timeout: Duration) -> Result<(), PublishError>;
}

pub trait ProducerFactory: Send + Sync {
    fn create(
        &self,
        source: &SourceConfig,
        client_id: &str,
    ) -> Result<Arc<dyn CheckpointProducer>, PublishError>;
}

pub struct KafkaCheckpointProducer {
    client_id: String,
    producer: FutureProducer<KafkaContext>,
}

impl CheckpointProducer for KafkaCheckpointProducer {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn send(&self, message: CheckpointMessage) -> Result<DeliveryFuture, PublishError> {
        let headers = message
            .headers
            .iter()
            .fold(OwnedHeaders::new_with_capacity(message.headers.len()), |acc, h| {
                acc.insert(Header {
                    key: &h.key,
                    value: h.value.as_deref(),
                })
            });

        let record = FutureRecord {
            topic: &message.topic,
            payload: Some(&message.payload),
            partition: None,
            key: message.key.as_deref(),
            timestamp: None,
            headers: Some(headers),
        };

        let delivery = match self.producer.send_result(record) {
            Ok(future) => future,
            Err((e, _)) => return Err(PublishError::Produce(e)),
        };

        Ok(async move {
            match delivery.await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err((e, _))) => Err(PublishError::Produce(e)),
                Err(_) => Err(PublishError::Canceled),
            }
        }
        .boxed())
    }

    fn flush(&self, timeout: Duration) -> Result<(), PublishError> {
        self.producer.flush(timeout).map_err(PublishError::Flush)
    }
}

/// Builds tenant producers against the tenant's own brokers, reusing every
/// other shared producer setting.
pub struct KafkaProducerFactory {
    kafka: KafkaConfig,
}

impl KafkaProducerFactory {
    pub fn new(kafka: KafkaConfig) -> Self {
        Self { kafka }
    }
}

impl ProducerFactory for KafkaProducerFactory {
    fn create(
        &self,
        source: &SourceConfig,
        client_id: &str,
    ) -> Result<Arc<dyn CheckpointProducer>, PublishError> {
        let config = self.kafka.with_hosts(&source.bootstrap_servers);
        let producer =
            create_kafka_producer(&config, client_id).map_err(PublishError::ProducerCreation)?;
        Ok(Arc::new(KafkaCheckpointProducer {
            client_id: client_id.to_string(),
            producer,
        }))
    }
}

/// Fixed set of producers for one tenant.
pub struct ProducerPool {
    tenant_id: String,
    producers: Vec<Arc<dyn CheckpointProducer>>,
}

impl ProducerPool {
    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    pub fn producers(&self) -> &[Arc<dyn CheckpointProducer>] {
        &self.producers
    }

    /// Sequence subscribers always get the same producer for the same key so
    /// per-key order survives the publish hop; everyone else is spread randomly.
    ///
    /// Order holds for first attempts only. A record whose delivery failed is
    /// resent after its successors with the same key were already delivered,
    /// so retried sequence records can land out of order.
    pub fn select(
        &self,
        subscriber: &SubscriberInfo,
        key: &[u8],
    ) -> Result<Arc<dyn CheckpointProducer>, ConfigError> {
        if self.producers.is_empty() {
            return Err(ConfigError::MissingProducer {
                tenant_id: self.tenant_id.clone(),
            });
        }
        let index = if subscriber.is_sequence() {
            crc32fast::hash(key) as usize % self.producers.len()
        } else {
            rand::thread_rng().gen_range(0..self.producers.len())
        };
        Ok(self.producers[index].clone())
    }
}

/// Handle for one in-flight checkpoint send.
pub struct CheckpointSentResult {
    pub record: SubscriberRecord,
    pub value: Arc<Value>,
    pub producer: Arc<dyn CheckpointProducer>,
    pub delivery: DeliveryFuture,
    pub attempt: Attempt,
}

pub struct PublisherSettings {
    pub pipeline: String,
    pub topic_prefix: String,
    pub producer_pool_size: usize,
    pub flush_timeout: Duration,
}

/// Republishes matched records to per-subscriber checkpoint topics through
/// lazily built, per-tenant producer pools.
pub struct CheckpointPublisher {
    settings: PublisherSettings,
    resolver: Arc<dyn TenantSourceResolver>,
    factory: Arc<dyn ProducerFactory>,
    pools: DashMap<String, Arc<ProducerPool>>,
}

impl CheckpointPublisher {
    pub fn new(
        settings: PublisherSettings,
        resolver: Arc<dyn TenantSourceResolver>,
        factory: Arc<dyn ProducerFactory>,
    ) -> Result<Self, ConfigError> {
        if settings.producer_pool_size == 0 {
            return Err(ConfigError::ZeroSize {
                field: "producer_pool_size",
            });
        }
        Ok(Self {
            settings,
            resolver,
            factory,
            pools: DashMap::new(),
        })
    }

    pub fn flush_timeout(&self) -> Duration {
        self.settings.flush_timeout
    }

    pub fn topic_for(&self, subscriber: &SubscriberInfo) -> String {
        checkpoint_topic_name(
            &self.settings.topic_prefix,
            &self.settings.pipeline,
            &subscriber.id,
        )
    }

    /// Pool for the subscriber's tenant, built once per tenant on first use.
    pub fn obtain_producer_pool(
        &self,
        subscriber: &SubscriberInfo,
    ) -> Result<Arc<ProducerPool>, PublishError> {
        let tenant_id = subscriber.tenant_id()?;
        if let Some(pool) = self.pools.get(tenant_id) {
            return Ok(pool.clone());
        }

        let entry = self
            .pools
            .entry(tenant_id.to_string())
            .or_try_insert_with(|| self.build_pool(tenant_id))?;
        Ok(entry.clone())
    }

    fn build_pool(&self, tenant_id: &str) -> Result<Arc<ProducerPool>, PublishError> {
        let source = self
            .resolver
            .load_source_by_tenant(&self.settings.pipeline, tenant_id)
            .ok_or_else(|| ConfigError::MissingTenantSource {
                pipeline: self.settings.pipeline.clone(),
                tenant_id: tenant_id.to_string(),
            })?;

        let producers = (0..self.settings.producer_pool_size)
            .map(|i| {
                let client_id = format!("checkpoint-{}-{tenant_id}-{i}", self.settings.pipeline);
                self.factory.create(&source, &client_id)
            })
            .collect::<Result<Vec<_>, _>>()?;

        metrics::counter!(PRODUCER_POOLS_CREATED_TOTAL).increment(1);
        info!(
            pipeline = %self.settings.pipeline,
            tenant = tenant_id,
            bootstrap_servers = %source.bootstrap_servers,
            producers = producers.len(),
            "Created checkpoint producer pool"
        );

        Ok(Arc::new(ProducerPool {
            tenant_id: tenant_id.to_string(),
            producers,
        }))
    }

    pub fn select_producer(
        &self,
        subscriber: &SubscriberInfo,
        key: &[u8],
    ) -> Result<Arc<dyn CheckpointProducer>, PublishError> {
        Ok(self.obtain_producer_pool(subscriber)?.select(subscriber, key)?)
    }

    /// Enqueue one checkpoint record. Returns as soon as the producer accepted
    /// it; the delivery report arrives through `CheckpointSentResult::delivery`.
    ///
    /// Resending a sequence record through here after a failed delivery does
    /// not restore its place among same-key records; see `ProducerPool::select`.
    pub fn send_async(
        &self,
        record: SubscriberRecord,
        value: Arc<Value>,
        attempt: Attempt,
    ) -> Result<CheckpointSentResult, PublishError> {
        let subscriber = record.subscriber.clone();
        let producer = self.select_producer(&subscriber, record.record.key_bytes())?;
        let metadata = CheckpointMetadata::for_subscriber(&subscriber);

        let message = CheckpointMessage {
            topic: self.topic_for(&subscriber),
            key: record.record.key.clone(),
            payload: serde_json::to_vec(value.as_ref())?,
            headers: metadata.to_headers(&record.record.headers),
        };

        let delivery = producer.send(message)?;
        Ok(CheckpointSentResult {
            record,
            value,
            producer,
            delivery,
            attempt,
        })
    }

    /// Flush and drop every cached pool.
    pub fn close(&self) {
        let timeout = self.settings.flush_timeout;
        for entry in self.pools.iter() {
            for producer in entry.value().producers() {
                if let Err(e) = producer.flush(timeout) {
                    warn!(
                        tenant = %entry.key(),
                        client_id = producer.client_id(),
                        error = ?e,
                        "Failed to flush producer on close"
                    );
                }
            }
        }
        self.pools.clear();
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}
