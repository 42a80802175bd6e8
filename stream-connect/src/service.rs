use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use common_kafka::consumer_config::ConsumerConfigBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dispatch::dispatcher::{BatchDispatcher, DispatcherSettings};
use crate::dispatch::executor::FilterMapExecutor;
use crate::dispatch::publisher::{CheckpointPublisher, KafkaProducerFactory, PublisherSettings};
use crate::kafka::batch_consumer::{create_source_consumer, BatchConsumer};
use crate::kafka::committer::KafkaOffsetCommitter;
use crate::kafka::offset_tracker::OffsetTracker;
use crate::qos::qos_by_name;
use crate::registry::{
    ShardedSubscriberRegistry, StaticSubscriberRegistry, SubscriberRegistry, TenantSourceResolver,
};
use crate::sharding::{strategy_by_name, ShardingCoordinator};
use crate::topic_manager::{KafkaTopicAdminFactory, TopicManager, TopicManagerSettings};

/// Wires the consumer, dispatcher and topic manager for one pipeline.
pub struct StreamConnectService {
    config: Config,
    consumer: BatchConsumer,
    dispatcher: Arc<BatchDispatcher>,
    topic_manager: TopicManager,
    owned_subscribers: Arc<dyn SubscriberRegistry>,
    shutdown: CancellationToken,
}

impl StreamConnectService {
    /// Build every component. Must run inside the tokio runtime: the worker
    /// pools are spawned here.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for pipeline '{}' on topic '{}'",
                config.pipeline_name, config.kafka_consumer_topic
            )
        })?;

        let registry = Arc::new(
            StaticSubscriberRegistry::from_path(&config.subscribers_path_buf())
                .context("Failed to load subscriber registry")?,
        );

        let coordinator = Arc::new(ShardingCoordinator::new(
            strategy_by_name(&config.sharding_strategy)?,
            config.sharding_total_count,
            config.instance_id.clone(),
            &config.server_instances(),
        ));
        let owned_subscribers: Arc<dyn SubscriberRegistry> = Arc::new(
            ShardedSubscriberRegistry::new(registry.clone(), coordinator),
        );

        let offset_tracker = Arc::new(OffsetTracker::new());
        let consumer_config =
            ConsumerConfigBuilder::from_kafka_config(&config.kafka, &config.kafka_consumer_group)
                .build();
        let source = create_source_consumer(&consumer_config, offset_tracker.clone())
            .with_context(|| {
                format!(
                    "Failed to create Kafka consumer for group '{}'",
                    config.kafka_consumer_group
                )
            })?;
        let committer = Arc::new(KafkaOffsetCommitter::new(
            source.clone(),
            config.admin_timeout(),
        ));

        let executor = Arc::new(FilterMapExecutor::new(
            Arc::new(config.process_chain()?),
            &config.executor_settings(),
        )?);

        let resolver: Arc<dyn TenantSourceResolver> = registry.clone();
        let publisher = Arc::new(CheckpointPublisher::new(
            PublisherSettings {
                pipeline: config.pipeline_name.clone(),
                topic_prefix: config.checkpoint_topic_prefix.clone(),
                producer_pool_size: config.producer_pool_size,
                flush_timeout: config.producer_flush_timeout(),
            },
            resolver.clone(),
            Arc::new(KafkaProducerFactory::new(config.kafka.clone())),
        )?);

        let dispatcher = Arc::new(BatchDispatcher::new(
            DispatcherSettings {
                pipeline: config.pipeline_name.clone(),
                checkpoint_enabled: config.checkpoint_enabled,
                qos: qos_by_name(&config.qos)?,
                retry: config.retry_policy(),
                shutdown_timeout: config.shutdown_timeout(),
            },
            registry,
            executor,
            publisher,
            committer,
            offset_tracker,
        ));

        let shutdown = CancellationToken::new();
        let consumer = BatchConsumer::new(
            source,
            &config.kafka_consumer_topic,
            dispatcher.clone(),
            shutdown.clone(),
            config.batch_size,
            config.batch_timeout(),
        )?;

        let topic_manager = TopicManager::new(
            Arc::new(KafkaTopicAdminFactory::new(
                config.kafka.clone(),
                config.admin_timeout(),
            )),
            resolver,
            TopicManagerSettings {
                topic_prefix: config.checkpoint_topic_prefix.clone(),
                partitions: config.checkpoint_topic_partitions,
                replication_factor: config.checkpoint_replication_factor,
                admin_timeout: config.admin_timeout(),
            },
        );

        info!(
            pipeline = %config.pipeline_name,
            topic = %config.kafka_consumer_topic,
            group = %config.kafka_consumer_group,
            qos = %config.qos,
            checkpoint_enabled = config.checkpoint_enabled,
            "Initialized stream connect service"
        );

        Ok(Self {
            config,
            consumer,
            dispatcher,
            topic_manager,
            owned_subscribers,
            shutdown,
        })
    }

    /// Provision checkpoint topics, then consume until `shutdown_signal`
    /// resolves or the consumer stops on its own.
    pub async fn run(self, shutdown_signal: impl Future<Output = ()>) -> Result<()> {
        let Self {
            config,
            consumer,
            dispatcher,
            topic_manager,
            owned_subscribers,
            shutdown,
        } = self;

        if config.checkpoint_enabled {
            let results = topic_manager
                .provision_all(&owned_subscribers.get_sharding_all())
                .await;
            let failed = results.values().filter(|r| r.is_err()).count();
            if failed > 0 {
                warn!(failed, "Some pipelines failed topic provisioning");
            }
        }

        info!("Starting stream connect consumer");
        let mut consumer_handle = tokio::spawn(consumer.start_consumption());

        let stopped_early = tokio::select! {
            _ = shutdown_signal => None,
            joined = &mut consumer_handle => Some(joined),
        };

        let consumer_result = match stopped_early {
            Some(joined) => Some(joined),
            None => {
                info!("Received shutdown signal, shutting down gracefully...");
                shutdown.cancel();
                match tokio::time::timeout(config.shutdown_timeout(), &mut consumer_handle).await {
                    Ok(joined) => Some(joined),
                    Err(_) => {
                        error!(
                            "Consumer shutdown timed out after {:?}",
                            config.shutdown_timeout()
                        );
                        consumer_handle.abort();
                        None
                    }
                }
            }
        };

        dispatcher.close().await;

        match consumer_result {
            Some(Ok(Ok(()))) => {
                info!("Stream connect service stopped");
                Ok(())
            }
            Some(Ok(Err(e))) => {
                error!("Consumer stopped with error: {e:#}");
                Err(e)
            }
            Some(Err(e)) => Err(anyhow!(e).context("Consumer task panicked")),
            None => Err(anyhow!("Consumer did not stop within the shutdown timeout")),
        }
    }
}
