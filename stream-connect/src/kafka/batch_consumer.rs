use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, MessageStream, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::Message;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::DispatchError;
use crate::kafka::context::ConnectConsumerContext;
use crate::kafka::metrics_consts::{
    BATCH_CONSUMER_BATCH_COLLECTION_DURATION_MS, BATCH_CONSUMER_BATCH_FILL_RATIO,
    BATCH_CONSUMER_BATCH_SIZE, BATCH_CONSUMER_DISPATCH_ERROR, BATCH_CONSUMER_KAFKA_ERROR,
    BATCH_CONSUMER_MESSAGES_RECEIVED,
};
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::record::{Batch, BatchError, SourceRecord};
use crate::kafka::types::Partition;

#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process_batch(&self, batch: Batch) -> Result<(), DispatchError>;
}

pub type SourceConsumer = StreamConsumer<ConnectConsumerContext>;

/// Build the shared-group source consumer. Offsets are committed explicitly
/// by the dispatcher through the same handle.
pub fn create_source_consumer(
    config: &ClientConfig,
    offset_tracker: Arc<OffsetTracker>,
) -> Result<Arc<SourceConsumer>> {
    let consumer: SourceConsumer = config
        .create_with_context(ConnectConsumerContext::new(offset_tracker))
        .context("Failed to create Kafka consumer")?;
    Ok(Arc::new(consumer))
}

pub struct BatchConsumer {
    consumer: Arc<SourceConsumer>,

    // how big batches get and how long to wait for a full one
    batch_size: usize,
    batch_timeout: Duration,

    processor: Arc<dyn BatchProcessor>,

    shutdown: CancellationToken,
}

impl BatchConsumer {
    pub fn new(
        consumer: Arc<SourceConsumer>,
        topic: &str,
        processor: Arc<dyn BatchProcessor>,
        shutdown: CancellationToken,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> Result<Self> {
        consumer
            .subscribe(&[topic])
            .with_context(|| format!("Failed to subscribe to topic: {topic}"))?;

        Ok(Self {
            consumer,
            batch_size,
            batch_timeout,
            processor,
            shutdown,
        })
    }

    /// Consume and dispatch batches until shutdown or a fatal error.
    pub async fn start_consumption(self) -> Result<()> {
        info!("Starting batch Kafka message consumption...");

        let batch_size = self.batch_size;
        let batch_timeout = self.batch_timeout;
        let mut stream = self.consumer.stream();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping consumption");
                    break;
                }

                batch_result = Self::consume_batch(&mut stream, batch_size, batch_timeout) => {
                    let (batch, collection_duration) = batch_result?;

                    metrics::histogram!(BATCH_CONSUMER_BATCH_COLLECTION_DURATION_MS)
                        .record(collection_duration.as_millis() as f64);

                    if batch.is_empty() {
                        continue;
                    }
                    let record_count = batch.record_count();
                    metrics::counter!(BATCH_CONSUMER_MESSAGES_RECEIVED, "status" => "success")
                        .increment(record_count as u64);
                    metrics::counter!(BATCH_CONSUMER_MESSAGES_RECEIVED, "status" => "error")
                        .increment(batch.error_count() as u64);
                    metrics::histogram!(BATCH_CONSUMER_BATCH_SIZE).record(record_count as f64);
                    metrics::histogram!(BATCH_CONSUMER_BATCH_FILL_RATIO)
                        .record(record_count as f64 / batch_size as f64);

                    if let Err(e) = self.processor.process_batch(batch).await {
                        let fatal = e.is_fatal();
                        metrics::counter!(
                            BATCH_CONSUMER_DISPATCH_ERROR,
                            "fatal" => fatal.to_string()
                        )
                        .increment(1);
                        if fatal {
                            error!(error = %e, "Fatal error dispatching batch, stopping consumption");
                            return Err(anyhow!(e).context("Batch dispatch failed"));
                        }
                        warn!(error = %e, "Error dispatching batch");
                    }
                }
            }
        }

        info!("Batch consumer loop shut down");
        Ok(())
    }

    /// Returns `Some` for errors the loop cannot recover from.
    async fn handle_kafka_error(e: KafkaError, current_count: u64) -> Option<KafkaError> {
        match &e {
            KafkaError::MessageConsumption(code) => {
                match code {
                    RDKafkaErrorCode::PartitionEOF => {
                        metrics::counter!(
                            BATCH_CONSUMER_KAFKA_ERROR,
                            &[("level", "info"), ("error", "partition_eof")]
                        )
                        .increment(1);
                    }
                    RDKafkaErrorCode::OperationTimedOut => {
                        metrics::counter!(
                            BATCH_CONSUMER_KAFKA_ERROR,
                            &[("level", "info"), ("error", "op_timed_out")]
                        )
                        .increment(1);
                    }
                    RDKafkaErrorCode::OffsetOutOfRange => {
                        // auto.offset.reset moves the partition to head or tail
                        warn!("Offset out of range - seeking to configured offset reset policy");
                        metrics::counter!(
                            BATCH_CONSUMER_KAFKA_ERROR,
                            &[("level", "info"), ("error", "offset_out_of_range")]
                        )
                        .increment(1);
                        sleep(Duration::from_millis(500)).await;
                    }
                    _ => {
                        warn!("Kafka consumer error: {code:?}");
                        metrics::counter!(
                            BATCH_CONSUMER_KAFKA_ERROR,
                            &[("level", "warn"), ("error", "consumer")]
                        )
                        .increment(1);
                        sleep(Duration::from_millis(100 * current_count.min(10))).await;
                    }
                }
                None
            }

            KafkaError::MessageConsumptionFatal(code) => {
                error!("Fatal Kafka consumer error: {code:?}");
                metrics::counter!(
                    BATCH_CONSUMER_KAFKA_ERROR,
                    &[("level", "fatal"), ("error", "consumer")]
                )
                .increment(1);
                Some(e)
            }

            KafkaError::Global(code) => {
                match code {
                    RDKafkaErrorCode::AllBrokersDown => {
                        warn!("All brokers down: {code:?} - waiting for reconnect");
                        metrics::counter!(
                            BATCH_CONSUMER_KAFKA_ERROR,
                            &[("level", "warn"), ("error", "all_brokers_down")]
                        )
                        .increment(1);
                        sleep(Duration::from_secs(current_count.min(5))).await;
                    }
                    RDKafkaErrorCode::Authentication => {
                        error!("Authentication failed: {code:?}");
                        metrics::counter!(
                            BATCH_CONSUMER_KAFKA_ERROR,
                            &[("level", "fatal"), ("error", "authentication")]
                        )
                        .increment(1);
                        return Some(e);
                    }
                    _ => {
                        warn!("Global Kafka error: {code:?}");
                        metrics::counter!(
                            BATCH_CONSUMER_KAFKA_ERROR,
                            &[("level", "warn"), ("error", "global")]
                        )
                        .increment(1);
                        sleep(Duration::from_millis(500 * current_count.min(6))).await;
                    }
                }
                None
            }

            KafkaError::Canceled => {
                info!("Consumer canceled - shutting down");
                metrics::counter!(
                    BATCH_CONSUMER_KAFKA_ERROR,
                    &[("level", "info"), ("error", "canceled")]
                )
                .increment(1);
                Some(e)
            }

            _ => {
                error!("Unexpected error: {:?}", e);
                metrics::counter!(
                    BATCH_CONSUMER_KAFKA_ERROR,
                    &[("level", "fatal"), ("error", "unexpected")]
                )
                .increment(1);
                sleep(Duration::from_millis(100 * current_count.min(10))).await;
                None
            }
        }
    }

    /// Collect up to `batch_size` records or whatever arrived within
    /// `batch_timeout`. Undecodable payloads become batch errors that keep
    /// their coordinates.
    async fn consume_batch(
        stream: &mut MessageStream<'_, ConnectConsumerContext>,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> KafkaResult<(Batch, Duration)> {
        let start = Instant::now();
        let mut batch = Batch::new_with_size_hint(batch_size);
        let deadline = sleep(batch_timeout);
        tokio::pin!(deadline);
        let mut kafka_error_count = 0;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    break;
                }

                next_msg = stream.next() => {
                    match next_msg {
                        Some(Ok(borrowed_message)) => {
                            kafka_error_count = 0;
                            match SourceRecord::from_borrowed_message(&borrowed_message) {
                                Ok(record) => batch.push_record(record),
                                Err(e) => {
                                    batch.push_error(BatchError::new(
                                        e.context("Error deserializing message"),
                                        Some(Partition::new(
                                            borrowed_message.topic().to_owned(),
                                            borrowed_message.partition(),
                                        )),
                                        Some(borrowed_message.offset()),
                                    ));
                                }
                            }
                        }
                        Some(Err(e)) => {
                            kafka_error_count += 1;
                            if let Some(ke) = Self::handle_kafka_error(e, kafka_error_count).await {
                                return Err(ke);
                            }
                        }
                        None => break,
                    }

                    if batch.record_count() + batch.error_count() >= batch_size {
                        break;
                    }
                }
            }
        }

        Ok((batch, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recoverable_consumption_errors_are_swallowed() {
        let handled = BatchConsumer::handle_kafka_error(
            KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF),
            1,
        )
        .await;
        assert!(handled.is_none());
    }

    #[tokio::test]
    async fn test_fatal_errors_stop_consumption() {
        let fatal = BatchConsumer::handle_kafka_error(
            KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::InvalidGroupId),
            1,
        )
        .await;
        assert!(fatal.is_some());

        let auth = BatchConsumer::handle_kafka_error(
            KafkaError::Global(RDKafkaErrorCode::Authentication),
            1,
        )
        .await;
        assert!(auth.is_some());

        let canceled = BatchConsumer::handle_kafka_error(KafkaError::Canceled, 1).await;
        assert!(canceled.is_some());
    }
}
