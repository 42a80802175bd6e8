use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::dispatch::executor::FilterMapExecutor;
use crate::dispatch::matcher::{match_records, MatchResult};
use crate::dispatch::publisher::{CheckpointProducer, CheckpointPublisher};
use crate::dispatch::retry::{AbandonReason, RetryDecision, RetryPolicy};
use crate::error::{DispatchError, ExecutorError, ProcessError, PublishError, Stage};
use crate::kafka::batch_consumer::BatchProcessor;
use crate::kafka::committer::OffsetCommitter;
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::record::Batch;
use crate::kafka::types::Partition;
use crate::metrics_consts::{
    ACKNOWLEDGE_DURATION_MS, ACKNOWLEDGE_GAP_DETECTED_TOTAL, ACKNOWLEDGE_TOTAL,
    BATCH_DISPATCH_DURATION_MS, BATCH_DISPATCH_FATAL_TOTAL, CHECKPOINT_SENT_DURATION_MS, CHECKPOINT_SENT_TOTAL,
    FILTER_RECORDS_DURATION_MS, FILTER_RECORDS_TOTAL, RECORDS_ABANDONED_TOTAL, TASK_RETRIES_TOTAL,
};
use crate::process::FilterMapOutcome;
use crate::qos::{AckAction, BatchLedger, Force, QoS};
use crate::registry::SubscriberRegistry;
use crate::subscriber::{Attempt, SubscriberRecord};

type FilterMapFuture = BoxFuture<'static, FilterMapAttempt>;
type PublishFuture = BoxFuture<'static, PublishAttempt>;

/// A filter/map task in flight, with the bookkeeping needed to retry it.
struct FilterMapAttempt {
    record: SubscriberRecord,
    attempt: Attempt,
    result: Result<Result<FilterMapOutcome, ProcessError>, ExecutorError>,
}

/// A checkpoint send in flight. `producer` is the one the record was handed to,
/// if it got that far.
struct PublishAttempt {
    record: SubscriberRecord,
    value: Arc<Value>,
    attempt: Attempt,
    producer: Option<Arc<dyn CheckpointProducer>>,
    result: Result<(), PublishError>,
}

/// Record ready to publish after filter/map.
struct Mapped {
    record: SubscriberRecord,
    value: Arc<Value>,
}

/// Counts for one dispatched batch, plus what was committed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub matched: usize,
    pub unmatched: usize,
    pub undecodable: usize,
    pub filtered: usize,
    pub published: usize,
    pub abandoned: usize,
    /// Next offsets committed to the group.
    pub committed: BTreeMap<Partition, i64>,
    /// Offsets the consumer was rewound to.
    pub rewound: BTreeMap<Partition, i64>,
}

pub struct DispatcherSettings {
    pub pipeline: String,
    /// When false, nothing is republished and every batch is force acknowledged.
    pub checkpoint_enabled: bool,
    pub qos: Arc<dyn QoS>,
    pub retry: RetryPolicy,
    pub shutdown_timeout: Duration,
}

/// Runs one source batch through match, filter/map, publish and acknowledge.
///
/// Per-record failures never fail the batch: they are retried within the
/// budget and then abandoned, and the QoS tier decides what that means for the
/// commit. Only configuration errors and a closed executor are returned.
pub struct BatchDispatcher {
    settings: DispatcherSettings,
    registry: Arc<dyn SubscriberRegistry>,
    executor: Arc<FilterMapExecutor>,
    publisher: Arc<CheckpointPublisher>,
    committer: Arc<dyn OffsetCommitter>,
    offset_tracker: Arc<OffsetTracker>,
}

impl BatchDispatcher {
    pub fn new(
        settings: DispatcherSettings,
        registry: Arc<dyn SubscriberRegistry>,
        executor: Arc<FilterMapExecutor>,
        publisher: Arc<CheckpointPublisher>,
        committer: Arc<dyn OffsetCommitter>,
        offset_tracker: Arc<OffsetTracker>,
    ) -> Self {
        Self {
            settings,
            registry,
            executor,
            publisher,
            committer,
            offset_tracker,
        }
    }

    pub fn pipeline(&self) -> &str {
        &self.settings.pipeline
    }

    fn qos(&self) -> &dyn QoS {
        if self.settings.checkpoint_enabled {
            self.settings.qos.as_ref()
        } else {
            &Force
        }
    }

    pub async fn dispatch(&self, batch: Batch) -> Result<BatchSummary, DispatchError> {
        let start = Instant::now();
        let mut summary = BatchSummary::default();
        let mut ledger = BatchLedger::new();

        let (records, errors) = batch.unpack();
        for e in &errors {
            if let (Some(partition), Some(offset)) = (e.partition(), e.offset()) {
                warn!(
                    pipeline = %self.settings.pipeline,
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    error = ?e.error(),
                    "Skipping undecodable record"
                );
                ledger.settle(partition, offset);
            }
        }
        summary.undecodable = errors.len();

        let subscribers = self.registry.get_subscribers(&self.settings.pipeline);
        self.executor.chain().refresh(&subscribers);

        let MatchResult { matched, unmatched } = match_records(&subscribers, records);
        for record in &unmatched {
            ledger.settle(record.partition(), record.offset());
        }
        summary.matched = matched.len();
        summary.unmatched = unmatched.len();

        let mapped = match self.run_filter_map(matched, &mut ledger, &mut summary).await {
            Ok(mapped) => mapped,
            Err(e) => {
                self.executor.cancel_all();
                return Err(e);
            }
        };

        if self.settings.checkpoint_enabled {
            self.publish(mapped, &mut ledger, &mut summary).await?;
        } else {
            for m in &mapped {
                ledger.settle(m.record.partition(), m.record.offset());
            }
        }

        self.acknowledge(&ledger, &mut summary).await;

        metrics::histogram!(BATCH_DISPATCH_DURATION_MS).record(start.elapsed().as_millis() as f64);
        debug!(
            pipeline = %self.settings.pipeline,
            matched = summary.matched,
            unmatched = summary.unmatched,
            filtered = summary.filtered,
            published = summary.published,
            abandoned = summary.abandoned,
            "Dispatched batch"
        );

        Ok(summary)
    }

    /// Submit every matched record in source order, then fan in results as they
    /// complete. Failures go back to the executor after their backoff.
    async fn run_filter_map(
        &self,
        matched: Vec<SubscriberRecord>,
        ledger: &mut BatchLedger,
        summary: &mut BatchSummary,
    ) -> Result<Vec<Mapped>, DispatchError> {
        let mut in_flight: FuturesUnordered<FilterMapFuture> = FuturesUnordered::new();

        // Sequential submission keeps equal keys in order on their isolated pool
        for record in matched {
            let handle = self.executor.submit(record.clone()).await?;
            let attempt = Attempt::first();
            in_flight.push(
                async move {
                    FilterMapAttempt {
                        record,
                        attempt,
                        result: Ok(handle.await),
                    }
                }
                .boxed(),
            );
        }

        let retry_enabled = self.qos().supports_retry();
        let mut mapped = Vec::with_capacity(in_flight.len());

        while let Some(FilterMapAttempt {
            record,
            attempt,
            result,
        }) = in_flight.next().await
        {
            match result? {
                Ok(outcome) if outcome.matched => {
                    metrics::counter!(FILTER_RECORDS_TOTAL, "status" => "matched").increment(1);
                    metrics::histogram!(FILTER_RECORDS_DURATION_MS)
                        .record(attempt.retry_begin.elapsed().as_millis() as f64);
                    mapped.push(Mapped {
                        record,
                        value: outcome.value,
                    });
                }
                Ok(_) => {
                    metrics::counter!(FILTER_RECORDS_TOTAL, "status" => "filtered").increment(1);
                    ledger.settle(record.partition(), record.offset());
                    summary.filtered += 1;
                }
                Err(e) => {
                    metrics::counter!(FILTER_RECORDS_TOTAL, "status" => "failed").increment(1);
                    match self.settings.retry.decide(attempt, e.is_give_up(), retry_enabled) {
                        RetryDecision::Retry { attempt, backoff } => {
                            metrics::counter!(TASK_RETRIES_TOTAL, "stage" => Stage::FilterMap.as_str())
                                .increment(1);
                            debug!(
                                subscriber = %record.subscriber.id,
                                offset = record.offset(),
                                retry_times = attempt.retry_times,
                                error = %e,
                                "Retrying filter/map task"
                            );
                            in_flight.push(resubmit(self.executor.clone(), record, attempt, backoff));
                        }
                        RetryDecision::Abandon(reason) => {
                            self.abandon(Stage::FilterMap, reason, &record, &e.to_string());
                            ledger.abandon(record.partition(), record.offset());
                            summary.abandoned += 1;
                        }
                    }
                }
            }
        }

        // Source order, so a sequence key reaches its producer in the order it was consumed
        mapped.sort_by(|a, b| {
            (a.record.partition(), a.record.offset()).cmp(&(b.record.partition(), b.record.offset()))
        });
        Ok(mapped)
    }

    async fn publish(
        &self,
        mapped: Vec<Mapped>,
        ledger: &mut BatchLedger,
        summary: &mut BatchSummary,
    ) -> Result<(), DispatchError> {
        let qos = self.qos();
        let retry_enabled = qos.supports_retry();
        let mut used: HashMap<String, Arc<dyn CheckpointProducer>> = HashMap::new();
        let mut in_flight: FuturesUnordered<PublishFuture> = FuturesUnordered::new();

        for Mapped { record, value } in mapped {
            let attempt = Attempt::first();
            match self.publisher.send_async(record.clone(), value.clone(), attempt) {
                Ok(sent) => {
                    used.insert(sent.producer.client_id().to_string(), sent.producer.clone());
                    if qos.awaits_delivery() {
                        let producer = sent.producer;
                        let delivery = sent.delivery;
                        in_flight.push(
                            async move {
                                PublishAttempt {
                                    record,
                                    value,
                                    attempt,
                                    producer: Some(producer),
                                    result: delivery.await,
                                }
                            }
                            .boxed(),
                        );
                    } else {
                        metrics::counter!(CHECKPOINT_SENT_TOTAL, "status" => "enqueued").increment(1);
                        ledger.settle(record.partition(), record.offset());
                        summary.published += 1;
                    }
                }
                Err(e) => {
                    let e = e.escalate()?;
                    in_flight.push(
                        futures::future::ready(PublishAttempt {
                            record,
                            value,
                            attempt,
                            producer: None,
                            result: Err(e),
                        })
                        .boxed(),
                    );
                }
            }
        }

        while let Some(PublishAttempt {
            record,
            value,
            attempt,
            producer,
            result,
        }) = in_flight.next().await
        {
            if let Some(producer) = producer {
                used.entry(producer.client_id().to_string())
                    .or_insert(producer);
            }

            let e = match result {
                Ok(()) => {
                    metrics::counter!(CHECKPOINT_SENT_TOTAL, "status" => "success").increment(1);
                    metrics::histogram!(CHECKPOINT_SENT_DURATION_MS)
                        .record(attempt.retry_begin.elapsed().as_millis() as f64);
                    ledger.settle(record.partition(), record.offset());
                    summary.published += 1;
                    continue;
                }
                Err(e) => e.escalate()?,
            };

            metrics::counter!(CHECKPOINT_SENT_TOTAL, "status" => "failed").increment(1);
            match self.settings.retry.decide(attempt, e.is_give_up(), retry_enabled) {
                RetryDecision::Retry { attempt, backoff } => {
                    metrics::counter!(TASK_RETRIES_TOTAL, "stage" => Stage::Publish.as_str())
                        .increment(1);
                    debug!(
                        subscriber = %record.subscriber.id,
                        offset = record.offset(),
                        retry_times = attempt.retry_times,
                        error = %e,
                        "Retrying checkpoint send"
                    );
                    in_flight.push(resend(self.publisher.clone(), record, value, attempt, backoff));
                }
                RetryDecision::Abandon(reason) => {
                    self.abandon(Stage::Publish, reason, &record, &e.to_string());
                    ledger.abandon(record.partition(), record.offset());
                    summary.abandoned += 1;
                }
            }
        }

        self.flush(used.into_values().collect()).await;
        Ok(())
    }

    async fn flush(&self, producers: Vec<Arc<dyn CheckpointProducer>>) {
        let timeout = self.publisher.flush_timeout();
        let flushes = producers.into_iter().map(|producer| async move {
            let client_id = producer.client_id().to_string();
            let result = tokio::task::spawn_blocking(move || producer.flush(timeout)).await;
            (client_id, result)
        });

        for (client_id, result) in futures::future::join_all(flushes).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(pipeline = %self.settings.pipeline, client_id = %client_id, error = ?e, "Failed to flush checkpoint producer");
                }
                Err(e) => {
                    warn!(pipeline = %self.settings.pipeline, client_id = %client_id, error = ?e, "Checkpoint producer flush panicked");
                }
            }
        }
    }

    fn abandon(&self, stage: Stage, reason: AbandonReason, record: &SubscriberRecord, error: &str) {
        metrics::counter!(
            RECORDS_ABANDONED_TOTAL,
            "stage" => stage.as_str(),
            "reason" => reason.as_str()
        )
        .increment(1);
        warn!(
            pipeline = %self.settings.pipeline,
            subscriber = %record.subscriber.id,
            topic = record.partition().topic(),
            partition = record.partition().partition_number(),
            offset = record.offset(),
            stage = %stage,
            reason = reason.as_str(),
            error = error,
            "Abandoning record"
        );
    }

    /// Commit what the QoS tier allows. Commit failures are logged and the
    /// batch is rewound so it is consumed again.
    async fn acknowledge(&self, ledger: &BatchLedger, summary: &mut BatchSummary) {
        if ledger.is_empty() {
            return;
        }

        let action = self.qos().acknowledge_action(ledger);
        let kind = action.kind();

        if let AckAction::CommitPrefix(offsets) = &action {
            let batch_end = ledger.batch_end_offsets();
            for (partition, end) in &batch_end {
                if offsets.get(partition) != Some(end) {
                    metrics::counter!(
                        ACKNOWLEDGE_GAP_DETECTED_TOTAL,
                        "topic" => partition.topic().to_string(),
                        "partition" => partition.partition_number().to_string()
                    )
                    .increment(1);
                }
            }
        }

        let advancing = self.offset_tracker.advancing(action.offsets());
        if !advancing.is_empty() {
            let start = Instant::now();
            match self.committer.commit(&advancing).await {
                Ok(()) => {
                    metrics::counter!(ACKNOWLEDGE_TOTAL, "status" => "success", "kind" => kind)
                        .increment(1);
                    metrics::histogram!(ACKNOWLEDGE_DURATION_MS, "kind" => kind)
                        .record(start.elapsed().as_millis() as f64);
                    self.offset_tracker.mark_committed(&advancing);
                    summary.committed = advancing;
                }
                Err(e) => {
                    metrics::counter!(ACKNOWLEDGE_TOTAL, "status" => "error", "kind" => kind)
                        .increment(1);
                    error!(
                        pipeline = %self.settings.pipeline,
                        kind = kind,
                        error = %e,
                        "Failed to commit offsets, batch will be redelivered"
                    );
                    self.rewind(ledger.redelivery_offsets(&BTreeMap::new()), summary)
                        .await;
                    return;
                }
            }
        }

        if let AckAction::CommitPrefix(offsets) = &action {
            self.rewind(ledger.redelivery_offsets(offsets), summary).await;
        }
    }

    async fn rewind(&self, offsets: BTreeMap<Partition, i64>, summary: &mut BatchSummary) {
        if offsets.is_empty() {
            return;
        }
        for (partition, offset) in &offsets {
            info!(
                pipeline = %self.settings.pipeline,
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = offset,
                "Rewinding partition for redelivery"
            );
        }
        match self.committer.seek(&offsets).await {
            Ok(()) => summary.rewound = offsets,
            Err(e) => {
                error!(
                    pipeline = %self.settings.pipeline,
                    error = %e,
                    "Failed to rewind partitions, records redeliver after the next rebalance"
                );
            }
        }
    }

    /// Cancel pending tasks, drain the worker pools and flush every producer.
    pub async fn close(&self) {
        info!(pipeline = %self.settings.pipeline, "Closing batch dispatcher");
        self.executor.cancel_all();
        self.executor.shutdown(self.settings.shutdown_timeout).await;

        let publisher = self.publisher.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || publisher.close()).await {
            warn!(pipeline = %self.settings.pipeline, error = ?e, "Closing checkpoint publisher panicked");
        }
    }
}

#[async_trait]
impl BatchProcessor for BatchDispatcher {
    async fn process_batch(&self, batch: Batch) -> Result<(), DispatchError> {
        match self.dispatch(batch).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.is_fatal() {
                    metrics::counter!(
                        BATCH_DISPATCH_FATAL_TOTAL,
                        "pipeline" => self.settings.pipeline.clone()
                    )
                    .increment(1);
                }
                Err(e)
            }
        }
    }
}

fn resubmit(
    executor: Arc<FilterMapExecutor>,
    record: SubscriberRecord,
    attempt: Attempt,
    backoff: Duration,
) -> FilterMapFuture {
    async move {
        tokio::time::sleep(backoff).await;
        let result = match executor.submit(record.clone()).await {
            Ok(handle) => Ok(handle.await),
            Err(e) => Err(e),
        };
        FilterMapAttempt {
            record,
            attempt,
            result,
        }
    }
    .boxed()
}

fn resend(
    publisher: Arc<CheckpointPublisher>,
    record: SubscriberRecord,
    value: Arc<Value>,
    attempt: Attempt,
    backoff: Duration,
) -> PublishFuture {
    async move {
        tokio::time::sleep(backoff).await;
        let (producer, result) = match publisher.send_async(record.clone(), value.clone(), attempt) {
            Ok(sent) => (Some(sent.producer), sent.delivery.await),
            Err(e) => (None, Err(e)),
        };
        PublishAttempt {
            record,
            value,
            attempt,
            producer,
            result,
        }
    }
    .boxed()
}
