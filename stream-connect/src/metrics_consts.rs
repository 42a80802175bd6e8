// ==== Filter/map stage ====
/// Counter for filter/map task results, labelled by status (matched, filtered, failed, abandoned)
pub const FILTER_RECORDS_TOTAL: &str = "filter_records_total";

/// Histogram for time from first submission to a settled filter/map result
pub const FILTER_RECORDS_DURATION_MS: &str = "filter_records_duration_ms";

/// Counter for records that matched no subscriber and were dropped
pub const RECORDS_UNMATCHED_TOTAL: &str = "records_unmatched_total";

// ==== Publish stage ====
/// Counter for checkpoint sends, labelled by status (success, failed, abandoned)
pub const CHECKPOINT_SENT_TOTAL: &str = "checkpoint_sent_total";

/// Histogram for checkpoint send latency, first attempt to delivery report
pub const CHECKPOINT_SENT_DURATION_MS: &str = "checkpoint_sent_duration_ms";

/// Counter for tenant producer pools built lazily on first use
pub const PRODUCER_POOLS_CREATED_TOTAL: &str = "producer_pools_created_total";

// ==== Retry and abandonment ====
/// Counter for records abandoned, labelled by stage and reason (give_up, exhausted)
pub const RECORDS_ABANDONED_TOTAL: &str = "records_abandoned_total";

/// Counter for resubmissions, labelled by stage
pub const TASK_RETRIES_TOTAL: &str = "task_retries_total";

// ==== Executor ====
/// Counter for submissions that found a full queue and had to wait
pub const EXECUTOR_QUEUE_SATURATED_TOTAL: &str = "executor_queue_saturated_total";

// ==== Acknowledgment ====
/// Counter for offset commits, labelled by status and kind (commit, prefix)
pub const ACKNOWLEDGE_TOTAL: &str = "acknowledge_total";

/// Histogram for offset commit duration, labelled by kind
pub const ACKNOWLEDGE_DURATION_MS: &str = "acknowledge_duration_ms";

/// Counter for STRICT batches that stopped committing at a gap
pub const ACKNOWLEDGE_GAP_DETECTED_TOTAL: &str = "acknowledge_gap_detected_total";

/// Counter for commits the offset tracker refused because they would move backwards
pub const ACKNOWLEDGE_REGRESSION_SKIPPED_TOTAL: &str = "acknowledge_regression_skipped_total";

// ==== Topic provisioning ====
/// Counter for provisioning runs, labelled by pipeline and status
pub const TOPIC_PROVISIONING_TOTAL: &str = "topic_provisioning_total";

/// Counter for individual topic actions, labelled by action (created, altered, unchanged)
pub const TOPIC_ACTIONS_TOTAL: &str = "topic_actions_total";

// ==== Batch dispatch ====
/// Histogram for end-to-end dispatch duration of one batch
pub const BATCH_DISPATCH_DURATION_MS: &str = "batch_dispatch_duration_ms";

/// Counter for batches that failed with a pipeline-halting error
pub const BATCH_DISPATCH_FATAL_TOTAL: &str = "batch_dispatch_fatal_total";

/// Gauge for number of shards owned by this instance
pub const SHARDS_OWNED: &str = "sharding_owned_shards";

// ==== HTTP ====
/// Counter for requests served by the metrics and health endpoints, scrapes excluded
pub const HTTP_REQUESTS_TOTAL: &str = "connect_http_requests_total";

/// Histogram for request handling time in seconds
pub const HTTP_REQUESTS_DURATION_SECONDS: &str = "connect_http_request_duration_seconds";
