/// Counter for messages received by the batch consumer, labelled by status
pub const BATCH_CONSUMER_MESSAGES_RECEIVED: &str = "batch_consumer_messages_received";

/// Histogram for number of decoded records per batch
pub const BATCH_CONSUMER_BATCH_SIZE: &str = "batch_consumer_batch_size";

/// Histogram for how full a batch was when it was handed off (0.0 to 1.0)
pub const BATCH_CONSUMER_BATCH_FILL_RATIO: &str = "batch_consumer_batch_fill_ratio";

/// Histogram for time spent collecting one batch
pub const BATCH_CONSUMER_BATCH_COLLECTION_DURATION_MS: &str =
    "batch_consumer_batch_collection_duration_ms";

/// Counter for Kafka errors seen while consuming, labelled by level and error
pub const BATCH_CONSUMER_KAFKA_ERROR: &str = "batch_consumer_kafka_error";

/// Counter for batches that failed to dispatch, labelled by fatal
pub const BATCH_CONSUMER_DISPATCH_ERROR: &str = "batch_consumer_dispatch_error";
