use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use serde_json::Value;

use crate::kafka::types::Partition;

pub struct Batch {
    records: Vec<SourceRecord>,
    errors: Vec<BatchError>,
}

impl Batch {
    pub fn new() -> Self {
        Self {
            records: vec![],
            errors: vec![],
        }
    }

    pub fn new_with_size_hint(hint: usize) -> Self {
        Self {
            records: Vec::with_capacity(hint),
            errors: vec![],
        }
    }

    pub fn from_parts(records: Vec<SourceRecord>, errors: Vec<BatchError>) -> Self {
        Self { records, errors }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.errors.is_empty()
    }

    // consume this Batch and return its contents
    pub fn unpack(self) -> (Vec<SourceRecord>, Vec<BatchError>) {
        (self.records, self.errors)
    }

    pub fn records(&self) -> &[SourceRecord] {
        &self.records
    }

    pub fn push_record(&mut self, record: SourceRecord) {
        self.records.push(record);
    }

    pub fn errors(&self) -> &[BatchError] {
        &self.errors
    }

    pub fn push_error(&mut self, error: BatchError) {
        self.errors.push(error);
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

/// A source message that could not be decoded. It still carries its
/// coordinates so the acknowledgment step can treat the offset as settled.
#[derive(Debug)]
pub struct BatchError {
    error: anyhow::Error,
    partition: Option<Partition>,
    offset: Option<i64>,
}

impl BatchError {
    pub fn new(error: anyhow::Error, partition: Option<Partition>, offset: Option<i64>) -> Self {
        Self {
            error,
            partition,
            offset,
        }
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    pub fn partition(&self) -> Option<&Partition> {
        self.partition.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// Owned, immutable view of one source record. The decoded value is shared so
/// a record can be handed to a worker pool without copying the payload.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    partition: Partition,
    offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Arc<Value>,
    pub headers: Vec<RecordHeader>,
    pub timestamp: Option<SystemTime>,
}

impl SourceRecord {
    pub fn new(partition: Partition, offset: i64, key: Option<Vec<u8>>, value: Value) -> Self {
        Self {
            partition,
            offset,
            key,
            value: Arc::new(value),
            headers: vec![],
            timestamp: None,
        }
    }

    pub fn with_headers(mut self, headers: Vec<RecordHeader>) -> Self {
        self.headers = headers;
        self
    }

    /// Detach a consumed message, decoding its payload as JSON.
    pub fn from_borrowed_message(msg: &BorrowedMessage<'_>) -> Result<Self> {
        let timestamp = msg
            .timestamp()
            .to_millis()
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64));

        let headers = msg
            .headers()
            .map(|h| {
                h.iter()
                    .map(|header| RecordHeader {
                        key: header.key.to_string(),
                        value: header.value.map(|v| v.to_vec()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let payload = msg.payload().ok_or_else(|| anyhow!("No payload in message"))?;
        let value: Value =
            serde_json::from_slice(payload).context("Failed to deserialize message payload")?;

        Ok(Self {
            partition: Partition::new(msg.topic().to_owned(), msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            value: Arc::new(value),
            headers,
            timestamp,
        })
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key_bytes(&self) -> &[u8] {
        self.key.as_deref().unwrap_or(&[])
    }

    /// First header with this name, if it carries a value.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.key == name)
            .and_then(|h| h.value.as_deref())
    }
}
