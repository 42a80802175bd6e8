use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::kafka::record::SourceRecord;
use crate::kafka::types::Partition;

pub const DEFAULT_LOG_RETENTION_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// A registered downstream consumer of the source stream. Read-only for the
/// lifetime of a batch; the registry hands out fresh snapshots between batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberInfo {
    pub id: String,
    pub rule: SubscribeRule,
    #[serde(default)]
    pub settings: SubscribeSettings,
}

impl SubscriberInfo {
    /// Tenant owning this subscriber's checkpoint output, taken from the
    /// first routing policy.
    pub fn tenant_id(&self) -> Result<&str, ConfigError> {
        self.rule
            .policies
            .first()
            .map(|p| p.tenant_id.as_str())
            .ok_or_else(|| ConfigError::MissingTenant {
                subscriber_id: self.id.clone(),
            })
    }

    pub fn is_sequence(&self) -> bool {
        self.rule.is_sequence
    }

    pub fn matches(&self, record: &SourceRecord) -> bool {
        self.rule.predicate.matches(record)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SubscribeRule {
    /// Records for this subscriber must keep per-key order.
    #[serde(default)]
    pub is_sequence: bool,
    #[serde(default)]
    pub predicate: MatchPredicate,
    #[serde(default)]
    pub policies: Vec<RoutingPolicy>,
}

/// Tenant-scoped data permission: which records a tenant may see and which
/// fields must be masked before republishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub tenant_id: String,
    #[serde(default)]
    pub condition: Option<MatchPredicate>,
    /// JSON pointers (RFC 6901) removed from the value by the field mask mapper.
    #[serde(default)]
    pub exclude_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeSettings {
    #[serde(default = "default_log_retention_ms")]
    pub log_retention_ms: i64,
    /// -1 means no size bound.
    #[serde(default = "default_log_retention_bytes")]
    pub log_retention_bytes: i64,
}

fn default_log_retention_ms() -> i64 {
    DEFAULT_LOG_RETENTION_MS
}

fn default_log_retention_bytes() -> i64 {
    -1
}

impl Default for SubscribeSettings {
    fn default() -> Self {
        Self {
            log_retention_ms: DEFAULT_LOG_RETENTION_MS,
            log_retention_bytes: -1,
        }
    }
}

/// Record predicate used both by the matcher and by routing policy conditions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchPredicate {
    #[default]
    All,
    Header {
        name: String,
        value: String,
    },
    KeyPrefix {
        prefix: String,
    },
    Field {
        pointer: String,
        value: Value,
    },
    AnyOf {
        predicates: Vec<MatchPredicate>,
    },
    AllOf {
        predicates: Vec<MatchPredicate>,
    },
}

impl MatchPredicate {
    pub fn matches(&self, record: &SourceRecord) -> bool {
        match self {
            MatchPredicate::All => true,
            MatchPredicate::Header { name, value } => {
                record.header(name) == Some(value.as_bytes())
            }
            MatchPredicate::KeyPrefix { prefix } => {
                record.key_bytes().starts_with(prefix.as_bytes())
            }
            MatchPredicate::Field { pointer, value } => {
                record.value.pointer(pointer) == Some(value)
            }
            MatchPredicate::AnyOf { predicates } => predicates.iter().any(|p| p.matches(record)),
            MatchPredicate::AllOf { predicates } => predicates.iter().all(|p| p.matches(record)),
        }
    }
}

/// One source record paired with the single subscriber it matched. Identity is
/// the source coordinates.
#[derive(Debug, Clone)]
pub struct SubscriberRecord {
    pub subscriber: Arc<SubscriberInfo>,
    pub record: SourceRecord,
}

impl SubscriberRecord {
    pub fn new(subscriber: Arc<SubscriberInfo>, record: SourceRecord) -> Self {
        Self { subscriber, record }
    }

    pub fn partition(&self) -> &Partition {
        self.record.partition()
    }

    pub fn offset(&self) -> i64 {
        self.record.offset()
    }
}

impl PartialEq for SubscriberRecord {
    fn eq(&self, other: &Self) -> bool {
        self.record.partition() == other.record.partition()
            && self.record.offset() == other.record.offset()
    }
}

impl Eq for SubscriberRecord {}

impl Hash for SubscriberRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.record.partition().hash(state);
        self.record.offset().hash(state);
    }
}

/// Retry bookkeeping carried with a record through both stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// Time of first submission; never reset by a retry.
    pub retry_begin: Instant,
    pub retry_times: u32,
}

impl Attempt {
    pub fn first() -> Self {
        Self {
            retry_begin: Instant::now(),
            retry_times: 0,
        }
    }

    pub fn next(self) -> Self {
        Self {
            retry_begin: self.retry_begin,
            retry_times: self.retry_times + 1,
        }
    }
}
