use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{ConfigError, ProcessError};
use crate::subscriber::{MatchPredicate, SubscriberInfo, SubscriberRecord};

pub trait RecordFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called with the full subscriber set before each batch.
    fn refresh(&self, _subscribers: &[Arc<SubscriberInfo>]) {}

    /// `Ok(false)` drops the record for this subscriber without error.
    fn filter(&self, record: &SubscriberRecord) -> Result<bool, ProcessError>;
}

pub struct NoOpFilter;

impl NoOpFilter {
    pub const NAME: &'static str = "NOOP_FILTER";
}

impl RecordFilter for NoOpFilter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn filter(&self, _record: &SubscriberRecord) -> Result<bool, ProcessError> {
        Ok(true)
    }
}

/// Passes a record when any of the subscriber's routing policies admits it: a
/// policy without a condition admits everything.
///
/// Conditions are merged per subscriber on refresh so the hot path is a single
/// map lookup. A subscriber first seen mid-batch falls back to merging inline.
#[derive(Default)]
pub struct PolicyFilter {
    merged: RwLock<HashMap<String, Arc<Option<MatchPredicate>>>>,
}

impl PolicyFilter {
    pub const NAME: &'static str = "POLICY_FILTER";

    pub fn new() -> Self {
        Self::default()
    }

    /// `None` admits every record; an empty `AnyOf` admits none.
    fn merge(subscriber: &SubscriberInfo) -> Option<MatchPredicate> {
        let policies = &subscriber.rule.policies;
        if !policies.is_empty() && policies.iter().any(|p| p.condition.is_none()) {
            return None;
        }
        Some(MatchPredicate::AnyOf {
            predicates: policies.iter().filter_map(|p| p.condition.clone()).collect(),
        })
    }

    fn merged_for(&self, subscriber: &SubscriberInfo) -> Arc<Option<MatchPredicate>> {
        let cached = match self.merged.read() {
            Ok(guard) => guard.get(&subscriber.id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&subscriber.id).cloned(),
        };
        cached.unwrap_or_else(|| Arc::new(Self::merge(subscriber)))
    }
}

impl RecordFilter for PolicyFilter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn refresh(&self, subscribers: &[Arc<SubscriberInfo>]) {
        let merged: HashMap<_, _> = subscribers
            .iter()
            .map(|s| (s.id.clone(), Arc::new(Self::merge(s))))
            .collect();

        match self.merged.write() {
            Ok(mut guard) => *guard = merged,
            Err(poisoned) => *poisoned.into_inner() = merged,
        }
    }

    fn filter(&self, record: &SubscriberRecord) -> Result<bool, ProcessError> {
        Ok(match self.merged_for(&record.subscriber).as_ref() {
            None => true,
            Some(predicate) => predicate.matches(&record.record),
        })
    }
}

pub fn filter_by_name(name: &str) -> Result<Arc<dyn RecordFilter>, ConfigError> {
    match name {
        NoOpFilter::NAME => Ok(Arc::new(NoOpFilter)),
        PolicyFilter::NAME => Ok(Arc::new(PolicyFilter::new())),
        other => Err(ConfigError::UnknownType {
            kind: "filter",
            name: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::record::SourceRecord;
    use crate::kafka::types::Partition;
    use crate::subscriber::{RoutingPolicy, SubscribeRule, SubscribeSettings};
    use serde_json::{json, Value};

    fn subscriber(id: &str, conditions: Vec<Option<MatchPredicate>>) -> Arc<SubscriberInfo> {
        Arc::new(SubscriberInfo {
            id: id.into(),
            rule: SubscribeRule {
                is_sequence: false,
                predicate: MatchPredicate::All,
                policies: conditions
                    .into_iter()
                    .enumerate()
                    .map(|(i, condition)| RoutingPolicy {
                        tenant_id: format!("t{i}"),
                        condition,
                        exclude_fields: vec![],
                    })
                    .collect(),
            },
            settings: SubscribeSettings::default(),
        })
    }

    fn record(subscriber: Arc<SubscriberInfo>, value: Value) -> SubscriberRecord {
        SubscriberRecord::new(
            subscriber,
            SourceRecord::new(Partition::new("events".into(), 0), 0, None, value),
        )
    }

    fn plan_is(plan: &str) -> Option<MatchPredicate> {
        Some(MatchPredicate::Field {
            pointer: "/plan".into(),
            value: json!(plan),
        })
    }

    #[test]
    fn test_policy_without_condition_admits_all() {
        let filter = PolicyFilter::new();
        let s = subscriber("s1", vec![plan_is("pro"), None]);

        assert!(filter.filter(&record(s, json!({"plan": "free"}))).unwrap());
    }

    #[test]
    fn test_any_policy_condition_admits() {
        let filter = PolicyFilter::new();
        let s = subscriber("s1", vec![plan_is("pro"), plan_is("team")]);
        filter.refresh(&[s.clone()]);

        assert!(filter.filter(&record(s.clone(), json!({"plan": "team"}))).unwrap());
        assert!(!filter.filter(&record(s, json!({"plan": "free"}))).unwrap());
    }

    #[test]
    fn test_no_policies_admits_nothing() {
        let filter = PolicyFilter::new();
        let s = subscriber("s1", vec![]);

        assert!(!filter.filter(&record(s, json!({}))).unwrap());
    }

    #[test]
    fn test_refresh_replaces_merged_state() {
        let filter = PolicyFilter::new();
        let strict = subscriber("s1", vec![plan_is("pro")]);
        filter.refresh(&[strict.clone()]);

        // the cached merge wins over whatever the record carries until the next refresh
        let relaxed = subscriber("s1", vec![None]);
        assert!(!filter.filter(&record(relaxed.clone(), json!({"plan": "free"}))).unwrap());

        filter.refresh(&[relaxed.clone()]);
        assert!(filter.filter(&record(relaxed, json!({"plan": "free"}))).unwrap());
    }

    #[test]
    fn test_noop_filter() {
        let s = subscriber("s1", vec![]);
        assert!(NoOpFilter.filter(&record(s, json!(null))).unwrap());
        assert_eq!(filter_by_name("NOOP_FILTER").unwrap().name(), "NOOP_FILTER");
    }
}
