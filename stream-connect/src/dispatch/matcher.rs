use std::sync::Arc;

use rayon::prelude::*;
use tracing::warn;

use crate::kafka::record::SourceRecord;
use crate::metrics_consts::RECORDS_UNMATCHED_TOTAL;
use crate::subscriber::{SubscriberInfo, SubscriberRecord};

pub struct MatchResult {
    /// In source order.
    pub matched: Vec<SubscriberRecord>,
    pub unmatched: Vec<SourceRecord>,
}

/// Pair each record with the first subscriber, in registration order, whose
/// predicate accepts it. Records are evaluated in parallel.
///
/// Must run on a multi-threaded runtime: the parallel section blocks in place.
pub fn match_records(subscribers: &[Arc<SubscriberInfo>], records: Vec<SourceRecord>) -> MatchResult {
    let results: Vec<Result<SubscriberRecord, SourceRecord>> = tokio::task::block_in_place(|| {
        records
            .into_par_iter()
            .map(|record| match subscribers.iter().find(|s| s.matches(&record)) {
                Some(subscriber) => Ok(SubscriberRecord::new(subscriber.clone(), record)),
                None => Err(record),
            })
            .collect()
    });

    let mut matched = Vec::with_capacity(results.len());
    let mut unmatched = vec![];
    for result in results {
        match result {
            Ok(r) => matched.push(r),
            Err(record) => {
                warn!(
                    topic = record.partition().topic(),
                    partition = record.partition().partition_number(),
                    offset = record.offset(),
                    "No subscriber matched record, dropping"
                );
                unmatched.push(record);
            }
        }
    }

    if !unmatched.is_empty() {
        metrics::counter!(RECORDS_UNMATCHED_TOTAL).increment(unmatched.len() as u64);
    }

    MatchResult { matched, unmatched }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::types::Partition;
    use crate::subscriber::{MatchPredicate, SubscribeRule, SubscribeSettings};
    use serde_json::json;

    fn subscriber(id: &str, predicate: MatchPredicate) -> Arc<SubscriberInfo> {
        Arc::new(SubscriberInfo {
            id: id.into(),
            rule: SubscribeRule {
                is_sequence: false,
                predicate,
                policies: vec![],
            },
            settings: SubscribeSettings::default(),
        })
    }

    fn record(offset: i64, key: &str) -> SourceRecord {
        SourceRecord::new(
            Partition::new("events".into(), 0),
            offset,
            Some(key.as_bytes().to_vec()),
            json!({}),
        )
    }

    fn prefix(p: &str) -> MatchPredicate {
        MatchPredicate::KeyPrefix { prefix: p.into() }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_first_match_wins() {
        let subscribers = vec![
            subscriber("narrow", prefix("org-1:")),
            subscriber("broad", prefix("org-")),
            subscriber("all", MatchPredicate::All),
        ];

        let result = match_records(
            &subscribers,
            vec![record(0, "org-1:a"), record(1, "org-2:b"), record(2, "x")],
        );

        let ids: Vec<(&str, i64)> = result
            .matched
            .iter()
            .map(|r| (r.subscriber.id.as_str(), r.offset()))
            .collect();
        assert_eq!(ids, vec![("narrow", 0), ("broad", 1), ("all", 2)]);
        assert!(result.unmatched.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unmatched_records_are_dropped() {
        let subscribers = vec![subscriber("s1", prefix("org-1:"))];

        let result = match_records(
            &subscribers,
            (0..100).map(|o| record(o, if o % 2 == 0 { "org-1:u" } else { "org-9:u" })).collect(),
        );

        assert_eq!(result.matched.len(), 50);
        assert_eq!(result.unmatched.len(), 50);
        // parallel evaluation keeps source order
        assert!(result.matched.windows(2).all(|w| w[0].offset() < w[1].offset()));
        assert!(result.unmatched.iter().all(|r| r.offset() % 2 == 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_subscribers_matches_nothing() {
        let result = match_records(&[], vec![record(0, "k")]);
        assert!(result.matched.is_empty());
        assert_eq!(result.unmatched.len(), 1);
    }
}
