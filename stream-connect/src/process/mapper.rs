use std::sync::Arc;

use serde_json::Value;

use crate::error::{ConfigError, ProcessError};
use crate::subscriber::SubscriberRecord;

pub trait RecordMapper: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the value to republish. Mappers that change nothing should
    /// hand back the input `Arc` instead of cloning the payload.
    fn map(&self, record: &SubscriberRecord, value: Arc<Value>) -> Result<Arc<Value>, ProcessError>;
}

pub struct NoOpMapper;

impl NoOpMapper {
    pub const NAME: &'static str = "NOOP_MAPPER";
}

impl RecordMapper for NoOpMapper {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn map(&self, _record: &SubscriberRecord, value: Arc<Value>) -> Result<Arc<Value>, ProcessError> {
        Ok(value)
    }
}

/// Removes the JSON pointers listed in the subscriber's routing policies.
/// Masks that point at nothing are ignored; masks configured against a
/// non-object payload cannot be honoured and give up on the record.
pub struct FieldMaskMapper;

impl FieldMaskMapper {
    pub const NAME: &'static str = "FIELD_MASK_MAPPER";
}

impl RecordMapper for FieldMaskMapper {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn map(&self, record: &SubscriberRecord, value: Arc<Value>) -> Result<Arc<Value>, ProcessError> {
        let masks: Vec<&str> = record
            .subscriber
            .rule
            .policies
            .iter()
            .flat_map(|p| p.exclude_fields.iter().map(String::as_str))
            .collect();

        if masks.is_empty() {
            return Ok(value);
        }

        if !value.is_object() {
            return Err(ProcessError::GiveUp(format!(
                "cannot mask fields of non-object payload at {}@{}",
                record.partition(),
                record.offset()
            )));
        }

        let mut masked = Value::clone(&value);
        for pointer in masks {
            remove_pointer(&mut masked, pointer);
        }
        Ok(Arc::new(masked))
    }
}

fn remove_pointer(value: &mut Value, pointer: &str) -> Option<Value> {
    let (parent, last) = pointer.rsplit_once('/')?;
    let key = last.replace("~1", "/").replace("~0", "~");
    match value.pointer_mut(parent)? {
        Value::Object(map) => map.remove(&key),
        Value::Array(items) => {
            let index: usize = key.parse().ok()?;
            (index < items.len()).then(|| items.remove(index))
        }
        _ => None,
    }
}

pub fn mapper_by_name(name: &str) -> Result<Arc<dyn RecordMapper>, ConfigError> {
    match name {
        NoOpMapper::NAME => Ok(Arc::new(NoOpMapper)),
        FieldMaskMapper::NAME => Ok(Arc::new(FieldMaskMapper)),
        other => Err(ConfigError::UnknownType {
            kind: "mapper",
            name: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::record::SourceRecord;
    use crate::kafka::types::Partition;
    use crate::subscriber::{
        MatchPredicate, RoutingPolicy, SubscribeRule, SubscribeSettings, SubscriberInfo,
    };
    use serde_json::json;

    fn record(excludes: Vec<Vec<&str>>, value: Value) -> SubscriberRecord {
        let subscriber = SubscriberInfo {
            id: "s1".into(),
            rule: SubscribeRule {
                is_sequence: false,
                predicate: MatchPredicate::All,
                policies: excludes
                    .into_iter()
                    .map(|fields| RoutingPolicy {
                        tenant_id: "t1".into(),
                        condition: None,
                        exclude_fields: fields.into_iter().map(String::from).collect(),
                    })
                    .collect(),
            },
            settings: SubscribeSettings::default(),
        };
        SubscriberRecord::new(
            Arc::new(subscriber),
            SourceRecord::new(Partition::new("events".into(), 1), 42, None, value),
        )
    }

    #[test]
    fn test_masks_nested_fields_from_every_policy() {
        let r = record(
            vec![vec!["/properties/email"], vec!["/ip", "/missing/field"]],
            json!({"ip": "1.2.3.4", "event": "login", "properties": {"email": "a@b.c", "plan": "pro"}}),
        );

        let mapped = FieldMaskMapper.map(&r, r.record.value.clone()).unwrap();

        assert_eq!(
            *mapped,
            json!({"event": "login", "properties": {"plan": "pro"}})
        );
    }

    #[test]
    fn test_escaped_pointer_tokens() {
        let r = record(vec![vec!["/a~1b", "/c~0d"]], json!({"a/b": 1, "c~d": 2, "e": 3}));

        let mapped = FieldMaskMapper.map(&r, r.record.value.clone()).unwrap();

        assert_eq!(*mapped, json!({"e": 3}));
    }

    #[test]
    fn test_array_elements_can_be_masked() {
        let r = record(vec![vec!["/items/0"]], json!({"items": ["x", "y"]}));

        let mapped = FieldMaskMapper.map(&r, r.record.value.clone()).unwrap();

        assert_eq!(*mapped, json!({"items": ["y"]}));
    }

    #[test]
    fn test_no_masks_returns_same_allocation() {
        let r = record(vec![vec![]], json!({"ip": "1.2.3.4"}));
        let input = r.record.value.clone();

        let mapped = FieldMaskMapper.map(&r, input.clone()).unwrap();

        assert!(Arc::ptr_eq(&mapped, &input));
    }

    #[test]
    fn test_non_object_with_masks_gives_up() {
        let r = record(vec![vec!["/ip"]], json!("not an object"));

        let err = FieldMaskMapper.map(&r, r.record.value.clone()).unwrap_err();

        assert!(err.is_give_up());
    }

    #[test]
    fn test_noop_mapper_by_name() {
        let mapper = mapper_by_name("NOOP_MAPPER").unwrap();
        let r = record(vec![vec!["/ip"]], json!({"ip": 1}));
        assert_eq!(*mapper.map(&r, r.record.value.clone()).unwrap(), json!({"ip": 1}));
    }
}
