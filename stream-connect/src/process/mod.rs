//! Per-subscriber filter and map strategies, resolved by type name and run as
//! ordered chains on the executor's worker threads.

pub mod filter;
pub mod mapper;

use std::sync::Arc;

use serde_json::Value;

use crate::error::{ConfigError, ProcessError};
use crate::subscriber::{SubscriberInfo, SubscriberRecord};

pub use filter::{filter_by_name, NoOpFilter, PolicyFilter, RecordFilter};
pub use mapper::{mapper_by_name, FieldMaskMapper, NoOpMapper, RecordMapper};

/// Result of running a chain over one record.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterMapOutcome {
    pub matched: bool,
    pub value: Arc<Value>,
}

impl FilterMapOutcome {
    pub fn filtered(value: Arc<Value>) -> Self {
        Self {
            matched: false,
            value,
        }
    }
}

/// Filters run in order and short-circuit on the first rejection; mappers
/// only run for matched records, each seeing the previous mapper's output.
#[derive(Clone, Default)]
pub struct ProcessChain {
    filters: Vec<Arc<dyn RecordFilter>>,
    mappers: Vec<Arc<dyn RecordMapper>>,
}

impl ProcessChain {
    pub fn new(filters: Vec<Arc<dyn RecordFilter>>, mappers: Vec<Arc<dyn RecordMapper>>) -> Self {
        Self { filters, mappers }
    }

    pub fn from_names(filters: &[String], mappers: &[String]) -> Result<Self, ConfigError> {
        let filters = filters
            .iter()
            .map(|n| filter_by_name(n))
            .collect::<Result<Vec<_>, _>>()?;
        let mappers = mappers
            .iter()
            .map(|n| mapper_by_name(n))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(filters, mappers))
    }

    pub fn names(&self) -> (Vec<&'static str>, Vec<&'static str>) {
        (
            self.filters.iter().map(|f| f.name()).collect(),
            self.mappers.iter().map(|m| m.name()).collect(),
        )
    }

    /// Rebuild any state the filters derive from the full subscriber set.
    pub fn refresh(&self, subscribers: &[Arc<SubscriberInfo>]) {
        for filter in &self.filters {
            filter.refresh(subscribers);
        }
    }

    pub fn process(&self, record: &SubscriberRecord) -> Result<FilterMapOutcome, ProcessError> {
        for filter in &self.filters {
            if !filter.filter(record)? {
                return Ok(FilterMapOutcome::filtered(record.record.value.clone()));
            }
        }

        let mut value = record.record.value.clone();
        for mapper in &self.mappers {
            value = mapper.map(record, value)?;
        }

        Ok(FilterMapOutcome {
            matched: true,
            value,
        })
    }
}
