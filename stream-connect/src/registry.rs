use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::sharding::ShardingCoordinator;
use crate::subscriber::SubscriberInfo;

/// Subscribers registered per pipeline, in registration order.
pub trait SubscriberRegistry: Send + Sync {
    /// Ordered subscribers for one pipeline. Order decides first-match-wins.
    fn get_subscribers(&self, pipeline: &str) -> Vec<Arc<SubscriberInfo>>;

    /// Every pipeline's subscribers this instance is responsible for.
    fn get_sharding_all(&self) -> BTreeMap<String, Vec<Arc<SubscriberInfo>>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceConfig {
    pub bootstrap_servers: String,
}

/// Looks up the cluster a tenant's checkpoint topics live on.
pub trait TenantSourceResolver: Send + Sync {
    fn load_source_by_tenant(&self, pipeline: &str, tenant_id: &str) -> Option<SourceConfig>;
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    pipelines: BTreeMap<String, PipelineEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelineEntry {
    #[serde(default)]
    subscribers: Vec<SubscriberInfo>,
    #[serde(default)]
    tenants: HashMap<String, SourceConfig>,
}

/// File-backed registry used when running the binary standalone.
///
/// ```json
/// {"pipelines": {"default": {
///     "subscribers": [{"id": "s1", "rule": {"policies": [{"tenant_id": "t1"}]}}],
///     "tenants": {"t1": {"bootstrap_servers": "localhost:9092"}}
/// }}}
/// ```
#[derive(Debug, Default)]
pub struct StaticSubscriberRegistry {
    subscribers: BTreeMap<String, Vec<Arc<SubscriberInfo>>>,
    tenants: BTreeMap<String, HashMap<String, SourceConfig>>,
}

impl StaticSubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read subscriber registry {}", path.display()))?;
        Self::from_json(&raw)
            .with_context(|| format!("Failed to parse subscriber registry {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: RegistryFile = serde_json::from_str(raw)?;
        let mut registry = Self::new();
        for (pipeline, entry) in file.pipelines {
            registry.subscribers.insert(
                pipeline.clone(),
                entry.subscribers.into_iter().map(Arc::new).collect(),
            );
            registry.tenants.insert(pipeline, entry.tenants);
        }
        Ok(registry)
    }

    pub fn with_subscriber(mut self, pipeline: &str, subscriber: SubscriberInfo) -> Self {
        self.subscribers
            .entry(pipeline.to_string())
            .or_default()
            .push(Arc::new(subscriber));
        self
    }

    pub fn with_tenant(mut self, pipeline: &str, tenant_id: &str, source: SourceConfig) -> Self {
        self.tenants
            .entry(pipeline.to_string())
            .or_default()
            .insert(tenant_id.to_string(), source);
        self
    }
}

impl SubscriberRegistry for StaticSubscriberRegistry {
    fn get_subscribers(&self, pipeline: &str) -> Vec<Arc<SubscriberInfo>> {
        self.subscribers.get(pipeline).cloned().unwrap_or_default()
    }

    fn get_sharding_all(&self) -> BTreeMap<String, Vec<Arc<SubscriberInfo>>> {
        self.subscribers.clone()
    }
}

impl TenantSourceResolver for StaticSubscriberRegistry {
    fn load_source_by_tenant(&self, pipeline: &str, tenant_id: &str) -> Option<SourceConfig> {
        self.tenants.get(pipeline)?.get(tenant_id).cloned()
    }
}

/// Narrows `get_sharding_all` to subscribers whose shard this instance owns.
/// Matching still sees every subscriber because the source group is shared.
pub struct ShardedSubscriberRegistry {
    inner: Arc<dyn SubscriberRegistry>,
    coordinator: Arc<ShardingCoordinator>,
}

impl ShardedSubscriberRegistry {
    pub fn new(inner: Arc<dyn SubscriberRegistry>, coordinator: Arc<ShardingCoordinator>) -> Self {
        Self { inner, coordinator }
    }
}

impl SubscriberRegistry for ShardedSubscriberRegistry {
    fn get_subscribers(&self, pipeline: &str) -> Vec<Arc<SubscriberInfo>> {
        self.inner.get_subscribers(pipeline)
    }

    fn get_sharding_all(&self) -> BTreeMap<String, Vec<Arc<SubscriberInfo>>> {
        self.inner
            .get_sharding_all()
            .into_iter()
            .map(|(pipeline, subscribers)| {
                let owned = subscribers
                    .into_iter()
                    .filter(|s| self.coordinator.owns_subscriber(&s.id))
                    .collect();
                (pipeline, owned)
            })
            .collect()
    }
}
