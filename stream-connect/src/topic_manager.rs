//! Topic lifecycle for checkpoint topics.
//!
//! Provisioning is idempotent: missing topics are created, existing ones only
//! get their retention converged. Partition count and replication factor of an
//! existing topic are never changed.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::config::KafkaConfig;
use dashmap::DashMap;
use rdkafka::admin::{
    AdminClient, AdminOptions, AlterConfig, NewTopic, ResourceSpecifier, TopicReplication,
};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use tracing::{error, info, warn};

use crate::dispatch::publisher::checkpoint_topic_name;
use crate::error::{AdminError, ConfigError};
use crate::metrics_consts::{TOPIC_ACTIONS_TOTAL, TOPIC_PROVISIONING_TOTAL};
use crate::registry::{SourceConfig, TenantSourceResolver};
use crate::subscriber::SubscriberInfo;

pub const RETENTION_MS: &str = "retention.ms";
pub const RETENTION_BYTES: &str = "retention.bytes";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub partitions: i32,
    pub replication_factor: i32,
    pub retention_ms: i64,
    pub retention_bytes: i64,
}

impl TopicSpec {
    /// Topic-level overrides managed here.
    pub fn config_entries(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (RETENTION_MS.to_string(), self.retention_ms.to_string()),
            (RETENTION_BYTES.to_string(), self.retention_bytes.to_string()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfigEntry {
    pub name: String,
    pub value: Option<String>,
    pub is_default: bool,
    pub is_read_only: bool,
}

impl TopicConfigEntry {
    /// Explicit override that a full replace has to carry over.
    fn is_override(&self) -> bool {
        !self.is_default && !self.is_read_only && self.value.is_some()
    }
}

/// Broker admin operations used by the topic manager.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn list_topics(&self) -> Result<HashSet<String>, AdminError>;

    /// Already existing topics count as created.
    async fn create_topics(&self, topics: &BTreeMap<String, TopicSpec>) -> Result<(), AdminError>;

    async fn describe_configs(
        &self,
        topics: &[String],
    ) -> Result<BTreeMap<String, Vec<TopicConfigEntry>>, AdminError>;

    /// Set only the given keys, leaving every other override untouched.
    async fn incremental_alter_configs(
        &self,
        configs: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<(), AdminError>;

    /// Replace the whole override set of each topic.
    async fn alter_configs(
        &self,
        configs: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<(), AdminError>;
}

pub struct KafkaTopicAdmin {
    admin: Arc<AdminClient<DefaultClientContext>>,
    timeout: Duration,
}

impl KafkaTopicAdmin {
    pub fn new(config: &KafkaConfig, timeout: Duration) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("client.id", "stream-connect-admin");
        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        let admin: AdminClient<DefaultClientContext> = client_config.create()?;
        Ok(Self {
            admin: Arc::new(admin),
            timeout,
        })
    }

    fn options(&self) -> AdminOptions {
        AdminOptions::new()
            .request_timeout(Some(self.timeout))
            .operation_timeout(Some(self.timeout))
    }
}

fn resource_error(resource: &str, code: RDKafkaErrorCode) -> AdminError {
    AdminError::Resource {
        resource: resource.to_string(),
        reason: code.to_string(),
    }
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    async fn list_topics(&self) -> Result<HashSet<String>, AdminError> {
        let admin = self.admin.clone();
        let timeout = self.timeout;
        let topics = tokio::task::spawn_blocking(move || {
            admin.inner().fetch_metadata(None, timeout).map(|metadata| {
                metadata
                    .topics()
                    .iter()
                    .map(|t| t.name().to_string())
                    .collect::<HashSet<String>>()
            })
        })
        .await
        .map_err(|e| AdminError::Resource {
            resource: "metadata".to_string(),
            reason: e.to_string(),
        })??;

        Ok(topics)
    }

    async fn create_topics(&self, topics: &BTreeMap<String, TopicSpec>) -> Result<(), AdminError> {
        let configs: Vec<(&String, &TopicSpec, String, String)> = topics
            .iter()
            .map(|(name, spec)| {
                (
                    name,
                    spec,
                    spec.retention_ms.to_string(),
                    spec.retention_bytes.to_string(),
                )
            })
            .collect();
        let new_topics: Vec<NewTopic> = configs
            .iter()
            .map(|(name, spec, retention_ms, retention_bytes)| {
                NewTopic::new(
                    name,
                    spec.partitions,
                    TopicReplication::Fixed(spec.replication_factor),
                )
                .set(RETENTION_MS, retention_ms)
                .set(RETENTION_BYTES, retention_bytes)
            })
            .collect();

        let results = self.admin.create_topics(&new_topics, &self.options()).await?;
        for result in results {
            match result {
                Ok(_) => {}
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((topic, code)) => return Err(resource_error(&topic, code)),
            }
        }
        Ok(())
    }

    async fn describe_configs(
        &self,
        topics: &[String],
    ) -> Result<BTreeMap<String, Vec<TopicConfigEntry>>, AdminError> {
        let specifiers: Vec<ResourceSpecifier> =
            topics.iter().map(|t| ResourceSpecifier::Topic(t.as_str())).collect();
        let results = self
            .admin
            .describe_configs(&specifiers, &self.options())
            .await?;

        let mut described = BTreeMap::new();
        for (topic, result) in topics.iter().zip(results) {
            let resource = result.map_err(|code| resource_error(topic, code))?;
            let entries = resource
                .entries
                .into_iter()
                .map(|e| TopicConfigEntry {
                    name: e.name,
                    value: e.value,
                    is_default: e.is_default,
                    is_read_only: e.is_read_only,
                })
                .collect();
            described.insert(topic.clone(), entries);
        }
        Ok(described)
    }

    async fn incremental_alter_configs(
        &self,
        _configs: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<(), AdminError> {
        // librdkafka's IncrementalAlterConfigs is not exposed by rdkafka
        Err(AdminError::Unsupported(
            "IncrementalAlterConfigs".to_string(),
        ))
    }

    async fn alter_configs(
        &self,
        configs: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Result<(), AdminError> {
        let alters: Vec<AlterConfig> = configs
            .iter()
            .map(|(topic, entries)| {
                entries.iter().fold(
                    AlterConfig::new(ResourceSpecifier::Topic(topic.as_str())),
                    |alter, (key, value)| alter.set(key, value),
                )
            })
            .collect();

        let results = self.admin.alter_configs(&alters, &self.options()).await?;
        for result in results {
            if let Err((resource, code)) = result {
                return Err(resource_error(&format!("{resource:?}"), code));
            }
        }
        Ok(())
    }
}

/// Builds an admin client for the cluster a tenant's checkpoint topics live on.
pub trait TopicAdminFactory: Send + Sync {
    fn create(&self, source: &SourceConfig) -> Result<Arc<dyn TopicAdmin>, AdminError>;
}

/// Admin clients against the tenant's own brokers, with every other shared
/// client setting kept. Producers are built the same way, so a checkpoint
/// topic is provisioned on the cluster its records are published to.
pub struct KafkaTopicAdminFactory {
    kafka: KafkaConfig,
    timeout: Duration,
}

impl KafkaTopicAdminFactory {
    pub fn new(kafka: KafkaConfig, timeout: Duration) -> Self {
        Self { kafka, timeout }
    }
}

impl TopicAdminFactory for KafkaTopicAdminFactory {
    fn create(&self, source: &SourceConfig) -> Result<Arc<dyn TopicAdmin>, AdminError> {
        let config = self.kafka.with_hosts(&source.bootstrap_servers);
        Ok(Arc::new(KafkaTopicAdmin::new(&config, self.timeout)?))
    }
}

pub struct TopicManagerSettings {
    pub topic_prefix: String,
    pub partitions: i32,
    pub replication_factor: i32,
    pub admin_timeout: Duration,
}

/// What one provisioning run did, by topic name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    pub created: Vec<String>,
    pub altered: Vec<String>,
    pub unchanged: Vec<String>,
}

pub struct TopicManager {
    factory: Arc<dyn TopicAdminFactory>,
    resolver: Arc<dyn TenantSourceResolver>,
    settings: TopicManagerSettings,
    /// One admin client per bootstrap server list.
    admins: DashMap<String, Arc<dyn TopicAdmin>>,
}

impl TopicManager {
    pub fn new(
        factory: Arc<dyn TopicAdminFactory>,
        resolver: Arc<dyn TenantSourceResolver>,
        settings: TopicManagerSettings,
    ) -> Self {
        Self {
            factory,
            resolver,
            settings,
            admins: DashMap::new(),
        }
    }

    fn topic_spec(&self, subscriber: &SubscriberInfo) -> TopicSpec {
        TopicSpec {
            partitions: self.settings.partitions,
            replication_factor: self.settings.replication_factor,
            retention_ms: subscriber.settings.log_retention_ms,
            retention_bytes: subscriber.settings.log_retention_bytes,
        }
    }

    /// Desired topics grouped by the cluster of each subscriber's tenant.
    pub fn desired_topics_by_source(
        &self,
        pipeline: &str,
        subscribers: &[Arc<SubscriberInfo>],
    ) -> Result<BTreeMap<String, (SourceConfig, BTreeMap<String, TopicSpec>)>, AdminError> {
        let mut grouped: BTreeMap<String, (SourceConfig, BTreeMap<String, TopicSpec>)> =
            BTreeMap::new();
        for subscriber in subscribers {
            let tenant_id = subscriber.tenant_id()?;
            let source = self
                .resolver
                .load_source_by_tenant(pipeline, tenant_id)
                .ok_or_else(|| ConfigError::MissingTenantSource {
                    pipeline: pipeline.to_string(),
                    tenant_id: tenant_id.to_string(),
                })?;
            grouped
                .entry(source.bootstrap_servers.clone())
                .or_insert_with(|| (source, BTreeMap::new()))
                .1
                .insert(
                    checkpoint_topic_name(&self.settings.topic_prefix, pipeline, &subscriber.id),
                    self.topic_spec(subscriber),
                );
        }
        Ok(grouped)
    }

    fn admin_for(&self, source: &SourceConfig) -> Result<Arc<dyn TopicAdmin>, AdminError> {
        if let Some(admin) = self.admins.get(&source.bootstrap_servers) {
            return Ok(admin.clone());
        }
        let entry = self
            .admins
            .entry(source.bootstrap_servers.clone())
            .or_try_insert_with(|| self.factory.create(source))?;
        Ok(entry.clone())
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, AdminError>
    where
        F: Future<Output = Result<T, AdminError>>,
    {
        let timeout = self.settings.admin_timeout;
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| AdminError::Timeout(timeout))?
    }

    /// Create missing checkpoint topics for one pipeline and converge the
    /// retention of the existing ones, each on its tenant's cluster.
    pub async fn provision_pipeline(
        &self,
        pipeline: &str,
        subscribers: &[Arc<SubscriberInfo>],
    ) -> Result<ProvisionReport, AdminError> {
        let mut report = ProvisionReport::default();
        for (source, desired) in self.desired_topics_by_source(pipeline, subscribers)?.into_values() {
            let admin = self.admin_for(&source)?;
            self.provision_on(admin.as_ref(), pipeline, desired, &mut report)
                .await?;
        }
        Ok(report)
    }

    async fn provision_on(
        &self,
        admin: &dyn TopicAdmin,
        pipeline: &str,
        desired: BTreeMap<String, TopicSpec>,
        report: &mut ProvisionReport,
    ) -> Result<(), AdminError> {
        if desired.is_empty() {
            return Ok(());
        }

        let existing = self.bounded(admin.list_topics()).await?;
        let (present, missing): (BTreeMap<_, _>, BTreeMap<_, _>) = desired
            .into_iter()
            .partition(|(name, _)| existing.contains(name));

        if !missing.is_empty() {
            self.bounded(admin.create_topics(&missing)).await?;
            report.created.extend(missing.into_keys());
        }

        if present.is_empty() {
            return Ok(());
        }

        let names: Vec<String> = present.keys().cloned().collect();
        let described = self.bounded(admin.describe_configs(&names)).await?;

        let mut drifted: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (name, spec) in &present {
            let wanted = spec.config_entries();
            let current = described.get(name).map(Vec::as_slice).unwrap_or_default();
            let converged = wanted.iter().all(|(key, value)| {
                current
                    .iter()
                    .any(|e| &e.name == key && e.value.as_deref() == Some(value.as_str()))
            });
            if converged {
                report.unchanged.push(name.clone());
            } else {
                drifted.insert(name.clone(), wanted);
            }
        }

        if drifted.is_empty() {
            return Ok(());
        }

        match self.bounded(admin.incremental_alter_configs(&drifted)).await {
            Ok(()) => {}
            Err(AdminError::Unsupported(api)) => {
                warn!(
                    pipeline = pipeline,
                    api = %api,
                    "Incremental config alter unsupported, falling back to full replace"
                );
                let full = drifted
                    .iter()
                    .map(|(name, wanted)| {
                        let mut entries: BTreeMap<String, String> = described
                            .get(name)
                            .into_iter()
                            .flatten()
                            .filter(|e| e.is_override())
                            .filter_map(|e| Some((e.name.clone(), e.value.clone()?)))
                            .collect();
                        entries.extend(wanted.clone());
                        (name.clone(), entries)
                    })
                    .collect();
                self.bounded(admin.alter_configs(&full)).await?;
            }
            Err(e) => return Err(e),
        }
        report.altered.extend(drifted.into_keys());

        Ok(())
    }

    /// Provision every pipeline. A failing pipeline is logged and skipped.
    pub async fn provision_all(
        &self,
        pipelines: &BTreeMap<String, Vec<Arc<SubscriberInfo>>>,
    ) -> BTreeMap<String, Result<ProvisionReport, AdminError>> {
        let mut results = BTreeMap::new();
        for (pipeline, subscribers) in pipelines {
            let result = self.provision_pipeline(pipeline, subscribers).await;
            match &result {
                Ok(report) => {
                    metrics::counter!(
                        TOPIC_PROVISIONING_TOTAL,
                        "pipeline" => pipeline.clone(),
                        "status" => "success"
                    )
                    .increment(1);
                    for (action, topics) in [
                        ("created", &report.created),
                        ("altered", &report.altered),
                        ("unchanged", &report.unchanged),
                    ] {
                        metrics::counter!(TOPIC_ACTIONS_TOTAL, "action" => action)
                            .increment(topics.len() as u64);
                    }
                    info!(
                        pipeline = %pipeline,
                        created = report.created.len(),
                        altered = report.altered.len(),
                        unchanged = report.unchanged.len(),
                        "Provisioned checkpoint topics"
                    );
                }
                Err(e) => {
                    metrics::counter!(
                        TOPIC_PROVISIONING_TOTAL,
                        "pipeline" => pipeline.clone(),
                        "status" => "error"
                    )
                    .increment(1);
                    error!(pipeline = %pipeline, error = ?e, "Failed to provision checkpoint topics");
                }
            }
            results.insert(pipeline.clone(), result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticSubscriberRegistry;
    use crate::subscriber::{RoutingPolicy, SubscribeRule, SubscribeSettings};
    use std::sync::Mutex;

    const CLUSTER_A: &str = "cluster-a:9092";
    const CLUSTER_B: &str = "cluster-b:9092";

    #[derive(Default)]
    struct FakeAdmin {
        topics: Mutex<BTreeMap<String, (TopicSpec, BTreeMap<String, String>)>>,
        incremental_supported: bool,
        hang: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FakeAdmin {
        fn with_incremental() -> Self {
            Self {
                incremental_supported: true,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn config(&self, topic: &str) -> BTreeMap<String, String> {
            self.topics.lock().unwrap()[topic].1.clone()
        }

        fn set_override(&self, topic: &str, key: &str, value: &str) {
            self.topics
                .lock()
                .unwrap()
                .get_mut(topic)
                .unwrap()
                .1
                .insert(key.to_string(), value.to_string());
        }
    }

    #[async_trait]
    impl TopicAdmin for FakeAdmin {
        async fn list_topics(&self) -> Result<HashSet<String>, AdminError> {
            self.calls.lock().unwrap().push("list");
            if self.hang {
                futures::future::pending::<()>().await;
            }
            Ok(self.topics.lock().unwrap().keys().cloned().collect())
        }

        async fn create_topics(
            &self,
            topics: &BTreeMap<String, TopicSpec>,
        ) -> Result<(), AdminError> {
            self.calls.lock().unwrap().push("create");
            let mut existing = self.topics.lock().unwrap();
            for (name, spec) in topics {
                if name.contains("broken") {
                    return Err(AdminError::Resource {
                        resource: name.clone(),
                        reason: "PolicyViolation".to_string(),
                    });
                }
                existing
                    .entry(name.clone())
                    .or_insert_with(|| (spec.clone(), spec.config_entries()));
            }
            Ok(())
        }

        async fn describe_configs(
            &self,
            topics: &[String],
        ) -> Result<BTreeMap<String, Vec<TopicConfigEntry>>, AdminError> {
            self.calls.lock().unwrap().push("describe");
            let existing = self.topics.lock().unwrap();
            Ok(topics
                .iter()
                .map(|t| {
                    let mut entries: Vec<TopicConfigEntry> = existing[t]
                        .1
                        .iter()
                        .map(|(k, v)| TopicConfigEntry {
                            name: k.clone(),
                            value: Some(v.clone()),
                            is_default: false,
                            is_read_only: false,
                        })
                        .collect();
                    entries.push(TopicConfigEntry {
                        name: "segment.ms".into(),
                        value: Some("604800000".into()),
                        is_default: true,
                        is_read_only: false,
                    });
                    (t.clone(), entries)
                })
                .collect())
        }

        async fn incremental_alter_configs(
            &self,
            configs: &BTreeMap<String, BTreeMap<String, String>>,
        ) -> Result<(), AdminError> {
            self.calls.lock().unwrap().push("incremental_alter");
            if !self.incremental_supported {
                return Err(AdminError::Unsupported("IncrementalAlterConfigs".into()));
            }
            let mut existing = self.topics.lock().unwrap();
            for (topic, entries) in configs {
                existing.get_mut(topic).unwrap().1.extend(entries.clone());
            }
            Ok(())
        }

        async fn alter_configs(
            &self,
            configs: &BTreeMap<String, BTreeMap<String, String>>,
        ) -> Result<(), AdminError> {
            self.calls.lock().unwrap().push("alter");
            let mut existing = self.topics.lock().unwrap();
            for (topic, entries) in configs {
                existing.get_mut(topic).unwrap().1 = entries.clone();
            }
            Ok(())
        }
    }

    /// Hands out `base` for every cluster unless one is registered per host.
    #[derive(Default)]
    struct FakeAdminFactory {
        base: Arc<FakeAdmin>,
        per_host: BTreeMap<String, Arc<FakeAdmin>>,
        created_for: Mutex<Vec<String>>,
    }

    impl FakeAdminFactory {
        fn created_for(&self) -> Vec<String> {
            self.created_for.lock().unwrap().clone()
        }
    }

    impl TopicAdminFactory for FakeAdminFactory {
        fn create(&self, source: &SourceConfig) -> Result<Arc<dyn TopicAdmin>, AdminError> {
            self.created_for
                .lock()
                .unwrap()
                .push(source.bootstrap_servers.clone());
            let admin: Arc<dyn TopicAdmin> = self
                .per_host
                .get(&source.bootstrap_servers)
                .unwrap_or(&self.base)
                .clone();
            Ok(admin)
        }
    }

    fn subscriber_for(id: &str, tenant_id: &str, retention_ms: i64) -> Arc<SubscriberInfo> {
        Arc::new(SubscriberInfo {
            id: id.into(),
            rule: SubscribeRule {
                policies: vec![RoutingPolicy {
                    tenant_id: tenant_id.into(),
                    condition: None,
                    exclude_fields: vec![],
                }],
                ..SubscribeRule::default()
            },
            settings: SubscribeSettings {
                log_retention_ms: retention_ms,
                log_retention_bytes: -1,
            },
        })
    }

    fn subscriber(id: &str, retention_ms: i64) -> Arc<SubscriberInfo> {
        subscriber_for(id, "t1", retention_ms)
    }

    /// Tenant t1 lives on cluster A and t2 on cluster B, in every pipeline the
    /// tests use.
    fn tenants() -> Arc<StaticSubscriberRegistry> {
        let registry = ["default", "alpha", "broken", "zeta"]
            .into_iter()
            .fold(StaticSubscriberRegistry::new(), |registry, pipeline| {
                registry
                    .with_tenant(
                        pipeline,
                        "t1",
                        SourceConfig {
                            bootstrap_servers: CLUSTER_A.into(),
                        },
                    )
                    .with_tenant(
                        pipeline,
                        "t2",
                        SourceConfig {
                            bootstrap_servers: CLUSTER_B.into(),
                        },
                    )
            });
        Arc::new(registry)
    }

    fn manager_with(factory: Arc<FakeAdminFactory>) -> TopicManager {
        TopicManager::new(
            factory,
            tenants(),
            TopicManagerSettings {
                topic_prefix: "checkpoint_".into(),
                partitions: 10,
                replication_factor: 3,
                admin_timeout: Duration::from_millis(200),
            },
        )
    }

    fn manager(admin: Arc<FakeAdmin>) -> TopicManager {
        manager_with(Arc::new(FakeAdminFactory {
            base: admin,
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_creates_missing_topics_with_partitions_and_retention() {
        let admin = Arc::new(FakeAdmin::with_incremental());
        let manager = manager(admin.clone());

        let report = manager
            .provision_pipeline("default", &[subscriber("s1", 1000), subscriber("s2", 2000)])
            .await
            .unwrap();

        assert_eq!(report.created, vec!["checkpoint_defaults1", "checkpoint_defaults2"]);
        let topics = admin.topics.lock().unwrap();
        let (spec, config) = &topics["checkpoint_defaults2"];
        assert_eq!(spec.partitions, 10);
        assert_eq!(spec.replication_factor, 3);
        assert_eq!(config[RETENTION_MS], "2000");
        assert_eq!(config[RETENTION_BYTES], "-1");
    }

    #[tokio::test]
    async fn test_provisioning_is_idempotent() {
        let admin = Arc::new(FakeAdmin::with_incremental());
        let manager = manager(admin.clone());
        let subscribers = [subscriber("s1", 1000)];

        manager.provision_pipeline("default", &subscribers).await.unwrap();
        admin.calls.lock().unwrap().clear();
        let report = manager.provision_pipeline("default", &subscribers).await.unwrap();

        assert!(report.created.is_empty());
        assert!(report.altered.is_empty());
        assert_eq!(report.unchanged, vec!["checkpoint_defaults1"]);
        assert_eq!(admin.calls(), vec!["list", "describe"]);
    }

    #[tokio::test]
    async fn test_retention_converges_incrementally() {
        let admin = Arc::new(FakeAdmin::with_incremental());
        let manager = manager(admin.clone());
        manager
            .provision_pipeline("default", &[subscriber("s1", 1000)])
            .await
            .unwrap();
        admin.set_override("checkpoint_defaults1", "cleanup.policy", "compact");

        let report = manager
            .provision_pipeline("default", &[subscriber("s1", 5000)])
            .await
            .unwrap();

        assert_eq!(report.altered, vec!["checkpoint_defaults1"]);
        let config = admin.config("checkpoint_defaults1");
        assert_eq!(config[RETENTION_MS], "5000");
        assert_eq!(config["cleanup.policy"], "compact");
        assert!(!admin.calls().contains(&"alter"));
    }

    #[tokio::test]
    async fn test_falls_back_to_full_replace_preserving_overrides() {
        let admin = Arc::new(FakeAdmin::default());
        let manager = manager(admin.clone());
        manager
            .provision_pipeline("default", &[subscriber("s1", 1000)])
            .await
            .unwrap();
        admin.set_override("checkpoint_defaults1", "cleanup.policy", "compact");

        let report = manager
            .provision_pipeline("default", &[subscriber("s1", 5000)])
            .await
            .unwrap();

        assert_eq!(report.altered, vec!["checkpoint_defaults1"]);
        let config = admin.config("checkpoint_defaults1");
        assert_eq!(config[RETENTION_MS], "5000");
        assert_eq!(config["cleanup.policy"], "compact");
        // broker defaults are not pinned as overrides
        assert!(!config.contains_key("segment.ms"));
        assert!(admin.calls().ends_with(&["incremental_alter", "alter"]));
    }

    #[tokio::test]
    async fn test_failing_pipeline_does_not_stop_the_rest() {
        let admin = Arc::new(FakeAdmin::with_incremental());
        let manager = manager(admin.clone());
        let pipelines = BTreeMap::from([
            ("alpha".to_string(), vec![subscriber("s1", 1000)]),
            ("broken".to_string(), vec![subscriber("s1", 1000)]),
            ("zeta".to_string(), vec![subscriber("s1", 1000)]),
        ]);

        let results = manager.provision_all(&pipelines).await;

        assert!(results["alpha"].is_ok());
        assert!(matches!(results["broken"], Err(AdminError::Resource { .. })));
        assert!(results["zeta"].is_ok());
        assert!(admin.topics.lock().unwrap().contains_key("checkpoint_zetas1"));
    }

    #[tokio::test]
    async fn test_admin_calls_are_bounded() {
        let admin = Arc::new(FakeAdmin {
            hang: true,
            ..Default::default()
        });
        let manager = manager(admin);

        let result = manager
            .provision_pipeline("default", &[subscriber("s1", 1000)])
            .await;

        assert!(matches!(result, Err(AdminError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_no_subscribers_skips_admin() {
        let admin = Arc::new(FakeAdmin::default());
        let manager = manager(admin.clone());

        let report = manager.provision_pipeline("default", &[]).await.unwrap();

        assert_eq!(report, ProvisionReport::default());
        assert!(admin.calls().is_empty());
    }

    #[tokio::test]
    async fn test_topics_are_created_on_the_tenant_cluster() {
        let cluster_a = Arc::new(FakeAdmin::with_incremental());
        let cluster_b = Arc::new(FakeAdmin::with_incremental());
        let factory = Arc::new(FakeAdminFactory {
            per_host: BTreeMap::from([
                (CLUSTER_A.to_string(), cluster_a.clone()),
                (CLUSTER_B.to_string(), cluster_b.clone()),
            ]),
            ..Default::default()
        });
        let manager = manager_with(factory.clone());

        let report = manager
            .provision_pipeline(
                "default",
                &[
                    subscriber_for("s1", "t1", 1000),
                    subscriber_for("s2", "t2", 1000),
                    subscriber_for("s3", "t1", 1000),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.created.len(), 3);
        assert_eq!(factory.created_for(), vec![CLUSTER_A, CLUSTER_B]);
        let on_a: Vec<String> = cluster_a.topics.lock().unwrap().keys().cloned().collect();
        let on_b: Vec<String> = cluster_b.topics.lock().unwrap().keys().cloned().collect();
        assert_eq!(on_a, vec!["checkpoint_defaults1", "checkpoint_defaults3"]);
        assert_eq!(on_b, vec!["checkpoint_defaults2"]);
    }

    #[tokio::test]
    async fn test_admin_clients_are_reused_per_cluster() {
        let factory = Arc::new(FakeAdminFactory::default());
        let manager = manager_with(factory.clone());
        let subscribers = [subscriber("s1", 1000)];

        manager.provision_pipeline("default", &subscribers).await.unwrap();
        manager.provision_pipeline("default", &subscribers).await.unwrap();

        assert_eq!(factory.created_for(), vec![CLUSTER_A]);
    }

    #[tokio::test]
    async fn test_unknown_tenant_source_fails_the_pipeline() {
        let admin = Arc::new(FakeAdmin::with_incremental());
        let manager = manager(admin.clone());

        let result = manager
            .provision_pipeline("default", &[subscriber_for("s1", "nobody", 1000)])
            .await;

        assert!(matches!(
            result,
            Err(AdminError::Config(ConfigError::MissingTenantSource { .. }))
        ));
        assert!(admin.calls().is_empty());
    }
}
