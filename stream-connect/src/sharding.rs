use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::error::ConfigError;
use crate::metrics_consts::SHARDS_OWNED;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerInstance {
    pub id: String,
}

impl ServerInstance {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Instance to shard indices, in instance order. Every index in
/// `[0, total)` appears exactly once when at least one instance exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardAssignment {
    total: u32,
    items: Vec<(ServerInstance, Vec<u32>)>,
}

impl ShardAssignment {
    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn shards_for(&self, instance_id: &str) -> &[u32] {
        self.items
            .iter()
            .find(|(instance, _)| instance.id == instance_id)
            .map(|(_, shards)| shards.as_slice())
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ServerInstance, &[u32])> {
        self.items.iter().map(|(i, s)| (i, s.as_slice()))
    }
}

/// Distributes shard indices across server instances.
pub trait ShardingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pure and deterministic for the same inputs. Instance order is significant.
    fn get_sharding_items(&self, total_count: u32, instances: &[ServerInstance])
        -> ShardAssignment;
}

/// Contiguous blocks of `total / n` indices per instance, then the remainder
/// handed out one each to the first instances.
pub struct AverageShardingStrategy;

impl AverageShardingStrategy {
    pub const NAME: &'static str = "AVG_SHARDING";
}

impl ShardingStrategy for AverageShardingStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn get_sharding_items(
        &self,
        total_count: u32,
        instances: &[ServerInstance],
    ) -> ShardAssignment {
        if instances.is_empty() {
            return ShardAssignment::default();
        }

        let n = instances.len() as u32;
        let per_instance = total_count / n;
        let remainder = total_count % n;

        let items = instances
            .iter()
            .enumerate()
            .map(|(i, instance)| {
                let i = i as u32;
                let mut shards: Vec<u32> = (i * per_instance..(i + 1) * per_instance).collect();
                if i < remainder {
                    shards.push(per_instance * n + i);
                }
                (instance.clone(), shards)
            })
            .collect();

        ShardAssignment {
            total: total_count,
            items,
        }
    }
}

pub fn strategy_by_name(name: &str) -> Result<Arc<dyn ShardingStrategy>, ConfigError> {
    match name {
        AverageShardingStrategy::NAME => Ok(Arc::new(AverageShardingStrategy)),
        other => Err(ConfigError::UnknownType {
            kind: "sharding strategy",
            name: other.to_string(),
        }),
    }
}

/// Shard a subscriber belongs to.
pub fn subscriber_shard(subscriber_id: &str, total_count: u32) -> u32 {
    if total_count == 0 {
        return 0;
    }
    crc32fast::hash(subscriber_id.as_bytes()) % total_count
}

/// Holds the current assignment for this instance. A membership change
/// computes a new assignment and swaps it in whole; readers never observe a
/// partially updated view.
pub struct ShardingCoordinator {
    strategy: Arc<dyn ShardingStrategy>,
    total_count: u32,
    instance_id: String,
    current: RwLock<Arc<ShardAssignment>>,
}

impl ShardingCoordinator {
    pub fn new(
        strategy: Arc<dyn ShardingStrategy>,
        total_count: u32,
        instance_id: impl Into<String>,
        instances: &[ServerInstance],
    ) -> Self {
        let coordinator = Self {
            strategy,
            total_count,
            instance_id: instance_id.into(),
            current: RwLock::new(Arc::new(ShardAssignment::default())),
        };
        coordinator.update_instances(instances);
        coordinator
    }

    /// Repeated ids are collapsed to their first occurrence so every slot
    /// belongs to a live instance.
    pub fn update_instances(&self, instances: &[ServerInstance]) {
        let mut seen = HashSet::new();
        let distinct: Vec<ServerInstance> = instances
            .iter()
            .filter(|i| seen.insert(i.id.as_str()))
            .cloned()
            .collect();
        if distinct.len() != instances.len() {
            warn!(
                listed = instances.len(),
                distinct = distinct.len(),
                "Ignoring repeated server instances"
            );
        }
        let instances = distinct.as_slice();

        let assignment = Arc::new(
            self.strategy
                .get_sharding_items(self.total_count, instances),
        );
        let owned = assignment.shards_for(&self.instance_id).len();

        match self.current.write() {
            Ok(mut guard) => *guard = assignment,
            Err(poisoned) => *poisoned.into_inner() = assignment,
        }

        metrics::gauge!(SHARDS_OWNED).set(owned as f64);
        info!(
            instance = %self.instance_id,
            instances = instances.len(),
            owned_shards = owned,
            strategy = self.strategy.name(),
            "Shard assignment updated"
        );
    }

    pub fn assignment(&self) -> Arc<ShardAssignment> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn owned_shards(&self) -> HashSet<u32> {
        self.assignment()
            .shards_for(&self.instance_id)
            .iter()
            .copied()
            .collect()
    }

    pub fn owns_subscriber(&self, subscriber_id: &str) -> bool {
        let shard = subscriber_shard(subscriber_id, self.total_count);
        self.assignment()
            .shards_for(&self.instance_id)
            .contains(&shard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn instances(n: usize) -> Vec<ServerInstance> {
        (0..n).map(|i| ServerInstance::new(format!("host-{i}"))).collect()
    }

    #[rstest]
    #[case(10, 3, vec![4, 3, 3])]
    #[case(9, 3, vec![3, 3, 3])]
    #[case(2, 3, vec![1, 1, 0])]
    #[case(64, 1, vec![64])]
    #[case(0, 2, vec![0, 0])]
    fn test_average_sizes(#[case] total: u32, #[case] n: usize, #[case] sizes: Vec<usize>) {
        let assignment = AverageShardingStrategy.get_sharding_items(total, &instances(n));
        let actual: Vec<usize> = assignment.iter().map(|(_, s)| s.len()).collect();
        assert_eq!(actual, sizes);
    }

    #[test]
    fn test_average_layout_ten_over_three() {
        let assignment = AverageShardingStrategy.get_sharding_items(10, &instances(3));

        assert_eq!(assignment.shards_for("host-0"), &[0, 1, 2, 9]);
        assert_eq!(assignment.shards_for("host-1"), &[3, 4, 5]);
        assert_eq!(assignment.shards_for("host-2"), &[6, 7, 8]);
    }

    #[rstest]
    #[case(10, 3)]
    #[case(64, 5)]
    #[case(7, 7)]
    #[case(3, 8)]
    fn test_average_covers_each_index_once(#[case] total: u32, #[case] n: usize) {
        let assignment = AverageShardingStrategy.get_sharding_items(total, &instances(n));

        let mut all: Vec<u32> = assignment.iter().flat_map(|(_, s)| s.to_vec()).collect();
        all.sort_unstable();
        assert_eq!(all, (0..total).collect::<Vec<_>>());

        let sizes: Vec<usize> = assignment.iter().map(|(_, s)| s.len()).collect();
        let max = sizes.iter().max().copied().unwrap_or(0);
        let min = sizes.iter().min().copied().unwrap_or(0);
        assert!(max - min <= 1);
    }

    #[test]
    fn test_empty_instances_yield_empty_assignment() {
        let assignment = AverageShardingStrategy.get_sharding_items(10, &[]);
        assert!(assignment.is_empty());
        assert!(assignment.shards_for("host-0").is_empty());
    }

    #[test]
    fn test_deterministic() {
        let a = AverageShardingStrategy.get_sharding_items(37, &instances(4));
        let b = AverageShardingStrategy.get_sharding_items(37, &instances(4));
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_strategy_is_config_error() {
        assert!(strategy_by_name("AVG_SHARDING").is_ok());
        assert!(matches!(
            strategy_by_name("HASH_SHARDING"),
            Err(ConfigError::UnknownType { .. })
        ));
    }

    #[test]
    fn test_coordinator_swaps_assignment_on_membership_change() {
        let coordinator =
            ShardingCoordinator::new(Arc::new(AverageShardingStrategy), 10, "host-1", &instances(3));
        assert_eq!(
            coordinator.owned_shards(),
            HashSet::from([3, 4, 5])
        );

        let before = coordinator.assignment();
        coordinator.update_instances(&instances(2));

        assert_eq!(coordinator.owned_shards(), HashSet::from([5, 6, 7, 8, 9]));
        // readers holding the old snapshot keep a consistent view
        assert_eq!(before.shards_for("host-1"), &[3, 4, 5]);
    }

    #[test]
    fn test_single_instance_owns_every_subscriber() {
        let coordinator =
            ShardingCoordinator::new(Arc::new(AverageShardingStrategy), 16, "solo", &[
                ServerInstance::new("solo"),
            ]);

        for id in ["a", "b", "subscriber-42"] {
            assert!(coordinator.owns_subscriber(id));
        }
    }

    #[test]
    fn test_subscriber_shard_is_stable() {
        assert_eq!(subscriber_shard("s1", 64), subscriber_shard("s1", 64));
        assert!(subscriber_shard("s1", 64) < 64);
        assert_eq!(subscriber_shard("s1", 0), 0);
    }

    #[test]
    fn test_repeated_instances_leave_no_orphan_shards() {
        let listed = [
            ServerInstance::new("a"),
            ServerInstance::new("a"),
            ServerInstance::new("b"),
        ];
        let owned: HashSet<u32> = ["a", "b"]
            .into_iter()
            .flat_map(|id| {
                ShardingCoordinator::new(Arc::new(AverageShardingStrategy), 10, id, &listed)
                    .owned_shards()
            })
            .collect();

        assert_eq!(owned, (0..10).collect::<HashSet<u32>>());
    }
}
