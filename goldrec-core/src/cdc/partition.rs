//! Partitioning of touched records into independent work units.
//!
//! A touched record's neighborhood is every current record sharing one of its
//! blocking keys plus the members of its prior cluster. Neighborhoods are
//! expanded transitively, so overlapping neighborhoods end up in the same
//! partition and no two partitions can produce or retire the same cluster.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::Result;
use crate::matching::{facility_blocking_keys, provider_blocking_keys};
use crate::models::{EntityType, RecordKey};
use crate::store::EntityStore;

/// One independent unit of re-matching work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub entity_type: EntityType,
    /// Every record key that takes part in re-matching
    pub keys: BTreeSet<RecordKey>,
    /// Clusters the keys belonged to before this batch
    pub prior_clusters: BTreeSet<String>,
    /// Sequences of the batch events that touched this partition
    pub sequences: Vec<u64>,
}

impl Partition {
    /// Label used in logs, timeouts and dead letters.
    pub fn label(&self) -> String {
        let entity = self.entity_type.as_str();
        match self.keys.iter().next() {
            Some(first) if self.keys.len() > 1 => {
                format!("{} {} (+{})", entity, first, self.keys.len() - 1)
            }
            Some(first) => format!("{} {}", entity, first),
            None => entity.to_string(),
        }
    }
}

/// Groups touched keys into disjoint partitions.
///
/// `touched` maps each touched key to the event sequences that touched it.
pub async fn build_partitions(
    store: &dyn EntityStore,
    entity_type: EntityType,
    touched: &BTreeMap<RecordKey, Vec<u64>>,
) -> Result<Vec<Partition>> {
    let mut assigned: BTreeSet<RecordKey> = BTreeSet::new();
    let mut partitions = Vec::new();

    for seed in touched.keys() {
        if assigned.contains(seed) {
            continue;
        }
        let mut partition = Partition {
            entity_type,
            keys: BTreeSet::new(),
            prior_clusters: BTreeSet::new(),
            sequences: Vec::new(),
        };
        let mut queue = VecDeque::from([seed.clone()]);
        while let Some(key) = queue.pop_front() {
            if !partition.keys.insert(key.clone()) {
                continue;
            }
            for neighbor in neighbors(store, entity_type, &key, &mut partition.prior_clusters).await? {
                if !partition.keys.contains(&neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }

        for key in &partition.keys {
            if let Some(sequences) = touched.get(key) {
                partition.sequences.extend(sequences);
            }
        }
        partition.sequences.sort_unstable();
        assigned.extend(partition.keys.iter().cloned());
        tracing::debug!(
            partition = %partition.label(),
            records = partition.keys.len(),
            prior_clusters = partition.prior_clusters.len(),
            "Built partition"
        );
        partitions.push(partition);
    }
    Ok(partitions)
}

async fn neighbors(
    store: &dyn EntityStore,
    entity_type: EntityType,
    key: &RecordKey,
    prior_clusters: &mut BTreeSet<String>,
) -> Result<BTreeSet<RecordKey>> {
    let mut found = BTreeSet::new();

    if let Some(cluster_id) = store.cluster_of(entity_type, key).await?
        && prior_clusters.insert(cluster_id.clone())
    {
        found.extend(store.cluster_members(&cluster_id).await?);
    }

    let keys = std::slice::from_ref(key);
    let blocking_keys: Vec<String> = match entity_type {
        EntityType::Provider => store
            .providers_by_keys(keys)
            .await?
            .iter()
            .flat_map(provider_blocking_keys)
            .collect(),
        EntityType::Facility => store
            .facilities_by_keys(keys)
            .await?
            .iter()
            .flat_map(facility_blocking_keys)
            .collect(),
    };
    if !blocking_keys.is_empty() {
        found.extend(store.keys_by_blocking_key(entity_type, &blocking_keys).await?);
    }
    found.remove(key);
    Ok(found)
}
