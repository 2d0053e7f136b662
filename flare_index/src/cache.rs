//! Bookkeeping for loaded `(partition, tenant)` entries.
//!
//! The cache is pure bookkeeping: materialization from the store happens in
//! the index, which then hands complete entries to [`PartitionCache::insert`].

use data_types::{BlockId, BlockMeta, PartitionKey, ShardId, TenantId, Timestamp};
use flare_time::Time;
use hashbrown::HashMap;
use observability_deps::tracing::debug;
use std::sync::Arc;

/// Cache granularity: one loaded entry per `(partition, tenant)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    pub(crate) partition: PartitionKey,
    pub(crate) tenant: TenantId,
}

/// All blocks of one `(partition, tenant)`, grouped by shard.
///
/// A loaded entry is complete: it holds every block of the coordinate for
/// every shard that has data.
#[derive(Debug)]
pub(crate) struct LoadedPartition {
    pub(crate) accessed_at: Time,
    pub(crate) shards: HashMap<ShardId, HashMap<BlockId, Arc<BlockMeta>>>,
}

impl LoadedPartition {
    pub(crate) fn block(&self, shard: ShardId, id: BlockId) -> Option<&Arc<BlockMeta>> {
        self.shards.get(&shard).and_then(|blocks| blocks.get(&id))
    }

    pub(crate) fn insert(&mut self, block: Arc<BlockMeta>) -> Option<Arc<BlockMeta>> {
        self.shards
            .entry(block.shard)
            .or_default()
            .insert(block.id, block)
    }

    pub(crate) fn remove(&mut self, shard: ShardId, id: BlockId) {
        if let Some(blocks) = self.shards.get_mut(&shard) {
            blocks.remove(&id);
            if blocks.is_empty() {
                self.shards.remove(&shard);
            }
        }
    }

    pub(crate) fn blocks(&self) -> impl Iterator<Item = &Arc<BlockMeta>> + '_ {
        self.shards.values().flat_map(|blocks| blocks.values())
    }
}

/// Tenant-keyed LRU of loaded partitions.
///
/// The budget is per tenant, so one tenant scanning history cannot starve
/// the others, and the partition containing "now" is pinned: it receives
/// continuous writes and is exempt from eviction.
#[derive(Debug)]
pub(crate) struct PartitionCache {
    entries: HashMap<CacheKey, LoadedPartition>,
    max_per_tenant: usize,
}

impl PartitionCache {
    pub(crate) fn new(max_per_tenant: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_per_tenant,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Cache hit: refresh recency and return the entry.
    pub(crate) fn get_mut(&mut self, key: &CacheKey, now: Time) -> Option<&mut LoadedPartition> {
        let entry = self.entries.get_mut(key)?;
        entry.accessed_at = now;
        Some(entry)
    }

    /// Access without refreshing recency; deletion mirroring uses this.
    pub(crate) fn peek_mut(&mut self, key: &CacheKey) -> Option<&mut LoadedPartition> {
        self.entries.get_mut(key)
    }

    pub(crate) fn insert(&mut self, key: CacheKey, entry: LoadedPartition) {
        self.entries.insert(key, entry);
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &CacheKey> + '_ {
        self.entries.keys()
    }

    /// Evict the least recently used entries of every tenant over budget.
    ///
    /// Runs after each materialization. Entries whose partition contains
    /// `now` are skipped without consuming the eviction quota, so a pinned
    /// active partition can leave a tenant one entry over budget.
    pub(crate) fn evict_excess(&mut self, now: Time) {
        let now_ts = Timestamp::new(now.timestamp_millis());

        let mut by_tenant: HashMap<TenantId, Vec<(CacheKey, Time)>> = HashMap::new();
        for (key, entry) in &self.entries {
            by_tenant
                .entry(key.tenant.clone())
                .or_default()
                .push((key.clone(), entry.accessed_at));
        }

        for (_, mut tenant_entries) in by_tenant {
            if tenant_entries.len() <= self.max_per_tenant {
                continue;
            }
            tenant_entries.sort_by_key(|(_, accessed_at)| *accessed_at);

            let mut excess = tenant_entries.len() - self.max_per_tenant;
            for (key, _) in tenant_entries {
                if excess == 0 {
                    break;
                }
                if key.partition.contains(now_ts) {
                    continue;
                }
                debug!(
                    partition = %key.partition,
                    tenant = %key.tenant,
                    "evicting cached partition"
                );
                self.entries.remove(&key);
                excess -= 1;
            }
        }
    }
}
