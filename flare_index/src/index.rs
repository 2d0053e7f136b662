//! The partition index engine.

use crate::{
    cache::{CacheKey, LoadedPartition, PartitionCache},
    interface::{BlockExistsSnafu, Result, ScanCancelledSnafu, StoreTransaction},
};
use data_types::{
    BlockId, BlockList, BlockMeta, CompactedBlocks, PartitionKey, PartitionMeta, ShardId,
    TenantId, Timestamp,
};
use flare_time::TimeProvider;
use futures::{future::BoxFuture, stream, StreamExt};
use hashbrown::{HashMap, HashSet};
use observability_deps::tracing::{debug, info};
use snafu::ensure;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Knobs of the partition index.
#[derive(Debug, Clone, Copy)]
pub struct IndexConfig {
    /// Width of the creation-time buckets blocks are partitioned into.
    ///
    /// Whole hours; the partition key's textual form has hour resolution.
    pub partition_duration: Duration,

    /// Loaded `(partition, tenant)` entries retained per tenant.
    pub partition_cache_size: usize,

    /// Slack added on both sides of a range query to cover blocks whose
    /// payload time extends outside their creation partition.
    pub query_lookaround_period: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            partition_duration: Duration::from_secs(24 * 3600),
            partition_cache_size: 7,
            query_lookaround_period: Duration::from_secs(3600),
        }
    }
}

/// Concurrent visits performed by [`PartitionIndex::for_each_partition`].
const PARTITION_SCAN_CONCURRENCY: usize = 8;

#[derive(Debug)]
struct IndexState {
    /// Every partition known to the store, sorted by key.
    partitions: Vec<PartitionMeta>,
    /// Loaded `(partition, tenant)` entries.
    cache: PartitionCache,
}

impl IndexState {
    fn partition_known(&self, key: &PartitionKey) -> bool {
        self.partitions
            .binary_search_by(|meta| meta.key().cmp(key))
            .is_ok()
    }

    fn get_or_create_partition(&mut self, key: PartitionKey) -> &mut PartitionMeta {
        match self.partitions.binary_search_by(|meta| meta.key().cmp(&key)) {
            Ok(at) => &mut self.partitions[at],
            Err(at) => {
                self.partitions.insert(at, PartitionMeta::new(key));
                &mut self.partitions[at]
            }
        }
    }
}

/// The time-partitioned block-metadata index.
///
/// Blocks are bucketed by the creation timestamp embedded in their id, per
/// tenant and shard. The index keeps the full list of partitions in memory,
/// plus a bounded cache of loaded `(partition, tenant)` entries read through
/// from the store on demand.
///
/// Callers own the transaction: they open it on the [`Store`], pass it into
/// every operation, and commit or abort afterwards. On a store error the
/// in-memory state may be ahead of the transaction; aborting and calling
/// [`restore`] reconciles.
///
/// [`Store`]: crate::interface::Store
/// [`restore`]: PartitionIndex::restore
#[derive(Debug)]
pub struct PartitionIndex {
    config: IndexConfig,
    time_provider: Arc<dyn TimeProvider>,

    /// One coarse lock over the whole in-memory state; every operation holds
    /// it for the full call, store I/O included.
    state: Mutex<IndexState>,
}

impl PartitionIndex {
    /// An empty index; call [`restore`](Self::restore) to populate it from
    /// the store.
    pub fn new(config: IndexConfig, time_provider: Arc<dyn TimeProvider>) -> Self {
        let cache = PartitionCache::new(config.partition_cache_size);
        Self {
            config,
            time_provider,
            state: Mutex::new(IndexState {
                partitions: Vec::new(),
                cache,
            }),
        }
    }

    fn now(&self) -> Timestamp {
        Timestamp::new(self.time_provider.now().timestamp_millis())
    }

    /// Ask the store to create its namespaces. Idempotent.
    pub async fn init(&self, tx: &mut dyn StoreTransaction) -> Result<()> {
        tx.create_buckets().await
    }

    /// Rebuild the in-memory state from the store.
    ///
    /// Every partition the store lists gets a [`PartitionMeta`]; partitions
    /// containing "now" are fully loaded into cache so the hot window is warm
    /// before the first query.
    pub async fn restore(&self, tx: &mut dyn StoreTransaction) -> Result<()> {
        let mut state = self.state.lock().await;
        state.partitions.clear();
        state.cache.clear();

        let now = self.now();
        for key in tx.list_partitions().await? {
            let mut meta = PartitionMeta::new(key);
            let mut cache_tenants = BTreeSet::new();
            for shard in tx.list_shards(&key).await? {
                for tenant in tx.list_tenants(&key, shard).await? {
                    if tenant.is_mixed() {
                        // dataset tenants of mixed blocks are not materialized
                        // as store coordinates; re-derive them from the blocks
                        for block in tx.list_blocks(&key, shard, &tenant).await? {
                            meta.register_block(&block);
                        }
                    } else {
                        meta.add_tenant(tenant.clone());
                    }
                    cache_tenants.insert(tenant);
                }
            }

            let active = meta.contains(now);
            state.partitions.push(meta);
            if active {
                for tenant in &cache_tenants {
                    self.load_partition(&mut state, tx, key, tenant).await?;
                }
            }
        }
        state.partitions.sort_by_key(|meta| meta.key());

        info!(partitions = state.partitions.len(), "restored block index");
        Ok(())
    }

    /// Insert one block.
    ///
    /// Fails with [`Error::BlockExists`] if a block with the same id is
    /// already present under the block's `(shard, tenant)` in any partition
    /// that could contain it; the block is then neither cached nor persisted.
    ///
    /// [`Error::BlockExists`]: crate::interface::Error::BlockExists
    pub async fn insert_block(&self, tx: &mut dyn StoreTransaction, block: BlockMeta) -> Result<()> {
        let mut state = self.state.lock().await;

        let tenant = block.tenant_id.clone();
        let existing = self
            .lookup_block(&mut state, tx, block.shard, &tenant, block.id)
            .await?;
        ensure!(
            existing.is_none(),
            BlockExistsSnafu {
                id: block.id,
                shard: block.shard,
                tenant,
            }
        );

        let key = PartitionKey::for_block(block.id, self.config.partition_duration);
        state.get_or_create_partition(key).register_block(&block);

        let entry = self.get_or_load(&mut state, tx, key, &tenant).await?;
        // the slot is re-checked inside the critical section
        ensure!(
            entry.block(block.shard, block.id).is_none(),
            BlockExistsSnafu {
                id: block.id,
                shard: block.shard,
                tenant,
            }
        );

        let block = Arc::new(block);
        entry.insert(Arc::clone(&block));
        tx.store_block(&key, &block).await
    }

    /// Insert one block into memory only: no duplicate probe, no store write.
    ///
    /// Replay paths use this to rebuild state that is already durable. The
    /// transaction is still needed to materialize the target partition.
    pub async fn insert_block_unchecked(
        &self,
        tx: &mut dyn StoreTransaction,
        block: BlockMeta,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        self.insert_unchecked(&mut state, tx, block, false).await
    }

    /// Point lookup of a block under `(shard, tenant)`.
    ///
    /// The returned value is the cached instance, shared not copied; block
    /// metadata is immutable once indexed.
    pub async fn find_block(
        &self,
        tx: &mut dyn StoreTransaction,
        shard: ShardId,
        tenant: &TenantId,
        id: BlockId,
    ) -> Result<Option<Arc<BlockMeta>>> {
        let mut state = self.state.lock().await;
        self.lookup_block(&mut state, tx, shard, tenant, id).await
    }

    /// Bulk lookup: every listed block found under the list's
    /// `(shard, tenant)`, in unspecified order. Missing ids are skipped.
    pub async fn find_blocks(
        &self,
        tx: &mut dyn StoreTransaction,
        list: &BlockList,
    ) -> Result<Vec<Arc<BlockMeta>>> {
        let mut state = self.state.lock().await;

        let mut outstanding: HashSet<BlockId> = list.blocks.iter().copied().collect();
        let mut found = Vec::with_capacity(outstanding.len());

        // first pass: the partition each id belongs to under the current
        // configuration
        let mut groups: BTreeMap<PartitionKey, Vec<BlockId>> = BTreeMap::new();
        for id in &outstanding {
            let key = PartitionKey::for_block(*id, self.config.partition_duration);
            groups.entry(key).or_default().push(*id);
        }
        for (key, ids) in groups {
            if !state.partition_known(&key) {
                continue;
            }
            let entry = self.get_or_load(&mut state, tx, key, &list.tenant).await?;
            for id in ids {
                if let Some(block) = entry.block(list.shard, id) {
                    found.push(Arc::clone(block));
                    outstanding.remove(&id);
                }
            }
        }

        // ids written under an older partition duration live in a different
        // bucket; probe every partition containing their creation time
        if !outstanding.is_empty() {
            let candidates: Vec<PartitionKey> = state
                .partitions
                .iter()
                .filter(|meta| outstanding.iter().any(|id| meta.contains(id.created_at())))
                .map(|meta| meta.key())
                .collect();
            for key in candidates {
                if outstanding.is_empty() {
                    break;
                }
                let entry = self.get_or_load(&mut state, tx, key, &list.tenant).await?;
                let probe: Vec<BlockId> = outstanding.iter().copied().collect();
                for id in probe {
                    if let Some(block) = entry.block(list.shard, id) {
                        found.push(Arc::clone(block));
                        outstanding.remove(&id);
                    }
                }
            }
        }

        Ok(found)
    }

    /// Every block whose payload interval intersects `[start, end]`, for any
    /// of the given tenants. Mixed blocks are included whenever their
    /// partition qualifies.
    ///
    /// Partitions are keyed by creation time while the filter is on payload
    /// time, so the partition-level search window is widened by the
    /// configured lookaround period on both sides; the precise predicate is
    /// applied per block.
    pub async fn find_blocks_in_range(
        &self,
        tx: &mut dyn StoreTransaction,
        start: Timestamp,
        end: Timestamp,
        tenants: &[TenantId],
    ) -> Result<Vec<Arc<BlockMeta>>> {
        let mut state = self.state.lock().await;

        let lookaround = self.config.query_lookaround_period;
        let window_start = start - lookaround;
        let window_end = end + lookaround;

        let candidates: Vec<(PartitionKey, Vec<TenantId>)> = state
            .partitions
            .iter()
            .filter(|meta| meta.overlaps(window_start, window_end))
            .filter_map(|meta| {
                let present: Vec<TenantId> = tenants
                    .iter()
                    .filter(|tenant| meta.has_tenant(tenant))
                    .cloned()
                    .collect();
                (!present.is_empty()).then(|| (meta.key(), present))
            })
            .collect();

        let mixed = TenantId::mixed();
        let mut found = Vec::new();
        for (key, present) in candidates {
            // the mixed entry is loaded once per partition
            for tenant in present.iter().chain(std::iter::once(&mixed)) {
                let entry = self.get_or_load(&mut state, tx, key, tenant).await?;
                for block in entry.blocks() {
                    if block.intersects(start, end) {
                        found.push(Arc::clone(block));
                    }
                }
            }
        }

        Ok(found)
    }

    /// Atomically, within the caller's transaction, insert the compaction
    /// output and remove the blocks it supersedes.
    ///
    /// Insertion follows [`insert_block`] without the duplicate probe. The
    /// source list is uniform in `(shard, tenant)`; its ids are grouped by
    /// partition, deleted from the store one group at a time, and mirrored
    /// out of any loaded cache entry.
    ///
    /// [`insert_block`]: PartitionIndex::insert_block
    pub async fn replace_blocks(
        &self,
        tx: &mut dyn StoreTransaction,
        compacted: &CompactedBlocks,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        for block in &compacted.new_blocks {
            self.insert_unchecked(&mut state, tx, block.clone(), true)
                .await?;
        }
        self.delete_blocks(&mut state, tx, &compacted.source_blocks, true)
            .await
    }

    /// The memory-only variant of [`replace_blocks`]: no store writes, no
    /// store deletes. Replay paths use this.
    ///
    /// [`replace_blocks`]: PartitionIndex::replace_blocks
    pub async fn replace_blocks_unchecked(
        &self,
        tx: &mut dyn StoreTransaction,
        compacted: &CompactedBlocks,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        for block in &compacted.new_blocks {
            self.insert_unchecked(&mut state, tx, block.clone(), false)
                .await?;
        }
        self.delete_blocks(&mut state, tx, &compacted.source_blocks, false)
            .await
    }

    /// Every partition whose interval contains the block's creation time.
    pub async fn find_partition_metas(&self, id: BlockId) -> Vec<PartitionMeta> {
        let state = self.state.lock().await;
        let created = id.created_at();
        state
            .partitions
            .iter()
            .filter(|meta| meta.contains(created))
            .cloned()
            .collect()
    }

    /// Visit every known partition, concurrently and in unspecified order.
    ///
    /// The first visit error cancels the remaining visits and is returned;
    /// cancelling `token` stops the scan between visit completions with
    /// [`Error::ScanCancelled`].
    ///
    /// Visits run under the index lock: they must not call back into the
    /// index, and must not retain partition references past their return.
    ///
    /// [`Error::ScanCancelled`]: crate::interface::Error::ScanCancelled
    pub async fn for_each_partition<F>(&self, token: &CancellationToken, visit: F) -> Result<()>
    where
        F: for<'a> Fn(&'a PartitionMeta) -> BoxFuture<'a, Result<()>>,
    {
        let state = self.state.lock().await;
        let mut visits = stream::iter(state.partitions.iter().map(&visit))
            .buffer_unordered(PARTITION_SCAN_CONCURRENCY);

        loop {
            tokio::select! {
                _ = token.cancelled() => return ScanCancelledSnafu.fail(),
                next = visits.next() => match next {
                    Some(result) => result?,
                    None => return Ok(()),
                },
            }
        }
    }

    /// Search every partition that could contain the block: the one derived
    /// from the id under the current partition duration first, then every
    /// partition whose interval contains the id's creation time. The latter
    /// covers blocks written under a different duration configuration.
    async fn lookup_block(
        &self,
        state: &mut IndexState,
        tx: &mut dyn StoreTransaction,
        shard: ShardId,
        tenant: &TenantId,
        id: BlockId,
    ) -> Result<Option<Arc<BlockMeta>>> {
        let natural = PartitionKey::for_block(id, self.config.partition_duration);
        let created = id.created_at();

        let mut candidates = Vec::new();
        if state.partition_known(&natural) {
            candidates.push(natural);
        }
        for meta in &state.partitions {
            if meta.key() != natural && meta.contains(created) {
                candidates.push(meta.key());
            }
        }

        for key in candidates {
            let entry = self.get_or_load(state, tx, key, tenant).await?;
            if let Some(block) = entry.block(shard, id) {
                return Ok(Some(Arc::clone(block)));
            }
        }
        Ok(None)
    }

    /// Insert into partition meta and cache; optionally persist.
    async fn insert_unchecked(
        &self,
        state: &mut IndexState,
        tx: &mut dyn StoreTransaction,
        block: BlockMeta,
        persist: bool,
    ) -> Result<()> {
        let key = PartitionKey::for_block(block.id, self.config.partition_duration);
        state.get_or_create_partition(key).register_block(&block);

        let tenant = block.tenant_id.clone();
        let entry = self.get_or_load(state, tx, key, &tenant).await?;
        let block = Arc::new(block);
        entry.insert(Arc::clone(&block));

        if persist {
            tx.store_block(&key, &block).await?;
        }
        Ok(())
    }

    /// Group the source ids by partition, delete each group, and mirror the
    /// deletions in the loaded cache entries.
    async fn delete_blocks(
        &self,
        state: &mut IndexState,
        tx: &mut dyn StoreTransaction,
        source: &BlockList,
        persist: bool,
    ) -> Result<()> {
        let mut groups: BTreeMap<PartitionKey, Vec<BlockId>> = BTreeMap::new();
        for id in &source.blocks {
            let key = PartitionKey::for_block(*id, self.config.partition_duration);
            groups.entry(key).or_default().push(*id);
        }

        for (key, ids) in groups {
            if persist {
                let list = BlockList {
                    tenant: source.tenant.clone(),
                    shard: source.shard,
                    blocks: ids.clone(),
                };
                tx.delete_block_list(&key, &list).await?;
            }

            let cache_key = CacheKey {
                partition: key,
                tenant: source.tenant.clone(),
            };
            if let Some(entry) = state.cache.peek_mut(&cache_key) {
                for id in ids {
                    entry.remove(source.shard, id);
                }
            }
        }
        Ok(())
    }

    /// Return the loaded entry for `(partition, tenant)`, materializing it
    /// from the store on a miss. Refreshes the entry's recency either way.
    async fn get_or_load<'s>(
        &self,
        state: &'s mut IndexState,
        tx: &mut dyn StoreTransaction,
        partition: PartitionKey,
        tenant: &TenantId,
    ) -> Result<&'s mut LoadedPartition> {
        let cache_key = CacheKey {
            partition,
            tenant: tenant.clone(),
        };
        let now = self.time_provider.now();

        if state.cache.get_mut(&cache_key, now).is_none() {
            self.load_partition(state, tx, partition, tenant).await?;
        }
        Ok(state
            .cache
            .peek_mut(&cache_key)
            .expect("partition just loaded"))
    }

    /// Materialize `(partition, tenant)` from the store: every block of the
    /// tenant in every shard of the partition. Runs the eviction pass
    /// afterwards; the fresh entry carries the newest access stamp and is
    /// not a candidate in it.
    async fn load_partition(
        &self,
        state: &mut IndexState,
        tx: &mut dyn StoreTransaction,
        partition: PartitionKey,
        tenant: &TenantId,
    ) -> Result<()> {
        let cache_key = CacheKey {
            partition,
            tenant: tenant.clone(),
        };
        if state.cache.contains(&cache_key) {
            return Ok(());
        }

        let mut shards: HashMap<ShardId, HashMap<BlockId, Arc<BlockMeta>>> = HashMap::new();
        for shard in tx.list_shards(&partition).await? {
            let blocks = tx.list_blocks(&partition, shard, tenant).await?;
            if blocks.is_empty() {
                continue;
            }
            shards.insert(
                shard,
                blocks
                    .into_iter()
                    .map(|block| (block.id, Arc::new(block)))
                    .collect(),
            );
        }
        debug!(
            partition = %partition,
            tenant = %tenant,
            shards = shards.len(),
            "loaded partition"
        );

        let now = self.time_provider.now();
        state.cache.insert(
            cache_key,
            LoadedPartition {
                accessed_at: now,
                shards,
            },
        );
        state.cache.evict_excess(now);
        Ok(())
    }

    #[cfg(test)]
    async fn loaded_cache_keys(&self) -> Vec<(PartitionKey, TenantId)> {
        let state = self.state.lock().await;
        state
            .cache
            .keys()
            .map(|key| (key.partition, key.tenant.clone()))
            .collect()
    }

    #[cfg(test)]
    async fn partition_keys(&self) -> Vec<PartitionKey> {
        let state = self.state.lock().await;
        state.partitions.iter().map(|meta| meta.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        interface::{Error, Store},
        mem::MemStore,
    };
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use data_types::Dataset;
    use flare_time::{MockProvider, Time};
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    const HOUR: Duration = Duration::from_secs(3600);

    /// 2024-09-23T00:00:00Z
    const DAY_START: i64 = 1_727_049_600_000;

    /// 2024-09-23T16:30:00Z, where the mock clock starts
    const NOW: i64 = DAY_START + (16 * 60 + 30) * 60_000;

    fn at(hour: i64, minute: i64) -> i64 {
        DAY_START + (hour * 60 + minute) * 60_000
    }

    fn tenant(name: &str) -> TenantId {
        TenantId::from(name)
    }

    fn block_at(created_at: i64, shard: u32, tenant: &str) -> BlockMeta {
        static UNIQUE: AtomicU64 = AtomicU64::new(1);
        BlockMeta {
            id: BlockId::from_parts(
                created_at as u64,
                UNIQUE.fetch_add(1, Ordering::Relaxed) as u128,
            ),
            shard: ShardId::new(shard),
            tenant_id: TenantId::from(tenant),
            min_time: Timestamp::new(created_at),
            max_time: Timestamp::new(created_at + 60_000),
            datasets: vec![],
        }
    }

    fn hourly() -> IndexConfig {
        IndexConfig {
            partition_duration: HOUR,
            ..Default::default()
        }
    }

    struct TestIndex {
        store: Arc<MemStore>,
        time: Arc<MockProvider>,
        index: PartitionIndex,
    }

    impl TestIndex {
        fn new(config: IndexConfig) -> Self {
            Self::with_store(config, Arc::new(MemStore::new()))
        }

        fn with_store(config: IndexConfig, store: Arc<MemStore>) -> Self {
            test_helpers::maybe_start_logging();
            let time = Arc::new(MockProvider::new(Time::from_timestamp_millis(NOW)));
            let index = PartitionIndex::new(config, Arc::clone(&time) as _);
            Self { store, time, index }
        }

        async fn begin(&self) -> Box<dyn StoreTransaction> {
            self.store.begin().await.unwrap()
        }

        /// The loaded partitions of one tenant, as sorted key strings.
        async fn loaded(&self, tenant_name: &str) -> Vec<String> {
            let mut keys: Vec<String> = self
                .index
                .loaded_cache_keys()
                .await
                .into_iter()
                .filter(|(_, tenant)| tenant.as_str() == tenant_name)
                .map(|(partition, _)| partition.to_string())
                .collect();
            keys.sort();
            keys
        }
    }

    #[tokio::test]
    async fn insert_and_find() {
        let fixture = TestIndex::new(hourly());
        let mut tx = fixture.begin().await;
        fixture.index.init(tx.as_mut()).await.unwrap();

        let block = block_at(at(16, 30), 1, "a");
        fixture
            .index
            .insert_block(tx.as_mut(), block.clone())
            .await
            .unwrap();

        let metas = fixture.index.find_partition_metas(block.id).await;
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].key().to_string(), "20240923T16.1h");
        assert!(metas[0].has_tenant(&tenant("a")));

        let found = fixture
            .index
            .find_block(tx.as_mut(), ShardId::new(1), &tenant("a"), block.id)
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some(&block));

        // wrong tenant, wrong shard
        assert!(fixture
            .index
            .find_block(tx.as_mut(), ShardId::new(1), &tenant("b"), block.id)
            .await
            .unwrap()
            .is_none());
        assert!(fixture
            .index
            .find_block(tx.as_mut(), ShardId::new(2), &tenant("a"), block.id)
            .await
            .unwrap()
            .is_none());

        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_insert_fails_and_persists_nothing() {
        let fixture = TestIndex::new(hourly());
        let mut tx = fixture.begin().await;
        fixture.index.init(tx.as_mut()).await.unwrap();

        let block = block_at(at(16, 30), 1, "a");
        fixture
            .index
            .insert_block(tx.as_mut(), block.clone())
            .await
            .unwrap();

        let err = fixture
            .index
            .insert_block(tx.as_mut(), block.clone())
            .await
            .unwrap_err();
        test_helpers::assert_contains!(err, "already exists");
        assert_matches!(err, Error::BlockExists { id, .. } => assert_eq!(id, block.id));

        tx.commit().await.unwrap();

        let mut tx = fixture.begin().await;
        let key = PartitionKey::for_block(block.id, HOUR);
        let stored = tx
            .list_blocks(&key, ShardId::new(1), &tenant("a"))
            .await
            .unwrap();
        assert_eq!(stored, vec![block]);
        tx.abort().await.unwrap();
    }

    #[tokio::test]
    async fn range_query_looks_around_partition_bounds() {
        let fixture = TestIndex::new(hourly());
        let mut tx = fixture.begin().await;
        fixture.index.init(tx.as_mut()).await.unwrap();

        // created in the 17:00 partition, payload reaching back before it
        let mut block = block_at(at(17, 5), 1, "a");
        block.min_time = Timestamp::new(at(16, 55));
        block.max_time = Timestamp::new(at(17, 10));
        fixture
            .index
            .insert_block(tx.as_mut(), block.clone())
            .await
            .unwrap();

        let found = fixture
            .index
            .find_blocks_in_range(
                tx.as_mut(),
                Timestamp::new(at(16, 50)),
                Timestamp::new(at(16, 58)),
                &[tenant("a")],
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(*found[0], block);

        // window past the payload interval
        assert!(fixture
            .index
            .find_blocks_in_range(
                tx.as_mut(),
                Timestamp::new(at(17, 30)),
                Timestamp::new(at(17, 40)),
                &[tenant("a")],
            )
            .await
            .unwrap()
            .is_empty());

        // other tenant
        assert!(fixture
            .index
            .find_blocks_in_range(
                tx.as_mut(),
                Timestamp::new(at(16, 50)),
                Timestamp::new(at(16, 58)),
                &[tenant("b")],
            )
            .await
            .unwrap()
            .is_empty());

        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn mixed_blocks_register_dataset_tenants() {
        let fixture = TestIndex::new(hourly());
        let mut tx = fixture.begin().await;
        fixture.index.init(tx.as_mut()).await.unwrap();

        let mut block = block_at(at(16, 40), 1, "");
        block.datasets = vec![
            Dataset {
                tenant_id: tenant("a"),
            },
            Dataset {
                tenant_id: tenant("b"),
            },
        ];
        fixture
            .index
            .insert_block(tx.as_mut(), block.clone())
            .await
            .unwrap();

        let metas = fixture.index.find_partition_metas(block.id).await;
        assert_eq!(metas.len(), 1);
        assert!(metas[0].has_tenant(&tenant("a")));
        assert!(metas[0].has_tenant(&tenant("b")));
        assert!(!metas[0].has_tenant(&TenantId::mixed()));

        // mixed blocks are cached under the mixed tenant
        let found = fixture
            .index
            .find_block(tx.as_mut(), ShardId::new(1), &TenantId::mixed(), block.id)
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some(&block));

        // and are returned for any dataset tenant's range query
        let found = fixture
            .index
            .find_blocks_in_range(
                tx.as_mut(),
                Timestamp::new(at(16, 0)),
                Timestamp::new(at(17, 0)),
                &[tenant("a")],
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(*found[0], block);

        assert!(fixture
            .index
            .find_blocks_in_range(
                tx.as_mut(),
                Timestamp::new(at(16, 0)),
                Timestamp::new(at(17, 0)),
                &[tenant("c")],
            )
            .await
            .unwrap()
            .is_empty());

        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn replace_blocks_swaps_sources_for_replacements() {
        let fixture = TestIndex::new(hourly());
        let mut tx = fixture.begin().await;
        fixture.index.init(tx.as_mut()).await.unwrap();

        let source = block_at(at(16, 30), 1, "a");
        fixture
            .index
            .insert_block(tx.as_mut(), source.clone())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let replacement = block_at(at(16, 45), 1, "a");
        let compacted = CompactedBlocks {
            source_blocks: BlockList {
                tenant: tenant("a"),
                shard: ShardId::new(1),
                blocks: vec![source.id],
            },
            new_blocks: vec![replacement.clone()],
        };

        let mut tx = fixture.begin().await;
        fixture
            .index
            .replace_blocks(tx.as_mut(), &compacted)
            .await
            .unwrap();

        assert!(fixture
            .index
            .find_block(tx.as_mut(), ShardId::new(1), &tenant("a"), source.id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            fixture
                .index
                .find_block(tx.as_mut(), ShardId::new(1), &tenant("a"), replacement.id)
                .await
                .unwrap()
                .as_deref(),
            Some(&replacement)
        );
        tx.commit().await.unwrap();

        // the swap survives a restart
        let reader = TestIndex::with_store(hourly(), Arc::clone(&fixture.store));
        let mut tx = reader.begin().await;
        reader.index.restore(tx.as_mut()).await.unwrap();
        assert!(reader
            .index
            .find_block(tx.as_mut(), ShardId::new(1), &tenant("a"), source.id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            reader
                .index
                .find_block(tx.as_mut(), ShardId::new(1), &tenant("a"), replacement.id)
                .await
                .unwrap()
                .as_deref(),
            Some(&replacement)
        );
        tx.abort().await.unwrap();
    }

    #[tokio::test]
    async fn eviction_drops_least_recently_used_partition() {
        let config = IndexConfig {
            partition_duration: HOUR,
            partition_cache_size: 2,
            ..Default::default()
        };
        let fixture = TestIndex::new(config);
        let mut tx = fixture.begin().await;
        fixture.index.init(tx.as_mut()).await.unwrap();

        for hour in [10, 11, 12] {
            fixture
                .index
                .insert_block(tx.as_mut(), block_at(at(hour, 30), 1, "a"))
                .await
                .unwrap();
            fixture.time.inc(Duration::from_secs(1));
        }

        assert_eq!(
            fixture.loaded("a").await,
            vec!["20240923T11.1h", "20240923T12.1h"]
        );
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn eviction_pins_the_active_partition() {
        let config = IndexConfig {
            partition_duration: HOUR,
            partition_cache_size: 2,
            ..Default::default()
        };
        let fixture = TestIndex::new(config);
        let mut tx = fixture.begin().await;
        fixture.index.init(tx.as_mut()).await.unwrap();

        // the oldest touch is the partition containing "now" (16:30)
        for minutes in [(16, 10), (10, 30), (11, 30)] {
            fixture
                .index
                .insert_block(tx.as_mut(), block_at(at(minutes.0, minutes.1), 1, "a"))
                .await
                .unwrap();
            fixture.time.inc(Duration::from_secs(1));
        }

        assert_eq!(
            fixture.loaded("a").await,
            vec!["20240923T11.1h", "20240923T16.1h"]
        );
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn cache_budget_is_per_tenant() {
        let config = IndexConfig {
            partition_duration: HOUR,
            partition_cache_size: 1,
            ..Default::default()
        };
        let fixture = TestIndex::new(config);
        let mut tx = fixture.begin().await;
        fixture.index.init(tx.as_mut()).await.unwrap();

        for (hour, minute, tenant_name) in
            [(10, 30, "a"), (11, 30, "a"), (10, 35, "b"), (11, 35, "b")]
        {
            fixture
                .index
                .insert_block(tx.as_mut(), block_at(at(hour, minute), 1, tenant_name))
                .await
                .unwrap();
            fixture.time.inc(Duration::from_secs(1));
        }

        assert_eq!(fixture.loaded("a").await, vec!["20240923T11.1h"]);
        assert_eq!(fixture.loaded("b").await, vec!["20240923T11.1h"]);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn restore_rebuilds_partitions_and_warms_the_active_window() {
        let fixture = TestIndex::new(hourly());
        let mut tx = fixture.begin().await;
        fixture.index.init(tx.as_mut()).await.unwrap();

        let old = block_at(at(10, 30), 1, "a");
        let active = block_at(at(16, 10), 1, "a");
        let other_tenant = block_at(at(11, 45), 2, "b");
        let mut mixed = block_at(at(16, 20), 1, "");
        mixed.datasets = vec![
            Dataset {
                tenant_id: tenant("a"),
            },
            Dataset {
                tenant_id: tenant("b"),
            },
        ];
        for block in [&old, &active, &other_tenant, &mixed] {
            fixture
                .index
                .insert_block(tx.as_mut(), block.clone())
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();

        let reader = TestIndex::with_store(hourly(), Arc::clone(&fixture.store));
        let mut tx = reader.begin().await;
        reader.index.restore(tx.as_mut()).await.unwrap();

        // every stored partition is known, sorted by key
        assert_eq!(
            reader.index.partition_keys().await,
            vec![
                "20240923T10.1h".parse().unwrap(),
                "20240923T11.1h".parse().unwrap(),
                "20240923T16.1h".parse().unwrap(),
            ]
        );

        // only the active partition is warm, for every tenant present in it
        assert_eq!(reader.loaded("a").await, vec!["20240923T16.1h"]);
        assert_eq!(reader.loaded("").await, vec!["20240923T16.1h"]);
        assert!(reader.loaded("b").await.is_empty());

        // mixed dataset tenants survive the restart
        let metas = reader.index.find_partition_metas(mixed.id).await;
        assert_eq!(metas.len(), 1);
        assert!(metas[0].has_tenant(&tenant("a")));
        assert!(metas[0].has_tenant(&tenant("b")));

        // cold partitions are still reachable
        assert_eq!(
            reader
                .index
                .find_block(tx.as_mut(), ShardId::new(1), &tenant("a"), old.id)
                .await
                .unwrap()
                .as_deref(),
            Some(&old)
        );
        assert_eq!(
            reader
                .index
                .find_block(tx.as_mut(), ShardId::new(2), &tenant("b"), other_tenant.id)
                .await
                .unwrap()
                .as_deref(),
            Some(&other_tenant)
        );

        // the warm window answers range queries, mixed blocks included
        let found = reader
            .index
            .find_blocks_in_range(
                tx.as_mut(),
                Timestamp::new(at(16, 0)),
                Timestamp::new(at(17, 0)),
                &[tenant("a")],
            )
            .await
            .unwrap();
        let mut ids: Vec<BlockId> = found.iter().map(|block| block.id).collect();
        ids.sort();
        let mut expected = vec![active.id, mixed.id];
        expected.sort();
        assert_eq!(ids, expected);

        tx.abort().await.unwrap();
    }

    #[tokio::test]
    async fn find_block_spans_partition_duration_epochs() {
        let writer = TestIndex::new(hourly());
        let mut tx = writer.begin().await;
        writer.index.init(tx.as_mut()).await.unwrap();
        let block = block_at(at(16, 30), 1, "a");
        writer
            .index
            .insert_block(tx.as_mut(), block.clone())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        // the reader runs with a different partition duration: the natural
        // key no longer matches the partition the block was written to
        let reader = TestIndex::with_store(IndexConfig::default(), Arc::clone(&writer.store));
        let mut tx = reader.begin().await;
        reader.index.restore(tx.as_mut()).await.unwrap();

        assert_eq!(
            reader
                .index
                .find_block(tx.as_mut(), ShardId::new(1), &tenant("a"), block.id)
                .await
                .unwrap()
                .as_deref(),
            Some(&block)
        );

        let list = BlockList {
            tenant: tenant("a"),
            shard: ShardId::new(1),
            blocks: vec![block.id],
        };
        let found = reader.index.find_blocks(tx.as_mut(), &list).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(*found[0], block);

        tx.abort().await.unwrap();
    }

    #[tokio::test]
    async fn find_blocks_skips_missing_ids() {
        let fixture = TestIndex::new(hourly());
        let mut tx = fixture.begin().await;
        fixture.index.init(tx.as_mut()).await.unwrap();

        let b1 = block_at(at(16, 5), 1, "a");
        let b2 = block_at(at(16, 10), 1, "a");
        let b3 = block_at(at(15, 30), 1, "a");
        for block in [&b1, &b2, &b3] {
            fixture
                .index
                .insert_block(tx.as_mut(), block.clone())
                .await
                .unwrap();
        }

        let unknown = BlockId::from_parts(at(15, 45) as u64, u128::MAX);
        let list = BlockList {
            tenant: tenant("a"),
            shard: ShardId::new(1),
            blocks: vec![b1.id, b2.id, b3.id, unknown],
        };
        let found = fixture.index.find_blocks(tx.as_mut(), &list).await.unwrap();

        let mut ids: Vec<BlockId> = found.iter().map(|block| block.id).collect();
        ids.sort();
        let mut expected = vec![b1.id, b2.id, b3.id];
        expected.sort();
        assert_eq!(ids, expected);

        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn unchecked_insert_is_memory_only() {
        let fixture = TestIndex::new(hourly());
        let mut tx = fixture.begin().await;
        fixture.index.init(tx.as_mut()).await.unwrap();

        let block = block_at(at(16, 30), 1, "a");
        fixture
            .index
            .insert_block_unchecked(tx.as_mut(), block.clone())
            .await
            .unwrap();

        assert_eq!(
            fixture
                .index
                .find_block(tx.as_mut(), ShardId::new(1), &tenant("a"), block.id)
                .await
                .unwrap()
                .as_deref(),
            Some(&block)
        );
        tx.commit().await.unwrap();

        // nothing was persisted
        let reader = TestIndex::with_store(hourly(), Arc::clone(&fixture.store));
        let mut tx = reader.begin().await;
        reader.index.restore(tx.as_mut()).await.unwrap();
        assert!(reader
            .index
            .find_block(tx.as_mut(), ShardId::new(1), &tenant("a"), block.id)
            .await
            .unwrap()
            .is_none());
        tx.abort().await.unwrap();
    }

    #[tokio::test]
    async fn unchecked_replace_is_memory_only() {
        let fixture = TestIndex::new(hourly());
        let mut tx = fixture.begin().await;
        fixture.index.init(tx.as_mut()).await.unwrap();

        let source = block_at(at(16, 30), 1, "a");
        fixture
            .index
            .insert_block(tx.as_mut(), source.clone())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let replacement = block_at(at(16, 45), 1, "a");
        let compacted = CompactedBlocks {
            source_blocks: BlockList {
                tenant: tenant("a"),
                shard: ShardId::new(1),
                blocks: vec![source.id],
            },
            new_blocks: vec![replacement.clone()],
        };

        let mut tx = fixture.begin().await;
        fixture
            .index
            .replace_blocks_unchecked(tx.as_mut(), &compacted)
            .await
            .unwrap();
        assert!(fixture
            .index
            .find_block(tx.as_mut(), ShardId::new(1), &tenant("a"), source.id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            fixture
                .index
                .find_block(tx.as_mut(), ShardId::new(1), &tenant("a"), replacement.id)
                .await
                .unwrap()
                .as_deref(),
            Some(&replacement)
        );
        tx.commit().await.unwrap();

        // the store still holds the source and knows nothing of the
        // replacement
        let reader = TestIndex::with_store(hourly(), Arc::clone(&fixture.store));
        let mut tx = reader.begin().await;
        reader.index.restore(tx.as_mut()).await.unwrap();
        assert!(reader
            .index
            .find_block(tx.as_mut(), ShardId::new(1), &tenant("a"), source.id)
            .await
            .unwrap()
            .is_some());
        assert!(reader
            .index
            .find_block(tx.as_mut(), ShardId::new(1), &tenant("a"), replacement.id)
            .await
            .unwrap()
            .is_none());
        tx.abort().await.unwrap();
    }

    #[tokio::test]
    async fn for_each_partition_visits_every_partition() {
        let fixture = TestIndex::new(hourly());
        let mut tx = fixture.begin().await;
        fixture.index.init(tx.as_mut()).await.unwrap();
        for hour in [10, 11, 12] {
            fixture
                .index
                .insert_block(tx.as_mut(), block_at(at(hour, 30), 1, "a"))
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();

        let token = CancellationToken::new();
        let visited = AtomicUsize::new(0);
        fixture
            .index
            .for_each_partition(&token, |meta| {
                assert!(meta.has_tenant(&tenant("a")));
                visited.fetch_add(1, Ordering::Relaxed);
                async { Ok(()) }.boxed()
            })
            .await
            .unwrap();
        assert_eq!(visited.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn for_each_partition_surfaces_the_first_error() {
        let fixture = TestIndex::new(hourly());
        let mut tx = fixture.begin().await;
        fixture.index.init(tx.as_mut()).await.unwrap();
        for hour in [10, 11] {
            fixture
                .index
                .insert_block(tx.as_mut(), block_at(at(hour, 30), 1, "a"))
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();

        let token = CancellationToken::new();
        let failing: PartitionKey = "20240923T11.1h".parse().unwrap();
        let result = fixture
            .index
            .for_each_partition(&token, move |meta| {
                let fail = meta.key() == failing;
                async move {
                    if fail {
                        Err(Error::store("partition scan failed"))
                    } else {
                        Ok(())
                    }
                }
                .boxed()
            })
            .await;
        assert_matches!(result, Err(Error::StoreFailure { .. }));
    }

    #[tokio::test]
    async fn for_each_partition_honors_cancellation() {
        let fixture = TestIndex::new(hourly());
        let mut tx = fixture.begin().await;
        fixture.index.init(tx.as_mut()).await.unwrap();
        fixture
            .index
            .insert_block(tx.as_mut(), block_at(at(10, 30), 1, "a"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let result = fixture
            .index
            .for_each_partition(&token, |_| {
                async {
                    futures::future::pending::<()>().await;
                    Ok(())
                }
                .boxed()
            })
            .await;
        assert_matches!(result, Err(Error::ScanCancelled));
    }

    #[derive(Debug)]
    struct StoreBlockFails(Box<dyn StoreTransaction>);

    #[async_trait]
    impl StoreTransaction for StoreBlockFails {
        async fn create_buckets(&mut self) -> Result<()> {
            self.0.create_buckets().await
        }

        async fn store_block(&mut self, _: &PartitionKey, _: &BlockMeta) -> Result<()> {
            Err(Error::store("disk full"))
        }

        async fn delete_block_list(
            &mut self,
            partition: &PartitionKey,
            list: &BlockList,
        ) -> Result<()> {
            self.0.delete_block_list(partition, list).await
        }

        async fn list_partitions(&mut self) -> Result<Vec<PartitionKey>> {
            self.0.list_partitions().await
        }

        async fn list_shards(&mut self, partition: &PartitionKey) -> Result<Vec<ShardId>> {
            self.0.list_shards(partition).await
        }

        async fn list_tenants(
            &mut self,
            partition: &PartitionKey,
            shard: ShardId,
        ) -> Result<Vec<TenantId>> {
            self.0.list_tenants(partition, shard).await
        }

        async fn list_blocks(
            &mut self,
            partition: &PartitionKey,
            shard: ShardId,
            tenant: &TenantId,
        ) -> Result<Vec<BlockMeta>> {
            self.0.list_blocks(partition, shard, tenant).await
        }

        async fn commit(self: Box<Self>) -> Result<()> {
            self.0.commit().await
        }

        async fn abort(self: Box<Self>) -> Result<()> {
            self.0.abort().await
        }
    }

    #[tokio::test]
    async fn store_errors_propagate_verbatim() {
        let fixture = TestIndex::new(hourly());
        let mut tx = StoreBlockFails(fixture.begin().await);

        let err = fixture
            .index
            .insert_block(&mut tx, block_at(at(16, 30), 1, "a"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::StoreFailure { .. });

        // the caller aborts; a restore reconciles the in-memory state
        Box::new(tx).abort().await.unwrap();
        let mut tx = fixture.begin().await;
        fixture.index.restore(tx.as_mut()).await.unwrap();
        assert!(fixture.index.partition_keys().await.is_empty());
        tx.abort().await.unwrap();
    }
}
