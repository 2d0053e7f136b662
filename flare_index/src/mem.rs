//! In-memory reference implementation of the [`Store`] contract.

use crate::interface::{Result, Store, StoreTransaction};
use async_trait::async_trait;
use data_types::{BlockId, BlockList, BlockMeta, PartitionKey, ShardId, TenantId};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::{Mutex, OwnedMutexGuard};

type Blocks = BTreeMap<BlockId, BlockMeta>;
type Tenants = BTreeMap<TenantId, Blocks>;
type Shards = BTreeMap<ShardId, Tenants>;

#[derive(Debug, Default, Clone)]
struct MemCollections {
    partitions: BTreeMap<PartitionKey, Shards>,
}

/// An in-memory [`Store`].
///
/// Transactions clone the collections on [`begin`] and write them back on
/// commit, so an aborted transaction leaves no trace. Each transaction holds
/// the owned collection guard for its whole lifetime, which serializes
/// writers the way the durable single-writer substrate does.
///
/// [`begin`]: Store::begin
#[derive(Debug, Default)]
pub struct MemStore {
    collections: Arc<Mutex<MemCollections>>,
}

impl MemStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let guard = Arc::clone(&self.collections).lock_owned().await;
        let stage = guard.clone();
        Ok(Box::new(MemTxn { guard, stage }))
    }
}

#[derive(Debug)]
struct MemTxn {
    guard: OwnedMutexGuard<MemCollections>,
    stage: MemCollections,
}

#[async_trait]
impl StoreTransaction for MemTxn {
    async fn create_buckets(&mut self) -> Result<()> {
        // namespaces are implicit in the map representation
        Ok(())
    }

    async fn store_block(&mut self, partition: &PartitionKey, block: &BlockMeta) -> Result<()> {
        self.stage
            .partitions
            .entry(*partition)
            .or_default()
            .entry(block.shard)
            .or_default()
            .entry(block.tenant_id.clone())
            .or_default()
            .insert(block.id, block.clone());
        Ok(())
    }

    async fn delete_block_list(
        &mut self,
        partition: &PartitionKey,
        list: &BlockList,
    ) -> Result<()> {
        if let Some(shards) = self.stage.partitions.get_mut(partition) {
            if let Some(tenants) = shards.get_mut(&list.shard) {
                if let Some(blocks) = tenants.get_mut(&list.tenant) {
                    for id in &list.blocks {
                        blocks.remove(id);
                    }
                    // listings must not report dead coordinates
                    if blocks.is_empty() {
                        tenants.remove(&list.tenant);
                    }
                }
                if tenants.is_empty() {
                    shards.remove(&list.shard);
                }
            }
        }
        Ok(())
    }

    async fn list_partitions(&mut self) -> Result<Vec<PartitionKey>> {
        Ok(self.stage.partitions.keys().copied().collect())
    }

    async fn list_shards(&mut self, partition: &PartitionKey) -> Result<Vec<ShardId>> {
        Ok(self
            .stage
            .partitions
            .get(partition)
            .map(|shards| shards.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn list_tenants(
        &mut self,
        partition: &PartitionKey,
        shard: ShardId,
    ) -> Result<Vec<TenantId>> {
        Ok(self
            .stage
            .partitions
            .get(partition)
            .and_then(|shards| shards.get(&shard))
            .map(|tenants| tenants.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_blocks(
        &mut self,
        partition: &PartitionKey,
        shard: ShardId,
        tenant: &TenantId,
    ) -> Result<Vec<BlockMeta>> {
        Ok(self
            .stage
            .partitions
            .get(partition)
            .and_then(|shards| shards.get(&shard))
            .and_then(|tenants| tenants.get(tenant))
            .map(|blocks| blocks.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self { mut guard, stage } = *self;
        *guard = stage;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        // dropping the stage and the guard is all there is to it
        Ok(())
    }
}
