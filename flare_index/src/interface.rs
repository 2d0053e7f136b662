//! The contract the index consumes from its transactional substrate.

use async_trait::async_trait;
use data_types::{BlockId, BlockList, BlockMeta, PartitionKey, ShardId, TenantId};
use snafu::Snafu;
use std::fmt::Debug;

/// Opaque error produced by a store implementation.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[allow(missing_copy_implementations, missing_docs)]
pub enum Error {
    #[snafu(display(
        "block {} already exists in shard {} of tenant {:?}",
        id,
        shard,
        tenant.as_str()
    ))]
    BlockExists {
        id: BlockId,
        shard: ShardId,
        tenant: TenantId,
    },

    #[snafu(display("store failure: {}", source))]
    StoreFailure { source: BoxedError },

    #[snafu(display("partition scan cancelled"))]
    ScanCancelled,
}

impl Error {
    /// Wrap a substrate error for verbatim propagation.
    pub fn store(source: impl Into<BoxedError>) -> Self {
        Self::StoreFailure {
            source: source.into(),
        }
    }
}

/// A specialized `Error` for index and store operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A durable, transactional store of block metadata, keyed
/// `(partition, shard, tenant, block)`.
///
/// The substrate is single-writer: at most one transaction is live at a
/// time, and implementations enforce it. The index itself never opens
/// transactions; callers do, pass them into index operations, and decide
/// whether to commit or abort.
#[async_trait]
pub trait Store: Debug + Send + Sync {
    /// Open a transaction. Blocks until the previous writer is done.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// One open transaction on a [`Store`].
///
/// Mutations are invisible to later transactions until [`commit`] returns;
/// [`abort`] discards them. Listing operations return keys in ascending
/// order.
///
/// [`commit`]: StoreTransaction::commit
/// [`abort`]: StoreTransaction::abort
#[async_trait]
pub trait StoreTransaction: Debug + Send {
    /// Initialize the underlying namespaces. Idempotent.
    async fn create_buckets(&mut self) -> Result<()>;

    /// Persist one block under `(partition, block.shard, block.tenant_id)`.
    async fn store_block(&mut self, partition: &PartitionKey, block: &BlockMeta) -> Result<()>;

    /// Remove the listed block ids from `(partition, list.shard, list.tenant)`.
    async fn delete_block_list(
        &mut self,
        partition: &PartitionKey,
        list: &BlockList,
    ) -> Result<()>;

    /// All partition keys ever written.
    async fn list_partitions(&mut self) -> Result<Vec<PartitionKey>>;

    /// Shards present in a partition.
    async fn list_shards(&mut self, partition: &PartitionKey) -> Result<Vec<ShardId>>;

    /// Tenants present under `(partition, shard)`. The mixed tenant
    /// addresses mixed blocks.
    async fn list_tenants(
        &mut self,
        partition: &PartitionKey,
        shard: ShardId,
    ) -> Result<Vec<TenantId>>;

    /// All block metadata under `(partition, shard, tenant)`.
    async fn list_blocks(
        &mut self,
        partition: &PartitionKey,
        shard: ShardId,
        tenant: &TenantId,
    ) -> Result<Vec<BlockMeta>>;

    /// Make the transaction's mutations durable.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard the transaction's mutations.
    async fn abort(self: Box<Self>) -> Result<()>;
}
