//! Time-partitioned block-metadata index for the FlareDB metastore.
//!
//! Blocks — immutable objects produced by ingesters and compactors — are
//! indexed by a three-axis coordinate: the time partition derived from the
//! creation timestamp in their id, their shard, and their tenant. The index
//! answers point and bulk lookups by id, range queries over the blocks'
//! payload time bounds, and executes compaction swaps, all against a
//! transaction the caller opens on the durable [`Store`].
//!
//! In-memory state is the full list of [`PartitionMeta`] plus a bounded,
//! per-tenant LRU cache of loaded `(partition, tenant)` entries read through
//! from the store on demand.
//!
//! [`PartitionMeta`]: data_types::PartitionMeta
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod cache;
mod index;
pub mod interface;
pub mod mem;

pub use index::{IndexConfig, PartitionIndex};
pub use interface::{Error, Result, Store, StoreTransaction};
