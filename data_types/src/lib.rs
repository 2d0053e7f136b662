//! Shared data types for the FlareDB block metastore.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{NaiveDate, TimeZone, Utc};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::{
    collections::BTreeSet,
    fmt,
    ops::{Add, Sub},
    str::FromStr,
    time::Duration,
};
use ulid::Ulid;

#[derive(Debug, Snafu)]
#[allow(missing_copy_implementations, missing_docs)]
pub enum Error {
    #[snafu(display("invalid block id {:?}: {}", text, source))]
    InvalidBlockId {
        text: String,
        source: ulid::DecodeError,
    },

    #[snafu(display("invalid partition key {:?}", text))]
    InvalidPartitionKey { text: String },
}

/// A specialized `Error` for errors parsing the textual forms of ids and keys
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Unique identifier of an immutable block of profile data.
///
/// Block ids are ULIDs: lexicographically sortable, with the creation
/// timestamp (milliseconds since epoch) embedded in the most significant
/// bits. The textual form is the canonical 26-character Crockford base32
/// rendering, so string order agrees with id order. A parsed `BlockId` is
/// well formed by construction; malformed text is rejected at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(Ulid);

impl BlockId {
    /// Mint a fresh id stamped with the current wall clock.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Build an id from an explicit creation timestamp and random payload.
    ///
    /// Used by replay tooling and tests that need deterministic ids.
    pub fn from_parts(timestamp_millis: u64, random: u128) -> Self {
        Self(Ulid::from_parts(timestamp_millis, random))
    }

    /// The creation timestamp embedded in this id.
    pub fn created_at(&self) -> Timestamp {
        Timestamp::new(self.0.timestamp_ms() as i64)
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BlockId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let ulid = Ulid::from_string(s).context(InvalidBlockIdSnafu { text: s })?;
        Ok(Self(ulid))
    }
}

/// Horizontal-partitioning key of the ingest path; opaque to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId(u32);

impl ShardId {
    /// Wrap a raw shard number.
    pub const fn new(shard: u32) -> Self {
        Self(shard)
    }

    /// The raw shard number.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tenant isolation boundary.
///
/// The empty tenant addresses *mixed* blocks: blocks carrying data of several
/// tenants, enumerated by their [`Dataset`] entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TenantId(String);

impl TenantId {
    /// Wrap a tenant name.
    pub fn new(tenant: impl Into<String>) -> Self {
        Self(tenant.into())
    }

    /// The tenant under which mixed blocks are stored.
    pub fn mixed() -> Self {
        Self(String::new())
    }

    /// Whether this is the mixed-block tenant.
    pub fn is_mixed(&self) -> bool {
        self.0.is_empty()
    }

    /// The tenant name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TenantId {
    fn from(tenant: &str) -> Self {
        Self(tenant.to_owned())
    }
}

impl From<String> for TenantId {
    fn from(tenant: String) -> Self {
        Self(tenant)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Wrap a raw millisecond timestamp.
    pub const fn new(millis: i64) -> Self {
        Self(millis)
    }

    /// The raw millisecond timestamp.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl Add<Duration> for Timestamp {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + rhs.as_millis() as i64)
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0 - rhs.as_millis() as i64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-tenant slice of a mixed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    /// Tenant owning this slice.
    pub tenant_id: TenantId,
}

/// Metadata of one immutable block produced by an ingester or compactor.
///
/// `min_time`/`max_time` bound the *payload* of the block, which is not the
/// same axis as the creation timestamp embedded in `id`: a block created at
/// 17:05 may well carry samples from 16:55. The index partitions by creation
/// time and filters range queries by payload time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    /// Unique block identifier; encodes the creation timestamp.
    pub id: BlockId,
    /// Shard that produced the block.
    pub shard: ShardId,
    /// Owning tenant; mixed when empty.
    pub tenant_id: TenantId,
    /// Inclusive lower payload time bound, milliseconds.
    pub min_time: Timestamp,
    /// Upper payload time bound, milliseconds. Treated as exclusive by range
    /// queries.
    pub max_time: Timestamp,
    /// Per-tenant datasets of a mixed block; empty for single-tenant blocks.
    pub datasets: Vec<Dataset>,
}

impl BlockMeta {
    /// Whether the block payload intersects the query window `[start, end]`.
    pub fn intersects(&self, start: Timestamp, end: Timestamp) -> bool {
        start < self.max_time && end >= self.min_time
    }
}

/// A uniform `(shard, tenant)` list of block ids.
///
/// All listed blocks live under the same shard and tenant; callers composing
/// a list across shards or tenants must issue one list per coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockList {
    /// Tenant the blocks belong to; mixed when empty.
    pub tenant: TenantId,
    /// Shard the blocks belong to.
    pub shard: ShardId,
    /// The block ids.
    pub blocks: Vec<BlockId>,
}

/// A compaction result: the blocks to insert and the source blocks they
/// replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactedBlocks {
    /// Blocks superseded by the compaction, removed atomically.
    pub source_blocks: BlockList,
    /// Replacement blocks, inserted atomically.
    pub new_blocks: Vec<BlockMeta>,
}

/// Identifier of one time partition: a fixed-width creation-time bucket.
///
/// The textual form is `YYYYMMDDThh.<duration>`, e.g. `20240923T16.1h`. It is
/// stable (other systems read it from the store) and chosen so lexicographic
/// order agrees with `(timestamp, duration)` order while durations are held
/// constant. The hour-resolution prefix implies bucket starts fall on whole
/// hours; see [`PartitionKey::for_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    timestamp: Timestamp,
    duration: Duration,
}

impl PartitionKey {
    /// Build a key from an explicit bucket start and width.
    pub fn new(timestamp: Timestamp, duration: Duration) -> Self {
        Self {
            timestamp,
            duration,
        }
    }

    /// The partition a block belongs to under the given partition duration:
    /// the block's creation timestamp floored to a duration multiple.
    ///
    /// `duration` must be non-zero and, for the textual form to round-trip,
    /// a whole number of hours.
    pub fn for_block(id: BlockId, duration: Duration) -> Self {
        let len = duration.as_millis() as i64;
        let ts = id.created_at().get();
        Self {
            timestamp: Timestamp::new(ts - ts.rem_euclid(len)),
            duration,
        }
    }

    /// Inclusive bucket start.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Bucket width.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Exclusive bucket end.
    pub fn end_timestamp(&self) -> Timestamp {
        self.timestamp + self.duration
    }

    /// Whether `ts` falls inside the bucket: `start <= ts < end`.
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.timestamp <= ts && ts < self.end_timestamp()
    }

    /// Whether the bucket intersects `[start, end)`.
    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        self.timestamp < end && self.end_timestamp() > start
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dt = Utc
            .timestamp_millis_opt(self.timestamp.get())
            .single()
            .expect("partition timestamp in range");
        write!(f, "{}.", dt.format("%Y%m%dT%H"))?;

        let secs = self.duration.as_secs();
        if secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{}s", secs)
        }
    }
}

impl FromStr for PartitionKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || InvalidPartitionKeySnafu { text: s };

        let (bucket, duration) = s.split_once('.').context(invalid())?;

        // `YYYYMMDDThh`
        ensure!(bucket.len() == 11 && bucket.as_bytes()[8] == b'T', invalid());
        let date = NaiveDate::parse_from_str(&bucket[..8], "%Y%m%d")
            .ok()
            .context(invalid())?;
        let hour: u32 = bucket[9..].parse().ok().context(invalid())?;
        let start = date.and_hms_opt(hour, 0, 0).context(invalid())?;

        let unit = duration.chars().last().context(invalid())?;
        let value: u64 = duration[..duration.len() - unit.len_utf8()]
            .parse()
            .ok()
            .context(invalid())?;
        let duration = match unit {
            'h' => Duration::from_secs(value * 3600),
            'm' => Duration::from_secs(value * 60),
            's' => Duration::from_secs(value),
            _ => return invalid().fail(),
        };

        Ok(Self {
            timestamp: Timestamp::new(Utc.from_utc_datetime(&start).timestamp_millis()),
            duration,
        })
    }
}

/// Summary of one partition: its key and every tenant that has ever
/// contributed a block to it.
///
/// For mixed blocks the contributing tenants are the dataset tenants; the
/// mixed tenant itself is never a member of the set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMeta {
    key: PartitionKey,
    tenants: BTreeSet<TenantId>,
}

impl PartitionMeta {
    /// A partition with no tenants recorded yet.
    pub fn new(key: PartitionKey) -> Self {
        Self {
            key,
            tenants: BTreeSet::new(),
        }
    }

    /// The partition key.
    pub fn key(&self) -> PartitionKey {
        self.key
    }

    /// Record a tenant; idempotent. Returns whether it was new.
    pub fn add_tenant(&mut self, tenant: TenantId) -> bool {
        self.tenants.insert(tenant)
    }

    /// Whether the tenant has contributed to this partition.
    pub fn has_tenant(&self, tenant: &TenantId) -> bool {
        self.tenants.contains(tenant)
    }

    /// The recorded tenants, in sorted order.
    pub fn tenants(&self) -> impl Iterator<Item = &TenantId> + '_ {
        self.tenants.iter()
    }

    /// Record the tenant(s) a block contributes: its own tenant, or every
    /// dataset tenant for a mixed block.
    pub fn register_block(&mut self, block: &BlockMeta) {
        if block.tenant_id.is_mixed() {
            for dataset in &block.datasets {
                self.add_tenant(dataset.tenant_id.clone());
            }
        } else {
            self.add_tenant(block.tenant_id.clone());
        }
    }

    /// Whether `ts` falls inside this partition.
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.key.contains(ts)
    }

    /// Whether this partition intersects `[start, end)`.
    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        self.key.overlaps(start, end)
    }
}
