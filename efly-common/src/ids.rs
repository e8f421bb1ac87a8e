//! Canonical identifier types used across dispatch, engine, and transaction layers.

/// Numeric shard identifier inside a single process.
pub type ShardId = u16;

/// Logical database index (Redis `SELECT` compatible model).
pub type DbIndex = u16;

/// Monotonic transaction identifier allocated per shard set.
pub type TxId = u64;

/// Strongly typed shard-count wrapper to avoid passing raw integers around runtime APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardCount(u16);

impl ShardCount {
    /// Creates a validated shard-count value.
    ///
    /// Returns `None` for zero because the runtime always requires at least one owning shard.
    #[must_use]
    pub fn new(value: u16) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Returns the inner count.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Shard count derived from a worker-thread count.
    ///
    /// One thread is reserved for non-shard work when more than one thread exists, matching the
    /// `max(1, threads - 1)` rule used at service init.
    #[must_use]
    pub fn from_thread_count(threads: u16) -> Option<Self> {
        if threads == 0 {
            return None;
        }
        let shards = if threads > 1 { threads - 1 } else { threads };
        Self::new(shards)
    }
}
