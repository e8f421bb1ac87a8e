//! Process-wide handle over the shard executor set.

use std::sync::atomic::{AtomicU64, Ordering};

use efly_common::error::EflyResult;
use efly_common::ids::{ShardCount, ShardId, TxId};

use crate::pool::ShardPool;
use crate::shard::EngineShard;
use crate::sharding::KeyRouter;

/// Shard executor set: the pool plus key routing and the transaction id sequence.
#[derive(Debug)]
pub struct ShardSet {
    pool: ShardPool,
    router: KeyRouter,
    next_txid: AtomicU64,
}

impl ShardSet {
    /// Spawns the executor set for `shard_count` shards.
    #[must_use]
    pub fn new(shard_count: ShardCount) -> Self {
        Self {
            pool: ShardPool::new(shard_count),
            router: KeyRouter::new(shard_count),
            next_txid: AtomicU64::new(1),
        }
    }

    /// Number of shards in the set.
    #[must_use]
    pub fn size(&self) -> u16 {
        self.pool.shard_count().get()
    }

    /// Owner shard for `key`.
    #[must_use]
    pub fn shard_for_key(&self, key: &[u8]) -> ShardId {
        self.router.shard_for_key(key)
    }

    /// Allocates the next monotonic transaction id.
    #[must_use]
    pub fn next_txid(&self) -> TxId {
        self.next_txid.fetch_add(1, Ordering::AcqRel)
    }

    /// Runs `job` on the owning shard's thread and waits for its result.
    ///
    /// # Errors
    ///
    /// Propagates executor-unavailable errors from the pool.
    pub fn await_on_shard<R>(
        &self,
        shard: ShardId,
        job: impl FnOnce(&mut EngineShard) -> R + Send + 'static,
    ) -> EflyResult<R>
    where
        R: Send + 'static,
    {
        self.pool.await_on_shard(shard, job)
    }

    /// Fans `job` out to every shard and joins the results in shard order.
    ///
    /// # Errors
    ///
    /// Propagates executor-unavailable errors from the pool.
    pub fn run_brief_in_parallel<R>(
        &self,
        job: impl Fn(&mut EngineShard) -> R + Send + Sync + Clone + 'static,
    ) -> EflyResult<Vec<R>>
    where
        R: Send + 'static,
    {
        self.pool.run_brief_in_parallel(job)
    }
}

#[cfg(test)]
mod tests {
    use super::ShardSet;
    use efly_common::ids::ShardCount;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn txid_sequence_is_monotonic() {
        let set = ShardSet::new(ShardCount::new(1).expect("literal is valid"));
        let first = set.next_txid();
        let second = set.next_txid();
        assert_that!(second > first, eq(true));
    }

    #[rstest]
    fn shard_routing_stays_in_range() {
        let set = ShardSet::new(ShardCount::new(4).expect("literal is valid"));
        for key in [&b"a"[..], b"b", b"longer-key", b"x:y"] {
            assert_that!(set.shard_for_key(key) < set.size(), eq(true));
        }
    }
}
