//! Shard-local keyspace state and its locking surface.

use std::time::{SystemTime, UNIX_EPOCH};

use efly_common::ids::{DbIndex, ShardId};

use crate::containers::HotMap;
use crate::lock::{IntentLock, IntentMode};

/// One stored string value with metadata recorded at store time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringValue {
    /// Value payload.
    pub data: Vec<u8>,
    /// Memcached flag echoed on `VALUE` replies.
    pub mc_flag: u32,
    /// Absolute expiry deadline in unix milliseconds.
    pub expire_at_ms: Option<u64>,
}

impl StringValue {
    fn plain(data: Vec<u8>) -> Self {
        Self {
            data,
            mc_flag: 0,
            expire_at_ms: None,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// Options applied by a `SET`-style store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Only store when the key is missing.
    pub if_missing: bool,
    /// Only store when the key exists.
    pub if_exists: bool,
    /// Relative expiry in milliseconds.
    pub expire_ms: Option<u64>,
    /// Memcached flag to record with the value.
    pub mc_flag: u32,
}

/// Per-database string table.
#[derive(Debug, Default)]
pub struct DbSlice {
    entries: HotMap<Vec<u8>, StringValue>,
}

impl DbSlice {
    fn prune_expired(&mut self, key: &[u8]) {
        let expired = self
            .entries
            .get(key)
            .and_then(|value| value.expire_at_ms)
            .is_some_and(|deadline| deadline <= now_ms());
        if expired {
            let _ = self.entries.remove(key);
        }
    }

    /// Returns a live value for `key`.
    pub fn get(&mut self, key: &[u8]) -> Option<&StringValue> {
        self.prune_expired(key);
        self.entries.get(key)
    }

    /// Applies one conditional store; returns whether the value was written.
    pub fn set(&mut self, key: &[u8], data: Vec<u8>, options: SetOptions) -> bool {
        self.prune_expired(key);
        let exists = self.entries.contains_key(key);
        if (options.if_missing && exists) || (options.if_exists && !exists) {
            return false;
        }
        let value = StringValue {
            data,
            mc_flag: options.mc_flag,
            expire_at_ms: options.expire_ms.map(|ttl| now_ms().saturating_add(ttl)),
        };
        let _ = self.entries.insert(key.to_vec(), value);
        true
    }

    /// Removes `key`; returns whether a live value was removed.
    pub fn del(&mut self, key: &[u8]) -> bool {
        self.prune_expired(key);
        self.entries.remove(key).is_some()
    }

    /// Returns whether `key` holds a live value.
    pub fn exists(&mut self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Appends (or prepends) `suffix` to the value under `key`, creating it when missing.
    ///
    /// Returns the resulting value length.
    pub fn concat(&mut self, key: &[u8], payload: &[u8], prepend: bool) -> usize {
        self.prune_expired(key);
        let value = self
            .entries
            .entry(key.to_vec())
            .or_insert_with(|| StringValue::plain(Vec::new()));
        if prepend {
            let mut combined = payload.to_vec();
            combined.extend_from_slice(&value.data);
            value.data = combined;
        } else {
            value.data.extend_from_slice(payload);
        }
        value.data.len()
    }

    /// Adds `delta` to the integer value under `key`, creating it at zero when missing.
    ///
    /// # Errors
    ///
    /// Returns the Redis integer-domain error text when the stored value is not an integer or
    /// the addition overflows.
    pub fn incr_by(&mut self, key: &[u8], delta: i64) -> Result<i64, &'static str> {
        const INVALID_INT: &str = "value is not an integer or out of range";
        self.prune_expired(key);
        let current = match self.entries.get(key) {
            Some(value) => std::str::from_utf8(&value.data)
                .ok()
                .and_then(|text| text.parse::<i64>().ok())
                .ok_or(INVALID_INT)?,
            None => 0,
        };
        let next = current.checked_add(delta).ok_or(INVALID_INT)?;
        let entry = self
            .entries
            .entry(key.to_vec())
            .or_insert_with(|| StringValue::plain(Vec::new()));
        entry.data = next.to_string().into_bytes();
        Ok(next)
    }

    /// Number of live keys, pruning nothing.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the table holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One shard executor's private state: keyspace tables plus the intent-lock surface used by the
/// transaction layer.
#[derive(Debug)]
pub struct EngineShard {
    shard_id: ShardId,
    db_tables: HotMap<DbIndex, DbSlice>,
    key_locks: HotMap<(DbIndex, Vec<u8>), IntentLock>,
    shard_lock: IntentLock,
}

impl EngineShard {
    /// Creates empty shard state.
    #[must_use]
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            db_tables: HotMap::new(),
            key_locks: HotMap::new(),
            shard_lock: IntentLock::default(),
        }
    }

    /// This shard's id.
    #[must_use]
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Mutable access to the string table of `db`, creating it on first touch.
    pub fn db_slice(&mut self, db: DbIndex) -> &mut DbSlice {
        self.db_tables.entry(db).or_default()
    }

    /// Drops all keyspace tables and lock state (service teardown).
    pub fn reset(&mut self) {
        self.db_tables.clear();
        self.key_locks.clear();
        self.shard_lock = IntentLock::default();
    }

    /// Attempts to take a key intent lock; returns whether it was acquired.
    pub fn try_lock_key(&mut self, db: DbIndex, key: &[u8], mode: IntentMode) -> bool {
        self.key_locks
            .entry((db, key.to_vec()))
            .or_default()
            .try_acquire(mode)
    }

    /// Releases one key intent lock holder, dropping empty lock records.
    pub fn unlock_key(&mut self, db: DbIndex, key: &[u8], mode: IntentMode) {
        let id = (db, key.to_vec());
        if let Some(lock) = self.key_locks.get_mut(&id) {
            lock.release(mode);
            if lock.is_free() {
                let _ = self.key_locks.remove(&id);
            }
        }
    }

    /// Returns whether `mode` could be acquired on `key` right now.
    #[must_use]
    pub fn check_key_lock(&self, db: DbIndex, key: &[u8], mode: IntentMode) -> bool {
        self.key_locks
            .get(&(db, key.to_vec()))
            .is_none_or(|lock| lock.can_acquire(mode))
    }

    /// Attempts to take the shard-wide intent lock.
    pub fn try_lock_shard(&mut self, mode: IntentMode) -> bool {
        self.shard_lock.try_acquire(mode)
    }

    /// Releases one shard-wide intent holder.
    pub fn unlock_shard(&mut self, mode: IntentMode) {
        self.shard_lock.release(mode);
    }

    /// Returns whether `mode` could be acquired shard-wide right now.
    #[must_use]
    pub fn check_shard_lock(&self, mode: IntentMode) -> bool {
        self.shard_lock.can_acquire(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineShard, SetOptions};
    use crate::lock::IntentMode;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn db_slice_applies_conditional_stores() {
        let mut shard = EngineShard::new(0);
        let slice = shard.db_slice(0);

        let nx = SetOptions {
            if_missing: true,
            ..SetOptions::default()
        };
        assert_that!(slice.set(b"k", b"1".to_vec(), nx), eq(true));
        assert_that!(slice.set(b"k", b"2".to_vec(), nx), eq(false));

        let xx = SetOptions {
            if_exists: true,
            ..SetOptions::default()
        };
        assert_that!(slice.set(b"k", b"3".to_vec(), xx), eq(true));
        assert_that!(
            slice.get(b"k").map(|value| value.data.clone()),
            some(eq(&b"3".to_vec()))
        );
        assert_that!(slice.set(b"missing", b"x".to_vec(), xx), eq(false));
    }

    #[rstest]
    fn db_slice_incr_rejects_non_integer_values() {
        let mut shard = EngineShard::new(0);
        let slice = shard.db_slice(0);
        assert_that!(slice.set(b"k", b"abc".to_vec(), SetOptions::default()), eq(true));
        assert_that!(slice.incr_by(b"k", 1).is_err(), eq(true));

        assert_that!(slice.incr_by(b"counter", 5), ok(eq(5)));
        assert_that!(slice.incr_by(b"counter", -2), ok(eq(3)));
    }

    #[rstest]
    fn db_slice_concat_supports_both_ends() {
        let mut shard = EngineShard::new(0);
        let slice = shard.db_slice(0);
        assert_that!(slice.concat(b"k", b"mid", false), eq(3_usize));
        assert_that!(slice.concat(b"k", b"pre-", true), eq(7_usize));
        assert_that!(slice.concat(b"k", b"-post", false), eq(12_usize));
        assert_that!(
            slice.get(b"k").map(|value| value.data.clone()),
            some(eq(&b"pre-mid-post".to_vec()))
        );
    }

    #[rstest]
    fn key_locks_are_dropped_when_released() {
        let mut shard = EngineShard::new(0);
        assert_that!(shard.try_lock_key(0, b"k", IntentMode::Exclusive), eq(true));
        assert_that!(shard.check_key_lock(0, b"k", IntentMode::Shared), eq(false));

        shard.unlock_key(0, b"k", IntentMode::Exclusive);
        assert_that!(shard.check_key_lock(0, b"k", IntentMode::Exclusive), eq(true));
    }
}
