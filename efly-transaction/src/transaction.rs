//! The transaction envelope.
//!
//! An envelope binds one logical command (or a whole `EXEC` body / script scope) to the shard
//! set. Locks are acquired per shard in ascending shard-id order, which is the process-wide
//! deadlock-avoidance order.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use efly_common::error::EflyResult;
use efly_common::ids::{DbIndex, ShardId, TxId};
use efly_engine::ShardSet;
use efly_engine::lock::IntentMode;
use efly_engine::shard::EngineShard;
use parking_lot::Mutex;

use crate::keys::{KeySpec, determine_keys};

const LOCK_RETRY_BACKOFF: Duration = Duration::from_micros(100);

/// Descriptor metadata a transaction needs from the command table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdBinding {
    /// Canonical uppercase command name, kept for debug output.
    pub name: &'static str,
    /// Key position layout.
    pub key_spec: KeySpec,
    /// Whether the command requires a global (all-shard) barrier.
    pub is_global: bool,
    /// Whether the command writes; selects exclusive versus shared intent.
    pub is_write: bool,
}

#[derive(Debug)]
enum HeldLock {
    Key {
        shard: ShardId,
        db: DbIndex,
        key: Vec<u8>,
        mode: IntentMode,
    },
    Shard {
        shard: ShardId,
        mode: IntentMode,
    },
}

#[derive(Debug, Default)]
struct TxState {
    db: DbIndex,
    keys: Vec<Vec<u8>>,
    unique_shards: Vec<ShardId>,
    held: Vec<HeldLock>,
    /// True while locks outlive individual dispatches (EXEC body, script scope).
    multi_scope: bool,
    /// True while a global barrier holds every shard; per-command lock acquisition is skipped.
    global_scope: bool,
    ooo: bool,
}

/// Transaction envelope bound to a command and argument vector.
pub struct Transaction {
    txid: TxId,
    shard_set: Arc<ShardSet>,
    binding: Mutex<CmdBinding>,
    state: Mutex<TxState>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("txid", &self.txid)
            .field("binding", &*self.binding.lock())
            .finish()
    }
}

impl Transaction {
    /// Creates an envelope for `binding`, allocating the next transaction id.
    #[must_use]
    pub fn new(binding: CmdBinding, shard_set: Arc<ShardSet>) -> Self {
        let txid = shard_set.next_txid();
        Self {
            txid,
            shard_set,
            binding: Mutex::new(binding),
            state: Mutex::new(TxState {
                ooo: true,
                ..TxState::default()
            }),
        }
    }

    /// This envelope's transaction id.
    #[must_use]
    pub fn txid(&self) -> TxId {
        self.txid
    }

    /// Whether every lock so far was acquired without waiting.
    #[must_use]
    pub fn is_ooo(&self) -> bool {
        self.state.lock().ooo
    }

    /// Number of distinct shards referenced by the current key set.
    #[must_use]
    pub fn unique_shard_count(&self) -> usize {
        self.state.lock().unique_shards.len()
    }

    /// Rebinds the envelope to another command descriptor (used inside `EXEC` and scripts).
    pub fn set_exec_cmd(&self, binding: CmdBinding) {
        *self.binding.lock() = binding;
    }

    /// Recomputes the key set and participating shards from an argument vector.
    pub fn init_by_args(&self, db: DbIndex, args: &[Vec<u8>]) {
        let binding = self.binding.lock().clone();
        let mut state = self.state.lock();
        state.db = db;
        state.keys = determine_keys(binding.name, &binding.key_spec, args);

        if binding.is_global {
            state.unique_shards = (0..self.shard_set.size()).collect();
        } else {
            let mut shards = state
                .keys
                .iter()
                .map(|key| self.shard_set.shard_for_key(key))
                .collect::<Vec<_>>();
            shards.sort_unstable();
            shards.dedup();
            state.unique_shards = shards;
        }
    }

    /// Acquires intent locks for the current key set (or the whole shard set for a global
    /// binding) and keeps them until [`Transaction::unlock_multi`].
    ///
    /// May suspend while contended locks drain.
    ///
    /// # Errors
    ///
    /// Propagates shard-executor errors.
    pub fn schedule(&self) -> EflyResult<()> {
        self.acquire_current_locks()?;
        let is_global = self.binding.lock().is_global;
        let mut state = self.state.lock();
        state.multi_scope = true;
        if is_global {
            state.global_scope = true;
        }
        Ok(())
    }

    /// Releases every lock acquired over the envelope's lifetime.
    ///
    /// # Errors
    ///
    /// Propagates shard-executor errors.
    pub fn unlock_multi(&self) -> EflyResult<()> {
        let held = {
            let mut state = self.state.lock();
            state.multi_scope = false;
            state.global_scope = false;
            std::mem::take(&mut state.held)
        };
        for lock in held.into_iter().rev() {
            match lock {
                HeldLock::Key {
                    shard,
                    db,
                    key,
                    mode,
                } => {
                    self.shard_set
                        .await_on_shard(shard, move |state| state.unlock_key(db, &key, mode))?;
                }
                HeldLock::Shard { shard, mode } => {
                    self.shard_set
                        .await_on_shard(shard, move |state| state.unlock_shard(mode))?;
                }
            }
        }
        Ok(())
    }

    /// Runs `job` on every participating shard in ascending shard order, handing it the shard's
    /// key subset, and collects the results.
    ///
    /// Outside a multi scope the hop acquires its locks up front and releases them before
    /// returning; inside one (script or `EXEC` body) locks accumulate until `unlock_multi`.
    ///
    /// # Errors
    ///
    /// Propagates shard-executor errors.
    pub fn run_on_shards<R>(
        &self,
        job: impl Fn(&mut EngineShard, DbIndex, Vec<Vec<u8>>) -> R + Send + Clone + 'static,
    ) -> EflyResult<Vec<R>>
    where
        R: Send + 'static,
    {
        let was_multi_scope = self.state.lock().multi_scope;
        self.acquire_current_locks()?;

        let (db, shards) = {
            let state = self.state.lock();
            (state.db, state.unique_shards.clone())
        };

        let mut results = Vec::with_capacity(shards.len());
        for shard in shards {
            let keys = self.keys_on_shard(shard);
            let job = job.clone();
            let result = self
                .shard_set
                .await_on_shard(shard, move |state| job(state, db, keys))?;
            results.push(result);
        }

        if !was_multi_scope {
            self.unlock_multi()?;
        }
        Ok(results)
    }

    fn keys_on_shard(&self, shard: ShardId) -> Vec<Vec<u8>> {
        let state = self.state.lock();
        state
            .keys
            .iter()
            .filter(|key| self.shard_set.shard_for_key(key) == shard)
            .cloned()
            .collect()
    }

    fn lock_mode(&self) -> IntentMode {
        if self.binding.lock().is_write {
            IntentMode::Exclusive
        } else {
            IntentMode::Shared
        }
    }

    fn acquire_current_locks(&self) -> EflyResult<()> {
        // Under a global barrier every shard is already reserved.
        if self.state.lock().global_scope {
            return Ok(());
        }
        let binding = self.binding.lock().clone();
        let mode = self.lock_mode();
        let (db, shards, keys) = {
            let state = self.state.lock();
            (
                state.db,
                state.unique_shards.clone(),
                state.keys.clone(),
            )
        };

        if binding.is_global {
            for shard in shards {
                if !self.already_holds_shard(shard) {
                    self.acquire_shard_lock(shard, IntentMode::Exclusive)?;
                }
            }
            return Ok(());
        }

        for shard in shards {
            if !self.already_holds_shard(shard) {
                self.acquire_shard_lock(shard, IntentMode::Shared)?;
            }
            for key in keys
                .iter()
                .filter(|key| self.shard_set.shard_for_key(key) == shard)
            {
                if self.already_holds_key(shard, db, key) {
                    continue;
                }
                self.acquire_key_lock(shard, db, key.clone(), mode)?;
            }
        }
        Ok(())
    }

    fn already_holds_key(&self, shard: ShardId, db: DbIndex, key: &[u8]) -> bool {
        self.state.lock().held.iter().any(|held| {
            matches!(held, HeldLock::Key { shard: held_shard, db: held_db, key: held_key, .. }
                if *held_shard == shard && *held_db == db && held_key == key)
        })
    }

    fn already_holds_shard(&self, shard: ShardId) -> bool {
        self.state.lock().held.iter().any(|held| {
            matches!(held, HeldLock::Shard { shard: held_shard, .. } if *held_shard == shard)
        })
    }

    fn acquire_key_lock(
        &self,
        shard: ShardId,
        db: DbIndex,
        key: Vec<u8>,
        mode: IntentMode,
    ) -> EflyResult<()> {
        let mut first_attempt = true;
        loop {
            let attempt_key = key.clone();
            let acquired = self
                .shard_set
                .await_on_shard(shard, move |state| state.try_lock_key(db, &attempt_key, mode))?;
            if acquired {
                let mut state = self.state.lock();
                if !first_attempt {
                    state.ooo = false;
                }
                state.held.push(HeldLock::Key {
                    shard,
                    db,
                    key,
                    mode,
                });
                return Ok(());
            }
            first_attempt = false;
            thread::sleep(LOCK_RETRY_BACKOFF);
        }
    }

    fn acquire_shard_lock(&self, shard: ShardId, mode: IntentMode) -> EflyResult<()> {
        let mut first_attempt = true;
        loop {
            let acquired = self
                .shard_set
                .await_on_shard(shard, move |state| state.try_lock_shard(mode))?;
            if acquired {
                let mut state = self.state.lock();
                if !first_attempt {
                    state.ooo = false;
                }
                state.held.push(HeldLock::Shard { shard, mode });
                return Ok(());
            }
            first_attempt = false;
            thread::sleep(LOCK_RETRY_BACKOFF);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // Error paths may abandon an envelope with live locks.
        if !self.state.lock().held.is_empty() {
            let _ = self.unlock_multi();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CmdBinding, Transaction};
    use crate::keys::KeySpec;
    use efly_common::ids::ShardCount;
    use efly_engine::ShardSet;
    use efly_engine::lock::IntentMode;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;

    fn shard_set() -> Arc<ShardSet> {
        Arc::new(ShardSet::new(
            ShardCount::new(2).expect("literal is valid"),
        ))
    }

    fn write_binding(name: &'static str, spec: KeySpec) -> CmdBinding {
        CmdBinding {
            name,
            key_spec: spec,
            is_global: false,
            is_write: true,
        }
    }

    fn args(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|part| part.as_bytes().to_vec()).collect()
    }

    #[rstest]
    fn init_by_args_groups_keys_into_unique_shards() {
        let shards = shard_set();
        let tx = Transaction::new(
            write_binding("MSET", KeySpec::new(1, -1, 2)),
            Arc::clone(&shards),
        );
        tx.init_by_args(0, &args(&["MSET", "a", "1", "b", "2", "a", "3"]));
        assert_that!(tx.unique_shard_count() <= 2, eq(true));
        assert_that!(tx.unique_shard_count() >= 1, eq(true));
    }

    #[rstest]
    fn schedule_holds_key_locks_until_unlock_multi() {
        let shards = shard_set();
        let tx = Transaction::new(
            write_binding("EVAL", KeySpec::new(1, -1, 1)),
            Arc::clone(&shards),
        );
        tx.init_by_args(0, &args(&["KEYSET", "x"]));
        tx.schedule().expect("schedule should acquire locks");

        let owner = shards.shard_for_key(b"x");
        let free = shards
            .await_on_shard(owner, |state| {
                state.check_key_lock(0, b"x", IntentMode::Exclusive)
            })
            .expect("lock inspection should reach shard");
        assert_that!(free, eq(false));

        tx.unlock_multi().expect("unlock should release locks");
        let free = shards
            .await_on_shard(owner, |state| {
                state.check_key_lock(0, b"x", IntentMode::Exclusive)
            })
            .expect("lock inspection should reach shard");
        assert_that!(free, eq(true));
    }

    #[rstest]
    fn global_binding_reserves_every_shard() {
        let shards = shard_set();
        let tx = Transaction::new(
            CmdBinding {
                name: "EXEC",
                key_spec: KeySpec::none(),
                is_global: true,
                is_write: true,
            },
            Arc::clone(&shards),
        );
        tx.init_by_args(0, &args(&["EXEC"]));
        assert_that!(tx.unique_shard_count(), eq(2_usize));
        tx.schedule().expect("schedule should acquire shard locks");

        let shared_free = shards
            .run_brief_in_parallel(|state| state.check_shard_lock(IntentMode::Shared))
            .expect("fan-out should reach shards");
        assert_that!(shared_free.iter().all(|free| !free), eq(true));

        tx.unlock_multi().expect("unlock should release shard locks");
        let shared_free = shards
            .run_brief_in_parallel(|state| state.check_shard_lock(IntentMode::Shared))
            .expect("fan-out should reach shards");
        assert_that!(shared_free.iter().all(|free| *free), eq(true));
    }

    #[rstest]
    fn standalone_hop_releases_locks_after_running() {
        let shards = shard_set();
        let tx = Transaction::new(
            write_binding("SET", KeySpec::new(1, 1, 1)),
            Arc::clone(&shards),
        );
        tx.init_by_args(0, &args(&["SET", "k", "v"]));

        let touched = tx
            .run_on_shards(|_, _, keys| keys.len())
            .expect("hop should run");
        assert_that!(touched, eq(&vec![1_usize]));
        assert_that!(tx.is_ooo(), eq(true));

        let owner = shards.shard_for_key(b"k");
        let free = shards
            .await_on_shard(owner, |state| {
                state.check_key_lock(0, b"k", IntentMode::Exclusive)
            })
            .expect("lock inspection should reach shard");
        assert_that!(free, eq(true));
    }
}
