//! Hot-path container aliases used by shard-local state.
//!
//! Container choices are centralized so future allocator/container upgrades can be done in one
//! place without touching command logic modules.

use hashbrown::{HashMap as HbMap, HashSet as HbSet};

/// Hot-path hash map used by shard-local state tables.
pub type HotMap<K, V> = HbMap<K, V>;

/// Hot-path hash set used by key-set bookkeeping.
pub type HotSet<T> = HbSet<T>;
