//! Key-to-shard routing.
//!
//! Routing honors hash tags: when a key contains a `{...}` section with non-empty content, only
//! that section is hashed. Clients use tags to pin related keys to one shard, which keeps a
//! multi-key transaction or script on a single executor instead of fanning out.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use efly_common::ids::{ShardCount, ShardId};

/// Maps keys to their owning shard over a fixed shard count.
#[derive(Debug, Clone)]
pub struct KeyRouter {
    shard_count: ShardCount,
}

impl KeyRouter {
    /// Builds a router for the process's shard set.
    #[must_use]
    pub fn new(shard_count: ShardCount) -> Self {
        Self { shard_count }
    }

    /// Returns the owner shard for `key`.
    #[must_use]
    pub fn shard_for_key(&self, key: &[u8]) -> ShardId {
        let mut hasher = DefaultHasher::new();
        routable_part(key).hash(&mut hasher);
        // The modulo keeps the id below the validated non-zero shard count, so the
        // narrowing cast cannot truncate.
        (hasher.finish() % u64::from(self.shard_count.get())) as ShardId
    }
}

/// The hashed portion of a key: the content of the first non-empty `{...}` tag, or the whole
/// key when no usable tag exists.
fn routable_part(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|byte| *byte == b'{') else {
        return key;
    };
    let tail = &key[open + 1..];
    match tail.iter().position(|byte| *byte == b'}') {
        Some(close) if close > 0 => &tail[..close],
        // `{}` and unterminated tags hash as plain keys.
        _ => key,
    }
}
