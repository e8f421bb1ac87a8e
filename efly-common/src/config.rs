//! Runtime configuration shared by module bootstrap code.

use crate::ids::ShardCount;

/// Bootstrap configuration used by `efly-server` during process startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of shard executors used by shared-nothing execution.
    pub shard_count: ShardCount,
    /// Main RESP listener port.
    pub redis_port: u16,
    /// Optional memcached text protocol port.
    pub memcached_port: Option<u16>,
    /// When set, connections require `AUTH` before any other command.
    pub requirepass: Option<String>,
    /// Read-only replica mode: write commands are rejected with `-READONLY`.
    pub replica_read_only: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shard_count: ShardCount::new(4).expect("literal shard count must be non-zero"),
            redis_port: 6380,
            memcached_port: None,
            requirepass: None,
            replica_read_only: false,
        }
    }
}

impl RuntimeConfig {
    /// Returns whether connections must authenticate before issuing commands.
    #[must_use]
    pub fn is_pass_protected(&self) -> bool {
        self.requirepass.as_deref().is_some_and(|pass| !pass.is_empty())
    }
}
