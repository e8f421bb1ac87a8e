//! Memcached text protocol adapter.
//!
//! Translates parsed memcached commands into the internal command path and re-enters the
//! dispatcher with the memcached reply builder.

use efly_facade::memcache_reply::McReplyBuilder;

use crate::conn_context::ConnectionContext;
use crate::service::Service;

/// Parsed memcached command verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McCommandKind {
    /// `set` — unconditional store.
    Set,
    /// `add` — store only when missing.
    Add,
    /// `replace` — store only when present.
    Replace,
    /// `append` — concatenate after the stored value.
    Append,
    /// `prepend` — concatenate before the stored value.
    Prepend,
    /// `delete`.
    Delete,
    /// `incr` with a delta.
    Incr,
    /// `decr` with a delta.
    Decr,
    /// `get` over one or more keys.
    Get,
    /// `quit`.
    Quit,
    /// `stats` — answered directly by the adapter.
    Stats,
    /// `version` — answered directly by the adapter.
    Version,
}

impl McCommandKind {
    fn is_store(self) -> bool {
        matches!(
            self,
            Self::Set | Self::Add | Self::Replace | Self::Append | Self::Prepend
        )
    }
}

/// One parsed memcached command.
#[derive(Debug, Clone, Default)]
pub struct MemcacheCommand {
    /// Command verb.
    pub kind: Option<McCommandKind>,
    /// Primary key, when the verb takes one.
    pub key: Vec<u8>,
    /// Additional keys for multi-key `get`.
    pub keys_ext: Vec<Vec<u8>>,
    /// Delta for `incr`/`decr`.
    pub delta: u64,
    /// Relative expiry in seconds; zero means no expiry.
    pub expire_ts: u64,
    /// Opaque client flags echoed on `VALUE` replies.
    pub flags: u32,
}

impl Service {
    /// Translates one memcached command into the internal command path and dispatches it.
    pub fn dispatch_mc(
        &self,
        cmd: &MemcacheCommand,
        value: &[u8],
        cntx: &mut ConnectionContext,
        builder: &mut McReplyBuilder,
    ) {
        let Some(kind) = cmd.kind else {
            return builder.send_client_error("bad command line format");
        };

        let (cmd_name, store_opt): (&[u8], Vec<u8>) = match kind {
            McCommandKind::Set => (b"SET", Vec::new()),
            McCommandKind::Add => (b"SET", b"NX".to_vec()),
            McCommandKind::Replace => (b"SET", b"XX".to_vec()),
            McCommandKind::Append => (b"APPEND", Vec::new()),
            McCommandKind::Prepend => (b"PREPEND", Vec::new()),
            McCommandKind::Delete => (b"DEL", Vec::new()),
            McCommandKind::Incr => (b"INCRBY", cmd.delta.to_string().into_bytes()),
            McCommandKind::Decr => (b"DECRBY", cmd.delta.to_string().into_bytes()),
            McCommandKind::Get => (b"MGET", Vec::new()),
            McCommandKind::Quit => (b"QUIT", Vec::new()),
            McCommandKind::Stats => {
                return self.stats_mc(builder);
            }
            McCommandKind::Version => {
                return builder.send_direct(&format!(
                    "VERSION {}\r\n",
                    env!("CARGO_PKG_VERSION")
                ));
            }
        };

        let mut args: Vec<Vec<u8>> = Vec::with_capacity(4 + cmd.keys_ext.len());
        args.push(cmd_name.to_vec());
        if !cmd.key.is_empty() {
            args.push(cmd.key.clone());
        }

        if kind.is_store() {
            args.push(value.to_vec());
            if !store_opt.is_empty() {
                args.push(store_opt);
            }
            if cmd.expire_ts != 0 && cmd_name == b"SET" {
                args.push(b"EX".to_vec());
                args.push(cmd.expire_ts.to_string().into_bytes());
            }
            cntx.conn_state.memcache_flag = cmd.flags;
        } else if kind == McCommandKind::Get {
            for key in &cmd.keys_ext {
                args.push(key.clone());
            }
        } else if !store_opt.is_empty() {
            args.push(store_opt);
        }

        builder.delete_reply = kind == McCommandKind::Delete;
        self.dispatch_command(args, cntx, builder);
        builder.delete_reply = false;

        // Reset back.
        cntx.conn_state.memcache_flag = 0;
    }

    /// Answers `stats` directly with a minimal snapshot.
    fn stats_mc(&self, builder: &mut McReplyBuilder) {
        builder.send_direct(&format!("STAT version {}\r\n", env!("CARGO_PKG_VERSION")));
        builder.send_direct(&format!("STAT shards {}\r\n", self.shard_set().size()));
        builder.send_direct(&format!(
            "STAT scripts {}\r\n",
            self.script_registry().len()
        ));
        builder.send_direct(&format!(
            "STAT global_lock {}\r\n",
            u8::from(self.is_shard_set_locked())
        ));
        builder.send_direct("END\r\n");
    }
}
