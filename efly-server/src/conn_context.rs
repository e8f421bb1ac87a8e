//! Per-connection execution state.

use std::sync::Arc;

use efly_common::ids::{DbIndex, TxId};
use efly_engine::containers::HotSet;
use efly_facade::ClientProtocol;
use efly_transaction::Transaction;

use crate::command::CommandId;

/// Authentication mask bits.
pub mod auth {
    /// The connection must authenticate before issuing commands.
    pub const REQ_AUTH: u8 = 1;
    /// The connection has authenticated.
    pub const AUTHENTICATED: u8 = 1 << 1;
}

/// MULTI phase of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecState {
    /// No transaction is open.
    #[default]
    Inactive,
    /// `MULTI` is collecting commands.
    Collect,
    /// A queued command was rejected; `EXEC` will abort.
    Error,
}

/// One command captured during `MULTI` collection.
#[derive(Debug, Clone)]
pub struct StoredCmd {
    /// Resolved descriptor.
    pub cid: Arc<CommandId>,
    /// Owned argument vector, command name included.
    pub args: Vec<Vec<u8>>,
}

/// Key declaration and write intent of an in-progress script.
#[derive(Debug, Clone, Default)]
pub struct ScriptInfo {
    /// Keys the script may touch.
    pub keys: HotSet<Vec<u8>>,
    /// Whether nested calls count as writes.
    pub is_write: bool,
}

/// Mutable per-connection dispatch state.
#[derive(Debug, Default)]
pub struct ConnectionState {
    /// Authentication mask over [`auth`].
    pub auth_mask: u8,
    /// Selected logical database.
    pub db_index: DbIndex,
    /// MULTI phase.
    pub exec_state: ExecState,
    /// Commands collected since `MULTI`.
    pub exec_body: Vec<StoredCmd>,
    /// Present while a script executes on this connection.
    pub script_info: Option<ScriptInfo>,
    /// Memcached flag to record with the next store.
    pub memcache_flag: u32,
}

/// Debug observables captured from the last dispatched command.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastCommandDebug {
    /// Distinct shards touched by the last transactional command.
    pub shards_count: usize,
    /// Transaction id of the last envelope.
    pub clock: TxId,
    /// Whether the last envelope ran out of order.
    pub is_ooo: bool,
}

/// Per-client context threaded through every dispatch.
#[derive(Debug)]
pub struct ConnectionContext {
    /// Active wire protocol.
    pub protocol: ClientProtocol,
    /// Mutable dispatch state.
    pub conn_state: ConnectionState,
    /// Transaction envelope bound to the in-flight command, if any.
    pub transaction: Option<Arc<Transaction>>,
    /// Debug observables from the last command.
    pub last_command_debug: LastCommandDebug,
}

impl ConnectionContext {
    /// Creates connection state for a freshly accepted client.
    #[must_use]
    pub fn new(protocol: ClientProtocol, requires_auth: bool) -> Self {
        let auth_mask = if requires_auth { auth::REQ_AUTH } else { 0 };
        Self {
            protocol,
            conn_state: ConnectionState {
                auth_mask,
                ..ConnectionState::default()
            },
            transaction: None,
            last_command_debug: LastCommandDebug::default(),
        }
    }

    /// Whether the connection still has to authenticate.
    #[must_use]
    pub fn requires_auth(&self) -> bool {
        self.conn_state.auth_mask & (auth::REQ_AUTH | auth::AUTHENTICATED) == auth::REQ_AUTH
    }
}
