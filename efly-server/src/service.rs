//! The central command dispatcher.
//!
//! Every request — RESP, memcached, or a nested call from a script — funnels through
//! [`Service::dispatch_command`], which validates the command against the registry, enforces the
//! connection gates, binds the transaction envelope, and invokes the handler.

use std::sync::Arc;
use std::time::Instant;

use efly_common::config::RuntimeConfig;
use efly_common::error::{EflyError, EflyResult};
use efly_common::ids::DbIndex;
use efly_engine::ShardSet;
use efly_engine::lock::IntentMode;
use efly_facade::ClientProtocol;
use efly_facade::reply::ReplySink;
use efly_script::ScriptRegistry;
use efly_transaction::Transaction;
use tracing::{debug, info};

use crate::command::{CommandId, copt};
use crate::conn_context::{ConnectionContext, ExecState, StoredCmd};
use crate::registry::CommandRegistry;
use crate::server_state::{self, GlobalState, GlobalStateKind};
use crate::{eval, generic_family, server_family, string_family};

/// Standard wrong-arity error text.
#[must_use]
pub fn wrong_num_args(command_name: &str) -> String {
    format!("wrong number of arguments for '{command_name}' command")
}

/// Process-wide dispatch service.
#[derive(Debug)]
pub struct Service {
    config: RuntimeConfig,
    registry: CommandRegistry,
    shard_set: Arc<ShardSet>,
    script_registry: Arc<ScriptRegistry>,
    global_state: GlobalState,
    is_master: bool,
}

impl Service {
    /// Builds the service: shard executors plus the sealed command table.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let shard_set = Arc::new(ShardSet::new(config.shard_count));
        let mut registry = CommandRegistry::new();
        Self::register_commands(&mut registry);
        let is_master = !config.replica_read_only;
        Self {
            config,
            registry,
            shard_set,
            script_registry: Arc::new(ScriptRegistry::new()),
            global_state: GlobalState::new(),
            is_master,
        }
    }

    /// Initializes per-thread state, metrics, and opens request admission.
    ///
    /// # Errors
    ///
    /// Returns `EflyError::InvalidState` when the service is not in `LOADING`, or when shard
    /// executors are unavailable.
    pub fn init(&self) -> EflyResult<()> {
        self.shard_set
            .run_brief_in_parallel(|_| server_state::init_thread_local())?;

        metrics::describe_histogram!(
            "request_latency_usec",
            "Per-command dispatch latency in microseconds"
        );
        metrics::describe_counter!("requests_total", "Number of served requests");

        self.registry.log_multi_key_commands();

        let (_, switched) = self.global_state.next(GlobalStateKind::Active);
        if !switched {
            return Err(EflyError::InvalidState("service is not in LOADING state"));
        }
        info!(
            shards = self.shard_set.size(),
            commands = self.registry.len(),
            "service is active"
        );
        Ok(())
    }

    /// Closes request admission and tears down per-thread and per-shard state.
    ///
    /// Callers may not invoke this again after it has completed.
    ///
    /// # Errors
    ///
    /// Returns `EflyError::InvalidState` when the service never went active, or when shard
    /// executors are unavailable.
    pub fn shutdown(&self) -> EflyResult<()> {
        let (seen, switched) = self.global_state.next(GlobalStateKind::ShuttingDown);
        // The SHUTDOWN command may already have closed admission; teardown still runs here.
        if !switched && seen != GlobalStateKind::ShuttingDown {
            return Err(EflyError::InvalidState("service is not in ACTIVE state"));
        }
        self.shard_set.run_brief_in_parallel(|shard| {
            server_state::shutdown_thread_local();
            shard.reset();
        })?;
        info!("service shut down");
        Ok(())
    }

    /// Runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Lifecycle state machine.
    #[must_use]
    pub fn global_state(&self) -> &GlobalState {
        &self.global_state
    }

    /// Shard executor set.
    #[must_use]
    pub fn shard_set(&self) -> &Arc<ShardSet> {
        &self.shard_set
    }

    /// Process-wide script registry.
    #[must_use]
    pub fn script_registry(&self) -> &Arc<ScriptRegistry> {
        &self.script_registry
    }

    /// Whether connections must authenticate first.
    #[must_use]
    pub fn is_pass_protected(&self) -> bool {
        self.config.is_pass_protected()
    }

    /// Creates connection state for a freshly accepted client.
    #[must_use]
    pub fn new_connection(&self, protocol: ClientProtocol) -> ConnectionContext {
        ConnectionContext::new(protocol, self.is_pass_protected())
    }

    /// Dispatches one parsed command on a connection.
    ///
    /// Exactly one reply is produced on `sink` for every accepted command; rejections reply with
    /// an error and mutate nothing beyond poisoning an open `MULTI`.
    pub fn dispatch_command(
        &self,
        mut args: Vec<Vec<u8>>,
        cntx: &mut ConnectionContext,
        sink: &mut dyn ReplySink,
    ) {
        assert!(!args.is_empty(), "dispatch requires a command name");
        args[0].make_ascii_uppercase();
        let cmd_str = String::from_utf8_lossy(&args[0]).into_owned();
        let is_trans_cmd = matches!(cmd_str.as_str(), "EXEC" | "MULTI" | "DISCARD");

        debug!(command = %cmd_str, args = args.len() - 1, "dispatch");

        let Some(cid) = self.check_dispatch_gates(&cmd_str, &args, cntx, sink, is_trans_cmd)
        else {
            // Any rejection up to the policy fence poisons an open MULTI.
            if cntx.conn_state.exec_state != ExecState::Inactive {
                cntx.conn_state.exec_state = ExecState::Error;
            }
            return;
        };

        if cntx.conn_state.exec_state != ExecState::Inactive && !is_trans_cmd {
            if cntx.conn_state.exec_state == ExecState::Error {
                return sink.send_error("Transaction discarded because of previous errors");
            }
            cntx.conn_state.exec_body.push(StoredCmd { cid, args });
            return sink.send_simple_string("QUEUED");
        }

        let start = Instant::now();
        let under_script = cntx.conn_state.script_info.is_some();
        let mut dist_trans: Option<Arc<Transaction>> = None;

        if under_script {
            // A script scope always owns the envelope; nested commands rebind it.
            let tx = cntx
                .transaction
                .clone()
                .expect("script execution must own a transaction");
            if let Some(range) = cid.key_spec().key_range(args.len()) {
                let declared = &cntx
                    .conn_state
                    .script_info
                    .as_ref()
                    .expect("under_script implies script_info")
                    .keys;
                for index in range.indices() {
                    if !declared.contains(&args[index]) {
                        return sink.send_error("script tried accessing undeclared key");
                    }
                }
            }
            tx.set_exec_cmd(cid.binding());
            tx.init_by_args(cntx.conn_state.db_index, &args);
        } else if cid.is_transactional() {
            debug_assert!(cntx.transaction.is_none());
            let tx = Arc::new(Transaction::new(cid.binding(), Arc::clone(&self.shard_set)));
            tx.init_by_args(cntx.conn_state.db_index, &args);
            cntx.last_command_debug.shards_count = tx.unique_shard_count();
            cntx.transaction = Some(Arc::clone(&tx));
            dist_trans = Some(tx);
        } else {
            cntx.transaction = None;
        }

        metrics::counter!("requests_total", "cmd" => cmd_str.clone()).increment(1);
        cid.invoke(self, &args, cntx, sink);
        let elapsed_usec = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
        metrics::histogram!("request_latency_usec", "cmd" => cmd_str).record(elapsed_usec as f64);

        if let Some(tx) = dist_trans {
            cntx.last_command_debug.clock = tx.txid();
            cntx.last_command_debug.is_ooo = tx.is_ooo();
        }
        if !under_script {
            cntx.transaction = None;
        }
    }

    fn check_dispatch_gates(
        &self,
        cmd_str: &str,
        args: &[Vec<u8>],
        cntx: &ConnectionContext,
        sink: &mut dyn ReplySink,
        is_trans_cmd: bool,
    ) -> Option<Arc<CommandId>> {
        let Some(cid) = self.registry.find(cmd_str) else {
            sink.send_error(&format!("unknown command `{cmd_str}`"));
            return None;
        };

        let gstate = self.global_state.current();
        let admitted = match gstate {
            GlobalStateKind::Active => true,
            GlobalStateKind::Loading => cid.opt_mask() & copt::LOADING != 0,
            GlobalStateKind::ShuttingDown => false,
        };
        if !admitted {
            sink.send_error(&format!("Can not execute during {}", gstate.name()));
            return None;
        }

        if cntx.requires_auth() && cid.name() != "AUTH" {
            sink.send_error("-NOAUTH Authentication required.");
            return None;
        }

        let under_script = cntx.conn_state.script_info.is_some();
        if under_script && cid.opt_mask() & copt::NOSCRIPT != 0 {
            sink.send_error("This Redis command is not allowed from script");
            return None;
        }

        let script_is_write = cntx
            .conn_state
            .script_info
            .as_ref()
            .is_some_and(|info| info.is_write);
        let is_write_cmd = cid.opt_mask() & copt::WRITE != 0 || (under_script && script_is_write);
        if !self.is_master && is_write_cmd {
            sink.send_error("-READONLY You can't write against a read only replica.");
            return None;
        }

        let arity = cid.arity();
        let arg_count = args.len();
        if (arity > 0 && arg_count != arity as usize)
            || (arity < 0 && arg_count < arity.unsigned_abs() as usize)
        {
            sink.send_error(&wrong_num_args(cmd_str));
            return None;
        }
        if cid.key_arg_step() == 2 && arg_count % 2 == 0 {
            sink.send_error(&wrong_num_args(cmd_str));
            return None;
        }

        if !cid.validate(args, sink) {
            return None;
        }

        let under_multi = cntx.conn_state.exec_state != ExecState::Inactive && !is_trans_cmd;
        if under_multi {
            if cid.opt_mask() & copt::ADMIN != 0 {
                sink.send_error("Can not run admin commands under transactions");
                return None;
            }
            if cid.name() == "SELECT" {
                sink.send_error("Can not call SELECT within a transaction");
                return None;
            }
        }

        Some(cid)
    }

    /// Whether an exclusive intent is currently held for `key` on its owner shard.
    ///
    /// Suspends briefly on the owning shard executor.
    #[must_use]
    pub fn is_locked(&self, db: DbIndex, key: &[u8]) -> bool {
        let shard = self.shard_set.shard_for_key(key);
        let key = key.to_vec();
        self.shard_set
            .await_on_shard(shard, move |state| {
                !state.check_key_lock(db, &key, IntentMode::Exclusive)
            })
            .unwrap_or(false)
    }

    /// Whether any shard currently blocks shared intent (a global transaction is running).
    #[must_use]
    pub fn is_shard_set_locked(&self) -> bool {
        self.shard_set
            .run_brief_in_parallel(|state| state.check_shard_lock(IntentMode::Shared))
            .map(|free| free.iter().any(|unlocked| !unlocked))
            .unwrap_or(false)
    }

    pub(crate) fn multi(
        _service: &Service,
        _args: &[Vec<u8>],
        cntx: &mut ConnectionContext,
        sink: &mut dyn ReplySink,
    ) {
        if cntx.conn_state.exec_state != ExecState::Inactive {
            return sink.send_error("MULTI calls can not be nested");
        }
        cntx.conn_state.exec_state = ExecState::Collect;
        sink.send_ok();
    }

    pub(crate) fn discard(
        _service: &Service,
        _args: &[Vec<u8>],
        cntx: &mut ConnectionContext,
        sink: &mut dyn ReplySink,
    ) {
        if cntx.conn_state.exec_state == ExecState::Inactive {
            return sink.send_error("DISCARD without MULTI");
        }
        cntx.conn_state.exec_state = ExecState::Inactive;
        cntx.conn_state.exec_body.clear();
        sink.send_ok();
    }

    pub(crate) fn exec(
        service: &Service,
        _args: &[Vec<u8>],
        cntx: &mut ConnectionContext,
        sink: &mut dyn ReplySink,
    ) {
        match cntx.conn_state.exec_state {
            ExecState::Inactive => return sink.send_error("EXEC without MULTI"),
            ExecState::Error => {
                cntx.conn_state.exec_state = ExecState::Inactive;
                cntx.conn_state.exec_body.clear();
                return sink
                    .send_error("-EXECABORT Transaction discarded because of previous errors");
            }
            ExecState::Collect => {}
        }

        let body = std::mem::take(&mut cntx.conn_state.exec_body);
        sink.start_array(u32::try_from(body.len()).unwrap_or(u32::MAX));
        if !body.is_empty() {
            let tx = cntx
                .transaction
                .clone()
                .expect("EXEC must own a transaction envelope");
            match tx.schedule() {
                Err(error) => {
                    let message = error.to_string();
                    for _ in &body {
                        sink.send_error(&message);
                    }
                }
                Ok(()) => {
                    let baseline_errors = sink.error_count();
                    for scmd in &body {
                        tx.set_exec_cmd(scmd.cid.binding());
                        tx.init_by_args(cntx.conn_state.db_index, &scmd.args);
                        scmd.cid.invoke(service, &scmd.args, cntx, sink);
                        if sink.error_count() > baseline_errors {
                            break;
                        }
                    }
                    debug!(commands = body.len(), "exec unlocking");
                    if let Err(error) = tx.unlock_multi() {
                        debug!(%error, "exec unlock failed");
                    }
                }
            }
        }
        cntx.conn_state.exec_state = ExecState::Inactive;
    }

    fn register_commands(registry: &mut CommandRegistry) {
        const EXEC_MASK: u32 = copt::LOADING | copt::NOSCRIPT | copt::GLOBAL_TRANS;

        registry.register(
            CommandId::new("QUIT", copt::READONLY | copt::FAST, 1, 0, 0, 0)
                .set_handler(server_family::quit),
        );
        registry.register(
            CommandId::new("MULTI", copt::NOSCRIPT | copt::FAST | copt::LOADING, 1, 0, 0, 0)
                .set_handler(Self::multi),
        );
        registry.register(
            CommandId::new("DISCARD", copt::NOSCRIPT | copt::FAST, 1, 0, 0, 0)
                .set_handler(Self::discard),
        );
        registry.register(
            CommandId::new("EXEC", EXEC_MASK, 1, 0, 0, 0).set_handler(Self::exec),
        );
        registry.register(
            CommandId::new("EVAL", copt::NOSCRIPT, -3, 0, 0, 0)
                .with_validator(eval::eval_validator)
                .set_handler(eval::eval),
        );
        registry.register(
            CommandId::new("EVALSHA", copt::NOSCRIPT, -3, 0, 0, 0)
                .with_validator(eval::eval_validator)
                .set_handler(eval::evalsha),
        );

        registry.register(
            CommandId::new("PING", copt::LOADING | copt::FAST, -1, 0, 0, 0)
                .set_handler(server_family::ping),
        );
        registry.register(
            CommandId::new("ECHO", copt::FAST, 2, 0, 0, 0).set_handler(server_family::echo),
        );
        registry.register(
            CommandId::new("AUTH", copt::NOSCRIPT | copt::FAST | copt::LOADING, 2, 0, 0, 0)
                .set_handler(server_family::auth),
        );
        registry.register(
            CommandId::new("SELECT", copt::LOADING | copt::FAST, 2, 0, 0, 0)
                .set_handler(server_family::select),
        );
        registry.register(
            CommandId::new("SHUTDOWN", copt::ADMIN | copt::NOSCRIPT | copt::LOADING, 1, 0, 0, 0)
                .set_handler(server_family::shutdown),
        );

        registry.register(
            CommandId::new("SET", copt::WRITE, -3, 1, 1, 1).set_handler(string_family::set),
        );
        registry.register(
            CommandId::new("SETNX", copt::WRITE | copt::FAST, 3, 1, 1, 1)
                .set_handler(string_family::setnx),
        );
        registry.register(
            CommandId::new("GET", copt::READONLY | copt::FAST, 2, 1, 1, 1)
                .set_handler(string_family::get),
        );
        registry.register(
            CommandId::new("MGET", copt::READONLY | copt::FAST, -2, 1, -1, 1)
                .set_handler(string_family::mget),
        );
        registry.register(
            CommandId::new("MSET", copt::WRITE, -3, 1, -1, 2).set_handler(string_family::mset),
        );
        registry.register(
            CommandId::new("APPEND", copt::WRITE | copt::FAST, 3, 1, 1, 1)
                .set_handler(string_family::append),
        );
        registry.register(
            CommandId::new("PREPEND", copt::WRITE | copt::FAST, 3, 1, 1, 1)
                .set_handler(string_family::prepend),
        );
        registry.register(
            CommandId::new("STRLEN", copt::READONLY | copt::FAST, 2, 1, 1, 1)
                .set_handler(string_family::strlen),
        );
        registry.register(
            CommandId::new("INCR", copt::WRITE | copt::FAST, 2, 1, 1, 1)
                .set_handler(string_family::incr),
        );
        registry.register(
            CommandId::new("DECR", copt::WRITE | copt::FAST, 2, 1, 1, 1)
                .set_handler(string_family::decr),
        );
        registry.register(
            CommandId::new("INCRBY", copt::WRITE | copt::FAST, 3, 1, 1, 1)
                .set_handler(string_family::incrby),
        );
        registry.register(
            CommandId::new("DECRBY", copt::WRITE | copt::FAST, 3, 1, 1, 1)
                .set_handler(string_family::decrby),
        );

        registry.register(
            CommandId::new("DEL", copt::WRITE, -2, 1, -1, 1).set_handler(generic_family::del),
        );
        registry.register(
            CommandId::new("UNLINK", copt::WRITE, -2, 1, -1, 1)
                .set_handler(generic_family::del),
        );
        registry.register(
            CommandId::new("EXISTS", copt::READONLY | copt::FAST, -2, 1, -1, 1)
                .set_handler(generic_family::exists),
        );
    }
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod service_tests;
