//! Command descriptors.

use efly_facade::reply::ReplySink;
use efly_transaction::{CmdBinding, KeySpec};

use crate::conn_context::ConnectionContext;
use crate::service::Service;

/// Option flags carried by a command descriptor.
pub mod copt {
    /// The command mutates keyspace state.
    pub const WRITE: u32 = 1;
    /// The command only reads keyspace state.
    pub const READONLY: u32 = 1 << 1;
    /// The command completes without suspending on other shards.
    pub const FAST: u32 = 1 << 2;
    /// The command is admitted while the service is still loading.
    pub const LOADING: u32 = 1 << 3;
    /// The command may not be called from inside a script.
    pub const NOSCRIPT: u32 = 1 << 4;
    /// Administrative command; rejected inside transactions.
    pub const ADMIN: u32 = 1 << 5;
    /// The command requires a global transaction over every shard.
    pub const GLOBAL_TRANS: u32 = 1 << 6;
}

/// Handler callback invoked once all dispatch gates have passed.
pub type CmdHandler = fn(&Service, &[Vec<u8>], &mut ConnectionContext, &mut dyn ReplySink);

/// Extra validation predicate run after the arity checks.
///
/// A failing validator owns emitting its error reply and returns `false` to stop the dispatch.
pub type CmdValidator = fn(&[Vec<u8>], &mut dyn ReplySink) -> bool;

fn unset_handler(_: &Service, args: &[Vec<u8>], _: &mut ConnectionContext, sink: &mut dyn ReplySink) {
    let name = String::from_utf8_lossy(&args[0]).into_owned();
    sink.send_error(&format!("command '{name}' has no registered handler"));
}

/// One command table entry: identity, arity, key layout, flags, validator, handler.
#[derive(Debug, Clone)]
pub struct CommandId {
    name: &'static str,
    opt_mask: u32,
    arity: i32,
    key_spec: KeySpec,
    validator: Option<CmdValidator>,
    handler: CmdHandler,
}

impl CommandId {
    /// Builder-style constructor mirroring the registration table layout:
    /// name, flags, arity, first key, last key, key step.
    #[must_use]
    pub fn new(
        name: &'static str,
        opt_mask: u32,
        arity: i32,
        first_key: u32,
        last_key: i32,
        key_step: u32,
    ) -> Self {
        let key_spec = if first_key == 0 {
            KeySpec::none()
        } else {
            KeySpec::new(first_key, last_key, key_step)
        };
        Self {
            name,
            opt_mask,
            arity,
            key_spec,
            validator: None,
            handler: unset_handler,
        }
    }

    /// Installs the handler callback.
    #[must_use]
    pub fn set_handler(mut self, handler: CmdHandler) -> Self {
        self.handler = handler;
        self
    }

    /// Installs an extra validator predicate.
    #[must_use]
    pub fn with_validator(mut self, validator: CmdValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Canonical uppercase command name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Option flag mask over [`copt`].
    #[must_use]
    pub fn opt_mask(&self) -> u32 {
        self.opt_mask
    }

    /// Signed arity: positive is an exact argument count, negative a minimum.
    #[must_use]
    pub fn arity(&self) -> i32 {
        self.arity
    }

    /// Key layout metadata.
    #[must_use]
    pub fn key_spec(&self) -> &KeySpec {
        &self.key_spec
    }

    /// First key position (`0` means no keys).
    #[must_use]
    pub fn first_key_pos(&self) -> u32 {
        self.key_spec.first_key
    }

    /// Last key position (`-1` means "to end").
    #[must_use]
    pub fn last_key_pos(&self) -> i32 {
        self.key_spec.last_key
    }

    /// Distance between consecutive keys.
    #[must_use]
    pub fn key_arg_step(&self) -> u32 {
        self.key_spec.key_step
    }

    /// Whether the command can reference more than one key.
    #[must_use]
    pub fn is_multi_key(&self) -> bool {
        self.key_spec.has_keys()
            && (self.key_spec.last_key < 0
                || self.key_spec.last_key as u32 > self.key_spec.first_key)
    }

    /// Whether dispatch must bind a transaction envelope for this command.
    #[must_use]
    pub fn is_transactional(&self) -> bool {
        self.key_spec.has_keys()
            || self.opt_mask & copt::GLOBAL_TRANS != 0
            || matches!(self.name, "EVAL" | "EVALSHA")
    }

    /// Envelope metadata handed to the transaction layer.
    #[must_use]
    pub fn binding(&self) -> CmdBinding {
        let is_script = matches!(self.name, "EVAL" | "EVALSHA");
        CmdBinding {
            name: self.name,
            key_spec: self.key_spec,
            is_global: self.opt_mask & copt::GLOBAL_TRANS != 0,
            // Scripts are treated as writers until static read-only detection exists.
            is_write: self.opt_mask & copt::WRITE != 0 || is_script,
        }
    }

    /// Runs the descriptor's validator; `true` means the dispatch proceeds.
    pub fn validate(&self, args: &[Vec<u8>], sink: &mut dyn ReplySink) -> bool {
        self.validator.is_none_or(|validator| validator(args, sink))
    }

    /// Invokes the handler.
    pub fn invoke(
        &self,
        service: &Service,
        args: &[Vec<u8>],
        cntx: &mut ConnectionContext,
        sink: &mut dyn ReplySink,
    ) {
        (self.handler)(service, args, cntx, sink);
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandId, copt};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn keyless_commands_are_not_transactional_without_flags() {
        let ping = CommandId::new("PING", copt::LOADING | copt::FAST, -1, 0, 0, 0);
        assert_that!(ping.is_transactional(), eq(false));
        assert_that!(ping.is_multi_key(), eq(false));
    }

    #[rstest]
    fn global_trans_flag_forces_transactional() {
        let exec = CommandId::new("EXEC", copt::GLOBAL_TRANS | copt::NOSCRIPT, 1, 0, 0, 0);
        assert_that!(exec.is_transactional(), eq(true));
        assert_that!(exec.binding().is_global, eq(true));
    }

    #[rstest]
    fn eval_is_transactional_and_treated_as_writer() {
        let eval = CommandId::new("EVAL", copt::NOSCRIPT, -3, 0, 0, 0);
        assert_that!(eval.is_transactional(), eq(true));
        assert_that!(eval.binding().is_write, eq(true));
    }

    #[rstest]
    fn key_layout_accessors_reflect_registration() {
        let mset = CommandId::new("MSET", copt::WRITE, -3, 1, -1, 2);
        assert_that!(mset.first_key_pos(), eq(1));
        assert_that!(mset.last_key_pos(), eq(-1));
        assert_that!(mset.key_arg_step(), eq(2));
        assert_that!(mset.is_multi_key(), eq(true));
        assert_that!(mset.is_transactional(), eq(true));
    }
}
