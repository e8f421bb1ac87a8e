//! `EVAL`/`EVALSHA` and the reentrant script bridge.

use efly_facade::capture::CapturingReplyBuilder;
use efly_facade::explore::ObjectExplorer;
use efly_facade::reply::ReplySink;
use efly_script::{
    AddResult, CommandDispatcher, RunResult, ScriptValue, TreeBuilder, is_sha_digest,
};
use tracing::debug;

use crate::conn_context::{ConnectionContext, ScriptInfo};
use crate::server_state::with_interpreter;
use crate::service::Service;

const SCRIPT_NOT_FOUND: &str = "-NOSCRIPT No matching script. Please use EVAL.";
const INVALID_INT: &str = "value is not an integer or out of range";

/// Validator shared by `EVAL` and `EVALSHA`: the third argument must be a non-negative integer
/// no larger than the number of trailing arguments.
pub(crate) fn eval_validator(args: &[Vec<u8>], sink: &mut dyn ReplySink) -> bool {
    let parsed = std::str::from_utf8(&args[2])
        .ok()
        .and_then(|text| text.parse::<i64>().ok());
    let Some(num_keys) = parsed else {
        sink.send_error(INVALID_INT);
        return false;
    };
    if num_keys < 0 {
        sink.send_error(INVALID_INT);
        return false;
    }
    if num_keys as usize > args.len() - 3 {
        sink.send_error("Number of keys can't be greater than number of args");
        return false;
    }
    true
}

fn declared_key_count(args: &[Vec<u8>]) -> usize {
    // The validator already accepted this argument.
    std::str::from_utf8(&args[2])
        .ok()
        .and_then(|text| text.parse::<usize>().ok())
        .unwrap_or(0)
}

pub(crate) fn eval(
    service: &Service,
    args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    let num_keys = declared_key_count(args);
    let body_text = String::from_utf8_lossy(&args[1]).into_owned();
    let body = body_text.trim();
    if body.is_empty() {
        return sink.send_null();
    }

    let compiled = with_interpreter(|interpreter| match interpreter.add_function(body) {
        AddResult::Ok(sha) => {
            // Newly compiled bodies become resolvable by every thread.
            service.script_registry().insert_function(&sha, body);
            Ok(sha)
        }
        AddResult::AlreadyExists(sha) => Ok(sha),
        AddResult::CompileErr(message) => Err(message),
    });
    let sha = match compiled {
        Ok(sha) => sha,
        Err(message) => return sink.send_error(&message),
    };

    let keys = args[3..3 + num_keys].to_vec();
    let argv = args[3 + num_keys..].to_vec();
    eval_internal(service, &sha, &keys, &argv, cntx, sink);
}

pub(crate) fn evalsha(
    service: &Service,
    args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    let num_keys = declared_key_count(args);
    let sha = String::from_utf8_lossy(&args[1]).to_lowercase();
    let keys = args[3..3 + num_keys].to_vec();
    let argv = args[3 + num_keys..].to_vec();
    eval_internal(service, &sha, &keys, &argv, cntx, sink);
}

fn eval_internal(
    service: &Service,
    sha: &str,
    keys: &[Vec<u8>],
    argv: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    // Sanitize the digest shape before it can select registry entries.
    if !is_sha_digest(sha) {
        return sink.send_error(SCRIPT_NOT_FOUND);
    }

    with_interpreter(|interpreter| {
        if !interpreter.exists(sha) {
            let Some(body) = service.script_registry().find(sha) else {
                return sink.send_error(SCRIPT_NOT_FOUND);
            };
            match interpreter.add_function(&body) {
                AddResult::Ok(compiled) | AddResult::AlreadyExists(compiled) => {
                    debug_assert_eq!(compiled, sha);
                }
                AddResult::CompileErr(message) => return sink.send_error(&message),
            }
        }

        assert!(
            cntx.conn_state.script_info.is_none(),
            "nested script execution is forbidden"
        );
        let mut info = ScriptInfo {
            is_write: true,
            ..ScriptInfo::default()
        };
        for key in keys {
            let _ = info.keys.insert(key.clone());
        }
        cntx.conn_state.script_info = Some(info);

        let tx = cntx
            .transaction
            .clone()
            .expect("EVAL must own a transaction envelope");
        if !keys.is_empty()
            && let Err(error) = tx.schedule()
        {
            cntx.conn_state.script_info = None;
            return sink.send_error(&error.to_string());
        }

        let run = {
            let mut bridge = DispatchBridge {
                service,
                cntx: &mut *cntx,
            };
            interpreter.run_function(sha, keys, argv, &mut bridge)
        };

        cntx.conn_state.script_info = None;
        if !keys.is_empty()
            && let Err(error) = tx.unlock_multi()
        {
            debug!(%error, "script envelope unlock failed");
        }

        match run {
            RunResult::Err(message) => {
                sink.send_error(&format!("Error running script (call to {sha}): {message}"));
            }
            RunResult::Ok => {
                if interpreter.is_result_safe() {
                    let mut serializer = EvalSerializer { sink };
                    interpreter.serialize_result(&mut serializer);
                } else {
                    sink.send_error("reached script stack limit");
                }
            }
        }
        interpreter.reset_stack();
    });
}

/// Bridge handed to the interpreter: a nested call becomes a full dispatch with the capturing
/// sink swapped in for the connection's builder, and the captured tree is returned to the script.
struct DispatchBridge<'a> {
    service: &'a Service,
    cntx: &'a mut ConnectionContext,
}

impl CommandDispatcher for DispatchBridge<'_> {
    fn call(&mut self, args: Vec<Vec<u8>>) -> ScriptValue {
        let mut tree = TreeBuilder::new();
        {
            let mut capture = CapturingReplyBuilder::new(&mut tree);
            self.service.dispatch_command(args, self.cntx, &mut capture);
        }
        tree.take()
    }
}

/// Maps the interpreter's result tree onto the outgoing reply builder.
///
/// Array events are intentionally unsupported at this layer: the interpreter's own result
/// serialization produces one top-level value, and deeper structures only arrive through the
/// nested-call path with the capturing sink.
struct EvalSerializer<'a> {
    sink: &'a mut dyn ReplySink,
}

impl ObjectExplorer for EvalSerializer<'_> {
    fn on_bool(&mut self, value: bool) {
        if value {
            self.sink.send_long(1);
        } else {
            self.sink.send_null();
        }
    }

    fn on_string(&mut self, value: &[u8]) {
        self.sink.send_bulk_string(value);
    }

    fn on_double(&mut self, value: f64) {
        self.sink.send_double(value);
    }

    fn on_int(&mut self, value: i64) {
        self.sink.send_long(value);
    }

    fn on_array_start(&mut self, _len: u32) {
        unimplemented!("table results arrive through the nested-call capture path");
    }

    fn on_array_end(&mut self) {
        unimplemented!("table results arrive through the nested-call capture path");
    }

    fn on_nil(&mut self) {
        self.sink.send_null();
    }

    fn on_status(&mut self, status: &str) {
        self.sink.send_simple_string(status);
    }

    fn on_error(&mut self, message: &str) {
        self.sink.send_error(message);
    }
}
