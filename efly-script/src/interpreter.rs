//! Per-thread script interpreter.
//!
//! One interpreter exists per worker thread; it compiles bodies into a local function table
//! keyed by digest and runs at most one script at a time. Exclusive access is enforced by the
//! owner's mutable borrow, which is this runtime's form of the interpreter lock.

use efly_facade::explore::ObjectExplorer;
use hashbrown::HashMap;

use crate::digest::script_digest;
use crate::engine::{CommandDispatcher, ScriptEngine, ScriptEnv};
use crate::value::{MAX_RESULT_DEPTH, ScriptValue};

/// Outcome of compiling a body into the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddResult {
    /// Newly compiled; carries the digest.
    Ok(String),
    /// The body was already known; carries the digest.
    AlreadyExists(String),
    /// Compilation failed; carries the error text.
    CompileErr(String),
}

/// Outcome of running a compiled function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    /// The script finished; its result tree is stored on the interpreter.
    Ok,
    /// The script failed; carries the runtime error text.
    Err(String),
}

/// Thread-local script interpreter.
pub struct Interpreter {
    engine: Box<dyn ScriptEngine>,
    funcs: HashMap<String, String>,
    result: Option<ScriptValue>,
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("funcs", &self.funcs.len())
            .field("has_result", &self.result.is_some())
            .finish()
    }
}

impl Interpreter {
    /// Creates an interpreter over a language engine.
    #[must_use]
    pub fn new(engine: Box<dyn ScriptEngine>) -> Self {
        Self {
            engine,
            funcs: HashMap::new(),
            result: None,
        }
    }

    /// Compiles `body` into the local function table.
    pub fn add_function(&mut self, body: &str) -> AddResult {
        if let Err(message) = self.engine.check(body) {
            return AddResult::CompileErr(message);
        }
        let sha = script_digest(body);
        if self.funcs.contains_key(&sha) {
            return AddResult::AlreadyExists(sha);
        }
        let _ = self.funcs.insert(sha.clone(), body.to_owned());
        AddResult::Ok(sha)
    }

    /// Returns whether this interpreter already compiled `sha`.
    #[must_use]
    pub fn exists(&self, sha: &str) -> bool {
        self.funcs.contains_key(sha)
    }

    /// Runs a compiled function with `KEYS`/`ARGV` and a dispatcher bridge.
    ///
    /// On success the result tree is retained until [`Interpreter::reset_stack`].
    pub fn run_function(
        &mut self,
        sha: &str,
        keys: &[Vec<u8>],
        args: &[Vec<u8>],
        dispatcher: &mut dyn CommandDispatcher,
    ) -> RunResult {
        let Some(body) = self.funcs.get(sha).cloned() else {
            return RunResult::Err("function is not compiled".to_owned());
        };
        let mut env = ScriptEnv {
            keys,
            args,
            dispatcher,
        };
        match self.engine.run(&body, &mut env) {
            Ok(value) => {
                self.result = Some(value);
                RunResult::Ok
            }
            Err(message) => RunResult::Err(message),
        }
    }

    /// Returns whether the stored result tree is within the serialization depth limit.
    #[must_use]
    pub fn is_result_safe(&self) -> bool {
        self.result
            .as_ref()
            .is_none_or(|value| value.depth() <= MAX_RESULT_DEPTH)
    }

    /// Walks the stored result tree on `explorer`; an absent result is nil.
    pub fn serialize_result(&self, explorer: &mut dyn ObjectExplorer) {
        match &self.result {
            Some(value) => value.explore(explorer),
            None => explorer.on_nil(),
        }
    }

    /// Drops the stored result tree.
    pub fn reset_stack(&mut self) {
        self.result = None;
    }
}

#[cfg(test)]
mod tests {
    use super::{AddResult, Interpreter, RunResult};
    use crate::engine::{BasicEngine, CommandDispatcher};
    use crate::value::{MAX_RESULT_DEPTH, ScriptValue};
    use efly_facade::explore::ObjectExplorer;
    use googletest::prelude::*;
    use rstest::rstest;

    struct NullDispatcher;

    impl CommandDispatcher for NullDispatcher {
        fn call(&mut self, _args: Vec<Vec<u8>>) -> ScriptValue {
            ScriptValue::Nil
        }
    }

    fn interpreter() -> Interpreter {
        Interpreter::new(Box::new(BasicEngine))
    }

    #[rstest]
    fn add_function_reports_new_and_known_bodies() {
        let mut interp = interpreter();
        let AddResult::Ok(sha) = interp.add_function("return 1") else {
            panic!("first compile must succeed");
        };
        assert_that!(interp.exists(&sha), eq(true));
        assert_that!(
            &interp.add_function("return 1"),
            eq(&AddResult::AlreadyExists(sha))
        );
    }

    #[rstest]
    fn add_function_rejects_bad_statements() {
        let mut interp = interpreter();
        assert_that!(
            matches!(interp.add_function("frobnicate"), AddResult::CompileErr(_)),
            eq(true)
        );
    }

    #[rstest]
    fn run_function_stores_result_until_reset() {
        let mut interp = interpreter();
        let AddResult::Ok(sha) = interp.add_function("return hi") else {
            panic!("compile must succeed");
        };
        let run = interp.run_function(&sha, &[], &[], &mut NullDispatcher);
        assert_that!(&run, eq(&RunResult::Ok));
        assert_that!(interp.is_result_safe(), eq(true));

        struct Last(Option<ScriptValue>);
        impl ObjectExplorer for Last {
            fn on_bool(&mut self, value: bool) {
                self.0 = Some(ScriptValue::Bool(value));
            }
            fn on_string(&mut self, value: &[u8]) {
                self.0 = Some(ScriptValue::Bytes(value.to_vec()));
            }
            fn on_double(&mut self, value: f64) {
                self.0 = Some(ScriptValue::Double(value));
            }
            fn on_int(&mut self, value: i64) {
                self.0 = Some(ScriptValue::Int(value));
            }
            fn on_array_start(&mut self, _len: u32) {}
            fn on_array_end(&mut self) {}
            fn on_nil(&mut self) {
                self.0 = Some(ScriptValue::Nil);
            }
            fn on_status(&mut self, status: &str) {
                self.0 = Some(ScriptValue::Status(status.to_owned()));
            }
            fn on_error(&mut self, message: &str) {
                self.0 = Some(ScriptValue::Error(message.to_owned()));
            }
        }

        let mut last = Last(None);
        interp.serialize_result(&mut last);
        assert_that!(&last.0, eq(&Some(ScriptValue::Bytes(b"hi".to_vec()))));

        interp.reset_stack();
        let mut last = Last(None);
        interp.serialize_result(&mut last);
        assert_that!(&last.0, eq(&Some(ScriptValue::Nil)));
    }

    #[rstest]
    fn deep_results_are_flagged_unsafe() {
        let mut interp = interpreter();
        let AddResult::Ok(sha) = interp.add_function("return x") else {
            panic!("compile must succeed");
        };
        let _ = interp.run_function(&sha, &[], &[], &mut NullDispatcher);

        // Splice an over-deep tree in place of the engine result.
        let mut value = ScriptValue::Int(0);
        for _ in 0..=MAX_RESULT_DEPTH {
            value = ScriptValue::Array(vec![value]);
        }
        interp.result = Some(value);
        assert_that!(interp.is_result_safe(), eq(false));
    }
}
