//! Script execution engine boundary.
//!
//! The dispatcher only depends on this trait: compile-check a body, then run it with `KEYS`,
//! `ARGV`, and a callback that re-enters the command dispatcher. The language behind the trait
//! is interchangeable.

use crate::value::ScriptValue;

/// Callback re-entering the command dispatcher from inside a running script.
pub trait CommandDispatcher {
    /// Dispatches one command; the reply arrives as a structured value.
    fn call(&mut self, args: Vec<Vec<u8>>) -> ScriptValue;
}

/// Execution environment handed to the engine for one run.
pub struct ScriptEnv<'a> {
    /// Pre-declared key set, exposed to the script as `KEYS`.
    pub keys: &'a [Vec<u8>],
    /// Trailing script arguments, exposed as `ARGV`.
    pub args: &'a [Vec<u8>],
    /// Bridge back into the dispatcher.
    pub dispatcher: &'a mut dyn CommandDispatcher,
}

impl std::fmt::Debug for ScriptEnv<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEnv")
            .field("keys", &self.keys.len())
            .field("args", &self.args.len())
            .finish()
    }
}

/// A script language runtime.
pub trait ScriptEngine: Send + Sync {
    /// Validates a body without running it.
    ///
    /// # Errors
    ///
    /// Returns the compile error text shown to the client.
    fn check(&self, body: &str) -> Result<(), String>;

    /// Runs a body to completion, producing the script's result tree.
    ///
    /// # Errors
    ///
    /// Returns the runtime error text; the caller wraps it with the script digest.
    fn run(&self, body: &str, env: &mut ScriptEnv<'_>) -> Result<ScriptValue, String>;
}

/// Minimal statement engine.
///
/// Supports exactly two statement forms, separated by newlines or `;`:
///
/// - `call <arg>...` — dispatch a command and remember its reply
/// - `return <arg>` / `return call <arg>...` — finish with a value
///
/// Arguments may be literals or `KEYS[i]` / `ARGV[i]` references (1-based).
/// TODO: replace with a Lua-backed engine behind the same trait.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicEngine;

impl BasicEngine {
    fn resolve_token(token: &str, env: &ScriptEnv<'_>) -> Result<Vec<u8>, String> {
        if let Some(index) = Self::bracket_index(token, "KEYS") {
            return env
                .keys
                .get(index)
                .cloned()
                .ok_or_else(|| format!("KEYS index {} is out of range", index + 1));
        }
        if let Some(index) = Self::bracket_index(token, "ARGV") {
            return env
                .args
                .get(index)
                .cloned()
                .ok_or_else(|| format!("ARGV index {} is out of range", index + 1));
        }
        Ok(token.as_bytes().to_vec())
    }

    fn bracket_index(token: &str, table: &str) -> Option<usize> {
        let inner = token.strip_prefix(table)?.strip_prefix('[')?.strip_suffix(']')?;
        let position = inner.parse::<usize>().ok()?;
        position.checked_sub(1)
    }

    fn statements(body: &str) -> impl Iterator<Item = &str> {
        body.split(['\n', ';'])
            .map(str::trim)
            .filter(|statement| !statement.is_empty())
    }
}

impl ScriptEngine for BasicEngine {
    fn check(&self, body: &str) -> Result<(), String> {
        for statement in Self::statements(body) {
            let mut tokens = statement.split_whitespace();
            match tokens.next() {
                Some("call") => {
                    if tokens.next().is_none() {
                        return Err("call needs a command name".to_owned());
                    }
                }
                Some("return") => {
                    if tokens.next().is_none() {
                        return Err("return needs a value".to_owned());
                    }
                }
                Some(other) => return Err(format!("unknown statement '{other}'")),
                None => {}
            }
        }
        Ok(())
    }

    fn run(&self, body: &str, env: &mut ScriptEnv<'_>) -> Result<ScriptValue, String> {
        let mut result = ScriptValue::Nil;
        for statement in Self::statements(body) {
            let tokens = statement.split_whitespace().collect::<Vec<_>>();
            match tokens.as_slice() {
                ["call", rest @ ..] => {
                    result = Self::run_call(rest, env)?;
                }
                ["return", "call", rest @ ..] => {
                    return Self::run_call(rest, env);
                }
                ["return", token] => {
                    return Ok(ScriptValue::Bytes(Self::resolve_token(token, env)?));
                }
                _ => return Err(format!("unknown statement '{statement}'")),
            }
        }
        Ok(result)
    }
}

impl BasicEngine {
    fn run_call(tokens: &[&str], env: &mut ScriptEnv<'_>) -> Result<ScriptValue, String> {
        if tokens.is_empty() {
            return Err("call needs a command name".to_owned());
        }
        let mut argv = Vec::with_capacity(tokens.len());
        for token in tokens {
            argv.push(Self::resolve_token(token, env)?);
        }
        let reply = env.dispatcher.call(argv);
        if let ScriptValue::Error(message) = &reply {
            return Err(message.clone());
        }
        Ok(reply)
    }
}
