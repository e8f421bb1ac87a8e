//! Scripting support: script identity, the process-wide registry, the per-thread interpreter,
//! and the structured result tree exchanged with the dispatcher.

pub mod digest;
pub mod engine;
pub mod interpreter;
pub mod registry;
pub mod value;

pub use digest::{is_sha_digest, script_digest};
pub use engine::{BasicEngine, CommandDispatcher, ScriptEngine, ScriptEnv};
pub use interpreter::{AddResult, Interpreter, RunResult};
pub use registry::ScriptRegistry;
pub use value::{ScriptValue, TreeBuilder};
