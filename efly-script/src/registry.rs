//! Process-wide script registry.

use hashbrown::HashMap;
use parking_lot::RwLock;

/// Concurrent digest-to-body map shared by every thread.
///
/// Written on successful `EVAL` compiles so any thread can later resolve an `EVALSHA` that its
/// own interpreter has not seen. Insert-only in normal operation.
#[derive(Debug, Default)]
pub struct ScriptRegistry {
    scripts: RwLock<HashMap<String, String>>,
}

impl ScriptRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a compiled script body under its digest.
    pub fn insert_function(&self, sha: &str, body: &str) {
        let _ = self
            .scripts
            .write()
            .insert(sha.to_owned(), body.to_owned());
    }

    /// Resolves a digest to its body.
    #[must_use]
    pub fn find(&self, sha: &str) -> Option<String> {
        self.scripts.read().get(sha).cloned()
    }

    /// Number of registered scripts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scripts.read().len()
    }

    /// Returns whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scripts.read().is_empty()
    }
}
