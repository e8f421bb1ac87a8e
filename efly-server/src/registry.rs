//! Runtime command registry.

use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{info, warn};

use crate::command::CommandId;

/// Name-keyed command table.
///
/// Registration happens once at startup; after the service goes active the table is only read.
/// Names are stored upper-case and the dispatcher upper-cases the incoming command name, which
/// makes lookup case-insensitive.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    entries: HashMap<&'static str, Arc<CommandId>>,
}

impl CommandRegistry {
    /// Builds an empty command registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registers one command in the table.
    pub fn register(&mut self, cid: CommandId) {
        let name = cid.name();
        if self.entries.insert(name, Arc::new(cid)).is_some() {
            warn!(command = name, "command registered twice, keeping the last entry");
        }
    }

    /// Resolves an upper-cased command name to its descriptor.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<CommandId>> {
        self.entries.get(name).cloned()
    }

    /// Visits every descriptor.
    pub fn traverse(&self, mut visitor: impl FnMut(&CommandId)) {
        for cid in self.entries.values() {
            visitor(cid);
        }
    }

    /// Number of registered commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Logs the multi-key commands at startup.
    pub fn log_multi_key_commands(&self) {
        self.traverse(|cid| {
            if cid.is_multi_key() {
                let key_len = if cid.last_key_pos() < 0 {
                    "unlimited".to_owned()
                } else {
                    format!("{}", cid.last_key_pos() as u32 - cid.first_key_pos() + 1)
                };
                info!(command = cid.name(), keys = %key_len, "multi-key command");
            }
        });
    }
}
