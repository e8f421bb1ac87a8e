//! Structured script values exchanged between the interpreter and the dispatcher.

use efly_facade::explore::ObjectExplorer;

/// Maximum result-tree depth the interpreter will serialize.
pub const MAX_RESULT_DEPTH: usize = 128;

/// One value in a script result tree or a captured nested-call reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    /// Missing value.
    Nil,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Double.
    Double(f64),
    /// Binary string.
    Bytes(Vec<u8>),
    /// Status (`+OK` style).
    Status(String),
    /// Error.
    Error(String),
    /// Array of child values.
    Array(Vec<ScriptValue>),
}

impl ScriptValue {
    /// Depth of the deepest nesting in this value.
    #[must_use]
    pub fn depth(&self) -> usize {
        match self {
            Self::Array(items) => 1 + items.iter().map(Self::depth).max().unwrap_or(0),
            _ => 1,
        }
    }

    /// Walks this value, emitting tree-walker events on `explorer`.
    pub fn explore(&self, explorer: &mut dyn ObjectExplorer) {
        match self {
            Self::Nil => explorer.on_nil(),
            Self::Bool(value) => explorer.on_bool(*value),
            Self::Int(value) => explorer.on_int(*value),
            Self::Double(value) => explorer.on_double(*value),
            Self::Bytes(value) => explorer.on_string(value),
            Self::Status(status) => explorer.on_status(status),
            Self::Error(message) => explorer.on_error(message),
            Self::Array(items) => {
                explorer.on_array_start(u32::try_from(items.len()).unwrap_or(u32::MAX));
                for item in items {
                    item.explore(explorer);
                }
                explorer.on_array_end();
            }
        }
    }
}

/// [`ObjectExplorer`] that rebuilds the event stream into a [`ScriptValue`].
///
/// The capturing reply sink drives this while a nested command runs, so the script observes the
/// reply as one structured value.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    stack: Vec<Vec<ScriptValue>>,
    root: Option<ScriptValue>,
}

impl TreeBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, value: ScriptValue) {
        if let Some(open_array) = self.stack.last_mut() {
            open_array.push(value);
        } else if self.root.is_none() {
            self.root = Some(value);
        }
    }

    /// Takes the finished value, defaulting to nil when nothing was emitted.
    #[must_use]
    pub fn take(&mut self) -> ScriptValue {
        while let Some(items) = self.stack.pop() {
            // Unbalanced arrays are closed as-is.
            self.push(ScriptValue::Array(items));
        }
        self.root.take().unwrap_or(ScriptValue::Nil)
    }
}

impl ObjectExplorer for TreeBuilder {
    fn on_bool(&mut self, value: bool) {
        self.push(ScriptValue::Bool(value));
    }

    fn on_string(&mut self, value: &[u8]) {
        self.push(ScriptValue::Bytes(value.to_vec()));
    }

    fn on_double(&mut self, value: f64) {
        self.push(ScriptValue::Double(value));
    }

    fn on_int(&mut self, value: i64) {
        self.push(ScriptValue::Int(value));
    }

    fn on_array_start(&mut self, _len: u32) {
        self.stack.push(Vec::new());
    }

    fn on_array_end(&mut self) {
        if let Some(items) = self.stack.pop() {
            self.push(ScriptValue::Array(items));
        }
    }

    fn on_nil(&mut self) {
        self.push(ScriptValue::Nil);
    }

    fn on_status(&mut self, status: &str) {
        self.push(ScriptValue::Status(status.to_owned()));
    }

    fn on_error(&mut self, message: &str) {
        self.push(ScriptValue::Error(message.to_owned()));
    }
}

#[cfg(test)]
mod tests {
    use super::{ScriptValue, TreeBuilder};
    use efly_facade::explore::ObjectExplorer;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn tree_builder_rebuilds_nested_arrays() {
        let mut builder = TreeBuilder::new();
        builder.on_array_start(2);
        builder.on_int(1);
        builder.on_array_start(1);
        builder.on_string(b"x");
        builder.on_array_end();
        builder.on_array_end();

        assert_that!(
            &builder.take(),
            eq(&ScriptValue::Array(vec![
                ScriptValue::Int(1),
                ScriptValue::Array(vec![ScriptValue::Bytes(b"x".to_vec())]),
            ]))
        );
    }

    #[rstest]
    fn tree_builder_defaults_to_nil() {
        let mut builder = TreeBuilder::new();
        assert_that!(&builder.take(), eq(&ScriptValue::Nil));
    }

    #[rstest]
    fn value_depth_counts_nesting() {
        let value = ScriptValue::Array(vec![ScriptValue::Array(vec![ScriptValue::Int(1)])]);
        assert_that!(value.depth(), eq(3_usize));
        assert_that!(ScriptValue::Int(1).depth(), eq(1_usize));
    }
}
