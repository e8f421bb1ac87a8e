//! Structured-value tree walker driven by the capturing reply sink.

/// Observer interface for reply values delivered as a structured tree instead of wire bytes.
///
/// The scripting interpreter implements this to receive the result of nested command calls as
/// values it can hand to the script.
pub trait ObjectExplorer {
    /// Boolean leaf.
    fn on_bool(&mut self, value: bool);
    /// Binary string leaf.
    fn on_string(&mut self, value: &[u8]);
    /// Double leaf.
    fn on_double(&mut self, value: f64);
    /// Integer leaf.
    fn on_int(&mut self, value: i64);
    /// Opens an array of `len` children.
    fn on_array_start(&mut self, len: u32);
    /// Closes the innermost open array.
    fn on_array_end(&mut self);
    /// Missing value leaf.
    fn on_nil(&mut self);
    /// Status (`+OK` style) leaf.
    fn on_status(&mut self, status: &str);
    /// Error leaf.
    fn on_error(&mut self, message: &str);
}
