//! Capturing reply sink used for commands invoked from inside a script.
//!
//! Instead of serializing, every send drives an [`ObjectExplorer`] so the interpreter observes
//! the reply as a structured value tree.

use crate::explore::ObjectExplorer;
use crate::reply::{MGetEntry, ReplySink};

/// Reply sink that rebuilds replies as a value tree on an [`ObjectExplorer`].
///
/// Array replies arrive as `start_array(n)` followed by `n` element sends; the builder keeps a
/// stack of `(saved_count, expected_count)` frames and closes each array exactly when its element
/// count is reached, propagating closure to parents that become complete.
pub struct CapturingReplyBuilder<'a> {
    explorer: &'a mut dyn ObjectExplorer,
    frames: Vec<(u32, u32)>,
    num_elems: u32,
    error: Option<String>,
    errors_sent: usize,
    close: bool,
}

impl<'a> CapturingReplyBuilder<'a> {
    /// Wraps an explorer for the duration of one nested dispatch.
    pub fn new(explorer: &'a mut dyn ObjectExplorer) -> Self {
        Self {
            explorer,
            frames: Vec::new(),
            num_elems: 0,
            error: None,
            errors_sent: 0,
            close: false,
        }
    }

    fn post_item(&mut self) {
        self.num_elems += 1;
        if self.frames.is_empty() {
            return;
        }
        while let Some(&(saved, expected)) = self.frames.last() {
            if self.num_elems != expected {
                break;
            }
            self.num_elems = saved;
            self.explorer.on_array_end();
            self.frames.pop();
        }
    }

    fn in_array(&self) -> bool {
        !self.frames.is_empty()
    }
}

impl std::fmt::Debug for CapturingReplyBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturingReplyBuilder")
            .field("frames", &self.frames)
            .field("num_elems", &self.num_elems)
            .field("error", &self.error)
            .finish()
    }
}

impl ReplySink for CapturingReplyBuilder<'_> {
    fn send_simple_string(&mut self, status: &str) {
        if self.in_array() {
            self.explorer.on_string(status.as_bytes());
        } else {
            self.explorer.on_status(status);
        }
        self.post_item();
    }

    fn send_stored(&mut self) {
        self.send_simple_string("OK");
    }

    fn send_error(&mut self, message: &str) {
        if self.in_array() {
            self.explorer.on_string(message.as_bytes());
            self.post_item();
        } else {
            self.explorer.on_error(message);
        }
        self.error = Some(message.to_owned());
        self.errors_sent += 1;
    }

    fn send_null(&mut self) {
        self.explorer.on_nil();
        self.post_item();
    }

    fn send_null_array(&mut self) {
        self.explorer.on_array_start(0);
        self.explorer.on_array_end();
        self.post_item();
    }

    fn send_long(&mut self, value: i64) {
        self.explorer.on_int(value);
        self.post_item();
    }

    fn send_double(&mut self, value: f64) {
        self.explorer.on_double(value);
        self.post_item();
    }

    fn send_bulk_string(&mut self, payload: &[u8]) {
        self.explorer.on_string(payload);
        self.post_item();
    }

    fn send_simple_str_arr(&mut self, items: &[&str]) {
        self.explorer
            .on_array_start(u32::try_from(items.len()).unwrap_or(u32::MAX));
        for item in items {
            self.explorer.on_string(item.as_bytes());
        }
        self.explorer.on_array_end();
        self.post_item();
    }

    fn send_string_arr(&mut self, items: &[Vec<u8>]) {
        self.explorer
            .on_array_start(u32::try_from(items.len()).unwrap_or(u32::MAX));
        for item in items {
            self.explorer.on_string(item);
        }
        self.explorer.on_array_end();
        self.post_item();
    }

    fn send_mget_response(&mut self, entries: &[Option<MGetEntry>]) {
        // MGET is always delivered flattened, whatever the nesting level.
        self.explorer
            .on_array_start(u32::try_from(entries.len()).unwrap_or(u32::MAX));
        for entry in entries {
            match entry {
                Some(found) => self.explorer.on_string(&found.value),
                None => self.explorer.on_nil(),
            }
        }
        self.explorer.on_array_end();
        self.post_item();
    }

    fn start_array(&mut self, len: u32) {
        self.explorer.on_array_start(len);
        if len == 0 {
            self.explorer.on_array_end();
            self.post_item();
        } else {
            self.frames.push((self.num_elems + 1, len));
            self.num_elems = 0;
        }
    }

    fn close_connection(&mut self) {
        self.close = true;
    }

    fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn error_count(&self) -> usize {
        self.errors_sent
    }

    fn close_requested(&self) -> bool {
        self.close
    }

    fn take_payload(&mut self) -> Vec<u8> {
        Vec::new()
    }
}
