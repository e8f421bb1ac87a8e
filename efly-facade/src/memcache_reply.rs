//! Memcached text protocol reply builder.

use crate::reply::{MGetEntry, ReplySink};

/// Reply builder emitting memcached text/status lines.
///
/// The adapter configures per-command behavior before dispatch: `delete_reply` maps the integer
/// reply of a translated `DEL` onto `DELETED`/`NOT_FOUND`. Stored-value flags travel with the
/// values themselves and surface through `send_mget_response`.
#[derive(Debug, Default)]
pub struct McReplyBuilder {
    buf: Vec<u8>,
    error: Option<String>,
    errors_sent: usize,
    close: bool,
    /// When set, integer replies are translated as delete acknowledgements.
    pub delete_reply: bool,
}

impl McReplyBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits a raw line already formatted by the caller (`VERSION ...`, stats sections).
    pub fn send_direct(&mut self, line: &str) {
        self.buf.extend_from_slice(line.as_bytes());
    }

    /// Emits `CLIENT_ERROR <msg>`.
    pub fn send_client_error(&mut self, message: &str) {
        self.buf
            .extend_from_slice(format!("CLIENT_ERROR {message}\r\n").as_bytes());
        self.error = Some(message.to_owned());
        self.errors_sent += 1;
    }

    fn put_line(&mut self, line: &str) {
        self.buf.extend_from_slice(line.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }
}

impl ReplySink for McReplyBuilder {
    fn send_simple_string(&mut self, status: &str) {
        self.put_line(status);
    }

    fn send_stored(&mut self) {
        self.put_line("STORED");
    }

    fn send_error(&mut self, message: &str) {
        self.buf
            .extend_from_slice(format!("SERVER_ERROR {message}\r\n").as_bytes());
        self.error = Some(message.to_owned());
        self.errors_sent += 1;
    }

    fn send_null(&mut self) {
        // A failed conditional store (`SET ... NX/XX`) surfaces as a null reply.
        self.put_line("NOT_STORED");
    }

    fn send_null_array(&mut self) {
        self.put_line("END");
    }

    fn send_long(&mut self, value: i64) {
        if self.delete_reply {
            self.put_line(if value > 0 { "DELETED" } else { "NOT_FOUND" });
        } else {
            self.put_line(&format!("{value}"));
        }
    }

    fn send_double(&mut self, value: f64) {
        self.put_line(&format!("{value}"));
    }

    fn send_bulk_string(&mut self, payload: &[u8]) {
        self.buf.extend_from_slice(payload);
        self.buf.extend_from_slice(b"\r\n");
    }

    fn send_simple_str_arr(&mut self, items: &[&str]) {
        for item in items {
            self.put_line(item);
        }
        self.put_line("END");
    }

    fn send_string_arr(&mut self, items: &[Vec<u8>]) {
        for item in items {
            self.send_bulk_string(item);
        }
        self.put_line("END");
    }

    fn send_mget_response(&mut self, entries: &[Option<MGetEntry>]) {
        for entry in entries.iter().flatten() {
            let key = String::from_utf8_lossy(&entry.key);
            self.buf.extend_from_slice(
                format!("VALUE {key} {} {}\r\n", entry.mc_flag, entry.value.len()).as_bytes(),
            );
            self.buf.extend_from_slice(&entry.value);
            self.buf.extend_from_slice(b"\r\n");
        }
        self.put_line("END");
    }

    fn start_array(&mut self, _len: u32) {
        // Memcached has no array framing; items follow as bare lines.
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
        std::mem::take(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::McReplyBuilder;
    use crate::reply::{MGetEntry, ReplySink};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn mc_builder_emits_value_blocks_with_flags() {
        let mut builder = McReplyBuilder::new();
        builder.send_mget_response(&[
            Some(MGetEntry {
                key: b"foo".to_vec(),
                value: b"bar".to_vec(),
                mc_flag: 5,
            }),
            None,
        ]);
        assert_that!(
            builder.take_payload(),
            eq(&b"VALUE foo 5 3\r\nbar\r\nEND\r\n".to_vec())
        );
    }

    #[rstest]
    #[case(1, b"DELETED\r\n".to_vec())]
    #[case(0, b"NOT_FOUND\r\n".to_vec())]
    fn mc_builder_translates_delete_counts(#[case] count: i64, #[case] expected: Vec<u8>) {
        let mut builder = McReplyBuilder::new();
        builder.delete_reply = true;
        builder.send_long(count);
        assert_that!(builder.take_payload(), eq(&expected));
    }

    #[rstest]
    fn mc_builder_reports_store_and_miss_lines() {
        let mut builder = McReplyBuilder::new();
        builder.send_stored();
        builder.send_null();
        assert_that!(
            builder.take_payload(),
            eq(&b"STORED\r\nNOT_STORED\r\n".to_vec())
        );
    }

    #[rstest]
    fn mc_builder_keeps_error_state() {
        let mut builder = McReplyBuilder::new();
        builder.send_client_error("bad command line format");
        assert_that!(builder.last_error(), some(eq("bad command line format")));
        assert_that!(
            builder.take_payload(),
            eq(&b"CLIENT_ERROR bad command line format\r\n".to_vec())
        );
    }
}
