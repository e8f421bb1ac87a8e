//! Reply sink capability trait and the RESP builder.

/// One resolved `MGET` position: key, stored payload, and the memcached flag recorded at store
/// time (echoed by the memcached builder, ignored by RESP).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MGetEntry {
    /// Key bytes as requested by the client.
    pub key: Vec<u8>,
    /// Stored value payload.
    pub value: Vec<u8>,
    /// Memcached flag recorded when the value was stored.
    pub mc_flag: u32,
}

/// Polymorphic reply sink.
///
/// Three concrete variants exist: [`RespReplyBuilder`], the memcached text builder, and the
/// capturing builder used for nested calls issued from scripts. The dispatcher never serializes
/// directly; every reply goes through this capability set.
pub trait ReplySink {
    /// Emits a `+...` status line.
    fn send_simple_string(&mut self, status: &str);

    /// Emits the protocol's "stored" acknowledgement (`+OK` / `STORED`).
    fn send_stored(&mut self);

    /// Emits `+OK`.
    fn send_ok(&mut self) {
        self.send_simple_string("OK");
    }

    /// Emits an error reply and records it for [`ReplySink::last_error`].
    fn send_error(&mut self, message: &str);

    /// Emits a null bulk value.
    fn send_null(&mut self);

    /// Emits a null array.
    fn send_null_array(&mut self);

    /// Emits an integer reply.
    fn send_long(&mut self, value: i64);

    /// Emits a double reply.
    fn send_double(&mut self, value: f64);

    /// Emits a binary-safe bulk payload.
    fn send_bulk_string(&mut self, payload: &[u8]);

    /// Emits an array of status strings.
    fn send_simple_str_arr(&mut self, items: &[&str]);

    /// Emits an array of bulk strings.
    fn send_string_arr(&mut self, items: &[Vec<u8>]);

    /// Emits one `MGET` response: per-position value or miss.
    fn send_mget_response(&mut self, entries: &[Option<MGetEntry>]);

    /// Opens an array of `len` elements; subsequent sends fill it.
    fn start_array(&mut self, len: u32);

    /// Requests connection teardown after the current payload is flushed.
    fn close_connection(&mut self);

    /// Last error emitted on this sink, if any.
    fn last_error(&self) -> Option<&str>;

    /// Number of errors emitted on this sink so far.
    fn error_count(&self) -> usize;

    /// Whether [`ReplySink::close_connection`] was requested.
    fn close_requested(&self) -> bool;

    /// Drains the serialized payload accumulated so far.
    fn take_payload(&mut self) -> Vec<u8>;
}

/// RESP wire builder for Redis clients.
#[derive(Debug, Default)]
pub struct RespReplyBuilder {
    buf: Vec<u8>,
    error: Option<String>,
    errors_sent: usize,
    close: bool,
}

impl RespReplyBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn put_bulk(&mut self, payload: &[u8]) {
        self.buf
            .extend_from_slice(format!("${}\r\n", payload.len()).as_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.extend_from_slice(b"\r\n");
    }
}

impl ReplySink for RespReplyBuilder {
    fn send_simple_string(&mut self, status: &str) {
        self.buf.extend_from_slice(b"+");
        self.buf.extend_from_slice(status.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    fn send_stored(&mut self) {
        self.send_simple_string("OK");
    }

    fn send_error(&mut self, message: &str) {
        // Messages carrying their own error code token (`-NOAUTH ...`) pass through verbatim.
        if message.starts_with('-') {
            self.buf.extend_from_slice(message.as_bytes());
        } else {
            self.buf.extend_from_slice(b"-ERR ");
            self.buf.extend_from_slice(message.as_bytes());
        }
        self.buf.extend_from_slice(b"\r\n");
        self.error = Some(message.to_owned());
        self.errors_sent += 1;
    }

    fn send_null(&mut self) {
        self.buf.extend_from_slice(b"$-1\r\n");
    }

    fn send_null_array(&mut self) {
        self.buf.extend_from_slice(b"*-1\r\n");
    }

    fn send_long(&mut self, value: i64) {
        self.buf
            .extend_from_slice(format!(":{value}\r\n").as_bytes());
    }

    fn send_double(&mut self, value: f64) {
        self.put_bulk(format!("{value}").as_bytes());
    }

    fn send_bulk_string(&mut self, payload: &[u8]) {
        self.put_bulk(payload);
    }

    fn send_simple_str_arr(&mut self, items: &[&str]) {
        self.start_array(u32::try_from(items.len()).unwrap_or(u32::MAX));
        for item in items {
            self.send_simple_string(item);
        }
    }

    fn send_string_arr(&mut self, items: &[Vec<u8>]) {
        self.start_array(u32::try_from(items.len()).unwrap_or(u32::MAX));
        for item in items {
            self.put_bulk(item);
        }
    }

    fn send_mget_response(&mut self, entries: &[Option<MGetEntry>]) {
        self.start_array(u32::try_from(entries.len()).unwrap_or(u32::MAX));
        for entry in entries {
            match entry {
                Some(found) => self.put_bulk(&found.value),
                None => self.send_null(),
            }
        }
    }

    fn start_array(&mut self, len: u32) {
        self.buf.extend_from_slice(format!("*{len}\r\n").as_bytes());
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
    use super::{MGetEntry, ReplySink, RespReplyBuilder};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn resp_builder_encodes_scalar_replies() {
        let mut builder = RespReplyBuilder::new();
        builder.send_ok();
        builder.send_long(42);
        builder.send_bulk_string(b"payload");
        builder.send_null();

        let payload = builder.take_payload();
        assert_that!(
            payload,
            eq(&b"+OK\r\n:42\r\n$7\r\npayload\r\n$-1\r\n".to_vec())
        );
    }

    #[rstest]
    fn resp_builder_prefixes_plain_error_messages() {
        let mut builder = RespReplyBuilder::new();
        builder.send_error("unknown command `FOO`");
        assert_that!(
            builder.take_payload(),
            eq(&b"-ERR unknown command `FOO`\r\n".to_vec())
        );
    }

    #[rstest]
    fn resp_builder_passes_coded_errors_through() {
        let mut builder = RespReplyBuilder::new();
        builder.send_error("-NOAUTH Authentication required.");
        assert_that!(
            builder.take_payload(),
            eq(&b"-NOAUTH Authentication required.\r\n".to_vec())
        );
        assert_that!(
            builder.last_error(),
            some(eq("-NOAUTH Authentication required."))
        );
    }

    #[rstest]
    fn resp_builder_encodes_mget_hits_and_misses() {
        let mut builder = RespReplyBuilder::new();
        builder.send_mget_response(&[
            Some(MGetEntry {
                key: b"a".to_vec(),
                value: b"1".to_vec(),
                mc_flag: 0,
            }),
            None,
        ]);
        assert_that!(
            builder.take_payload(),
            eq(&b"*2\r\n$1\r\n1\r\n$-1\r\n".to_vec())
        );
    }
}
