//! Network front-end: lean accept loops feeding parsed commands into the dispatcher.
//!
//! One task per connection; parsing stays at this edge and the dispatcher only ever sees
//! complete argument vectors.

use std::sync::Arc;

use efly_common::error::{EflyError, EflyResult};
use efly_facade::ClientProtocol;
use efly_facade::memcache_reply::McReplyBuilder;
use efly_facade::reply::{ReplySink, RespReplyBuilder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::memcache::{McCommandKind, MemcacheCommand};
use crate::service::Service;

/// Binds the configured listeners and serves until the process is stopped.
///
/// # Errors
///
/// Returns `EflyError::Io` when a listener cannot bind or an accept loop fails.
pub async fn serve(service: Arc<Service>) -> EflyResult<()> {
    let redis_port = service.config().redis_port;
    let resp_listener = bind(redis_port).await?;
    info!(port = redis_port, "resp listener ready");

    match service.config().memcached_port {
        Some(memcached_port) => {
            let mc_listener = bind(memcached_port).await?;
            info!(port = memcached_port, "memcached listener ready");
            tokio::try_join!(
                accept_loop(resp_listener, Arc::clone(&service), ClientProtocol::Resp),
                accept_loop(mc_listener, service, ClientProtocol::Memcache),
            )?;
        }
        None => accept_loop(resp_listener, service, ClientProtocol::Resp).await?,
    }
    Ok(())
}

async fn bind(port: u16) -> EflyResult<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|error| EflyError::Io(error.to_string()))
}

async fn accept_loop(
    listener: TcpListener,
    service: Arc<Service>,
    protocol: ClientProtocol,
) -> EflyResult<()> {
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|error| EflyError::Io(error.to_string()))?;
        debug!(%peer, ?protocol, "connection accepted");
        let service = Arc::clone(&service);
        let _ = tokio::spawn(async move {
            let result = match protocol {
                ClientProtocol::Resp => handle_resp_connection(service, stream).await,
                ClientProtocol::Memcache => handle_mc_connection(service, stream).await,
            };
            if let Err(error) = result {
                debug!(%peer, %error, "connection closed on error");
            }
        });
    }
}

async fn handle_resp_connection(service: Arc<Service>, mut stream: TcpStream) -> EflyResult<()> {
    let mut cntx = service.new_connection(ClientProtocol::Resp);
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0_u8; 4096];

    loop {
        loop {
            match parse_resp_command(&buf) {
                Ok(Some((argv, consumed))) => {
                    let _ = buf.drain(..consumed);
                    if argv.is_empty() {
                        continue;
                    }
                    // Dispatch suspends on shard executors and may wait out lock contention;
                    // it must not hold a shared runtime worker. The context moves with the
                    // command, so only its own thread ever mutates connection state.
                    let dispatch_service = Arc::clone(&service);
                    let mut moved_cntx = cntx;
                    let (returned_cntx, mut sink) = tokio::task::spawn_blocking(move || {
                        let mut sink = RespReplyBuilder::new();
                        dispatch_service.dispatch_command(argv, &mut moved_cntx, &mut sink);
                        (moved_cntx, sink)
                    })
                    .await
                    .map_err(|_| EflyError::InvalidState("dispatch worker is gone"))?;
                    cntx = returned_cntx;
                    let payload = sink.take_payload();
                    if !payload.is_empty() {
                        write_all(&mut stream, &payload).await?;
                    }
                    if sink.close_requested() {
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(message) => {
                    let reply = format!("-ERR Protocol error: {message}\r\n");
                    write_all(&mut stream, reply.as_bytes()).await?;
                    return Ok(());
                }
            }
        }

        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|error| EflyError::Io(error.to_string()))?;
        if read == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..read]);
    }
}

async fn handle_mc_connection(service: Arc<Service>, mut stream: TcpStream) -> EflyResult<()> {
    let mut cntx = service.new_connection(ClientProtocol::Memcache);
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0_u8; 4096];

    loop {
        loop {
            match parse_mc_command(&buf) {
                McParse::Incomplete => break,
                McParse::BadLine(consumed) => {
                    let _ = buf.drain(..consumed);
                    write_all(&mut stream, b"CLIENT_ERROR bad command line format\r\n").await?;
                }
                McParse::Command {
                    command,
                    value,
                    noreply,
                    consumed,
                } => {
                    let _ = buf.drain(..consumed);
                    // Same rule as the RESP path: translated commands run on the blocking
                    // pool so a contended lock never stalls other connections' tasks.
                    let dispatch_service = Arc::clone(&service);
                    let mut moved_cntx = cntx;
                    let (returned_cntx, mut builder) = tokio::task::spawn_blocking(move || {
                        let mut builder = McReplyBuilder::new();
                        dispatch_service.dispatch_mc(&command, &value, &mut moved_cntx, &mut builder);
                        (moved_cntx, builder)
                    })
                    .await
                    .map_err(|_| EflyError::InvalidState("dispatch worker is gone"))?;
                    cntx = returned_cntx;
                    let payload = builder.take_payload();
                    if !noreply && !payload.is_empty() {
                        write_all(&mut stream, &payload).await?;
                    }
                    if builder.close_requested() {
                        return Ok(());
                    }
                }
            }
        }

        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|error| EflyError::Io(error.to_string()))?;
        if read == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..read]);
    }
}

async fn write_all(stream: &mut TcpStream, payload: &[u8]) -> EflyResult<()> {
    stream
        .write_all(payload)
        .await
        .map_err(|error| EflyError::Io(error.to_string()))
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .windows(2)
        .position(|window| window == b"\r\n")
        .map(|position| from + position)
}

fn parse_decimal(text: &[u8]) -> Option<u64> {
    std::str::from_utf8(text).ok()?.parse::<u64>().ok()
}

/// Parses one complete RESP command from the head of `buf`.
///
/// Returns the argument vector and the number of consumed bytes, `None` when more bytes are
/// needed, or a protocol error description.
fn parse_resp_command(buf: &[u8]) -> Result<Option<(Vec<Vec<u8>>, usize)>, String> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != b'*' {
        // Inline command: whitespace-separated tokens on one line.
        let Some(line_end) = find_crlf(buf, 0) else {
            return Ok(None);
        };
        let argv = buf[..line_end]
            .split(|byte| byte.is_ascii_whitespace())
            .filter(|token| !token.is_empty())
            .map(<[u8]>::to_vec)
            .collect::<Vec<_>>();
        return Ok(Some((argv, line_end + 2)));
    }

    let Some(header_end) = find_crlf(buf, 1) else {
        return Ok(None);
    };
    let Some(arg_count) = parse_decimal(&buf[1..header_end]) else {
        return Err("invalid multibulk length".to_owned());
    };

    let mut argv = Vec::with_capacity(arg_count as usize);
    let mut cursor = header_end + 2;
    for _ in 0..arg_count {
        if cursor >= buf.len() {
            return Ok(None);
        }
        if buf[cursor] != b'$' {
            return Err("expected '$', got something else".to_owned());
        }
        let Some(len_end) = find_crlf(buf, cursor + 1) else {
            return Ok(None);
        };
        let Some(bulk_len) = parse_decimal(&buf[cursor + 1..len_end]) else {
            return Err("invalid bulk length".to_owned());
        };
        let payload_start = len_end + 2;
        let payload_end = payload_start + bulk_len as usize;
        if buf.len() < payload_end + 2 {
            return Ok(None);
        }
        if &buf[payload_end..payload_end + 2] != b"\r\n" {
            return Err("invalid bulk terminator".to_owned());
        }
        argv.push(buf[payload_start..payload_end].to_vec());
        cursor = payload_end + 2;
    }
    Ok(Some((argv, cursor)))
}

enum McParse {
    Incomplete,
    BadLine(usize),
    Command {
        command: MemcacheCommand,
        value: Vec<u8>,
        noreply: bool,
        consumed: usize,
    },
}

/// Parses one complete memcached text command (and its value line for store verbs).
fn parse_mc_command(buf: &[u8]) -> McParse {
    let Some(line_end) = find_crlf(buf, 0) else {
        return McParse::Incomplete;
    };
    let consumed_line = line_end + 2;
    let tokens = buf[..line_end]
        .split(|byte| *byte == b' ')
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>();
    let Some(verb) = tokens.first() else {
        return McParse::BadLine(consumed_line);
    };

    let store_kind = match verb.to_ascii_lowercase().as_slice() {
        b"set" => Some(McCommandKind::Set),
        b"add" => Some(McCommandKind::Add),
        b"replace" => Some(McCommandKind::Replace),
        b"append" => Some(McCommandKind::Append),
        b"prepend" => Some(McCommandKind::Prepend),
        _ => None,
    };

    if let Some(kind) = store_kind {
        // <verb> <key> <flags> <exptime> <bytes> [noreply]
        if tokens.len() < 5 {
            return McParse::BadLine(consumed_line);
        }
        let (Some(flags), Some(expire_ts), Some(bytes)) = (
            parse_decimal(tokens[2]),
            parse_decimal(tokens[3]),
            parse_decimal(tokens[4]),
        ) else {
            return McParse::BadLine(consumed_line);
        };
        let noreply = tokens.get(5).is_some_and(|token| *token == b"noreply");
        let value_end = consumed_line + bytes as usize;
        if buf.len() < value_end + 2 {
            return McParse::Incomplete;
        }
        if &buf[value_end..value_end + 2] != b"\r\n" {
            return McParse::BadLine(value_end + 2);
        }
        let command = MemcacheCommand {
            kind: Some(kind),
            key: tokens[1].to_vec(),
            flags: u32::try_from(flags).unwrap_or(u32::MAX),
            expire_ts,
            ..MemcacheCommand::default()
        };
        return McParse::Command {
            command,
            value: buf[consumed_line..value_end].to_vec(),
            noreply,
            consumed: value_end + 2,
        };
    }

    let mut command = MemcacheCommand::default();
    let mut noreply = false;
    match verb.to_ascii_lowercase().as_slice() {
        b"get" | b"gets" => {
            if tokens.len() < 2 {
                return McParse::BadLine(consumed_line);
            }
            command.kind = Some(McCommandKind::Get);
            command.key = tokens[1].to_vec();
            command.keys_ext = tokens[2..].iter().map(|token| token.to_vec()).collect();
        }
        b"delete" => {
            if tokens.len() < 2 {
                return McParse::BadLine(consumed_line);
            }
            command.kind = Some(McCommandKind::Delete);
            command.key = tokens[1].to_vec();
            noreply = tokens.get(2).is_some_and(|token| *token == b"noreply");
        }
        b"incr" | b"decr" => {
            let Some(delta) = tokens.get(2).and_then(|token| parse_decimal(token)) else {
                return McParse::BadLine(consumed_line);
            };
            command.kind = Some(if verb.eq_ignore_ascii_case(b"incr") {
                McCommandKind::Incr
            } else {
                McCommandKind::Decr
            });
            command.key = tokens[1].to_vec();
            command.delta = delta;
            noreply = tokens.get(3).is_some_and(|token| *token == b"noreply");
        }
        b"quit" => command.kind = Some(McCommandKind::Quit),
        b"stats" => command.kind = Some(McCommandKind::Stats),
        b"version" => command.kind = Some(McCommandKind::Version),
        _ => return McParse::BadLine(consumed_line),
    }

    McParse::Command {
        command,
        value: Vec::new(),
        noreply,
        consumed: consumed_line,
    }
}

#[cfg(test)]
mod tests {
    use super::{McParse, parse_mc_command, parse_resp_command};
    use crate::memcache::McCommandKind;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn resp_parser_reads_multibulk_commands() {
        let parsed = parse_resp_command(b"*2\r\n$4\r\nECHO\r\n$5\r\nhello\r\n")
            .expect("well-formed payload must parse");
        let (argv, consumed) = parsed.expect("payload is complete");
        assert_that!(consumed, eq(25_usize));
        assert_that!(argv, eq(&vec![b"ECHO".to_vec(), b"hello".to_vec()]));
    }

    #[rstest]
    fn resp_parser_waits_for_partial_payloads() {
        let parsed =
            parse_resp_command(b"*2\r\n$4\r\nECHO\r\n$5\r\nhe").expect("prefix is well-formed");
        assert_that!(parsed.is_none(), eq(true));
    }

    #[rstest]
    fn resp_parser_reads_inline_commands() {
        let parsed = parse_resp_command(b"PING extra\r\n").expect("inline line must parse");
        let (argv, consumed) = parsed.expect("line is complete");
        assert_that!(consumed, eq(12_usize));
        assert_that!(argv, eq(&vec![b"PING".to_vec(), b"extra".to_vec()]));
    }

    #[rstest]
    fn resp_parser_rejects_malformed_bulk_lengths() {
        let parsed = parse_resp_command(b"*1\r\n$A\r\nPING\r\n");
        assert_that!(parsed.is_err(), eq(true));
    }

    #[rstest]
    fn mc_parser_reads_store_commands_with_value() {
        let McParse::Command {
            command,
            value,
            noreply,
            consumed,
        } = parse_mc_command(b"add foo 7 60 3\r\nbar\r\nrest")
        else {
            panic!("store command must parse");
        };
        assert_that!(command.kind, eq(Some(McCommandKind::Add)));
        assert_that!(command.key, eq(&b"foo".to_vec()));
        assert_that!(command.flags, eq(7));
        assert_that!(command.expire_ts, eq(60_u64));
        assert_that!(value, eq(&b"bar".to_vec()));
        assert_that!(noreply, eq(false));
        assert_that!(consumed, eq(21_usize));
    }

    #[rstest]
    fn mc_parser_reads_multi_key_get() {
        let McParse::Command { command, .. } = parse_mc_command(b"get a b c\r\n") else {
            panic!("get must parse");
        };
        assert_that!(command.kind, eq(Some(McCommandKind::Get)));
        assert_that!(command.key, eq(&b"a".to_vec()));
        assert_that!(command.keys_ext, eq(&vec![b"b".to_vec(), b"c".to_vec()]));
    }

    #[rstest]
    fn mc_parser_flags_unknown_verbs() {
        assert_that!(
            matches!(parse_mc_command(b"frobnicate\r\n"), McParse::BadLine(12)),
            eq(true)
        );
    }
}
