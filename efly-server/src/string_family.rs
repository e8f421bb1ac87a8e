//! String command family.
//!
//! Handlers run after every dispatch gate has passed; the dispatcher has already bound the
//! transaction envelope, so each handler only parses its options and drives the envelope's
//! shard hop.

use efly_engine::containers::HotMap;
use efly_engine::shard::SetOptions;
use efly_facade::reply::{MGetEntry, ReplySink};

use crate::conn_context::ConnectionContext;
use crate::service::Service;

const INVALID_INT: &str = "value is not an integer or out of range";
const SYNTAX_ERROR: &str = "syntax error";

fn parse_i64(payload: &[u8]) -> Option<i64> {
    std::str::from_utf8(payload).ok()?.parse::<i64>().ok()
}

fn envelope(cntx: &ConnectionContext) -> std::sync::Arc<efly_transaction::Transaction> {
    cntx.transaction
        .clone()
        .expect("transactional command must carry an envelope")
}

pub(crate) fn set(
    _service: &Service,
    args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    let mut options = SetOptions {
        mc_flag: cntx.conn_state.memcache_flag,
        ..SetOptions::default()
    };

    let mut index = 3;
    while index < args.len() {
        let option = args[index].to_ascii_uppercase();
        match option.as_slice() {
            b"NX" => options.if_missing = true,
            b"XX" => options.if_exists = true,
            b"EX" | b"PX" => {
                index += 1;
                let Some(ttl) = args.get(index).and_then(|arg| parse_i64(arg)) else {
                    return sink.send_error(INVALID_INT);
                };
                if ttl <= 0 {
                    return sink.send_error("invalid expire time in 'set' command");
                }
                let millis = if option.as_slice() == b"EX" {
                    ttl.saturating_mul(1000)
                } else {
                    ttl
                };
                options.expire_ms = Some(millis as u64);
            }
            _ => return sink.send_error(SYNTAX_ERROR),
        }
        index += 1;
    }

    let value = args[2].clone();
    let tx = envelope(cntx);
    let result = tx.run_on_shards(move |shard, db, keys| {
        keys.first()
            .map(|key| shard.db_slice(db).set(key, value.clone(), options))
            .unwrap_or(false)
    });
    match result {
        Ok(stored) if stored.iter().any(|written| *written) => sink.send_stored(),
        Ok(_) => sink.send_null(),
        Err(error) => sink.send_error(&error.to_string()),
    }
}

pub(crate) fn setnx(
    _service: &Service,
    args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    let options = SetOptions {
        if_missing: true,
        mc_flag: cntx.conn_state.memcache_flag,
        ..SetOptions::default()
    };
    let value = args[2].clone();
    let tx = envelope(cntx);
    let result = tx.run_on_shards(move |shard, db, keys| {
        keys.first()
            .map(|key| shard.db_slice(db).set(key, value.clone(), options))
            .unwrap_or(false)
    });
    match result {
        Ok(stored) => sink.send_long(i64::from(stored.iter().any(|written| *written))),
        Err(error) => sink.send_error(&error.to_string()),
    }
}

pub(crate) fn get(
    _service: &Service,
    _args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    let tx = envelope(cntx);
    let result = tx.run_on_shards(|shard, db, keys| {
        keys.first()
            .and_then(|key| shard.db_slice(db).get(key).map(|value| value.data.clone()))
    });
    match result {
        Ok(found) => match found.into_iter().flatten().next() {
            Some(value) => sink.send_bulk_string(&value),
            None => sink.send_null(),
        },
        Err(error) => sink.send_error(&error.to_string()),
    }
}

pub(crate) fn mget(
    _service: &Service,
    args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    let tx = envelope(cntx);
    let result = tx.run_on_shards(|shard, db, keys| {
        keys.into_iter()
            .map(|key| {
                let found = shard
                    .db_slice(db)
                    .get(&key)
                    .map(|value| (value.data.clone(), value.mc_flag));
                (key, found)
            })
            .collect::<Vec<_>>()
    });
    let per_key = match result {
        Ok(shard_results) => {
            let mut by_key = HotMap::new();
            for (key, found) in shard_results.into_iter().flatten() {
                let _ = by_key.insert(key, found);
            }
            by_key
        }
        Err(error) => return sink.send_error(&error.to_string()),
    };

    let entries = args[1..]
        .iter()
        .map(|key| {
            per_key.get(key).cloned().flatten().map(|(value, mc_flag)| MGetEntry {
                key: key.clone(),
                value,
                mc_flag,
            })
        })
        .collect::<Vec<_>>();
    sink.send_mget_response(&entries);
}

pub(crate) fn mset(
    _service: &Service,
    args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    let mut pairs = HotMap::new();
    for pair in args[1..].chunks_exact(2) {
        // The last occurrence of a duplicated key wins.
        let _ = pairs.insert(pair[0].clone(), pair[1].clone());
    }
    let mc_flag = cntx.conn_state.memcache_flag;
    let tx = envelope(cntx);
    let result = tx.run_on_shards(move |shard, db, keys| {
        for key in keys {
            if let Some(value) = pairs.get(&key) {
                let options = SetOptions {
                    mc_flag,
                    ..SetOptions::default()
                };
                let _ = shard.db_slice(db).set(&key, value.clone(), options);
            }
        }
    });
    match result {
        Ok(_) => sink.send_ok(),
        Err(error) => sink.send_error(&error.to_string()),
    }
}

fn concat_cmd(args: &[Vec<u8>], cntx: &mut ConnectionContext, sink: &mut dyn ReplySink, front: bool) {
    let payload = args[2].clone();
    let tx = envelope(cntx);
    let result = tx.run_on_shards(move |shard, db, keys| {
        keys.first()
            .map(|key| shard.db_slice(db).concat(key, &payload, front))
            .unwrap_or(0)
    });
    match result {
        Ok(lengths) => {
            let length = lengths.first().copied().unwrap_or(0);
            sink.send_long(i64::try_from(length).unwrap_or(i64::MAX));
        }
        Err(error) => sink.send_error(&error.to_string()),
    }
}

pub(crate) fn append(
    _service: &Service,
    args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    concat_cmd(args, cntx, sink, false);
}

pub(crate) fn prepend(
    _service: &Service,
    args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    concat_cmd(args, cntx, sink, true);
}

pub(crate) fn strlen(
    _service: &Service,
    _args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    let tx = envelope(cntx);
    let result = tx.run_on_shards(|shard, db, keys| {
        keys.first()
            .and_then(|key| shard.db_slice(db).get(key).map(|value| value.data.len()))
            .unwrap_or(0)
    });
    match result {
        Ok(lengths) => {
            let length = lengths.first().copied().unwrap_or(0);
            sink.send_long(i64::try_from(length).unwrap_or(i64::MAX));
        }
        Err(error) => sink.send_error(&error.to_string()),
    }
}

fn incr_cmd(delta: i64, cntx: &mut ConnectionContext, sink: &mut dyn ReplySink) {
    let tx = envelope(cntx);
    let result = tx.run_on_shards(move |shard, db, keys| {
        keys.first()
            .map(|key| shard.db_slice(db).incr_by(key, delta))
            .unwrap_or(Ok(0))
    });
    match result {
        Ok(outcomes) => match outcomes.into_iter().next() {
            Some(Ok(value)) => sink.send_long(value),
            Some(Err(message)) => sink.send_error(message),
            None => sink.send_long(0),
        },
        Err(error) => sink.send_error(&error.to_string()),
    }
}

pub(crate) fn incr(
    _service: &Service,
    _args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    incr_cmd(1, cntx, sink);
}

pub(crate) fn decr(
    _service: &Service,
    _args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    incr_cmd(-1, cntx, sink);
}

pub(crate) fn incrby(
    _service: &Service,
    args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    let Some(delta) = parse_i64(&args[2]) else {
        return sink.send_error(INVALID_INT);
    };
    incr_cmd(delta, cntx, sink);
}

pub(crate) fn decrby(
    _service: &Service,
    args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    let Some(delta) = parse_i64(&args[2]).and_then(i64::checked_neg) else {
        return sink.send_error(INVALID_INT);
    };
    incr_cmd(delta, cntx, sink);
}
