//! Generic (keyspace) command family.

use efly_facade::reply::ReplySink;

use crate::conn_context::ConnectionContext;
use crate::service::Service;

fn envelope(cntx: &ConnectionContext) -> std::sync::Arc<efly_transaction::Transaction> {
    cntx.transaction
        .clone()
        .expect("transactional command must carry an envelope")
}

pub(crate) fn del(
    _service: &Service,
    _args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    let tx = envelope(cntx);
    let result = tx.run_on_shards(|shard, db, keys| {
        keys.iter()
            .filter(|key| shard.db_slice(db).del(key))
            .count()
    });
    match result {
        Ok(counts) => {
            let removed = counts.iter().sum::<usize>();
            sink.send_long(i64::try_from(removed).unwrap_or(i64::MAX));
        }
        Err(error) => sink.send_error(&error.to_string()),
    }
}

pub(crate) fn exists(
    _service: &Service,
    _args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    let tx = envelope(cntx);
    let result = tx.run_on_shards(|shard, db, keys| {
        keys.iter()
            .filter(|key| shard.db_slice(db).exists(key))
            .count()
    });
    match result {
        Ok(counts) => {
            let live = counts.iter().sum::<usize>();
            sink.send_long(i64::try_from(live).unwrap_or(i64::MAX));
        }
        Err(error) => sink.send_error(&error.to_string()),
    }
}
