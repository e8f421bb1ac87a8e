//! Connection and server-level commands.

use efly_facade::ClientProtocol;
use efly_facade::reply::ReplySink;

use crate::conn_context::{ConnectionContext, auth};
use crate::server_state::GlobalStateKind;
use crate::service::{Service, wrong_num_args};

pub(crate) fn ping(
    _service: &Service,
    args: &[Vec<u8>],
    _cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    match args.len() {
        1 => sink.send_simple_string("PONG"),
        2 => sink.send_bulk_string(&args[1]),
        _ => sink.send_error(&wrong_num_args("PING")),
    }
}

pub(crate) fn echo(
    _service: &Service,
    args: &[Vec<u8>],
    _cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    sink.send_bulk_string(&args[1]);
}

pub(crate) fn auth(
    service: &Service,
    args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    if !service.is_pass_protected() {
        return sink.send_error("Client sent AUTH, but no password is set.");
    }
    let expected = service.config().requirepass.as_deref().unwrap_or_default();
    if args[1] == expected.as_bytes() {
        cntx.conn_state.auth_mask |= auth::AUTHENTICATED;
        sink.send_ok();
    } else {
        sink.send_error("invalid password");
    }
}

pub(crate) fn select(
    _service: &Service,
    args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    let parsed = std::str::from_utf8(&args[1])
        .ok()
        .and_then(|text| text.parse::<i64>().ok());
    let Some(index) = parsed else {
        return sink.send_error("value is not an integer or out of range");
    };
    let Ok(db_index) = u16::try_from(index) else {
        return sink.send_error("DB index is out of range");
    };
    cntx.conn_state.db_index = db_index;
    sink.send_ok();
}

pub(crate) fn quit(
    _service: &Service,
    _args: &[Vec<u8>],
    cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    if cntx.protocol == ClientProtocol::Resp {
        sink.send_ok();
    }
    sink.close_connection();
}

pub(crate) fn shutdown(
    service: &Service,
    _args: &[Vec<u8>],
    _cntx: &mut ConnectionContext,
    sink: &mut dyn ReplySink,
) {
    let (_, switched) = service.global_state().next(GlobalStateKind::ShuttingDown);
    if !switched {
        return sink.send_error("shutdown is already in progress");
    }
    sink.send_ok();
    sink.close_connection();
}
