//! # TCP Server
//!
//! Accept RESP connections, parse commands, and dispatch them against the
//! shared [`Store`]. Pipelined requests are answered in arrival order.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::protocol::{RespError, RespParser};
use crate::store::{SetCondition, Store};

/// Per-connection state.
#[derive(Debug)]
struct Session {
    db: usize,
    authenticated: bool,
    protocol: u8,
}

impl Session {
    fn new(store: &Store) -> Self {
        Session {
            db: 0,
            authenticated: store.password().is_none(),
            protocol: 2,
        }
    }
}

/// Accepts connections until the listener fails.
pub async fn serve(listener: TcpListener, store: Arc<Store>) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!(%peer, "accepted connection");
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, store).await {
                debug!(%peer, error = %err, "connection closed with error");
            }
        });
    }
}

/// Handles a single client connection.
pub async fn handle_connection<S>(mut stream: S, store: Arc<Store>) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut parser = RespParser::new();
    let mut session = Session::new(&store);
    let mut out = Vec::with_capacity(1024);

    loop {
        let bytes = stream.read_buf(&mut buffer).await?;
        if bytes == 0 {
            break;
        }

        // Drain every complete command, then flush the replies in one write.
        loop {
            match parser.parse(&mut buffer) {
                Ok(Some(args)) => {
                    out.extend_from_slice(&dispatch_command(&args, &store, &mut session));
                }
                Ok(None) => break,
                Err(RespError::Protocol) => {
                    warn!("protocol error, closing connection");
                    out.extend_from_slice(&resp_error("ERR", "protocol error"));
                    stream.write_all(&out).await?;
                    return Ok(());
                }
            }
        }
        if !out.is_empty() {
            stream.write_all(&out).await?;
            out.clear();
        }
    }

    Ok(())
}

fn dispatch_command(args: &[Vec<u8>], store: &Store, session: &mut Session) -> Vec<u8> {
    let Some(cmd) = args.first() else {
        return resp_error("ERR", "empty command");
    };
    store.record(cmd);
    let name = cmd.to_ascii_uppercase();

    match name.as_slice() {
        b"AUTH" => return handle_auth(args, store, session),
        b"HELLO" => return handle_hello(args, store, session),
        b"PING" if session.authenticated => return handle_ping(args),
        _ => {}
    }
    if !session.authenticated {
        return resp_error("NOAUTH", "Authentication required.");
    }

    match name.as_slice() {
        b"SELECT" => handle_select(args, store, session),
        b"GET" => handle_get(args, store, session),
        b"SET" => handle_set(args, store, session),
        b"SETNX" => handle_setnx(args, store, session),
        b"SETEX" => handle_setex(args, store, session),
        b"EXPIRE" => handle_expire(args, store, session),
        b"TTL" => handle_ttl(args, store, session),
        b"INCR" => handle_incr(args, store, session, None),
        b"INCRBY" => handle_incr(args, store, session, Some(2)),
        b"DEL" => handle_del(args, store, session),
        b"EXISTS" => handle_exists(args, store, session),
        b"KEYS" => handle_keys(args, store, session),
        b"RENAME" => handle_rename(args, store, session),
        b"FLUSHDB" => handle_flushdb(args, store, session),
        b"MGET" => handle_mget(args, store, session),
        b"DBSIZE" => handle_dbsize(args, store, session),
        _ => resp_error(
            "ERR",
            &format!("unknown command '{}'", String::from_utf8_lossy(cmd)),
        ),
    }
}

fn handle_ping(args: &[Vec<u8>]) -> Vec<u8> {
    match args.len() {
        1 => resp_simple("PONG"),
        2 => resp_bulk(&args[1]),
        _ => wrong_arity("ping"),
    }
}

fn handle_auth(args: &[Vec<u8>], store: &Store, session: &mut Session) -> Vec<u8> {
    let password = match args.len() {
        2 => &args[1],
        3 => &args[2],
        _ => return wrong_arity("auth"),
    };
    match store.password() {
        None => resp_error("ERR", "AUTH called without any password configured"),
        Some(expected) if expected.as_bytes() == password.as_slice() => {
            session.authenticated = true;
            resp_simple("OK")
        }
        Some(_) => resp_error("WRONGPASS", "invalid username-password pair"),
    }
}

/// `HELLO [protover [AUTH user pass]]`; replies with the server map.
fn handle_hello(args: &[Vec<u8>], store: &Store, session: &mut Session) -> Vec<u8> {
    let mut protocol = session.protocol;
    if let Some(version) = args.get(1) {
        match parse_i64(version) {
            Ok(2) => protocol = 2,
            Ok(3) => protocol = 3,
            _ => return resp_error("NOPROTO", "unsupported protocol version"),
        }
    }
    match args.len() {
        1 | 2 => {}
        5 if args[2].eq_ignore_ascii_case(b"AUTH") => {
            let auth = handle_auth(&args[2..], store, session);
            if auth.first() == Some(&b'-') {
                return auth;
            }
        }
        _ => return resp_error("ERR", "syntax error in HELLO"),
    }
    if !session.authenticated {
        return resp_error("NOAUTH", "HELLO must be called with the client already authenticated");
    }
    session.protocol = protocol;

    let fields: [(&[u8], Vec<u8>); 3] = [
        (b"server", resp_bulk(b"skv-node")),
        (b"version", resp_bulk(env!("CARGO_PKG_VERSION").as_bytes())),
        (b"proto", resp_integer(i64::from(protocol))),
    ];
    let mut reply = if protocol == 3 {
        format!("%{}\r\n", fields.len()).into_bytes()
    } else {
        format!("*{}\r\n", fields.len() * 2).into_bytes()
    };
    for (name, value) in fields {
        reply.extend_from_slice(&resp_bulk(name));
        reply.extend_from_slice(&value);
    }
    reply
}

fn handle_select(args: &[Vec<u8>], store: &Store, session: &mut Session) -> Vec<u8> {
    if args.len() != 2 {
        return wrong_arity("select");
    }
    match parse_i64(&args[1]) {
        Ok(db) if db >= 0 && (db as usize) < store.databases() => {
            session.db = db as usize;
            resp_simple("OK")
        }
        Ok(_) => resp_error("ERR", "DB index is out of range"),
        Err(resp) => resp,
    }
}

fn handle_get(args: &[Vec<u8>], store: &Store, session: &Session) -> Vec<u8> {
    if args.len() != 2 {
        return wrong_arity("get");
    }
    match store.get(session.db, &args[1]) {
        Some(value) => resp_bulk(&value),
        None => resp_null(session),
    }
}

/// `SET key value [NX|XX] [EX seconds|PX milliseconds]`
fn handle_set(args: &[Vec<u8>], store: &Store, session: &Session) -> Vec<u8> {
    if args.len() < 3 {
        return wrong_arity("set");
    }

    let mut condition = SetCondition::Always;
    let mut ttl = None;
    let mut i = 3;
    while i < args.len() {
        let option = args[i].to_ascii_uppercase();
        match option.as_slice() {
            b"NX" if condition == SetCondition::Always => condition = SetCondition::IfAbsent,
            b"XX" if condition == SetCondition::Always => condition = SetCondition::IfPresent,
            b"EX" | b"PX" if ttl.is_none() && i + 1 < args.len() => {
                let amount = match parse_i64(&args[i + 1]) {
                    Ok(amount) if amount > 0 => amount as u64,
                    Ok(_) => return resp_error("ERR", "invalid expire time in 'set' command"),
                    Err(resp) => return resp,
                };
                ttl = Some(if option == b"EX" {
                    Duration::from_secs(amount)
                } else {
                    Duration::from_millis(amount)
                });
                i += 1;
            }
            _ => return resp_error("ERR", "syntax error"),
        }
        i += 1;
    }

    match store.set(session.db, &args[1], &args[2], ttl, condition) {
        Ok(true) => resp_simple("OK"),
        Ok(false) => resp_null(session),
        Err(message) => command_error(message, "set"),
    }
}

fn handle_setnx(args: &[Vec<u8>], store: &Store, session: &Session) -> Vec<u8> {
    if args.len() != 3 {
        return wrong_arity("setnx");
    }
    match store.set(session.db, &args[1], &args[2], None, SetCondition::IfAbsent) {
        Ok(stored) => resp_integer(stored as i64),
        Err(message) => command_error(message, "setnx"),
    }
}

/// `SETEX key seconds value`
fn handle_setex(args: &[Vec<u8>], store: &Store, session: &Session) -> Vec<u8> {
    if args.len() != 4 {
        return wrong_arity("setex");
    }
    let seconds = match parse_i64(&args[2]) {
        Ok(seconds) if seconds > 0 => seconds as u64,
        Ok(_) => return resp_error("ERR", "invalid expire time in 'setex' command"),
        Err(resp) => return resp,
    };
    match store.set(
        session.db,
        &args[1],
        &args[3],
        Some(Duration::from_secs(seconds)),
        SetCondition::Always,
    ) {
        Ok(_) => resp_simple("OK"),
        Err(message) => command_error(message, "setex"),
    }
}

fn handle_expire(args: &[Vec<u8>], store: &Store, session: &Session) -> Vec<u8> {
    if args.len() != 3 {
        return wrong_arity("expire");
    }
    match parse_i64(&args[2]) {
        Ok(seconds) => match store.expire(session.db, &args[1], seconds) {
            Ok(existed) => resp_integer(existed as i64),
            Err(message) => command_error(message, "expire"),
        },
        Err(resp) => resp,
    }
}

fn handle_ttl(args: &[Vec<u8>], store: &Store, session: &Session) -> Vec<u8> {
    if args.len() != 2 {
        return wrong_arity("ttl");
    }
    resp_integer(store.ttl(session.db, &args[1]))
}

/// INCR when `delta_arg` is None, INCRBY otherwise.
fn handle_incr(args: &[Vec<u8>], store: &Store, session: &Session, delta_arg: Option<usize>) -> Vec<u8> {
    let expected = if delta_arg.is_some() { 3 } else { 2 };
    if args.len() != expected {
        return wrong_arity(if delta_arg.is_some() { "incrby" } else { "incr" });
    }
    let delta = match delta_arg {
        Some(index) => match parse_i64(&args[index]) {
            Ok(delta) => delta,
            Err(resp) => return resp,
        },
        None => 1,
    };
    match store.incr_by(session.db, &args[1], delta) {
        Ok(value) => resp_integer(value),
        Err(message) => resp_error("ERR", message),
    }
}

fn handle_del(args: &[Vec<u8>], store: &Store, session: &Session) -> Vec<u8> {
    if args.len() < 2 {
        return wrong_arity("del");
    }
    resp_integer(store.delete(session.db, &args[1..]))
}

fn handle_exists(args: &[Vec<u8>], store: &Store, session: &Session) -> Vec<u8> {
    if args.len() < 2 {
        return wrong_arity("exists");
    }
    resp_integer(store.count_existing(session.db, &args[1..]))
}

fn handle_keys(args: &[Vec<u8>], store: &Store, session: &Session) -> Vec<u8> {
    if args.len() != 2 {
        return wrong_arity("keys");
    }
    let keys = store.keys(session.db, &args[1]);
    let mut reply = resp_array_header(keys.len());
    for key in &keys {
        reply.extend_from_slice(&resp_bulk(key));
    }
    reply
}

fn handle_rename(args: &[Vec<u8>], store: &Store, session: &Session) -> Vec<u8> {
    if args.len() != 3 {
        return wrong_arity("rename");
    }
    match store.rename(session.db, &args[1], &args[2]) {
        Ok(()) => resp_simple("OK"),
        Err(message) => resp_error("ERR", message),
    }
}

fn handle_flushdb(args: &[Vec<u8>], store: &Store, session: &Session) -> Vec<u8> {
    if args.len() > 2 {
        return wrong_arity("flushdb");
    }
    store.flush(session.db);
    resp_simple("OK")
}

fn handle_mget(args: &[Vec<u8>], store: &Store, session: &Session) -> Vec<u8> {
    if args.len() < 2 {
        return wrong_arity("mget");
    }
    let mut reply = resp_array_header(args.len() - 1);
    for key in &args[1..] {
        match store.get(session.db, key) {
            Some(value) => reply.extend_from_slice(&resp_bulk(&value)),
            None => reply.extend_from_slice(&resp_null(session)),
        }
    }
    reply
}

fn handle_dbsize(args: &[Vec<u8>], store: &Store, session: &Session) -> Vec<u8> {
    if args.len() != 1 {
        return wrong_arity("dbsize");
    }
    resp_integer(store.len(session.db) as i64)
}

/// `ERR <message> in '<command>' command`
fn command_error(message: &str, command: &str) -> Vec<u8> {
    resp_error("ERR", &format!("{message} in '{command}' command"))
}

fn wrong_arity(command: &str) -> Vec<u8> {
    resp_error("ERR", &format!("wrong number of arguments for '{command}' command"))
}

fn resp_simple(message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.len() + 3);
    buf.push(b'+');
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_error(code: &str, message: &str) -> Vec<u8> {
    format!("-{code} {message}\r\n").into_bytes()
}

fn resp_integer(value: i64) -> Vec<u8> {
    format!(":{value}\r\n").into_bytes()
}

fn resp_bulk(data: &[u8]) -> Vec<u8> {
    let mut buf = format!("${}\r\n", data.len()).into_bytes();
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf
}

fn resp_array_header(len: usize) -> Vec<u8> {
    format!("*{len}\r\n").into_bytes()
}

/// Null in the session's protocol.
fn resp_null(session: &Session) -> Vec<u8> {
    if session.protocol == 3 {
        b"_\r\n".to_vec()
    } else {
        b"$-1\r\n".to_vec()
    }
}

fn parse_i64(arg: &[u8]) -> Result<i64, Vec<u8>> {
    std::str::from_utf8(arg)
        .ok()
        .filter(|text| !text.starts_with('+'))
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| resp_error("ERR", "value is not an integer or out of range"))
}
