use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use skv_client::{ClientError, NodeClient, NodeIdentity, PoolRegistry, PoolSettings, RespValue};

type Handler = fn(usize, Vec<Vec<u8>>, &mut TcpStream);

fn spawn_server(expected_commands: usize, handler: Handler) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();

    thread::spawn(move || {
        // Only one connection is accepted, so every command below must reuse it.
        let (mut stream, _) = listener.accept().expect("accept");
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
        for idx in 0..expected_commands {
            let args = read_command(&mut reader).expect("read command");
            handler(idx, args, &mut stream);
        }
    });

    addr
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
    if line.first() != Some(&b'*') {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
        if line.first() != Some(&b'$') {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing crlf"));
        }
        args.push(data);
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<Option<()>> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Ok(None);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(Some(()))
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    if data.is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "empty"));
    }
    let mut value = 0usize;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "digit"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as usize);
    }
    Ok(value)
}

fn write_raw(stream: &mut TcpStream, data: &[u8]) {
    let _ = stream.write_all(data);
    let _ = stream.flush();
}

fn write_simple(stream: &mut TcpStream, msg: &str) {
    write_raw(stream, format!("+{}\r\n", msg).as_bytes());
}

fn write_error(stream: &mut TcpStream, msg: &str) {
    write_raw(stream, format!("-{}\r\n", msg).as_bytes());
}

fn write_bulk(stream: &mut TcpStream, data: &[u8]) {
    let mut buf = format!("${}\r\n", data.len()).into_bytes();
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    write_raw(stream, &buf);
}

fn write_integer(stream: &mut TcpStream, value: i64) {
    write_raw(stream, format!(":{}\r\n", value).as_bytes());
}

fn settings() -> PoolSettings {
    PoolSettings {
        max_idle: 1,
        max_total: 1,
        read_timeout: Some(Duration::from_secs(1)),
        write_timeout: Some(Duration::from_secs(1)),
        connect_timeout: Some(Duration::from_secs(1)),
        acquire_timeout: Some(Duration::ZERO),
    }
}

fn client_for(identity: NodeIdentity) -> NodeClient {
    let registry = PoolRegistry::new(settings());
    NodeClient::new(identity, &registry)
}

fn client_with_addr(addr: String) -> NodeClient {
    client_for(NodeIdentity::new(addr.parse().expect("address")))
}

#[test]
fn client_set_get_roundtrip() {
    let addr = spawn_server(2, |idx, args, stream| {
        if idx == 0 {
            assert_eq!(args, vec![b"SET".to_vec(), b"key".to_vec(), b"value".to_vec()]);
            write_simple(stream, "OK");
        } else {
            assert_eq!(args, vec![b"GET".to_vec(), b"key".to_vec()]);
            write_bulk(stream, b"value");
        }
    });

    let client = client_with_addr(addr);
    client.set(b"key", b"value").expect("set");
    let value = client.get(b"key").expect("get");
    assert_eq!(value, Some(b"value".to_vec()));
}

#[test]
fn handshake_authenticates_and_selects_db() {
    let addr = spawn_server(3, |idx, args, stream| match idx {
        0 => {
            assert_eq!(args, vec![b"AUTH".to_vec(), b"s3cret".to_vec()]);
            write_simple(stream, "OK");
        }
        1 => {
            assert_eq!(args, vec![b"SELECT".to_vec(), b"3".to_vec()]);
            write_simple(stream, "OK");
        }
        _ => {
            assert_eq!(args, vec![b"EXISTS".to_vec(), b"key".to_vec()]);
            write_integer(stream, 1);
        }
    });

    let identity = NodeIdentity::new(addr.parse().expect("address"))
        .with_db(3)
        .with_password(Some("s3cret".to_string()));
    let client = client_for(identity);
    assert!(client.exists(b"key").expect("exists"));
}

#[test]
fn setex_and_setnx_wire_forms() {
    let addr = spawn_server(3, |idx, args, stream| match idx {
        0 => {
            assert_eq!(args, vec![b"SETEX".to_vec(), b"k".to_vec(), b"30".to_vec(), b"v".to_vec()]);
            write_simple(stream, "OK");
        }
        1 => {
            assert_eq!(args, vec![b"SETNX".to_vec(), b"k".to_vec(), b"v".to_vec()]);
            write_integer(stream, 0);
        }
        _ => {
            assert_eq!(args[0], b"SET");
            assert_eq!(&args[3..], &[b"NX".to_vec(), b"EX".to_vec(), b"5".to_vec()]);
            write_raw(stream, b"$-1\r\n");
        }
    });

    let client = client_with_addr(addr);
    assert!(client.set_with_expiry(b"k", b"v", 30).expect("setex"));
    assert!(!client.set_if_absent(b"k", b"v").expect("setnx"));
    assert!(!client.set_if_absent_with_expiry(b"k", b"v", 5).expect("set nx ex"));
}

#[test]
fn ping_and_expire_wire_forms() {
    let addr = spawn_server(3, |idx, args, stream| match idx {
        0 => {
            assert_eq!(args, vec![b"PING".to_vec()]);
            write_simple(stream, "PONG");
        }
        1 => {
            assert_eq!(args, vec![b"EXPIRE".to_vec(), b"k".to_vec(), b"90".to_vec()]);
            write_integer(stream, 1);
        }
        _ => {
            assert_eq!(args, vec![b"EXPIRE".to_vec(), b"gone".to_vec(), b"90".to_vec()]);
            write_integer(stream, 0);
        }
    });

    let client = client_with_addr(addr);
    assert_eq!(client.ping().expect("ping"), b"PONG".to_vec());
    assert!(client.expire(b"k", 90).expect("expire"));
    assert!(!client.expire(b"gone", 90).expect("expire missing"));
}

#[test]
fn rename_missing_key_is_not_found() {
    let addr = spawn_server(1, |_, args, stream| {
        assert_eq!(args[0], b"RENAME");
        write_error(stream, "ERR no such key");
    });

    let client = client_with_addr(addr);
    let err = client.rename(b"old", b"new").unwrap_err();
    assert!(matches!(err, ClientError::NotFound));
}

#[test]
fn increment_on_non_integer_is_server_error() {
    let addr = spawn_server(2, |idx, args, stream| {
        assert_eq!(args[0], b"INCRBY");
        if idx == 0 {
            assert_eq!(args[2], b"3");
            write_integer(stream, 8);
        } else {
            write_error(stream, "ERR value is not an integer or out of range");
        }
    });

    let client = client_with_addr(addr);
    assert_eq!(client.increment(b"counter", 3).expect("incr"), 8);
    let err = client.increment(b"blob", 1).unwrap_err();
    assert!(err.is_server_error());
}

#[test]
fn mget_keeps_request_order() {
    let addr = spawn_server(1, |_, args, stream| {
        assert_eq!(args, vec![b"MGET".to_vec(), b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        write_raw(stream, b"*3\r\n$1\r\n1\r\n$-1\r\n$1\r\n3\r\n");
    });

    let client = client_with_addr(addr);
    let values = client.get_many(&[b"a", b"b", b"c"]).expect("mget");
    assert_eq!(values, vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())]);
}

#[test]
fn delete_and_keys() {
    let addr = spawn_server(2, |idx, args, stream| {
        if idx == 0 {
            assert_eq!(args, vec![b"KEYS".to_vec(), b"p:*".to_vec()]);
            write_raw(stream, b"*2\r\n$3\r\np:1\r\n$3\r\np:2\r\n");
        } else {
            assert_eq!(args, vec![b"DEL".to_vec(), b"p:1".to_vec(), b"p:2".to_vec()]);
            write_integer(stream, 2);
        }
    });

    let client = client_with_addr(addr);
    let keys = client.keys_matching(b"p:*").expect("keys");
    let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
    assert_eq!(client.delete(&refs).expect("del"), 2);
}

#[test]
fn pipeline_replies_in_submission_order() {
    let addr = spawn_server(3, |idx, args, stream| match idx {
        0 => {
            assert_eq!(args[0], b"SET");
            write_simple(stream, "OK");
        }
        1 => {
            assert_eq!(args[0], b"INCRBY");
            write_error(stream, "ERR value is not an integer or out of range");
        }
        _ => {
            assert_eq!(args[0], b"GET");
            write_bulk(stream, b"x");
        }
    });

    let client = client_with_addr(addr);
    let mut pipeline = client.pipeline();
    pipeline.set(b"a", b"x").increment(b"a", 1).get(b"a");
    let replies = pipeline.execute().expect("execute");
    assert_eq!(
        replies,
        vec![
            RespValue::Simple(b"OK".to_vec()),
            RespValue::Error(b"ERR value is not an integer or out of range".to_vec()),
            RespValue::Bulk(Some(b"x".to_vec())),
        ]
    );
}

#[test]
fn pool_limit_fails_fast() {
    let addr = spawn_server(0, |_, _, _| {});
    let client = client_with_addr(addr);
    let held = client.pool().acquire().expect("first connection");
    let err = client.pool().acquire().err().expect("pool exhausted");
    assert!(matches!(err, ClientError::PoolExhausted));
    drop(held);
    assert_eq!(client.pool().idle_count(), 1);
}

#[test]
fn acquire_waits_for_a_released_connection() {
    let addr = spawn_server(0, |_, _, _| {});
    let registry = PoolRegistry::new(PoolSettings {
        acquire_timeout: Some(Duration::from_secs(2)),
        ..settings()
    });
    let client = NodeClient::new(NodeIdentity::new(addr.parse().expect("address")), &registry);
    let held = client.pool().acquire().expect("first connection");

    let waiter = {
        let pool = client.pool().clone();
        thread::spawn(move || pool.acquire().map(|_| ()))
    };
    thread::sleep(Duration::from_millis(100));
    drop(held);
    assert!(waiter.join().expect("join").is_ok());
    assert_eq!(client.pool().idle_count(), 1);
}

#[test]
fn acquire_gives_up_after_its_timeout() {
    let addr = spawn_server(0, |_, _, _| {});
    let registry = PoolRegistry::new(PoolSettings {
        acquire_timeout: Some(Duration::from_millis(50)),
        ..settings()
    });
    let client = NodeClient::new(NodeIdentity::new(addr.parse().expect("address")), &registry);
    let _held = client.pool().acquire().expect("first connection");
    let err = client.pool().acquire().err().expect("pool exhausted");
    assert!(matches!(err, ClientError::PoolExhausted));
}
