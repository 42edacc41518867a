//! # RESP Encoding and Parsing
//!
//! Purpose: Encode node commands and parse replies, keeping allocations under
//! control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **One Value Model**: RESP3 reply types are folded into the RESP2 shapes
//!    so command decoding does not depend on the negotiated protocol.

use std::io::BufRead;

use crate::error::{ClientError, ClientResult};

/// RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK style replies.
    Simple(Vec<u8>),
    /// -ERR ... replies.
    Error(Vec<u8>),
    /// :123 replies (RESP3 booleans land here as 0/1).
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays; RESP3 maps are flattened into key/value pairs.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Returns true for nil replies in either protocol.
    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Bulk(None))
    }
}

/// Encodes a RESP array command into the provided buffer.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Reads one RESP value from the buffered reader.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ClientResult<RespValue> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(ClientError::Protocol);
    }

    match line_buf[0] {
        b'+' => Ok(RespValue::Simple(line_buf[1..].to_vec())),
        b'-' => Ok(RespValue::Error(line_buf[1..].to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_bulk_len(reader, len, line_buf)
        }
        b'*' | b'~' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_array_len(reader, len, line_buf)
        }
        // RESP3 from here on.
        b'_' => Ok(RespValue::Bulk(None)),
        b'#' => match &line_buf[1..] {
            b"t" => Ok(RespValue::Integer(1)),
            b"f" => Ok(RespValue::Integer(0)),
            _ => Err(ClientError::Protocol),
        },
        b',' | b'(' => Ok(RespValue::Bulk(Some(line_buf[1..].to_vec()))),
        b'=' => {
            let len = parse_i64(&line_buf[1..])?;
            match parse_bulk_len(reader, len, line_buf)? {
                // Verbatim strings carry a "txt:" style format prefix.
                RespValue::Bulk(Some(data)) if data.len() >= 4 && data[3] == b':' => {
                    Ok(RespValue::Bulk(Some(data[4..].to_vec())))
                }
                other => Ok(other),
            }
        }
        b'!' => {
            let len = parse_i64(&line_buf[1..])?;
            match parse_bulk_len(reader, len, line_buf)? {
                RespValue::Bulk(Some(data)) => Ok(RespValue::Error(data)),
                _ => Err(ClientError::Protocol),
            }
        }
        b'%' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_array_len(reader, len.saturating_mul(2), line_buf)
        }
        _ => Err(ClientError::Protocol),
    }
}

fn parse_bulk_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ClientResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }
    let len = len as usize;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(ClientError::Protocol);
    }

    line_buf.clear();
    Ok(RespValue::Bulk(Some(data)))
}

fn parse_array_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ClientResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }
    if len == 0 {
        return Ok(RespValue::Array(Vec::new()));
    }

    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        items.push(read_response(reader, line_buf)?);
    }
    Ok(RespValue::Array(items))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(ClientError::Protocol);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(ClientError::Protocol);
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    if data.is_empty() {
        return Err(ClientError::Protocol);
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
    }
    if idx == data.len() {
        return Err(ClientError::Protocol);
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(ClientError::Protocol);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(input: &[u8]) -> RespValue {
        let mut reader = Cursor::new(input.to_vec());
        let mut line = Vec::new();
        read_response(&mut reader, &mut line).unwrap()
    }

    #[test]
    fn encodes_command() {
        let mut buf = Vec::new();
        encode_command(&[b"GET", b"key"], &mut buf);
        assert_eq!(&buf, b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[test]
    fn parses_simple_string() {
        assert_eq!(parse(b"+OK\r\n"), RespValue::Simple(b"OK".to_vec()));
    }

    #[test]
    fn parses_bulk_and_null_bulk() {
        assert_eq!(parse(b"$5\r\nhello\r\n"), RespValue::Bulk(Some(b"hello".to_vec())));
        assert_eq!(parse(b"$-1\r\n"), RespValue::Bulk(None));
    }

    #[test]
    fn parses_error() {
        assert_eq!(parse(b"-ERR bad\r\n"), RespValue::Error(b"ERR bad".to_vec()));
    }

    #[test]
    fn parses_mget_style_array() {
        let resp = parse(b"*3\r\n$1\r\na\r\n$-1\r\n:7\r\n");
        assert_eq!(
            resp,
            RespValue::Array(vec![
                RespValue::Bulk(Some(b"a".to_vec())),
                RespValue::Bulk(None),
                RespValue::Integer(7),
            ])
        );
    }

    #[test]
    fn folds_resp3_types() {
        assert!(parse(b"_\r\n").is_null());
        assert_eq!(parse(b"#t\r\n"), RespValue::Integer(1));
        assert_eq!(parse(b",3.5\r\n"), RespValue::Bulk(Some(b"3.5".to_vec())));
        assert_eq!(parse(b"=8\r\ntxt:hiya\r\n"), RespValue::Bulk(Some(b"hiya".to_vec())));
        assert_eq!(parse(b"!7\r\nERR bad\r\n"), RespValue::Error(b"ERR bad".to_vec()));
        assert_eq!(
            parse(b"%1\r\n+proto\r\n:3\r\n"),
            RespValue::Array(vec![RespValue::Simple(b"proto".to_vec()), RespValue::Integer(3)])
        );
    }

    #[test]
    fn rejects_truncated_line() {
        let mut reader = Cursor::new(b"+OK\n".to_vec());
        let mut line = Vec::new();
        assert!(matches!(read_response(&mut reader, &mut line), Err(ClientError::Protocol)));
    }
}
