//! # RESP Request Parser
//!
//! Incremental parser for RESP arrays of bulk strings. A frame is consumed
//! from the buffer only once it is complete, so partial reads simply wait
//! for more bytes.

use bytes::{Buf, BytesMut};

/// Upper bound on pre-allocated argument slots per command.
const MAX_PREALLOC_ARGS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespError {
    /// Framing the parser cannot recover from.
    Protocol,
}

/// Request parser for one connection.
#[derive(Debug, Default)]
pub struct RespParser;

impl RespParser {
    pub fn new() -> Self {
        RespParser
    }

    /// Parses one command, consuming it from `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        match parse_frame(&buf[..])? {
            Some((args, consumed)) => {
                buf.advance(consumed);
                Ok(Some(args))
            }
            None => Ok(None),
        }
    }
}

fn parse_frame(data: &[u8]) -> Result<Option<(Vec<Vec<u8>>, usize)>, RespError> {
    let Some((line, mut pos)) = read_line(data, 0)? else {
        return Ok(None);
    };
    if line.first() != Some(&b'*') {
        return Err(RespError::Protocol);
    }
    let count = parse_len(&line[1..])?;

    let mut args = Vec::with_capacity(count.min(MAX_PREALLOC_ARGS));
    for _ in 0..count {
        let Some((line, start)) = read_line(data, pos)? else {
            return Ok(None);
        };
        if line.first() != Some(&b'$') {
            return Err(RespError::Protocol);
        }
        let len = parse_len(&line[1..])?;
        let end = start.checked_add(len).ok_or(RespError::Protocol)?;
        if data.len() < end.saturating_add(2) {
            return Ok(None);
        }
        if &data[end..end + 2] != b"\r\n" {
            return Err(RespError::Protocol);
        }
        args.push(data[start..end].to_vec());
        pos = end + 2;
    }
    Ok(Some((args, pos)))
}

/// Returns the line starting at `start` (without CRLF) and the offset after it.
fn read_line(data: &[u8], start: usize) -> Result<Option<(&[u8], usize)>, RespError> {
    let Some(offset) = data[start..].iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    let newline = start + offset;
    if newline == start || data[newline - 1] != b'\r' {
        return Err(RespError::Protocol);
    }
    Ok(Some((&data[start..newline - 1], newline + 1)))
}

fn parse_len(data: &[u8]) -> Result<usize, RespError> {
    if data.is_empty() {
        return Err(RespError::Protocol);
    }
    let mut value = 0usize;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(RespError::Protocol);
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as usize))
            .ok_or(RespError::Protocol)?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_command() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n"[..]);
        let args = RespParser::new().parse(&mut buf).unwrap().unwrap();
        assert_eq!(args, vec![b"GET".to_vec(), b"key".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_partial_frames() {
        let mut parser = RespParser::new();
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nke"[..]);
        assert_eq!(parser.parse(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 19);
        buf.extend_from_slice(b"y\r\n");
        assert!(parser.parse(&mut buf).unwrap().is_some());
    }

    #[test]
    fn parses_pipelined_commands_in_order() {
        let mut parser = RespParser::new();
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nDEL\r\n$1\r\na\r\n"[..]);
        assert_eq!(parser.parse(&mut buf).unwrap().unwrap(), vec![b"PING".to_vec()]);
        assert_eq!(parser.parse(&mut buf).unwrap().unwrap(), vec![b"DEL".to_vec(), b"a".to_vec()]);
        assert_eq!(parser.parse(&mut buf).unwrap(), None);
    }

    #[test]
    fn rejects_bulk_length_past_address_space() {
        let mut buf = BytesMut::from(format!("*1\r\n${}\r\nGET\r\n", usize::MAX).as_bytes());
        assert_eq!(RespParser::new().parse(&mut buf), Err(RespError::Protocol));
    }

    #[test]
    fn rejects_inline_commands() {
        let mut buf = BytesMut::from(&b"PING\r\n"[..]);
        assert_eq!(RespParser::new().parse(&mut buf), Err(RespError::Protocol));
    }
}
