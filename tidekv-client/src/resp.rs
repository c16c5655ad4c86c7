//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and parse server replies over an async
//! buffered stream, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **Buffer Reuse**: The caller supplies the line and output buffers, so
//!    steady-state commands allocate only for reply payloads.
//! 2. **Binary-Safe**: Bulk strings are raw bytes end to end.
//! 3. **Fail Fast**: Invalid framing surfaces a protocol error immediately
//!    and poisons the connection upstream.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::client::{ClientError, ClientResult};

/// Parsed RESP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK` / `+PONG` style replies.
    Simple(Vec<u8>),
    /// `-ERR ...` replies.
    Error(Vec<u8>),
    /// `:123` replies.
    Integer(i64),
    /// `$...` bulk strings; `None` is the null bulk.
    Bulk(Option<Vec<u8>>),
    /// `*...` arrays.
    Array(Vec<RespValue>),
}

/// Encodes one command as a RESP2 array of bulk strings.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_decimal(out, args.len() as u64);
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        push_decimal(out, arg.len() as u64);
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Reads one complete RESP value from the buffered reader.
pub async fn read_response<R>(reader: &mut R, line_buf: &mut Vec<u8>) -> ClientResult<RespValue>
where
    R: AsyncBufRead + Unpin + Send,
{
    read_value(reader, line_buf).await
}

// Arrays recurse; boxing keeps the future size finite.
fn read_value<'a, R>(
    reader: &'a mut R,
    line_buf: &'a mut Vec<u8>,
) -> Pin<Box<dyn Future<Output = ClientResult<RespValue>> + Send + 'a>>
where
    R: AsyncBufRead + Unpin + Send,
{
    Box::pin(async move {
        read_line(reader, line_buf).await?;
        let Some((&marker, rest)) = line_buf.split_first() else {
            return Err(ClientError::Protocol);
        };

        match marker {
            b'+' => Ok(RespValue::Simple(rest.to_vec())),
            b'-' => Ok(RespValue::Error(rest.to_vec())),
            b':' => Ok(RespValue::Integer(parse_i64(rest)?)),
            b'$' => {
                let len = parse_i64(rest)?;
                read_bulk(reader, len, line_buf).await
            }
            b'*' => {
                let len = parse_i64(rest)?;
                if len <= 0 {
                    return Ok(RespValue::Array(Vec::new()));
                }
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    items.push(read_value(reader, line_buf).await?);
                }
                Ok(RespValue::Array(items))
            }
            _ => Err(ClientError::Protocol),
        }
    })
}

async fn read_bulk<R>(reader: &mut R, len: i64, line_buf: &mut Vec<u8>) -> ClientResult<RespValue>
where
    R: AsyncBufRead + Unpin + Send,
{
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if crlf != *b"\r\n" {
        return Err(ClientError::Protocol);
    }

    line_buf.clear();
    Ok(RespValue::Bulk(Some(data)))
}

async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()>
where
    R: AsyncBufRead + Unpin + Send,
{
    buf.clear();
    let bytes = reader.read_until(b'\n', buf).await?;
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
    let (negative, digits) = match data.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(ClientError::Protocol);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ClientError::Protocol);
        }
        value = value
            .saturating_mul(10)
            .saturating_add(i64::from(b - b'0'));
    }

    Ok(if negative { -value } else { value })
}

fn push_decimal(out: &mut Vec<u8>, mut value: u64) {
    // Stack buffer keeps the conversion allocation-free.
    let mut digits = [0u8; 20];
    let mut len = 0;
    loop {
        digits[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
        if value == 0 {
            break;
        }
    }
    while len > 0 {
        len -= 1;
        out.push(digits[len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse(bytes: &[u8]) -> ClientResult<RespValue> {
        let mut reader = BufReader::new(bytes);
        let mut line = Vec::new();
        read_response(&mut reader, &mut line).await
    }

    #[test]
    fn encodes_command() {
        let mut buf = Vec::new();
        encode_command(&[b"GET", b"key"], &mut buf);
        assert_eq!(&buf, b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[tokio::test]
    async fn parses_simple_string() {
        let resp = parse(b"+OK\r\n").await.unwrap();
        assert_eq!(resp, RespValue::Simple(b"OK".to_vec()));
    }

    #[tokio::test]
    async fn parses_error() {
        let resp = parse(b"-ERR bad\r\n").await.unwrap();
        assert_eq!(resp, RespValue::Error(b"ERR bad".to_vec()));
    }

    #[tokio::test]
    async fn parses_integer() {
        let resp = parse(b":-42\r\n").await.unwrap();
        assert_eq!(resp, RespValue::Integer(-42));
    }

    #[tokio::test]
    async fn parses_bulk_string() {
        let resp = parse(b"$5\r\nhello\r\n").await.unwrap();
        assert_eq!(resp, RespValue::Bulk(Some(b"hello".to_vec())));
    }

    #[tokio::test]
    async fn parses_null_bulk_string() {
        let resp = parse(b"$-1\r\n").await.unwrap();
        assert_eq!(resp, RespValue::Bulk(None));
    }

    #[tokio::test]
    async fn parses_array_of_bulk_strings() {
        let resp = parse(b"*2\r\n$1\r\na\r\n$1\r\nb\r\n").await.unwrap();
        assert_eq!(
            resp,
            RespValue::Array(vec![
                RespValue::Bulk(Some(b"a".to_vec())),
                RespValue::Bulk(Some(b"b".to_vec())),
            ])
        );
    }

    #[tokio::test]
    async fn rejects_missing_crlf() {
        assert!(matches!(
            parse(b"$3\r\nabcXY").await,
            Err(ClientError::Protocol)
        ));
    }

    #[tokio::test]
    async fn rejects_unknown_marker() {
        assert!(matches!(parse(b"?\r\n").await, Err(ClientError::Protocol)));
    }
}
