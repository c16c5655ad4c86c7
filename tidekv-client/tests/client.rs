//! End-to-end command tests against a scripted RESP server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use tidekv_client::{ClientConfig, ClientError, ClientTtl, KVClient};

type Handler = Arc<dyn Fn(usize, &[Vec<u8>]) -> Vec<u8> + Send + Sync>;

/// Spawns a server that parses RESP commands and answers via the handler,
/// which receives a global command index and the argument list.
async fn spawn_server(handler: Handler) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let commands = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            let commands = commands.clone();
            tokio::spawn(async move {
                let mut stream = stream;
                let (read_half, mut write_half) = stream.split();
                let mut reader = BufReader::new(read_half);
                while let Ok(Some(args)) = read_command(&mut reader).await {
                    let idx = commands.fetch_add(1, Ordering::SeqCst);
                    let reply = handler(idx, &args);
                    if write_half.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

async fn read_command<R>(reader: &mut R) -> std::io::Result<Option<Vec<Vec<u8>>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    if read_line(reader, &mut line).await?.is_none() {
        return Ok(None);
    }
    if line.first() != Some(&b'*') {
        return Err(invalid("expected array"));
    }
    let count = parse_usize(&line[1..])?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)
            .await?
            .ok_or_else(|| invalid("eof inside command"))?;
        if line.first() != Some(&b'$') {
            return Err(invalid("expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data).await?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if crlf != *b"\r\n" {
            return Err(invalid("missing crlf"));
        }
        args.push(data);
    }
    Ok(Some(args))
}

async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<()>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let bytes = reader.read_until(b'\n', buf).await?;
    if bytes == 0 {
        return Ok(None);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(invalid("invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(Some(()))
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    if data.is_empty() {
        return Err(invalid("empty length"));
    }
    let mut value = 0usize;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(invalid("bad digit"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as usize);
    }
    Ok(value)
}

fn invalid(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.to_string())
}

fn simple(text: &str) -> Vec<u8> {
    format!("+{text}\r\n").into_bytes()
}

fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

fn integer(value: i64) -> Vec<u8> {
    format!(":{value}\r\n").into_bytes()
}

fn error(message: &str) -> Vec<u8> {
    format!("-{message}\r\n").into_bytes()
}

fn client_for(addr: String) -> KVClient {
    let config = ClientConfig {
        addr,
        pool_size: 1,
        min_idle_conns: 0,
        pool_timeout: Duration::from_secs(1),
        replenish_interval: Duration::from_secs(600),
        connect_timeout: Some(Duration::from_secs(1)),
        ..ClientConfig::default()
    };
    KVClient::with_config(config).expect("client")
}

#[tokio::test]
async fn set_get_roundtrip() {
    let addr = spawn_server(Arc::new(|idx, args| {
        if idx == 0 {
            assert_eq!(args[0], b"SET");
            assert_eq!(args[1], b"key");
            assert_eq!(args[2], b"value");
            simple("OK")
        } else {
            assert_eq!(args[0], b"GET");
            assert_eq!(args[1], b"key");
            bulk(b"value")
        }
    }))
    .await;

    let client = client_for(addr);
    client.set(b"key", b"value").await.expect("set");
    let value = client.get(b"key").await.expect("get");
    assert_eq!(value, Some(b"value".to_vec()));
    client.close();
}

#[tokio::test]
async fn set_with_ttl_sends_ex_argument() {
    let addr = spawn_server(Arc::new(|_, args| {
        assert_eq!(args[0], b"SET");
        assert_eq!(args[3], b"EX");
        assert_eq!(args[4], b"30");
        simple("OK")
    }))
    .await;

    let client = client_for(addr);
    client
        .set_with_ttl(b"key", b"value", Duration::from_secs(30))
        .await
        .expect("set with ttl");
    client.close();
}

#[tokio::test]
async fn ttl_and_delete() {
    let addr = spawn_server(Arc::new(|idx, args| {
        if idx == 0 {
            assert_eq!(args[0], b"TTL");
            integer(5)
        } else {
            assert_eq!(args[0], b"DEL");
            integer(1)
        }
    }))
    .await;

    let client = client_for(addr);
    let ttl = client.ttl(b"key").await.expect("ttl");
    assert_eq!(ttl, ClientTtl::ExpiresIn(Duration::from_secs(5)));
    let removed = client.delete(b"key").await.expect("delete");
    assert!(removed);
    client.close();
}

#[tokio::test]
async fn missing_key_ttl_states() {
    let addr = spawn_server(Arc::new(|idx, _| {
        if idx == 0 {
            integer(-2)
        } else {
            integer(-1)
        }
    }))
    .await;

    let client = client_for(addr);
    assert_eq!(client.ttl(b"gone").await.expect("ttl"), ClientTtl::Missing);
    assert_eq!(client.ttl(b"kept").await.expect("ttl"), ClientTtl::NoExpiry);
    client.close();
}

#[tokio::test]
async fn ping_roundtrip() {
    let addr = spawn_server(Arc::new(|_, args| {
        assert_eq!(args[0], b"PING");
        simple("PONG")
    }))
    .await;

    let client = client_for(addr);
    let pong = client.ping(None).await.expect("ping");
    assert_eq!(pong, b"PONG".to_vec());
    client.close();
}

#[tokio::test]
async fn server_error_reply_keeps_connection_pooled() {
    let addr = spawn_server(Arc::new(|idx, _| {
        if idx == 0 {
            error("ERR boom")
        } else {
            bulk(b"fine")
        }
    }))
    .await;

    let client = client_for(addr);
    let err = client.get(b"key").await.expect_err("server error");
    assert!(matches!(err, ClientError::Server { .. }));

    // An error reply is data, not a transport fault: the same connection
    // serves the next command.
    let value = client.get(b"key").await.expect("get");
    assert_eq!(value, Some(b"fine".to_vec()));

    let stats = client.pool_stats();
    assert_eq!(stats.total_conns, 1);
    assert_eq!(stats.hits, 1);
    client.close();
}

#[tokio::test]
async fn protocol_error_discards_connection() {
    let addr = spawn_server(Arc::new(|idx, _| {
        if idx == 0 {
            b"!garbage\r\n".to_vec()
        } else {
            simple("OK")
        }
    }))
    .await;

    let client = client_for(addr);
    let err = client.set(b"key", b"value").await.expect_err("bad framing");
    assert!(matches!(err, ClientError::Protocol));
    assert_eq!(client.pool_stats().total_conns, 0);

    // The poisoned connection was destroyed; the retry dials a fresh one.
    client.set(b"key", b"value").await.expect("set");
    let stats = client.pool_stats();
    assert_eq!(stats.total_conns, 1);
    assert_eq!(stats.misses, 2);
    client.close();
}

#[tokio::test]
async fn invalid_address_is_rejected() {
    let err = KVClient::connect("not an address").expect_err("bad addr");
    assert!(matches!(err, ClientError::InvalidAddress));
}

#[tokio::test]
async fn info_returns_bulk_payload() {
    let addr = spawn_server(Arc::new(|_, args| {
        assert_eq!(args[0], b"INFO");
        bulk(b"# Server\r\nversion:1\r\n")
    }))
    .await;

    let client = client_for(addr);
    let info = client.info().await.expect("info");
    assert_eq!(info, b"# Server\r\nversion:1\r\n".to_vec());
    client.close();
}
