//! # Async Client API
//!
//! Purpose: Expose a compact API for issuing Redis-compatible commands over
//! pooled TCP connections.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides pooling and protocol details.
//! 2. **Borrow Per Command**: Each call checks a connection out, runs one
//!    command, and hands it back: healthy through `put`, broken through
//!    `remove`.
//! 3. **Borrow-Friendly API**: Commands accept `&[u8]` to avoid copies.
//! 4. **Fail Fast**: Protocol violations surface immediately as errors.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::pool::{ConnPool, DialFn, PoolConfig, PoolError};
use crate::resp::RespValue;
use crate::stats::PoolStats;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Network or IO failure while reading or writing.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,
    /// Server returned an error reply.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Server {
        /// Raw error payload from the server.
        message: Vec<u8>,
    },
    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// Pool-level failure: closed, admission timeout, or dial error.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// Address could not be parsed into a socket address.
    #[error("invalid address")]
    InvalidAddress,
}

/// TTL state returned by the server, mirroring Redis semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// Configuration for the client and its pool.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Maximum live connections, idle plus checked out.
    pub pool_size: usize,
    /// Idle connections the background replenisher keeps warm.
    pub min_idle_conns: usize,
    /// Maximum time a command waits for pool admission.
    pub pool_timeout: Duration,
    /// Hard connection lifetime; `None` disables the age check.
    pub conn_max_age: Option<Duration>,
    /// Idle eviction threshold; `None` disables the idle check.
    pub conn_max_idle_time: Option<Duration>,
    /// Period of the background replenish/sweep task.
    pub replenish_interval: Duration,
    /// Optional TCP connect timeout applied by the default dialer.
    pub connect_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        ClientConfig {
            addr: "127.0.0.1:6379".to_string(),
            pool_size: pool.pool_size,
            min_idle_conns: pool.min_idle_conns,
            pool_timeout: pool.pool_timeout,
            conn_max_age: pool.conn_max_age,
            conn_max_idle_time: pool.conn_max_idle_time,
            replenish_interval: pool.replenish_interval,
            connect_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Async client with connection pooling.
///
/// A facade over the pool and RESP codec: each command borrows a connection,
/// executes once, and routes it back through the pool.
#[derive(Debug)]
pub struct KVClient {
    pool: ConnPool,
}

impl KVClient {
    /// Creates a client with default configuration.
    pub fn connect(addr: impl Into<String>) -> ClientResult<Self> {
        let config = ClientConfig {
            addr: addr.into(),
            ..ClientConfig::default()
        };
        Self::with_config(config)
    }

    /// Creates a client with a custom configuration.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        let addr: SocketAddr = config
            .addr
            .parse()
            .map_err(|_| ClientError::InvalidAddress)?;
        let connect_timeout = config.connect_timeout;
        let dial: DialFn = Arc::new(move || {
            Box::pin(dial_addr(addr, connect_timeout))
                as Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>
        });

        let pool = ConnPool::new(
            PoolConfig {
                pool_size: config.pool_size,
                min_idle_conns: config.min_idle_conns,
                pool_timeout: config.pool_timeout,
                conn_max_age: config.conn_max_age,
                conn_max_idle_time: config.conn_max_idle_time,
                replenish_interval: config.replenish_interval,
            },
            dial,
        );
        Ok(KVClient { pool })
    }

    /// The underlying pool, for stats and out-of-band connections.
    pub fn pool(&self) -> &ConnPool {
        &self.pool
    }

    /// Point-in-time pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Closes the pool; in-flight commands fail or finish, new ones fail.
    pub fn close(&self) {
        self.pool.close();
    }

    /// Fetches a value by key. Returns `Ok(None)` when the key is missing.
    pub async fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        match self.exec(&[b"GET", key]).await? {
            RespValue::Bulk(data) => Ok(data),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a value for a key without expiration.
    pub async fn set(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        match self.exec(&[b"SET", key, value]).await? {
            RespValue::Simple(_) => Ok(()),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a value and attaches an expiration in seconds.
    pub async fn set_with_ttl(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> ClientResult<()> {
        let (seconds, len) = encode_u64(ttl.as_secs());
        match self
            .exec(&[b"SET", key, value, b"EX", &seconds[..len]])
            .await?
        {
            RespValue::Simple(_) => Ok(()),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Deletes a key. Returns true when a key was removed.
    pub async fn delete(&self, key: &[u8]) -> ClientResult<bool> {
        match self.exec(&[b"DEL", key]).await? {
            RespValue::Integer(count) => Ok(count > 0),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a time-to-live on a key. Returns true when the TTL was set.
    pub async fn expire(&self, key: &[u8], ttl: Duration) -> ClientResult<bool> {
        let (seconds, len) = encode_u64(ttl.as_secs());
        match self.exec(&[b"EXPIRE", key, &seconds[..len]]).await? {
            RespValue::Integer(value) => Ok(value == 1),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Returns TTL status for a key.
    pub async fn ttl(&self, key: &[u8]) -> ClientResult<ClientTtl> {
        match self.exec(&[b"TTL", key]).await? {
            RespValue::Integer(-2) => Ok(ClientTtl::Missing),
            RespValue::Integer(-1) => Ok(ClientTtl::NoExpiry),
            RespValue::Integer(value) if value >= 0 => {
                Ok(ClientTtl::ExpiresIn(Duration::from_secs(value as u64)))
            }
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Pings the server. Returns the raw response payload.
    pub async fn ping(&self, payload: Option<&[u8]>) -> ClientResult<Vec<u8>> {
        let response = match payload {
            Some(data) => self.exec(&[b"PING", data]).await?,
            None => self.exec(&[b"PING"]).await?,
        };
        match response {
            RespValue::Simple(text) => Ok(text),
            RespValue::Bulk(Some(data)) => Ok(data),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Fetches server INFO output.
    pub async fn info(&self) -> ClientResult<Vec<u8>> {
        match self.exec(&[b"INFO"]).await? {
            RespValue::Bulk(Some(data)) => Ok(data),
            RespValue::Error(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Borrows a connection for one command.
    ///
    /// A healthy connection goes back to the idle set; one that failed at
    /// the transport or framing level is destroyed so the next command gets
    /// a clean stream.
    async fn exec(&self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let mut conn = self.pool.get().await?;
        match conn.exec(args).await {
            Ok(value) => {
                self.pool.put(conn);
                Ok(value)
            }
            Err(err) => {
                self.pool.remove(conn, &err);
                Err(err)
            }
        }
    }
}

async fn dial_addr(addr: SocketAddr, connect_timeout: Option<Duration>) -> io::Result<TcpStream> {
    let stream = match connect_timeout {
        Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
        None => TcpStream::connect(addr).await?,
    };
    // Disable Nagle to keep request latency low for small payloads.
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn encode_u64(mut value: u64) -> ([u8; 20], usize) {
    // Stack buffer keeps the conversion allocation-free.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        return (buf, 1);
    }
    while value > 0 {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
    }
    buf[..len].reverse();
    (buf, len)
}
