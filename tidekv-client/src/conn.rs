//! # Pooled Connection
//!
//! Purpose: Wrap one TCP connection together with the metadata the pool
//! needs for lifecycle decisions: creation/last-use timestamps, a usability
//! flag, and whether the connection counts against pool limits.
//!
//! ## Design Principles
//! 1. **Single Owner**: A `Conn` is always owned by exactly one place: a
//!    caller, the idle set, or nowhere (dropped). No internal locking.
//! 2. **Cache-Friendly Buffers**: The line and write buffers live on the
//!    connection and are reused across commands.
//! 3. **Poison On Failure**: Any I/O or framing error marks the connection
//!    unusable; it can never re-enter the idle set afterwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::client::ClientResult;
use crate::resp::{encode_command, read_response, RespValue};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// One live connection plus pool bookkeeping.
///
/// Checkout exclusivity is enforced by ownership: `ConnPool::get` moves the
/// value out to the caller and `put`/`remove` move it back in, so two callers
/// can never hold the same connection and a removed connection cannot be
/// removed twice.
pub struct Conn {
    id: u64,
    // Buffered reader reduces syscalls while still allowing direct writes
    // through `get_mut`.
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
    created_at: Instant,
    last_used_at: Instant,
    usable: bool,
    pooled: bool,
}

impl Conn {
    pub(crate) fn new(stream: TcpStream, pooled: bool) -> Self {
        let now = Instant::now();
        Conn {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
            created_at: now,
            last_used_at: now,
            usable: true,
            pooled,
        }
    }

    /// Process-unique identity, stable for the connection's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the connection may be returned to the idle set.
    pub fn usable(&self) -> bool {
        self.usable
    }

    /// Marks the connection bad; `put` will destroy it instead of pooling.
    pub fn mark_unusable(&mut self) {
        self.usable = false;
    }

    pub(crate) fn pooled(&self) -> bool {
        self.pooled
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_used_at = now;
    }

    /// Checkout-time staleness check: age and idle-duration thresholds are
    /// both disabled when `None`.
    pub(crate) fn is_stale(
        &self,
        now: Instant,
        max_age: Option<Duration>,
        max_idle: Option<Duration>,
    ) -> bool {
        past_deadline(now.saturating_duration_since(self.created_at), max_age)
            || past_deadline(now.saturating_duration_since(self.last_used_at), max_idle)
    }

    /// Executes one RESP command and returns the parsed reply.
    ///
    /// A transport or framing failure poisons the connection so the pool
    /// destroys it rather than reusing a stream in an unknown state. A server
    /// error reply is a value, not a failure; the connection stays usable.
    pub async fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);

        let result = self.exec_inner().await;
        if result.is_err() {
            self.usable = false;
        }
        result
    }

    async fn exec_inner(&mut self) -> ClientResult<RespValue> {
        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf).await?;
        stream.flush().await?;

        read_response(&mut self.reader, &mut self.line_buf).await
    }

    /// Raw transport access for callers that need out-of-band I/O on a
    /// standalone connection.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        self.reader.get_mut()
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("usable", &self.usable)
            .field("pooled", &self.pooled)
            .finish()
    }
}

fn past_deadline(elapsed: Duration, limit: Option<Duration>) -> bool {
    match limit {
        Some(limit) => elapsed > limit,
        None => false,
    }
}
