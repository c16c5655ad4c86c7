//! # TideKV Async Client
//!
//! Purpose: Provide an asynchronous Redis-compatible client built around a
//! bounded connection pool, so callers borrow a warm TCP connection per
//! command instead of paying a handshake each time.
//!
//! ## Design Principles
//! 1. **Bounded Admission**: A FIFO semaphore caps live connections; callers
//!    queue fairly instead of stampeding the server.
//! 2. **Minimal Locking**: The pool mutex only covers idle-set membership;
//!    dialing and command I/O happen outside it.
//! 3. **Lazy Eviction**: Staleness is checked at checkout, with a background
//!    sweep keeping long-idle connections from lingering.
//! 4. **Typed Failures**: Pool exhaustion, closure, and dial errors are
//!    distinct from protocol and server errors, so callers can pick a retry
//!    policy.

mod client;
mod conn;
mod pool;
mod resp;
mod stats;

pub use client::{ClientConfig, ClientError, ClientResult, ClientTtl, KVClient};
pub use conn::Conn;
pub use pool::{ConnPool, DialFn, PoolConfig, PoolError};
pub use resp::RespValue;
pub use stats::PoolStats;
