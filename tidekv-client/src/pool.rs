//! # Connection Pool
//!
//! Purpose: Bound and recycle TCP connections for concurrent callers, with a
//! background replenisher keeping a minimum number of warm idle connections.
//!
//! ## Design Principles
//! 1. **Semaphore Admission**: A FIFO-fair counting semaphore caps live
//!    connections (idle + checked out); every acquisition path goes through
//!    it first, so the total can never exceed `pool_size`.
//! 2. **Minimal Locking**: The state mutex only covers idle-set membership
//!    and the live-connection count. Dialing and admission waits never hold
//!    it.
//! 3. **Lazy Eviction**: Stale connections are discarded at checkout under
//!    the caller's admission grant; a periodic sweep handles the ones no
//!    caller touches.
//! 4. **Exactly-Once Slots**: A permit is held across the dial (cancellation
//!    returns it by drop), forgotten only when a live connection takes
//!    ownership of the slot, and re-added exactly once when that connection
//!    leaves the pool.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{watch, Semaphore};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::conn::Conn;
use crate::stats::{PoolStats, StatsCounters};

const POOL_MUTEX: &str = "pool mutex poisoned";

/// Dial function supplied at construction. The pool only opens and closes
/// transports; it never interprets protocol bytes.
pub type DialFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>> + Send + Sync>;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum live connections, idle plus checked out.
    pub pool_size: usize,
    /// Idle connections the replenisher keeps warm. Clamped to `pool_size`.
    pub min_idle_conns: usize,
    /// Maximum time a `get` call waits for admission.
    pub pool_timeout: Duration,
    /// Hard connection lifetime; `None` disables the age check.
    pub conn_max_age: Option<Duration>,
    /// Idle eviction threshold; `None` disables the idle check.
    pub conn_max_idle_time: Option<Duration>,
    /// Period of the background replenish/sweep task.
    pub replenish_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            pool_size: 16,
            min_idle_conns: 0,
            pool_timeout: Duration::from_secs(5),
            conn_max_age: None,
            conn_max_idle_time: None,
            replenish_interval: Duration::from_secs(1),
        }
    }
}

/// Errors surfaced by the pool.
///
/// `Timeout` leaves the pool clean (no slot consumed) and is safe to retry;
/// `Closed` is terminal for the pool instance.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Operation attempted after `close`.
    #[error("connection pool closed")]
    Closed,
    /// Admission wait exceeded `pool_timeout`.
    #[error("connection pool timeout")]
    Timeout,
    /// The dial function failed; the admission slot was released first.
    #[error("dial failed: {0}")]
    Dial(#[source] io::Error),
}

struct PoolState {
    // LIFO: most-recently-used at the back, pushed and popped there, so
    // reuse favors warm connections and old ones age out via the sweep.
    idle: Vec<Conn>,
    total: usize,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    dial: DialFn,
    state: Mutex<PoolState>,
    queue: Semaphore,
    stats: StatsCounters,
    shutdown: watch::Sender<bool>,
}

/// Cloneable handle to a shared connection pool.
///
/// Must be created inside a Tokio runtime: construction spawns the
/// background replenisher task, which lives until `close` or until every
/// handle is dropped.
#[derive(Clone)]
pub struct ConnPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnPool")
            .field("pool_size", &self.inner.config.pool_size)
            .finish()
    }
}

impl ConnPool {
    /// Creates a pool around the given dial function.
    pub fn new(mut config: PoolConfig, dial: DialFn) -> Self {
        if config.min_idle_conns > config.pool_size {
            config.min_idle_conns = config.pool_size;
        }
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(PoolInner {
            queue: Semaphore::new(config.pool_size),
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(config.pool_size),
                total: 0,
                closed: false,
            }),
            stats: StatsCounters::new(),
            config,
            dial,
            shutdown,
        });
        spawn_replenisher(&inner);
        ConnPool { inner }
    }

    /// Checks out a connection, waiting up to `pool_timeout` for admission.
    ///
    /// Reuses the most-recently-idle connection when one is available and
    /// fresh; otherwise dials a new one. Dropping the returned future before
    /// completion releases whatever it held; no slot leaks.
    pub async fn get(&self) -> Result<Conn, PoolError> {
        if self.inner.lock().closed {
            return Err(PoolError::Closed);
        }

        let permit = match timeout(self.inner.config.pool_timeout, self.inner.queue.acquire()).await
        {
            Err(_) => {
                self.inner.stats.record_timeout();
                return Err(PoolError::Timeout);
            }
            // The semaphore only errors once `close` shut it down.
            Ok(Err(_)) => return Err(PoolError::Closed),
            Ok(Ok(permit)) => permit,
        };

        // Reuse vs dial is internal to this one admission grant: stale pops
        // are destroyed and retried without touching the semaphore.
        let now = Instant::now();
        loop {
            let candidate = self.inner.lock().idle.pop();
            let Some(conn) = candidate else { break };

            if conn.is_stale(
                now,
                self.inner.config.conn_max_age,
                self.inner.config.conn_max_idle_time,
            ) {
                self.inner.discard_stale(conn);
                continue;
            }

            self.inner.stats.record_hit();
            permit.forget();
            return Ok(conn);
        }

        self.inner.stats.record_miss();
        match (self.inner.dial)().await {
            Ok(stream) => {
                let conn = Conn::new(stream, true);
                {
                    let mut state = self.inner.lock();
                    if state.closed {
                        // Closed while dialing: drop the fresh conn and let
                        // the permit fall back into the (closed) semaphore.
                        return Err(PoolError::Closed);
                    }
                    state.total += 1;
                }
                permit.forget();
                Ok(conn)
            }
            // Dropping the permit releases the slot before the error
            // propagates.
            Err(err) => Err(PoolError::Dial(err)),
        }
    }

    /// Returns a healthy connection to the idle set.
    ///
    /// Unusable connections are routed through `remove` instead. If the pool
    /// closed while the connection was out, it is destroyed rather than
    /// re-pooled.
    pub fn put(&self, mut conn: Conn) {
        if !conn.usable() {
            self.remove(conn, "unusable");
            return;
        }
        if !conn.pooled() {
            // Standalone connections never held a slot; just drop them.
            return;
        }

        conn.touch(Instant::now());

        let mut surplus = None;
        let release = {
            let mut state = self.inner.lock();
            if state.closed {
                state.total -= 1;
                surplus = Some(conn);
                false
            } else if state.idle.len() >= self.inner.config.pool_size {
                // The admission invariant makes this unreachable; close the
                // surplus rather than retain it if it ever happens.
                state.total -= 1;
                surplus = Some(conn);
                true
            } else {
                state.idle.push(conn);
                true
            }
        };

        drop(surplus);
        if release {
            self.inner.queue.add_permits(1);
        }
    }

    /// Destroys a connection and releases its admission slot.
    pub fn remove(&self, conn: Conn, reason: impl fmt::Display) {
        debug!(id = conn.id(), %reason, "removing connection");
        let mut release = false;
        if conn.pooled() {
            let mut state = self.inner.lock();
            state.total -= 1;
            release = !state.closed;
        }
        if release {
            self.inner.queue.add_permits(1);
        }
        // Dropping the conn closes the transport.
    }

    /// Dials a connection outside pool limits, for out-of-band use.
    ///
    /// The result does not count against `pool_size`; hand it back with
    /// `put` or `remove` (both just close it) or drop it directly.
    pub async fn new_standalone_conn(&self) -> Result<Conn, PoolError> {
        if self.inner.lock().closed {
            return Err(PoolError::Closed);
        }
        let stream = (self.inner.dial)().await.map_err(PoolError::Dial)?;
        Ok(Conn::new(stream, false))
    }

    /// Closes the pool: fails pending and future `get` calls, stops the
    /// replenisher, and drains every idle connection.
    ///
    /// Checked-out connections are not force-closed; their eventual `put` or
    /// `remove` observes the closed state and destroys them. Idempotent.
    pub fn close(&self) {
        let drained = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.total -= state.idle.len();
            std::mem::take(&mut state.idle)
        };

        let _ = self.inner.shutdown.send(true);
        self.inner.queue.close();
        debug!(drained = drained.len(), "pool closed, draining idle connections");
        drop(drained);
    }

    /// Point-in-time counters. Never blocks `get`/`put`/`remove` beyond one
    /// short lock to read the gauges.
    pub fn stats(&self) -> PoolStats {
        let (total, idle) = {
            let state = self.inner.lock();
            (state.total, state.idle.len())
        };
        self.inner.stats.snapshot(total, idle)
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect(POOL_MUTEX)
    }

    /// Destroys a connection popped from the idle set for failing the
    /// staleness check. The caller keeps its admission grant.
    fn discard_stale(&self, conn: Conn) {
        debug!(id = conn.id(), "discarding stale connection");
        self.lock().total -= 1;
        self.stats.record_stale(1);
    }

    /// One sweep over the idle set, evicting members that aged out.
    fn sweep_stale(&self) {
        if self.config.conn_max_age.is_none() && self.config.conn_max_idle_time.is_none() {
            return;
        }

        let now = Instant::now();
        let stale = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let mut stale = Vec::new();
            let mut kept = Vec::with_capacity(state.idle.len());
            for conn in state.idle.drain(..) {
                if conn.is_stale(now, self.config.conn_max_age, self.config.conn_max_idle_time) {
                    stale.push(conn);
                } else {
                    kept.push(conn);
                }
            }
            state.idle = kept;
            state.total -= stale.len();
            stale
        };

        if !stale.is_empty() {
            debug!(count = stale.len(), "evicted stale idle connections");
            self.stats.record_stale(stale.len() as u64);
            self.queue.add_permits(stale.len());
        }
    }

    /// Tops the idle set up to `min_idle_conns`, without contending with
    /// foreground traffic for admission.
    async fn top_up_idle(&self) {
        loop {
            let deficit = {
                let state = self.lock();
                if state.closed {
                    return;
                }
                self.config.min_idle_conns.saturating_sub(state.idle.len())
            };
            if deficit == 0 {
                return;
            }

            // Non-blocking: a saturated pool means live traffic owns the
            // slots and replenishment backs off until the next tick.
            let Ok(permit) = self.queue.try_acquire() else {
                return;
            };

            match (self.dial)().await {
                Ok(stream) => {
                    let conn = Conn::new(stream, true);
                    let mut state = self.lock();
                    if state.closed {
                        return;
                    }
                    state.total += 1;
                    state.idle.push(conn);
                    permit.forget();
                }
                Err(err) => {
                    // Best effort: release the slot and wait for the next
                    // tick instead of hammering a down server.
                    warn!(error = %err, "replenish dial failed");
                    return;
                }
            }
        }
    }
}

/// Periodic replenish/sweep task, cancelled atomically with `close` and
/// self-terminating once every pool handle is gone.
fn spawn_replenisher(inner: &Arc<PoolInner>) {
    let weak = Arc::downgrade(inner);
    let mut shutdown = inner.shutdown.subscribe();
    let period = inner.config.replenish_interval;

    tokio::spawn(async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                // The flag only ever flips to true, and a dropped sender
                // means the pool itself is gone: either way, stop.
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.sweep_stale();
                    inner.top_up_idle().await;
                }
            }
        }
    });
}
