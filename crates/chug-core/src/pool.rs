//! Connection pooling.
//!
//! One generic bounded pool (semaphore for concurrency control, LIFO idle
//! list, lifetime and idle recycling, ping on construction) instantiated for
//! the two backends, plus the two process-wide lazily constructed pools the
//! rest of the engine goes through.
//!
//! The process-wide state is deliberate: every component that touches a
//! database goes through these pools, and recreating them per operation
//! would destroy connection reuse. `close_all` exists so tests and orderly
//! shutdowns can reset them.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::Error;
use crate::sink::ChFactory;
use crate::source::PgFactory;

/// A connection the pool can hold.
#[async_trait]
pub trait PooledConn: Send + Sync + 'static {
    /// Liveness probe; `false` drops the connection from the pool.
    async fn ping(&self) -> bool;
}

/// Creates connections for one backend.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Connection type this factory produces
    type Conn: PooledConn;

    /// Open a new connection to `url`.
    async fn connect(&self, url: &str) -> crate::Result<Self::Conn>;
}

/// Pool sizing and lifecycle parameters.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Connections kept warm
    pub min_size: usize,
    /// Hard ceiling on concurrently borrowed connections
    pub max_size: usize,
    /// How long `get` waits for a free slot
    pub acquire_timeout: Duration,
    /// Connections older than this are recycled
    pub max_lifetime: Duration,
    /// Connections idle longer than this are recycled
    pub idle_timeout: Duration,
    /// Idle connections are re-pinged on borrow once they sit past this
    pub health_check_interval: Duration,
    /// Timeout for the construction-time ping
    pub ping_timeout: Duration,
}

impl PoolConfig {
    /// Parameters for the source (PostgreSQL) pool.
    pub const fn source_defaults() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(1800),
            health_check_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(10),
        }
    }

    /// Parameters for the destination (ClickHouse) pool.
    pub const fn dest_defaults() -> Self {
        Self {
            min_size: 5,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(1800),
            health_check_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

struct PoolEntry<C> {
    conn: C,
    created_at: Instant,
    last_used: Instant,
}

/// A bounded connection pool for one backend.
pub struct ConnectionPool<F: ConnectionFactory> {
    url: String,
    config: PoolConfig,
    factory: F,
    idle: Mutex<Vec<PoolEntry<F::Conn>>>,
    semaphore: Arc<Semaphore>,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Construct a pool and verify connectivity.
    ///
    /// The first connection is opened and pinged under `ping_timeout`; on
    /// failure the pool is discarded and an error returned, so the next
    /// request retries construction. Up to `min_size` connections are then
    /// warmed best-effort.
    pub async fn connect(url: &str, config: PoolConfig, factory: F) -> crate::Result<Arc<Self>> {
        let first = factory.connect(url).await?;
        let alive = tokio::time::timeout(config.ping_timeout, first.ping())
            .await
            .unwrap_or(false);
        if !alive {
            return Err(Error::connect(format!(
                "ping failed within {:?} during pool construction",
                config.ping_timeout
            )));
        }

        let pool = Arc::new(Self {
            url: url.to_string(),
            config,
            factory,
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            semaphore: Arc::new(Semaphore::new(config.max_size)),
        });

        {
            let mut idle = pool.idle.lock().await;
            let now = Instant::now();
            idle.push(PoolEntry {
                conn: first,
                created_at: now,
                last_used: now,
            });
            while idle.len() < config.min_size {
                match pool.factory.connect(url).await {
                    Ok(conn) => {
                        let now = Instant::now();
                        idle.push(PoolEntry {
                            conn,
                            created_at: now,
                            last_used: now,
                        });
                    }
                    Err(err) => {
                        debug!(error = %err, "could not prewarm pool connection");
                        break;
                    }
                }
            }
        }

        Ok(pool)
    }

    /// Borrow a connection. Expired idle entries are recycled on the way;
    /// entries idle past the health-check interval are re-pinged first.
    pub async fn get(self: &Arc<Self>) -> crate::Result<PoolGuard<F>> {
        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| {
            Error::connect(format!(
                "timed out after {:?} waiting for a pooled connection",
                self.config.acquire_timeout
            ))
        })?
        .map_err(|_| Error::connect("pool is shut down"))?;

        let reused = {
            let mut idle = self.idle.lock().await;
            loop {
                let Some(entry) = idle.pop() else { break None };
                if entry.created_at.elapsed() > self.config.max_lifetime
                    || entry.last_used.elapsed() > self.config.idle_timeout
                {
                    continue;
                }
                if entry.last_used.elapsed() >= self.config.health_check_interval
                    && !entry.conn.ping().await
                {
                    warn!("dropping pooled connection that failed its health check");
                    continue;
                }
                break Some(entry);
            }
        };

        let entry = match reused {
            Some(entry) => entry,
            None => {
                let conn = self.factory.connect(&self.url).await?;
                let now = Instant::now();
                PoolEntry {
                    conn,
                    created_at: now,
                    last_used: now,
                }
            }
        };

        Ok(PoolGuard {
            entry: Some(entry),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Drop every idle connection. Borrowed connections are dropped when
    /// their guards return them.
    pub async fn close(&self) {
        self.idle.lock().await.clear();
    }

    /// Number of idle connections right now.
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }
}

/// A connection borrowed from a [`ConnectionPool`]; returns itself on drop.
///
/// Invariant: `entry` is `Some` for the guard's whole life; only `Drop`
/// takes it, to hand the connection back to the idle list.
pub struct PoolGuard<F: ConnectionFactory> {
    entry: Option<PoolEntry<F::Conn>>,
    pool: Arc<ConnectionPool<F>>,
    _permit: OwnedSemaphorePermit,
}

impl<F: ConnectionFactory> std::fmt::Debug for PoolGuard<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> std::ops::Deref for PoolGuard<F> {
    type Target = F::Conn;

    fn deref(&self) -> &Self::Target {
        match &self.entry {
            Some(entry) => &entry.conn,
            None => unreachable!("guard entry is only vacated by Drop"),
        }
    }
}

impl<F: ConnectionFactory> Drop for PoolGuard<F> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entry.take() {
            entry.last_used = Instant::now();
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move {
                pool.idle.lock().await.push(entry);
            });
        }
    }
}

// Process-wide pools, lazily constructed from the first URL they are asked
// for. Guarded by async mutexes because construction itself awaits.
static SOURCE_POOL: Mutex<Option<Arc<ConnectionPool<PgFactory>>>> = Mutex::const_new(None);
static DEST_POOL: Mutex<Option<Arc<ConnectionPool<ChFactory>>>> = Mutex::const_new(None);

/// The process-wide source (PostgreSQL) pool.
pub async fn source_pool(url: &str) -> crate::Result<Arc<ConnectionPool<PgFactory>>> {
    let mut slot = SOURCE_POOL.lock().await;
    if let Some(pool) = slot.as_ref() {
        return Ok(Arc::clone(pool));
    }
    let pool = ConnectionPool::connect(url, PoolConfig::source_defaults(), PgFactory).await?;
    *slot = Some(Arc::clone(&pool));
    Ok(pool)
}

/// The process-wide destination (ClickHouse) pool.
pub async fn dest_pool(url: &str) -> crate::Result<Arc<ConnectionPool<ChFactory>>> {
    let mut slot = DEST_POOL.lock().await;
    if let Some(pool) = slot.as_ref() {
        return Ok(Arc::clone(pool));
    }
    let pool = ConnectionPool::connect(url, PoolConfig::dest_defaults(), ChFactory).await?;
    *slot = Some(Arc::clone(&pool));
    Ok(pool)
}

/// Tear down both process-wide pools. The next `source_pool`/`dest_pool`
/// call reconstructs them; tests rely on this for isolation.
pub async fn close_all() {
    if let Some(pool) = SOURCE_POOL.lock().await.take() {
        pool.close().await;
    }
    if let Some(pool) = DEST_POOL.lock().await.take() {
        pool.close().await;
    }
}
