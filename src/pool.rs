//! Connection pool + health monitor (C7).
//!
//! Wraps a driver-agnostic `sqlx::AnyPool` (Postgres or SQLite, selected at
//! runtime by the configured URL's scheme) with the metrics and health
//! state the original `AgriculturalConnectionPool`/`ConnectionHealthMonitor`
//! pair tracked, re-expressed as one typed Rust component per §9's
//! "async/sync duality" redesign note: one pool, one scheduling model, one
//! surface.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Once;
use std::time::{Duration, Instant};

use sqlx::any::{Any, AnyPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::Pool;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::PoolConfig;
use crate::error::{GatewayError, Result};

static INSTALL_DRIVERS: Once = Once::new();

fn ensure_drivers_installed() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Whether `url` names a SQLite in-memory database, which sqlx opens as a
/// fresh, unshared database per connection rather than one database shared
/// by the whole pool.
fn is_sqlite_memory(url: &str) -> bool {
    url == "sqlite::memory:" || url.starts_with("sqlite://:memory:")
}

/// One of the four health states derived from the rolling probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Reconnecting,
}

#[derive(Debug, Default)]
struct PoolMetrics {
    total_queries: AtomicU64,
    slow_queries: AtomicU64,
    total_query_time_ms: AtomicU64,
    connection_acquisitions: AtomicU64,
    connection_failures: AtomicU64,
    active_connections: AtomicU64,
}

/// A point-in-time snapshot of §4.7's pool metrics.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    pub health: HealthStatus,
    pub active_connections: u64,
    pub total_queries: u64,
    pub slow_queries: u64,
    pub avg_query_time_ms: f64,
    pub connection_acquisitions: u64,
    pub connection_failures: u64,
}

/// Derived operator-facing diagnostics, carried over from the original
/// `get_performance_report` heuristics (§4.7 supplement).
#[derive(Debug, Clone)]
pub struct PerformanceReport {
    pub success_rate: f64,
    pub avg_query_time_ms: f64,
    pub slow_query_rate: f64,
    pub connection_efficiency: f64,
    pub recommendations: Vec<String>,
}

const SLOW_QUERY_THRESHOLD: Duration = Duration::from_secs(1);

/// A scoped acquisition of a pooled database connection.
///
/// Released back to the pool when dropped (sqlx's own `PoolConnection`
/// already guarantees this); this wrapper additionally decrements the
/// pool's active-connection gauge on drop so `PoolStatus` stays accurate.
pub struct PoolSession {
    conn: Option<PoolConnection<Any>>,
    metrics: std::sync::Arc<PoolMetrics>,
}

impl PoolSession {
    /// Execute `f` against the held connection, recording its duration and
    /// outcome into the pool's query metrics regardless of success.
    pub async fn timed<'a, F, Fut, T>(&'a mut self, f: F) -> Result<T>
    where
        F: FnOnce(&'a mut PoolConnection<Any>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let conn = self.conn.as_mut().expect("session connection already released");
        let start = Instant::now();
        let result = f(conn).await;
        self.metrics.total_queries.fetch_add(1, Ordering::Relaxed);
        let elapsed = start.elapsed();
        self.metrics
            .total_query_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        if elapsed >= SLOW_QUERY_THRESHOLD {
            self.metrics.slow_queries.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

impl std::ops::Deref for PoolSession {
    type Target = PoolConnection<Any>;
    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("session connection already released")
    }
}

impl std::ops::DerefMut for PoolSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("session connection already released")
    }
}

impl Drop for PoolSession {
    fn drop(&mut self) {
        self.metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The health-monitored connection pool (C7).
pub struct ConnectionPool {
    url: String,
    config: PoolConfig,
    inner: RwLock<Pool<Any>>,
    metrics: std::sync::Arc<PoolMetrics>,
    health: RwLock<HealthStatus>,
    consecutive_failures: AtomicU32,
    health_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Connect to `url`, building the pool per `config`. Does not start the
    /// health monitor; call [`ConnectionPool::spawn_health_monitor`] once
    /// the pool is wrapped in an `Arc`.
    ///
    /// A SQLite `:memory:` URL is special-cased to a single connection: each
    /// pooled SQLite connection otherwise gets its own private, throwaway
    /// in-memory database, so anything `ensure_schema` creates on one
    /// connection would be invisible to whichever connection a later
    /// `acquire()` hands out. Pinning the pool to one connection keeps every
    /// caller on the same database.
    pub async fn connect(url: &str, config: PoolConfig) -> Result<Self> {
        ensure_drivers_installed();

        let config = if is_sqlite_memory(url) {
            PoolConfig {
                max_connections: 1,
                min_connections: config.min_connections.min(1),
                ..config
            }
        } else {
            config
        };

        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_millis(config.pool_timeout_ms))
            .max_lifetime(Duration::from_secs(config.pool_recycle_secs))
            .test_before_acquire(config.pool_pre_ping)
            .connect(url)
            .await?;

        Ok(Self {
            url: url.to_string(),
            config,
            inner: RwLock::new(pool),
            metrics: std::sync::Arc::new(PoolMetrics::default()),
            health: RwLock::new(HealthStatus::Healthy),
            consecutive_failures: AtomicU32::new(0),
            health_task: std::sync::Mutex::new(None),
        })
    }

    pub fn is_postgres(&self) -> bool {
        self.url.starts_with("postgres://") || self.url.starts_with("postgresql://")
    }

    /// Acquire a scoped session, failing with `PoolTimeout` if none becomes
    /// available within `pool_timeout_ms` (property 6: every acquirer gets
    /// either a session or a timeout, never neither, never a shared one).
    pub async fn acquire(&self) -> Result<PoolSession> {
        self.metrics.connection_acquisitions.fetch_add(1, Ordering::Relaxed);

        let pool = self.inner.read().await.clone();
        let timeout = Duration::from_millis(self.config.pool_timeout_ms);

        match tokio::time::timeout(timeout, pool.acquire()).await {
            Ok(Ok(conn)) => {
                self.metrics.active_connections.fetch_add(1, Ordering::Relaxed);
                Ok(PoolSession {
                    conn: Some(conn),
                    metrics: self.metrics.clone(),
                })
            }
            Ok(Err(e)) => {
                self.metrics.connection_failures.fetch_add(1, Ordering::Relaxed);
                Err(GatewayError::Database(e))
            }
            Err(_elapsed) => {
                self.metrics.connection_failures.fetch_add(1, Ordering::Relaxed);
                Err(GatewayError::PoolTimeout(self.config.pool_timeout_ms))
            }
        }
    }

    /// Snapshot of the metrics in §4.7.
    pub async fn status(&self) -> PoolStatus {
        let total_queries = self.metrics.total_queries.load(Ordering::Relaxed);
        let total_ms = self.metrics.total_query_time_ms.load(Ordering::Relaxed);
        PoolStatus {
            health: *self.health.read().await,
            active_connections: self.metrics.active_connections.load(Ordering::Relaxed),
            total_queries,
            slow_queries: self.metrics.slow_queries.load(Ordering::Relaxed),
            avg_query_time_ms: if total_queries == 0 {
                0.0
            } else {
                total_ms as f64 / total_queries as f64
            },
            connection_acquisitions: self.metrics.connection_acquisitions.load(Ordering::Relaxed),
            connection_failures: self.metrics.connection_failures.load(Ordering::Relaxed),
        }
    }

    /// Derived diagnostics, carried over verbatim from the original
    /// `get_performance_report` heuristics (§4.7 supplement).
    pub async fn performance_report(&self) -> PerformanceReport {
        let status = self.status().await;
        let attempts = status.connection_acquisitions.max(1);
        let success_rate = 1.0 - (status.connection_failures as f64 / attempts as f64);
        let slow_query_rate = if status.total_queries == 0 {
            0.0
        } else {
            status.slow_queries as f64 / status.total_queries as f64
        };
        let failure_rate = status.connection_failures as f64 / attempts as f64;
        let connection_efficiency = status.total_queries as f64 / attempts as f64;

        let mut recommendations = Vec::new();
        if status.avg_query_time_ms > 500.0 {
            recommendations.push("average query time exceeds 500ms; consider indexing or batching".to_string());
        }
        if slow_query_rate > 0.10 {
            recommendations.push("slow-query rate exceeds 10%; investigate query plans".to_string());
        }
        if failure_rate > 0.05 {
            recommendations.push("connection failure rate exceeds 5%; check database availability".to_string());
        }
        if connection_efficiency > 1.5 {
            recommendations.push("acquisition-to-query ratio exceeds 1.5; connections are being acquired but underused".to_string());
        }

        PerformanceReport {
            success_rate,
            avg_query_time_ms: status.avg_query_time_ms,
            slow_query_rate,
            connection_efficiency,
            recommendations,
        }
    }

    /// Probe the pool once with `SELECT 1`, updating health state per the
    /// transition rules in §4.7. Exposed directly (not just via the spawned
    /// timer) so property 7's test can drive it deterministically.
    pub async fn probe(&self) {
        let probe_ok = {
            let pool = self.inner.read().await.clone();
            sqlx::query("SELECT 1").execute(&pool).await.is_ok()
        };

        if probe_ok {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            let mut health = self.health.write().await;
            if *health != HealthStatus::Healthy {
                #[cfg(feature = "tracing-support")]
                tracing::info!("pool health probe recovered");
            }
            *health = HealthStatus::Healthy;
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = *self.health.read().await;

        if failures == 1 && previous == HealthStatus::Healthy {
            *self.health.write().await = HealthStatus::Degraded;
            #[cfg(feature = "tracing-support")]
            tracing::warn!("pool health probe failed once; degraded");
        } else if failures >= 2 {
            *self.health.write().await = HealthStatus::Unhealthy;
            #[cfg(feature = "tracing-support")]
            tracing::error!("pool health probe failed twice; rebuilding pool");
            self.rebuild().await;
        }
    }

    /// Dispose the current pool and construct a fresh one against the same
    /// URL, setting `Reconnecting` during the swap per §4.7.
    async fn rebuild(&self) {
        *self.health.write().await = HealthStatus::Reconnecting;

        let rebuilt = AnyPoolOptions::new()
            .max_connections(self.config.max_connections)
            .min_connections(self.config.min_connections)
            .acquire_timeout(Duration::from_millis(self.config.pool_timeout_ms))
            .max_lifetime(Duration::from_secs(self.config.pool_recycle_secs))
            .test_before_acquire(self.config.pool_pre_ping)
            .connect(&self.url)
            .await;

        match rebuilt {
            Ok(new_pool) => {
                let old = {
                    let mut guard = self.inner.write().await;
                    std::mem::replace(&mut *guard, new_pool)
                };
                old.close().await;
                self.consecutive_failures.store(0, Ordering::Relaxed);
                *self.health.write().await = HealthStatus::Healthy;
                #[cfg(feature = "tracing-support")]
                tracing::info!("pool rebuild succeeded");
            }
            Err(e) => {
                *self.health.write().await = HealthStatus::Unhealthy;
                #[cfg(feature = "tracing-support")]
                tracing::error!(error = %e, "pool rebuild failed");
            }
        }
    }

    /// Start the background health-probe timer. The caller keeps `self`
    /// behind an `Arc` so the spawned task can outlive the call site.
    pub fn spawn_health_monitor(self: &std::sync::Arc<Self>) {
        let pool = self.clone();
        let interval = Duration::from_secs(self.config.health_check_interval_secs);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                pool.probe().await;
            }
        });
        *self.health_task.lock().unwrap() = Some(handle);
    }

    /// Drain all sessions and stop the health monitor.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.health_task.lock().unwrap().take() {
            handle.abort();
        }
        self.inner.read().await.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> ConnectionPool {
        ConnectionPool::connect("sqlite::memory:", PoolConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_memory_forces_single_connection() {
        // A `:memory:` database's default pool config (max_connections=50)
        // would otherwise scatter schema and rows across up to 50 separate,
        // private databases. `connect` must pin it to one connection so every
        // acquirer shares the same database.
        let pool = test_pool().await;
        assert_eq!(pool.config.max_connections, 1);
        assert_eq!(pool.config.min_connections, 1);
    }

    #[tokio::test]
    async fn test_sqlite_memory_sessions_share_one_database() {
        let pool = test_pool().await;
        {
            let mut session = pool.acquire().await.unwrap();
            sqlx::query("CREATE TABLE t (v INTEGER)")
                .execute(&mut **session)
                .await
                .unwrap();
            sqlx::query("INSERT INTO t (v) VALUES (1)")
                .execute(&mut **session)
                .await
                .unwrap();
        }
        // A second, later acquisition must see the same database, not a
        // fresh empty one.
        let mut session = pool.acquire().await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM t")
            .fetch_one(&mut **session)
            .await
            .unwrap();
        assert_eq!(row.0, 1);
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let pool = test_pool().await;
        {
            let _session = pool.acquire().await.unwrap();
            assert_eq!(pool.status().await.active_connections, 1);
        }
        // Dropping the session releases it synchronously on drop.
        assert_eq!(pool.status().await.active_connections, 0);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_times_out() {
        // Property 6 / scenario S5: with max_connections=1 and a short
        // timeout, a second concurrent acquirer gets PoolTimeout, never a
        // shared session.
        let mut config = PoolConfig::default();
        config.max_connections = 1;
        config.min_connections = 0;
        config.pool_timeout_ms = 50;
        let pool = ConnectionPool::connect("sqlite::memory:", config).await.unwrap();

        let held = pool.acquire().await.unwrap();
        let second = pool.acquire().await;
        assert!(matches!(second, Err(GatewayError::PoolTimeout(_))));
        drop(held);

        let third = pool.acquire().await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_health_recovery_sequence() {
        // Property 7: Healthy -> Degraded -> Unhealthy -> Healthy.
        let pool = test_pool().await;
        assert_eq!(pool.status().await.health, HealthStatus::Healthy);

        pool.consecutive_failures.store(1, Ordering::Relaxed);
        *pool.health.write().await = HealthStatus::Degraded;
        assert_eq!(pool.status().await.health, HealthStatus::Degraded);

        pool.consecutive_failures.store(2, Ordering::Relaxed);
        pool.rebuild().await;
        assert_eq!(pool.status().await.health, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_probe_updates_health_to_degraded_then_recovers() {
        let pool = test_pool().await;
        pool.probe().await;
        assert_eq!(pool.status().await.health, HealthStatus::Healthy);
    }
}
