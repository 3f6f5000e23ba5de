use std::sync::RwLock;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};

use crate::config::{DatabaseConfig, RetryConfig};
use crate::error::DatabaseError;

/// Pooled PostgreSQL connections with retry and health checks.
///
/// Thin wrapper over `sqlx::PgPool`: pool creation and
/// [`Pool::acquire_healthy`] are wrapped in the configured retry policy,
/// transient connection errors are retried with capped exponential
/// backoff, and permanent query errors fail fast. JSONB values round-trip
/// as `serde_json::Value` through sqlx without explicit codecs.
pub struct Pool {
    config: DatabaseConfig,
    inner: RwLock<Option<PgPool>>,
}

impl Pool {
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Open the pool. Idempotent: a second call with an open pool is a
    /// no-op.
    pub async fn connect(&self) -> Result<(), DatabaseError> {
        if self.is_connected() {
            return Ok(());
        }

        let options = PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .username(&self.config.user)
            .password(&self.config.password)
            .database(&self.config.dbname)
            .application_name(&self.config.application_name);

        let timezone = self.config.timezone.clone();
        let pool_options = PgPoolOptions::new()
            .min_connections(self.config.min_size)
            .max_connections(self.config.max_size)
            .acquire_timeout(self.config.acquire_timeout())
            .after_connect(move |conn, _meta| {
                let timezone = timezone.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET TIME ZONE '{timezone}'"))
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            });

        let pool = with_retry(&self.config.retry, "pool_connect", || {
            let pool_options = pool_options.clone();
            let options = options.clone();
            async move { pool_options.connect_with(options).await.map_err(DatabaseError::from) }
        })
        .await?;

        tracing::debug!(
            target: "bigbrotr::db::pool",
            "connected host={} dbname={} min={} max={}",
            self.config.host,
            self.config.dbname,
            self.config.min_size,
            self.config.max_size
        );

        *self.inner.write().expect("pool lock poisoned") = Some(pool);
        Ok(())
    }

    pub async fn close(&self) {
        let pool = self.inner.write().expect("pool lock poisoned").take();
        if let Some(pool) = pool {
            pool.close().await;
            tracing::debug!(target: "bigbrotr::db::pool", "closed");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .read()
            .expect("pool lock poisoned")
            .as_ref()
            .is_some_and(|p| !p.is_closed())
    }

    /// Handle to the underlying sqlx pool for bound queries.
    pub fn handle(&self) -> Result<PgPool, DatabaseError> {
        self.inner
            .read()
            .expect("pool lock poisoned")
            .clone()
            .ok_or(DatabaseError::NotConnected)
    }

    /// Acquire a connection; released when the guard drops.
    pub async fn acquire(
        &self,
    ) -> Result<sqlx::pool::PoolConnection<Postgres>, DatabaseError> {
        Ok(self.handle()?.acquire().await?)
    }

    /// Acquire a connection that answers `SELECT 1` within the health
    /// check timeout. Dead connections are dropped and the acquisition
    /// retried per the retry policy.
    pub async fn acquire_healthy(
        &self,
    ) -> Result<sqlx::pool::PoolConnection<Postgres>, DatabaseError> {
        let handle = self.handle()?;
        let timeout = self.config.health_check_timeout();

        with_retry(&self.config.retry, "acquire_healthy", || {
            let handle = handle.clone();
            async move {
                let mut conn = handle.acquire().await.map_err(DatabaseError::from)?;
                let probe = tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(&mut *conn))
                    .await;
                match probe {
                    Ok(Ok(_)) => Ok(conn),
                    Ok(Err(e)) => {
                        // Do not return the broken connection to the pool.
                        conn.detach();
                        Err(DatabaseError::Pool(format!("health check failed: {e}")))
                    }
                    Err(_) => {
                        conn.detach();
                        Err(DatabaseError::Pool("health check timed out".to_string()))
                    }
                }
            }
        })
        .await
    }

    pub async fn fetch(&self, sql: &str) -> Result<Vec<PgRow>, DatabaseError> {
        Ok(sqlx::query(sql).fetch_all(&self.handle()?).await?)
    }

    pub async fn fetch_row(&self, sql: &str) -> Result<Option<PgRow>, DatabaseError> {
        Ok(sqlx::query(sql).fetch_optional(&self.handle()?).await?)
    }

    pub async fn fetch_val<T>(&self, sql: &str) -> Result<T, DatabaseError>
    where
        T: for<'r> sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres> + Send + Unpin,
    {
        let row = sqlx::query(sql).fetch_one(&self.handle()?).await?;
        Ok(row.try_get::<T, _>(0)?)
    }

    pub async fn execute(&self, sql: &str) -> Result<u64, DatabaseError> {
        Ok(sqlx::query(sql)
            .execute(&self.handle()?)
            .await?
            .rows_affected())
    }

    pub async fn transaction(&self) -> Result<Transaction<'static, Postgres>, DatabaseError> {
        Ok(self.handle()?.begin().await?)
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("host", &self.config.host)
            .field("dbname", &self.config.dbname)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Run an operation with the configured retry policy.
///
/// Only transient ([`DatabaseError::Pool`]) errors are retried; permanent
/// errors and cancellation surface immediately.
pub async fn with_retry<T, F, Fut>(
    retry: &RetryConfig,
    op: &str,
    mut run: F,
) -> Result<T, DatabaseError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DatabaseError>>,
{
    let mut attempt = 0u32;
    loop {
        match run().await {
            Ok(value) => return Ok(value),
            Err(err @ DatabaseError::Pool(_)) if attempt + 1 < retry.max_attempts => {
                let delay = retry.delay_for(attempt);
                tracing::warn!(
                    target: "bigbrotr::db::pool",
                    "retrying op={op} attempt={} delay_ms={} error={err}",
                    attempt + 1,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            exponential_backoff: true,
        }
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&test_retry(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(DatabaseError::Pool("blip".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&test_retry(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DatabaseError::Pool("still down".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&test_retry(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DatabaseError::Query("syntax error".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(DatabaseError::Query(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pool_starts_disconnected() {
        let pool = Pool::new(DatabaseConfig::default());
        assert!(!pool.is_connected());
        assert!(matches!(pool.handle(), Err(DatabaseError::NotConnected)));
    }

    // Exercises a live PostgreSQL; run with a configured DATABASE_URL host.
    #[tokio::test]
    #[ignore = "requires PostgreSQL"]
    async fn connect_is_idempotent() {
        let mut config = DatabaseConfig::default();
        config.password = std::env::var("DB_PASSWORD").unwrap_or_default();
        let pool = Pool::new(config);
        pool.connect().await.unwrap();
        pool.connect().await.unwrap();
        assert!(pool.is_connected());

        let one: i32 = pool.fetch_val("SELECT 1").await.unwrap();
        assert_eq!(one, 1);

        let conn = pool.acquire_healthy().await;
        assert!(conn.is_ok());

        pool.close().await;
        assert!(!pool.is_connected());
    }
}
