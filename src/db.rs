//! Instrumented business database
//!
//! Every statement issued through [`Database::traced`] is reported to the
//! telescope query interceptor, so queries made while serving a request are
//! attributed to it.

use crate::telescope::QueryInterceptor;
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    queries: Option<Arc<QueryInterceptor>>,
}

impl Database {
    /// Connect to `url`; pass the interceptor to have queries captured
    pub async fn connect(url: &str, queries: Option<Arc<QueryInterceptor>>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));

        let pool_options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(10)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to connect to database at {}", url))?;

        Ok(Self { pool, queries })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run `f` against the pool, timed and reported as `sql`
    ///
    /// # Example
    ///
    /// ```ignore
    /// let rows = db
    ///     .traced("SELECT id FROM events WHERE ward = ?", |pool, sql| async move {
    ///         sqlx::query(sql).bind(ward).fetch_all(pool).await
    ///     })
    ///     .await?;
    /// ```
    pub async fn traced<'a, F, Fut, T>(&'a self, sql: &'a str, f: F) -> T
    where
        F: FnOnce(&'a SqlitePool, &'a str) -> Fut,
        Fut: Future<Output = T>,
    {
        match &self.queries {
            Some(queries) => queries.instrument(sql, f(&self.pool, sql)).await,
            None => f(&self.pool, sql).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelescopeConfig;
    use crate::telescope::context::{self, RequestContext};
    use crate::telescope::Telescope;

    #[tokio::test]
    async fn test_traced_query_is_captured_in_scope() {
        let telescope = Telescope::new(TelescopeConfig::in_memory()).await.unwrap();
        let db = Database::connect("sqlite::memory:", Some(telescope.queries().clone()))
            .await
            .unwrap();

        let ctx = RequestContext::new_request();
        let correlation_id = ctx.correlation_id().unwrap().to_string();

        let value: i64 = context::run(ctx, async {
            db.traced("SELECT ?", |pool, sql| async move {
                sqlx::query_scalar(sql).bind(7_i64).fetch_one(pool).await
            })
            .await
        })
        .await
        .unwrap();
        telescope.flush().await;

        assert_eq!(value, 7);
        let queries = telescope
            .store()
            .queries_by_correlation_id(&correlation_id)
            .await
            .unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].sql, "SELECT ?");
    }

    #[tokio::test]
    async fn test_untraced_database_runs_queries() {
        let db = Database::connect("sqlite::memory:", None).await.unwrap();
        let value: i64 = db
            .traced("SELECT 1", |pool, sql| async move {
                sqlx::query_scalar(sql).fetch_one(pool).await
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
    }
}
