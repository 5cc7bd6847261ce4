//! Query interceptor
//!
//! The data-access layer calls [`QueryInterceptor::on_query_start`] and
//! [`QueryInterceptor::on_query_end`] around every statement, or wraps the
//! statement future with [`QueryInterceptor::instrument`]. Completed queries
//! are attributed through the ambient [`context`](super::context) and handed
//! to the [`QueryWriter`] without waiting on the store.

use super::context;
use super::models::NewCapturedQuery;
use super::writer::QueryWriter;
use dashmap::DashMap;
use regex::Regex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

const MAX_SQL_LENGTH: usize = 10_000;

/// Bare `?`, numbered `?1`, or named `:ident` placeholders
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\?\d*|:[A-Za-z_][A-Za-z0-9_]*").expect("valid placeholder regex")
});

/// Ephemeral id of an in-flight query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(u64);

#[derive(Debug)]
struct PendingQuery {
    sql: String,
    started: Instant,
}

/// Query start/finish hook
pub struct QueryInterceptor {
    pending: DashMap<u64, PendingQuery>,
    next_id: AtomicU64,
    enabled: Arc<AtomicBool>,
    writer: QueryWriter,
}

impl QueryInterceptor {
    /// `enabled` is shared with the owning service so runtime toggles apply here too
    pub fn new(writer: QueryWriter, enabled: Arc<AtomicBool>) -> Self {
        Self {
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            enabled,
            writer,
        }
    }

    /// Register a query about to run
    pub fn on_query_start(&self, sql: &str) -> QueryId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(
            id,
            PendingQuery {
                sql: sql.to_string(),
                started: Instant::now(),
            },
        );
        QueryId(id)
    }

    /// Complete a query started with [`Self::on_query_start`]
    ///
    /// Queries finishing outside any request scope are not recorded.
    pub fn on_query_end(&self, id: QueryId) {
        let Some((_, pending)) = self.pending.remove(&id.0) else {
            tracing::debug!(query_id = id.0, "Query end without matching start");
            return;
        };

        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }

        let Some(ctx) = context::current() else {
            return;
        };

        let duration_ms = pending.started.elapsed().as_millis() as i64;

        // request_id wins when known; the correlation id is kept either way
        // so late links can still find the row
        let record = NewCapturedQuery {
            bindings: extract_bindings(&pending.sql),
            sql: truncate_sql(pending.sql),
            duration_ms,
            request_id: ctx.request_id,
            correlation_id: ctx.correlation_id().map(str::to_string),
            created_at: chrono::Utc::now().timestamp_millis(),
        };

        self.writer.write(record);
    }

    /// Time `fut` as the execution of `sql`
    ///
    /// The query is completed even if `fut` is dropped before finishing.
    pub async fn instrument<F, T>(&self, sql: &str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let guard = QueryGuard {
            interceptor: self,
            id: self.on_query_start(sql),
        };
        let output = fut.await;
        drop(guard);
        output
    }

    /// Number of started but not yet completed queries
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Wait until every completed query has been persisted
    pub async fn flush(&self) {
        self.writer.flush().await;
    }
}

struct QueryGuard<'a> {
    interceptor: &'a QueryInterceptor,
    id: QueryId,
}

impl Drop for QueryGuard<'_> {
    fn drop(&mut self) {
        self.interceptor.on_query_end(self.id);
    }
}

/// Placeholder tokens in `sql`, or `None` if there are none
pub fn extract_bindings(sql: &str) -> Option<Vec<String>> {
    let tokens: Vec<String> = PLACEHOLDER
        .find_iter(sql)
        .map(|m| m.as_str().to_string())
        .collect();

    if tokens.is_empty() {
        None
    } else {
        Some(tokens)
    }
}

fn truncate_sql(sql: String) -> String {
    if sql.chars().count() <= MAX_SQL_LENGTH {
        sql
    } else {
        sql.chars().take(MAX_SQL_LENGTH).collect()
    }
}
