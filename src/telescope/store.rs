//! SQLite capture store
//!
//! Owns the three capture tables (`telescope_requests`,
//! `telescope_exceptions`, `telescope_queries`):
//! - sanitizing/length-capping fields on the way in
//! - count-based retention after every insert
//! - deferred linking of queries to requests by correlation id
//! - filtered, paginated reads for the management API

use super::exception::{parse_location, ExceptionReport};
use super::models::{
    page, CapturedException, CapturedQuery, CapturedRequest, ExceptionFilter,
    NewCapturedQuery, NewCapturedRequest, RequestFilter, RetentionStats, StoreStats,
};
use super::raw_value::RawValue;
use super::sanitizer::{sanitize, sanitize_json, truncate_str, SanitizeOptions};
use crate::config::TelescopeConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MAX_URL_LENGTH: usize = 2048;
const MAX_USER_AGENT_LENGTH: usize = 512;
const MAX_IP_LENGTH: usize = 64;
const MAX_HEADERS_SIZE: usize = 10_000;
const MAX_SQL_LENGTH: usize = 10_000;
const MAX_MESSAGE_LENGTH: usize = 5_000;
const MAX_STACK_LENGTH: usize = 50_000;

/// A capture table subject to retention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureTable {
    Requests,
    Exceptions,
    Queries,
}

impl CaptureTable {
    fn name(self) -> &'static str {
        match self {
            CaptureTable::Requests => "telescope_requests",
            CaptureTable::Exceptions => "telescope_exceptions",
            CaptureTable::Queries => "telescope_queries",
        }
    }
}

/// Capture store handle
pub struct CaptureStore {
    pool: SqlitePool,
    config: Arc<TelescopeConfig>,
    /// Runtime capture switch, seeded from `config.enabled`
    enabled: Arc<AtomicBool>,
}

impl CaptureStore {
    /// Connect to `config.database_url` and run migrations
    ///
    /// In-memory databases are pinned to a single long-lived connection,
    /// since every SQLite connection to `:memory:` is a separate database.
    pub async fn connect(config: Arc<TelescopeConfig>) -> Result<Self> {
        let in_memory = config.database_url.contains(":memory:");

        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .pragma("synchronous", "NORMAL");

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .context("Failed to connect to telescope database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run telescope database migrations")?;

        tracing::info!(url = %config.database_url, "Telescope store ready");

        let enabled = Arc::new(AtomicBool::new(config.enabled));

        Ok(Self {
            pool,
            config,
            enabled,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Shared handle to the capture switch
    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        self.enabled.clone()
    }

    /// Whether a request to `path` is captured right now
    pub fn should_capture(&self, path: &str) -> bool {
        self.is_enabled() && !self.config.is_excluded(path)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &TelescopeConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Persist a request snapshot, then enforce request retention
    ///
    /// Returns `None` when the path is not capturable or persistence failed.
    pub async fn record_request(&self, fields: NewCapturedRequest) -> Option<CapturedRequest> {
        if !self.should_capture(&fields.path) {
            return None;
        }

        let correlation_id = fields.correlation_id.clone();
        match self.insert_request(fields).await {
            Ok(request) => {
                self.enforce_retention_logged(CaptureTable::Requests).await;
                Some(request)
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    correlation_id = ?correlation_id,
                    "Failed to record request"
                );
                None
            }
        }
    }

    async fn insert_request(&self, fields: NewCapturedRequest) -> Result<CapturedRequest> {
        let max_body = Some(self.config.max_body_size);
        let uuid = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now().timestamp_millis();

        let headers = sanitize_json(fields.headers, Some(MAX_HEADERS_SIZE));
        let query_params = sanitize_json(fields.query_params, max_body);
        let body_params = sanitize_json(fields.body_params, max_body);
        let response_body = sanitize_json(fields.response_body, max_body);
        let response_headers = sanitize_json(fields.response_headers, Some(MAX_HEADERS_SIZE));

        let row = sqlx::query(
            r#"
            INSERT INTO telescope_requests (
                uuid, correlation_id, method, path, full_url, status_code, duration_ms,
                ip_address, user_agent, headers, query_params, body_params,
                response_body, response_headers, user_id, exception_id, created_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                (SELECT id FROM telescope_exceptions WHERE id = ?16),
                ?17
            )
            RETURNING *
            "#,
        )
        .bind(&uuid)
        .bind(&fields.correlation_id)
        .bind(fields.method.to_uppercase())
        .bind(truncate_str(&fields.path, MAX_URL_LENGTH))
        .bind(truncate_str(&fields.full_url, MAX_URL_LENGTH))
        .bind(fields.status_code as i64)
        .bind(fields.duration_ms.max(0))
        .bind(fields.ip_address.map(|ip| truncate_str(&ip, MAX_IP_LENGTH)))
        .bind(fields.user_agent.map(|ua| truncate_str(&ua, MAX_USER_AGENT_LENGTH)))
        .bind(json_column(&headers))
        .bind(json_column(&query_params))
        .bind(json_column(&body_params))
        .bind(json_column(&response_body))
        .bind(json_column(&response_headers))
        .bind(&fields.user_id)
        .bind(fields.exception_id)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert captured request")?;

        Ok(request_from_row(&row))
    }

    /// List requests, newest first, with the total matching count
    pub async fn list_requests(&self, filter: &RequestFilter) -> Result<(Vec<CapturedRequest>, i64)> {
        let (limit, offset) = page(filter.limit, filter.offset);

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM telescope_requests WHERE 1=1");
        push_request_filters(&mut count, filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .context("Failed to count captured requests")?;

        let mut select = QueryBuilder::<Sqlite>::new("SELECT * FROM telescope_requests WHERE 1=1");
        push_request_filters(&mut select, filter);
        select
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to list captured requests")?;

        Ok((rows.iter().map(request_from_row).collect(), total))
    }

    pub async fn get_request_by_uuid(&self, uuid: &str) -> Result<Option<CapturedRequest>> {
        let row = sqlx::query("SELECT * FROM telescope_requests WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch captured request")?;

        Ok(row.as_ref().map(request_from_row))
    }

    /// Delete every captured request; returns the number of rows removed
    pub async fn clear_all_requests(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM telescope_requests")
            .execute(&self.pool)
            .await
            .context("Failed to clear captured requests")?;

        tracing::info!(count = result.rows_affected(), "Cleared captured requests");
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Exceptions
    // ------------------------------------------------------------------

    /// Persist an exception, then enforce exception retention. Never fails.
    pub async fn record_exception(
        &self,
        report: &ExceptionReport,
        context: &RawValue,
    ) -> Option<CapturedException> {
        match self.insert_exception(report, context).await {
            Ok(exception) => {
                self.enforce_retention_logged(CaptureTable::Exceptions).await;
                Some(exception)
            }
            Err(e) => {
                tracing::error!(error = %e, kind = %report.kind, "Failed to record exception");
                None
            }
        }
    }

    async fn insert_exception(
        &self,
        report: &ExceptionReport,
        context: &RawValue,
    ) -> Result<CapturedException> {
        let (file, line) = match report.stack.as_deref().and_then(parse_location) {
            Some((file, line)) => (Some(file), Some(line)),
            None => (None, None),
        };

        let context = sanitize(context, SanitizeOptions::bounded(self.config.max_body_size));

        let row = sqlx::query(
            r#"
            INSERT INTO telescope_exceptions (
                uuid, type, message, code, file, line, stack_trace, context, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&report.kind)
        .bind(truncate_str(&report.message, MAX_MESSAGE_LENGTH))
        .bind(&report.code)
        .bind(file.map(|f| truncate_str(&f, MAX_URL_LENGTH)))
        .bind(line)
        .bind(report.stack.as_deref().map(|s| truncate_str(s, MAX_STACK_LENGTH)))
        .bind(json_column(&context))
        .bind(Utc::now().timestamp_millis())
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert captured exception")?;

        Ok(exception_from_row(&row))
    }

    pub async fn list_exceptions(
        &self,
        filter: &ExceptionFilter,
    ) -> Result<(Vec<CapturedException>, i64)> {
        let (limit, offset) = page(filter.limit, filter.offset);

        let mut count =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM telescope_exceptions WHERE 1=1");
        push_exception_filters(&mut count, filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .context("Failed to count captured exceptions")?;

        let mut select = QueryBuilder::<Sqlite>::new("SELECT * FROM telescope_exceptions WHERE 1=1");
        push_exception_filters(&mut select, filter);
        select
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to list captured exceptions")?;

        Ok((rows.iter().map(exception_from_row).collect(), total))
    }

    pub async fn get_exception_by_uuid(&self, uuid: &str) -> Result<Option<CapturedException>> {
        let row = sqlx::query("SELECT * FROM telescope_exceptions WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch captured exception")?;

        Ok(row.as_ref().map(exception_from_row))
    }

    pub async fn get_exception_by_id(&self, id: i64) -> Result<Option<CapturedException>> {
        let row = sqlx::query("SELECT * FROM telescope_exceptions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch captured exception")?;

        Ok(row.as_ref().map(exception_from_row))
    }

    /// Delete every captured exception; returns the number of rows removed
    pub async fn clear_all_exceptions(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM telescope_exceptions")
            .execute(&self.pool)
            .await
            .context("Failed to clear captured exceptions")?;

        tracing::info!(count = result.rows_affected(), "Cleared captured exceptions");
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Insert query records in one transaction
    ///
    /// A record without `request_id` whose correlation id already belongs to
    /// a persisted request is resolved on insert; the rest wait for
    /// [`Self::link_queries_by_correlation_id`].
    pub async fn insert_queries_batch(&self, queries: &[NewCapturedQuery]) -> Result<()> {
        if queries.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for query in queries {
            let bindings = match &query.bindings {
                Some(tokens) => Some(serde_json::to_string(tokens)?),
                None => None,
            };

            sqlx::query(
                r#"
                INSERT INTO telescope_queries (
                    sql, duration_ms, request_id, correlation_id, bindings, created_at
                ) VALUES (
                    ?1, ?2,
                    COALESCE(?3, (SELECT id FROM telescope_requests WHERE correlation_id = ?4)),
                    ?4, ?5, ?6
                )
                "#,
            )
            .bind(truncate_str(&query.sql, MAX_SQL_LENGTH))
            .bind(query.duration_ms.max(0))
            .bind(query.request_id)
            .bind(&query.correlation_id)
            .bind(bindings)
            .bind(query.created_at)
            .execute(&mut *tx)
            .await
            .context("Failed to insert captured query")?;
        }

        tx.commit().await?;

        Ok(())
    }

    /// Attach every unlinked query carrying `correlation_id` to `request_id`
    ///
    /// Idempotent: already-linked rows are untouched, zero matches is fine.
    pub async fn link_queries_by_correlation_id(
        &self,
        correlation_id: &str,
        request_id: i64,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE telescope_queries SET request_id = ?
             WHERE request_id IS NULL AND correlation_id = ?",
        )
        .bind(request_id)
        .bind(correlation_id)
        .execute(&self.pool)
        .await
        .context("Failed to link queries to request")?;

        Ok(result.rows_affected())
    }

    pub async fn queries_for_request(&self, request_id: i64) -> Result<Vec<CapturedQuery>> {
        let rows = sqlx::query(
            "SELECT * FROM telescope_queries WHERE request_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch queries for request")?;

        Ok(rows.iter().map(query_from_row).collect())
    }

    pub async fn queries_by_correlation_id(&self, correlation_id: &str) -> Result<Vec<CapturedQuery>> {
        let rows = sqlx::query(
            "SELECT * FROM telescope_queries WHERE correlation_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch queries by correlation id")?;

        Ok(rows.iter().map(query_from_row).collect())
    }

    // ------------------------------------------------------------------
    // Retention & stats
    // ------------------------------------------------------------------

    fn cap_for(&self, table: CaptureTable) -> i64 {
        let cap = match table {
            CaptureTable::Requests => self.config.max_requests,
            CaptureTable::Exceptions => self.config.max_exceptions,
            CaptureTable::Queries => self.config.max_queries,
        };
        cap as i64
    }

    /// Delete the oldest rows beyond the table's cap; returns rows deleted
    ///
    /// One count, one bounded id selection, one delete by that id list.
    pub async fn enforce_retention(&self, table: CaptureTable) -> Result<u64> {
        let name = table.name();
        let cap = self.cap_for(table);

        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", name))
            .fetch_one(&self.pool)
            .await?;

        let excess = count - cap;
        if excess <= 0 {
            return Ok(0);
        }

        let ids: Vec<i64> = sqlx::query_scalar(&format!(
            "SELECT id FROM {} ORDER BY created_at ASC, id ASC LIMIT ?",
            name
        ))
        .bind(excess)
        .fetch_all(&self.pool)
        .await?;

        if ids.is_empty() {
            return Ok(0);
        }

        let mut delete = QueryBuilder::<Sqlite>::new(format!("DELETE FROM {} WHERE id IN (", name));
        let mut separated = delete.separated(", ");
        for id in &ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = delete.build().execute(&self.pool).await?;

        tracing::debug!(table = name, cap = cap, deleted = result.rows_affected(), "Retention enforced");
        Ok(result.rows_affected())
    }

    async fn enforce_retention_logged(&self, table: CaptureTable) {
        if let Err(e) = self.enforce_retention(table).await {
            tracing::error!(table = table.name(), error = %e, "Retention enforcement failed");
        }
    }

    /// Enforce every cap
    pub async fn enforce_all_retention(&self) -> Result<RetentionStats> {
        Ok(RetentionStats {
            requests_deleted: self.enforce_retention(CaptureTable::Requests).await?,
            exceptions_deleted: self.enforce_retention(CaptureTable::Exceptions).await?,
            queries_deleted: self.enforce_retention(CaptureTable::Queries).await?,
        })
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM telescope_requests) AS requests,
                (SELECT COUNT(*) FROM telescope_exceptions) AS exceptions,
                (SELECT COUNT(*) FROM telescope_queries) AS queries,
                (SELECT COUNT(*) FROM telescope_queries WHERE request_id IS NULL) AS unlinked_queries
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to read store statistics")?;

        Ok(StoreStats {
            requests: row.get("requests"),
            exceptions: row.get("exceptions"),
            queries: row.get("queries"),
            unlinked_queries: row.get("unlinked_queries"),
        })
    }
}

fn push_request_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &RequestFilter) {
    if let Some(method) = &filter.method {
        qb.push(" AND method = ").push_bind(method.to_uppercase());
    }

    if let Some(status_code) = filter.status_code {
        qb.push(" AND status_code = ").push_bind(status_code);
    }

    if let Some(user_id) = &filter.user_id {
        qb.push(" AND user_id = ").push_bind(user_id.clone());
    }

    if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", search);
        qb.push(" AND (path LIKE ")
            .push_bind(pattern.clone())
            .push(" OR full_url LIKE ")
            .push_bind(pattern.clone())
            .push(" OR ip_address LIKE ")
            .push_bind(pattern.clone())
            .push(" OR user_agent LIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

fn push_exception_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &ExceptionFilter) {
    if let Some(kind) = &filter.kind {
        qb.push(" AND type = ").push_bind(kind.clone());
    }

    if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", search);
        qb.push(" AND (message LIKE ")
            .push_bind(pattern.clone())
            .push(" OR type LIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

/// JSON text for a column; SQL NULL for JSON null
fn json_column(value: &Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        Some(value.to_string())
    }
}

fn json_from_column(row: &SqliteRow, column: &str) -> Value {
    row.get::<Option<String>, _>(column)
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or(Value::Null)
}

fn timestamp_from_column(row: &SqliteRow, column: &str) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(row.get::<i64, _>(column)).unwrap_or_default()
}

fn request_from_row(row: &SqliteRow) -> CapturedRequest {
    CapturedRequest {
        id: row.get("id"),
        uuid: row.get("uuid"),
        correlation_id: row.get("correlation_id"),
        method: row.get("method"),
        path: row.get("path"),
        full_url: row.get("full_url"),
        status_code: row.get("status_code"),
        duration_ms: row.get("duration_ms"),
        ip_address: row.get("ip_address"),
        user_agent: row.get("user_agent"),
        headers: json_from_column(row, "headers"),
        query_params: json_from_column(row, "query_params"),
        body_params: json_from_column(row, "body_params"),
        response_body: json_from_column(row, "response_body"),
        response_headers: json_from_column(row, "response_headers"),
        user_id: row.get("user_id"),
        exception_id: row.get("exception_id"),
        created_at: timestamp_from_column(row, "created_at"),
    }
}

fn exception_from_row(row: &SqliteRow) -> CapturedException {
    CapturedException {
        id: row.get("id"),
        uuid: row.get("uuid"),
        kind: row.get("type"),
        message: row.get("message"),
        code: row.get("code"),
        file: row.get("file"),
        line: row.get("line"),
        stack_trace: row.get("stack_trace"),
        context: json_from_column(row, "context"),
        created_at: timestamp_from_column(row, "created_at"),
    }
}

fn query_from_row(row: &SqliteRow) -> CapturedQuery {
    CapturedQuery {
        id: row.get("id"),
        sql: row.get("sql"),
        duration_ms: row.get("duration_ms"),
        request_id: row.get("request_id"),
        correlation_id: row.get("correlation_id"),
        bindings: row
            .get::<Option<String>, _>("bindings")
            .and_then(|text| serde_json::from_str(&text).ok()),
        created_at: timestamp_from_column(row, "created_at"),
    }
}
