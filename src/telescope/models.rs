//! Captured entities and their query filters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default page size for list queries
pub const DEFAULT_LIMIT: i64 = 50;

/// Upper bound on page size
pub const MAX_LIMIT: i64 = 500;

/// A persisted HTTP request snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRequest {
    pub id: i64,
    pub uuid: String,
    pub correlation_id: Option<String>,
    pub method: String,
    pub path: String,
    pub full_url: String,
    pub status_code: i64,
    pub duration_ms: i64,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub headers: Value,
    pub query_params: Value,
    pub body_params: Value,
    pub response_body: Value,
    pub response_headers: Value,
    pub user_id: Option<String>,
    pub exception_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Fields gathered by the capture middleware, before persistence
#[derive(Debug, Clone, Default)]
pub struct NewCapturedRequest {
    pub correlation_id: Option<String>,
    pub method: String,
    pub path: String,
    pub full_url: String,
    pub status_code: u16,
    pub duration_ms: i64,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub headers: Value,
    pub query_params: Value,
    pub body_params: Value,
    pub response_body: Value,
    pub response_headers: Value,
    pub user_id: Option<String>,
    pub exception_id: Option<i64>,
}

/// A persisted exception
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedException {
    pub id: i64,
    pub uuid: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub code: Option<String>,
    pub file: Option<String>,
    pub line: Option<i64>,
    pub stack_trace: Option<String>,
    pub context: Value,
    pub created_at: DateTime<Utc>,
}

/// A persisted query; `request_id` is filled in once the owning request is known
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedQuery {
    pub id: i64,
    pub sql: String,
    pub duration_ms: i64,
    pub request_id: Option<i64>,
    pub correlation_id: Option<String>,
    pub bindings: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

/// Query record produced by the interceptor
#[derive(Debug, Clone)]
pub struct NewCapturedQuery {
    pub sql: String,
    pub duration_ms: i64,
    pub request_id: Option<i64>,
    pub correlation_id: Option<String>,
    pub bindings: Option<Vec<String>>,
    /// Unix milliseconds at completion
    pub created_at: i64,
}

/// Request detail, as returned by the management API
#[derive(Debug, Clone, Serialize)]
pub struct RequestDetail {
    #[serde(flatten)]
    pub request: CapturedRequest,
    pub queries: Vec<CapturedQuery>,
}

/// Filters for listing captured requests
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub method: Option<String>,
    pub status_code: Option<i64>,
    pub user_id: Option<String>,
    /// Substring match over path, URL, IP and user agent
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Filters for listing captured exceptions
#[derive(Debug, Clone, Default)]
pub struct ExceptionFilter {
    pub kind: Option<String>,
    /// Substring match over type and message
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Effective (limit, offset) pair
pub fn page(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = offset.unwrap_or(0).max(0);
    (limit, offset)
}

/// Row counts per capture table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub requests: i64,
    pub exceptions: i64,
    pub queries: i64,
    pub unlinked_queries: i64,
}

/// Rows evicted by one retention pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionStats {
    pub requests_deleted: u64,
    pub exceptions_deleted: u64,
    pub queries_deleted: u64,
}
