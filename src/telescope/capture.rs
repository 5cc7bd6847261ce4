//! Request capture middleware
//!
//! Per request: skip entirely when capture is off or the path is excluded;
//! otherwise open a context scope, tee the request and response bodies, and
//! once the response body has been fully sent (or dropped) persist the
//! snapshot and link queries recorded under the request's correlation id.
//! Persistence runs on a detached task and never touches the response.

use super::body::{BodySnapshot, Captured, TeeBody};
use super::context::{self, RequestContext};
use super::models::NewCapturedRequest;
use super::raw_value::RawValue;
use super::sanitizer::{is_sensitive_key, sanitize, SanitizeOptions, REDACTED};
use super::Telescope;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, Uri},
    middleware::Next,
    response::Response,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Reserved body key holding uploaded-file metadata
pub const FILES_KEY: &str = "_files";

/// Largest body copied for parsing; matches the server's request body limit.
/// The stored snapshot is bounded to `max_body_size` only after redaction.
pub const BODY_PARSE_LIMIT: usize = 10 * 1024 * 1024;

/// Metadata of a file received in a multipart upload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub field_name: String,
    pub original_name: Option<String>,
    pub mime_type: Option<String>,
    pub size: u64,
}

#[derive(Debug, Default)]
struct CaptureMeta {
    user_id: Option<String>,
    exception_id: Option<i64>,
    files: Vec<UploadedFile>,
}

/// In-flight capture metadata, shared through request extensions
///
/// Authentication, upload handling and the error reporter write to it; the
/// capture middleware reads it when the response finishes.
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    correlation_id: Arc<str>,
    meta: Arc<Mutex<CaptureMeta>>,
}

impl CaptureHandle {
    fn new(correlation_id: Arc<str>) -> Self {
        Self {
            correlation_id,
            meta: Arc::new(Mutex::new(CaptureMeta::default())),
        }
    }

    fn meta(&self) -> MutexGuard<'_, CaptureMeta> {
        self.meta.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Record the authenticated principal
    pub fn set_user_id(&self, user_id: impl Into<String>) {
        self.meta().user_id = Some(user_id.into());
    }

    pub fn user_id(&self) -> Option<String> {
        self.meta().user_id.clone()
    }

    pub fn set_exception_id(&self, exception_id: i64) {
        self.meta().exception_id = Some(exception_id);
    }

    pub fn exception_id(&self) -> Option<i64> {
        self.meta().exception_id
    }

    pub fn add_uploaded_file(&self, file: UploadedFile) {
        self.meta().files.push(file);
    }

    pub fn files(&self) -> Vec<UploadedFile> {
        self.meta().files.clone()
    }
}

/// Everything known about a request before its response body finishes
struct PendingCapture {
    telescope: Arc<Telescope>,
    ctx: RequestContext,
    handle: CaptureHandle,
    method: String,
    path: String,
    full_url: String,
    ip_address: Option<String>,
    user_agent: Option<String>,
    headers: Value,
    query_params: Value,
    request_content_type: Option<String>,
    request_body: Option<BodySnapshot>,
    status_code: u16,
    response_headers: Value,
    response_content_type: Option<String>,
    capture_response_body: bool,
}

impl PendingCapture {
    /// Response finished; assemble the record and persist it off-path
    fn complete(self, response: Captured) {
        let duration_ms = self.ctx.elapsed_ms();

        let mut body_params = self
            .request_body
            .as_ref()
            .and_then(BodySnapshot::take)
            .map(|captured| parse_body(&captured, self.request_content_type.as_deref()))
            .unwrap_or(Value::Null);

        let files = self.handle.files();
        if !files.is_empty() {
            body_params = merge_files(body_params, &files);
        }

        let response_body = if self.capture_response_body {
            parse_body(&response, self.response_content_type.as_deref())
        } else {
            Value::Null
        };

        let fields = NewCapturedRequest {
            correlation_id: Some(self.handle.correlation_id().to_string()),
            method: self.method,
            path: self.path,
            full_url: self.full_url,
            status_code: self.status_code,
            duration_ms,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            headers: self.headers,
            query_params: self.query_params,
            body_params,
            response_body,
            response_headers: self.response_headers,
            user_id: self.handle.user_id(),
            exception_id: self.handle.exception_id(),
        };

        let telescope = self.telescope;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    telescope.persist(fields).await;
                });
            }
            Err(_) => {
                tracing::warn!(path = %fields.path, "No runtime available, request not captured");
            }
        }
    }
}

/// Request capture middleware
pub async fn capture_requests(
    State(telescope): State<Arc<Telescope>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if !telescope.should_capture(&path) {
        return next.run(req).await;
    }

    let config = telescope.config();
    let ctx = RequestContext::new_request();
    let correlation_id: Arc<str> = ctx
        .correlation_id
        .clone()
        .unwrap_or_else(|| Arc::from(uuid::Uuid::new_v4().to_string()));
    let handle = CaptureHandle::new(correlation_id);

    let method = req.method().to_string();
    let full_url = full_url(req.uri(), req.headers());
    let ip_address = client_ip(&req);
    let user_agent = header_str(req.headers(), header::USER_AGENT.as_str());
    let headers = if config.capture_headers {
        headers_to_json(req.headers())
    } else {
        Value::Null
    };
    let query_params = query_to_json(req.uri().query());
    let request_content_type = header_str(req.headers(), header::CONTENT_TYPE.as_str());
    let is_multipart = request_content_type
        .as_deref()
        .is_some_and(|ct| ct.starts_with("multipart/"));

    let (mut parts, body) = req.into_parts();
    parts.extensions.insert(handle.clone());

    let (body, request_body) = if config.capture_request_body && !is_multipart {
        let snapshot = BodySnapshot::default();
        let tee = TeeBody::new(body, BODY_PARSE_LIMIT)
            .with_snapshot(snapshot.clone())
            .into_body();
        (tee, Some(snapshot))
    } else {
        (body, None)
    };

    let req = Request::from_parts(parts, body);
    let response = context::run(ctx.clone(), next.run(req)).await;

    let (parts, body) = response.into_parts();

    let pending = PendingCapture {
        telescope: telescope.clone(),
        ctx,
        handle,
        method,
        path,
        full_url,
        ip_address,
        user_agent,
        headers,
        query_params,
        request_content_type,
        request_body,
        status_code: parts.status.as_u16(),
        response_headers: if config.capture_headers {
            headers_to_json(&parts.headers)
        } else {
            Value::Null
        },
        response_content_type: header_str(&parts.headers, header::CONTENT_TYPE.as_str()),
        capture_response_body: config.capture_response_body,
    };

    // with response capture off the tee only observes completion
    let limit = if config.capture_response_body {
        BODY_PARSE_LIMIT
    } else {
        0
    };

    let body = TeeBody::new(body, limit)
        .on_finish(move |captured| pending.complete(captured))
        .into_body();

    Response::from_parts(parts, body)
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Absolute URL of the request, reconstructed from `Host` when needed.
/// Sensitive query parameters are redacted.
fn full_url(uri: &Uri, headers: &HeaderMap) -> String {
    let origin = match (uri.scheme_str(), uri.authority()) {
        (Some(scheme), Some(authority)) => format!("{}://{}", scheme, authority),
        _ => {
            let scheme =
                header_str(headers, "x-forwarded-proto").unwrap_or_else(|| "http".to_string());
            let host =
                header_str(headers, header::HOST.as_str()).unwrap_or_else(|| "localhost".to_string());
            format!("{}://{}", scheme, host)
        }
    };

    let path = if uri.path().is_empty() { "/" } else { uri.path() };

    match uri.query() {
        Some(query) => format!("{}{}?{}", origin, path, redact_query(query)),
        None => format!("{}{}", origin, path),
    }
}

/// Query string with sensitive values replaced; untouched when nothing matches
fn redact_query(query: &str) -> Cow<'_, str> {
    let pairs: Vec<(Cow<'_, str>, Cow<'_, str>)> =
        url::form_urlencoded::parse(query.as_bytes()).collect();

    if !pairs.iter().any(|(key, _)| is_sensitive_key(key)) {
        return Cow::Borrowed(query);
    }

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in &pairs {
        if is_sensitive_key(key) {
            serializer.append_pair(key, REDACTED);
        } else {
            serializer.append_pair(key, value);
        }
    }
    Cow::Owned(serializer.finish())
}

/// First `X-Forwarded-For` hop, else the socket peer
fn client_ip(req: &Request) -> Option<String> {
    if let Some(forwarded) = header_str(req.headers(), "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return Some(first.to_string());
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

/// Header map as a JSON object; repeated headers are joined with ", "
fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();

    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        map.insert(name.as_str().to_string(), Value::String(joined));
    }

    Value::Object(map)
}

/// `a=1&b=2&b=3` as `{"a": "1", "b": ["2", "3"]}`
fn form_to_json(input: &[u8]) -> Value {
    let mut map = Map::new();

    for (key, value) in url::form_urlencoded::parse(input) {
        let value = Value::String(value.into_owned());
        match map.get_mut(key.as_ref()) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(key.into_owned(), value);
            }
        }
    }

    Value::Object(map)
}

fn query_to_json(query: Option<&str>) -> Value {
    match query {
        Some(q) if !q.is_empty() => form_to_json(q.as_bytes()),
        _ => Value::Object(Map::new()),
    }
}

/// Best-effort structured view of a captured body
///
/// JSON-looking text is parsed, urlencoded forms become objects, other text
/// is kept as a string and anything else is summarized as binary. A body cut
/// off at [`BODY_PARSE_LIMIT`] cannot be parsed or redacted, so only its size
/// is kept.
fn parse_body(captured: &Captured, content_type: Option<&str>) -> Value {
    let bytes = captured.bytes.as_slice();
    if bytes.is_empty() {
        return Value::Null;
    }

    if captured.truncated {
        return serde_json::json!({
            "truncated": true,
            "size": captured.total,
        });
    }

    if content_type.is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded")) {
        return form_to_json(bytes);
    }

    match std::str::from_utf8(bytes) {
        Ok(text) => {
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                if let Ok(value) = serde_json::from_str::<Value>(text) {
                    return value;
                }
            }
            Value::String(text.to_string())
        }
        Err(_) => sanitize(&RawValue::from(bytes.to_vec()), SanitizeOptions::default()),
    }
}

fn merge_files(body: Value, files: &[UploadedFile]) -> Value {
    let files = serde_json::to_value(files).unwrap_or(Value::Null);

    match body {
        Value::Object(mut map) => {
            map.insert(FILES_KEY.to_string(), files);
            Value::Object(map)
        }
        Value::Null => {
            let mut map = Map::new();
            map.insert(FILES_KEY.to_string(), files);
            Value::Object(map)
        }
        other => {
            let mut map = Map::new();
            map.insert("_body".to_string(), other);
            map.insert(FILES_KEY.to_string(), files);
            Value::Object(map)
        }
    }
}
