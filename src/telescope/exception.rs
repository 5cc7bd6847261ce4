//! Exception capture hook
//!
//! Errors rendered by [`crate::error::AppError`] and panics caught by the
//! panic layer leave an [`ExceptionReport`] in the response extensions.
//! [`report_errors`] is the centralized error-reporting middleware: it picks
//! the report up, persists it before the response leaves, and hands the new
//! exception id to the in-flight capture through its [`CaptureHandle`].

use super::capture::CaptureHandle;
use super::raw_value::RawValue;
use super::Telescope;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use regex::Regex;
use serde_json::json;
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::sync::{Arc, LazyLock};

/// `at function (path/to/file.rs:12:5)`
static PAREN_FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^()\s]+?):(\d+):(\d+)\)").expect("valid frame regex"));

/// `at path/to/file.rs:12:5`
static BARE_FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"at\s+([^()\s]+?):(\d+)(?::\d+)?").expect("valid frame regex"));

/// What the error handler knows about a failure, attached to the response
#[derive(Debug, Clone)]
pub struct ExceptionReport {
    /// Error kind / type name
    pub kind: String,
    pub message: String,
    pub code: Option<String>,
    pub stack: Option<String>,
}

impl ExceptionReport {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            code: None,
            stack: None,
        }
    }

    /// Build from an error value; the message includes the source chain
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let kind = std::any::type_name_of_val(err)
            .rsplit("::")
            .next()
            .unwrap_or("Error")
            .to_string();

        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }

        Self::new(kind, message).with_backtrace()
    }

    /// Build from a caught panic payload
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };

        Self::new("panic", message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Attach a backtrace when the runtime has capture enabled (`RUST_BACKTRACE`)
    pub fn with_backtrace(mut self) -> Self {
        let backtrace = Backtrace::capture();
        if backtrace.status() == BacktraceStatus::Captured {
            self.stack = Some(backtrace.to_string());
        }
        self
    }
}

/// Whether a response status is worth an exception record
pub fn should_record(status: StatusCode) -> bool {
    status.is_server_error()
        || matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY
        )
}

/// First useful `(file, line)` in a stack trace
///
/// Tries the parenthesized `(file:line:col)` form across all frames first,
/// then falls back to bare `at file:line:col` frames. Frames inside the
/// standard library or registry crates are skipped.
pub fn parse_location(stack: &str) -> Option<(String, i64)> {
    [&*PAREN_FRAME, &*BARE_FRAME]
        .into_iter()
        .find_map(|pattern| first_useful_frame(stack, pattern))
}

fn first_useful_frame(stack: &str, pattern: &Regex) -> Option<(String, i64)> {
    stack.lines().find_map(|line| {
        let caps = pattern.captures(line)?;
        let file = caps.get(1)?.as_str();
        if is_library_frame(file) {
            return None;
        }
        let line_no = caps.get(2)?.as_str().parse().ok()?;
        Some((file.to_string(), line_no))
    })
}

fn is_library_frame(file: &str) -> bool {
    file.starts_with("/rustc/")
        || file.contains("/.cargo/registry/")
        || file.contains("/library/std/")
        || file.contains("/library/core/")
}

/// Centralized error-reporting middleware
pub async fn report_errors(
    State(telescope): State<Arc<Telescope>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let handle = req.extensions().get::<CaptureHandle>().cloned();

    let mut response = next.run(req).await;

    let Some(report) = response.extensions_mut().remove::<ExceptionReport>() else {
        return response;
    };

    let status = response.status();
    if !should_record(status) || !telescope.should_capture(&path) {
        return response;
    }

    let context = json!({
        "method": method,
        "path": path,
        "statusCode": status.as_u16(),
        "correlationId": handle.as_ref().map(|h| h.correlation_id().to_string()),
        "userId": handle.as_ref().and_then(|h| h.user_id()),
    });

    match telescope.capture_exception(&report, RawValue::from(context)).await {
        Some(exception) => {
            tracing::debug!(
                exception_id = exception.id,
                kind = %exception.kind,
                "Exception captured"
            );
            if let Some(handle) = handle {
                handle.set_exception_id(exception.id);
            }
        }
        None => {
            tracing::warn!(kind = %report.kind, path = %path, "Exception was not captured");
        }
    }

    response
}
