use crate::telescope::ExceptionReport;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Application error types
///
/// Rendered as `{ success: false, error: { code, message, details? } }`.
/// Every rendered error carries an [`ExceptionReport`] in the response
/// extensions for the error-reporting middleware.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Resource lookup failed
    #[error("{0}")]
    NotFound(String),
    /// Malformed or invalid input
    #[error("{0}")]
    Validation(String),
    /// State conflict (duplicate, stale update)
    #[error("{0}")]
    Conflict(String),
    /// Authentication error
    #[error("{0}")]
    Unauthorized(String),
    /// Internal server error; `details` holds the underlying cause
    #[error("{message}")]
    Internal {
        message: String,
        details: Option<String>,
    },
}

impl AppError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            details: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFoundError",
            Self::Validation(_) => "ValidationError",
            Self::Conflict(_) => "ConflictError",
            Self::Unauthorized(_) => "UnauthorizedError",
            Self::Internal { .. } => "InternalError",
        }
    }

    fn report(&self) -> ExceptionReport {
        let message = match self {
            Self::Internal {
                message,
                details: Some(details),
            } => format!("{}: {}", message, details),
            other => other.to_string(),
        };

        let report = ExceptionReport::new(self.kind(), message).with_code(self.code());
        if self.status().is_server_error() {
            report.with_backtrace()
        } else {
            report
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }

        let mut error = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if let Self::Internal {
            details: Some(details),
            ..
        } = &self
        {
            error["details"] = json!(details);
        }

        let report = self.report();
        let mut response = (status, Json(json!({ "success": false, "error": error }))).into_response();
        response.extensions_mut().insert(report);
        response
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            message: "Internal server error".to_string(),
            details: Some(format!("{:#}", err)),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("Record not found".to_string()),
            other => Self::Internal {
                message: "Database error".to_string(),
                details: Some(other.to_string()),
            },
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("Invalid JSON: {}", err))
    }
}
