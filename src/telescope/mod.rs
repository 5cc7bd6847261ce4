//! Telescope: request, query and exception capture
//!
//! One [`Telescope`] instance is built at startup and shared (as
//! `Arc<Telescope>`) with the middleware stack, the data-access layer and the
//! management API. Nothing in this module can fail a business request:
//! capture errors are logged and dropped.
//!
//! Wiring:
//!
//! ```ignore
//! let telescope = Telescope::new(config.telescope.clone()).await?;
//! let app = telescope::attach(business_routes, telescope.clone());
//! ```

pub mod body;
pub mod capture;
pub mod context;
pub mod exception;
pub mod interceptor;
pub mod models;
pub mod raw_value;
pub mod retention;
pub mod sanitizer;
pub mod store;
pub mod writer;

pub use capture::{CaptureHandle, UploadedFile};
pub use context::RequestContext;
pub use exception::ExceptionReport;
pub use interceptor::QueryInterceptor;
pub use models::{CapturedException, CapturedQuery, CapturedRequest};
pub use raw_value::RawValue;
pub use store::CaptureStore;

use crate::config::TelescopeConfig;
use crate::error::AppError;
use crate::handlers::telescope_api;
use anyhow::Result;
use axum::{
    middleware,
    response::{IntoResponse, Response},
    Router,
};
use models::NewCapturedRequest;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use writer::QueryWriter;

const LINK_ATTEMPTS: u32 = 3;
const LINK_BACKOFF_BASE: Duration = Duration::from_millis(25);

/// Capture service
pub struct Telescope {
    store: Arc<CaptureStore>,
    queries: Arc<QueryInterceptor>,
}

impl Telescope {
    /// Open the capture store and start the query writer
    pub async fn new(config: TelescopeConfig) -> Result<Arc<Self>> {
        let store = CaptureStore::connect(Arc::new(config)).await?;
        Ok(Self::from_store(Arc::new(store)))
    }

    /// Build around an already connected store
    pub fn from_store(store: Arc<CaptureStore>) -> Arc<Self> {
        let config = store.config();
        let writer = QueryWriter::spawn(
            store.clone(),
            config.query_batch_size,
            config.query_flush_interval(),
        );
        let queries = Arc::new(QueryInterceptor::new(writer, store.enabled_flag()));

        Arc::new(Self { store, queries })
    }

    pub fn config(&self) -> &TelescopeConfig {
        self.store.config()
    }

    pub fn store(&self) -> &Arc<CaptureStore> {
        &self.store
    }

    /// Query hook for the data-access layer
    pub fn queries(&self) -> &Arc<QueryInterceptor> {
        &self.queries
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_enabled()
    }

    /// Turn capture on or off without restarting
    pub fn set_enabled(&self, enabled: bool) {
        self.store.set_enabled(enabled);
        tracing::info!(enabled = enabled, "Telescope capture toggled");
    }

    pub fn should_capture(&self, path: &str) -> bool {
        self.store.should_capture(path)
    }

    /// Persist an exception; `None` when capture is off or the write failed
    pub async fn capture_exception(
        &self,
        report: &ExceptionReport,
        context: RawValue,
    ) -> Option<CapturedException> {
        if !self.is_enabled() {
            return None;
        }
        self.store.record_exception(report, &context).await
    }

    /// Persist a request snapshot, then link its queries
    pub async fn persist(&self, fields: NewCapturedRequest) -> Option<CapturedRequest> {
        let correlation_id = fields.correlation_id.clone();
        let request = self.store.record_request(fields).await?;

        if let Some(correlation_id) = correlation_id {
            self.link_queries(&correlation_id, request.id).await;
        }

        tracing::debug!(
            uuid = %request.uuid,
            method = %request.method,
            path = %request.path,
            status = request.status_code,
            "Request captured"
        );

        Some(request)
    }

    /// Link queries to their request, retrying a bounded number of times
    ///
    /// Returns the number of rows linked; gives up (leaving the rows
    /// unlinked) after the last attempt fails.
    pub async fn link_queries(&self, correlation_id: &str, request_id: i64) -> u64 {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self
                .store
                .link_queries_by_correlation_id(correlation_id, request_id)
                .await
            {
                Ok(linked) => return linked,
                Err(e) if attempt < LINK_ATTEMPTS => {
                    let delay = LINK_BACKOFF_BASE * 2u32.pow(attempt - 1);
                    tracing::warn!(
                        error = %e,
                        attempt = attempt,
                        correlation_id = correlation_id,
                        "Query linking failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        correlation_id = correlation_id,
                        request_id = request_id,
                        "Query linking failed, leaving queries unlinked"
                    );
                    return 0;
                }
            }
        }
    }

    /// Drain queued query records into the store
    pub async fn flush(&self) {
        self.queries.flush().await;
    }
}

/// Wrap `routes` with the capture stack and mount the management API
///
/// Layer order, outermost first: request capture, error reporting, panic
/// recovery.
pub fn attach(routes: Router, telescope: Arc<Telescope>) -> Router {
    let dashboard_path = telescope.config().dashboard_path.clone();

    routes
        .nest(&dashboard_path, telescope_api::router(telescope.clone()))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn_with_state(
            telescope.clone(),
            exception::report_errors,
        ))
        .layer(middleware::from_fn_with_state(
            telescope,
            capture::capture_requests,
        ))
}

fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let report = ExceptionReport::from_panic(payload.as_ref());
    tracing::error!(message = %report.message, "Handler panicked");

    let mut response = AppError::internal("Internal server error").into_response();
    response.extensions_mut().insert(report);
    response
}
