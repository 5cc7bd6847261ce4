//! Telescope management API
//!
//! Read and clear captured requests and exceptions. Mounted under the
//! configured dashboard path, which is excluded from capture itself.

use crate::error::AppError;
use crate::telescope::models::{page, ExceptionFilter, RequestDetail, RequestFilter};
use crate::telescope::Telescope;
use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Success envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

/// Query parameters for `GET /api/requests`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestQueryParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub method: Option<String>,
    pub status_code: Option<i64>,
    pub user_id: Option<String>,
    pub search: Option<String>,
}

/// Query parameters for `GET /api/exceptions`
#[derive(Debug, Default, Deserialize)]
pub struct ExceptionQueryParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RequestPage {
    pub requests: Vec<crate::telescope::CapturedRequest>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct ExceptionPage {
    pub exceptions: Vec<crate::telescope::CapturedException>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Management API routes, with state applied
pub fn router(telescope: Arc<Telescope>) -> Router {
    Router::new()
        .route("/api/requests", get(list_requests).delete(clear_requests))
        .route("/api/requests/:uuid", get(get_request))
        .route("/api/exceptions", get(list_exceptions).delete(clear_exceptions))
        .route("/api/exceptions/:uuid", get(get_exception))
        .route("/api/stats", get(get_stats))
        .with_state(telescope)
}

/// GET /api/requests - List captured requests, newest first
///
/// Example: GET /api/requests?method=POST&statusCode=500&limit=20
pub async fn list_requests(
    State(telescope): State<Arc<Telescope>>,
    Query(params): Query<RequestQueryParams>,
) -> Result<Json<ApiResponse<RequestPage>>, AppError> {
    let (limit, offset) = page(params.limit, params.offset);
    let filter = RequestFilter {
        method: params.method,
        status_code: params.status_code,
        user_id: params.user_id,
        search: params.search,
        limit: Some(limit),
        offset: Some(offset),
    };

    let (requests, total) = telescope.store().list_requests(&filter).await?;

    Ok(ApiResponse::ok(RequestPage {
        requests,
        total,
        limit,
        offset,
    }))
}

/// GET /api/requests/:uuid - One request with the queries it issued
pub async fn get_request(
    State(telescope): State<Arc<Telescope>>,
    Path(uuid): Path<String>,
) -> Result<Json<ApiResponse<RequestDetail>>, AppError> {
    let store = telescope.store();
    let request = store
        .get_request_by_uuid(&uuid)
        .await?
        .ok_or_else(|| AppError::NotFound("Request not found".to_string()))?;
    let queries = store.queries_for_request(request.id).await?;

    Ok(ApiResponse::ok(RequestDetail { request, queries }))
}

/// GET /api/exceptions - List captured exceptions, newest first
///
/// Example: GET /api/exceptions?type=InternalError&search=timeout
pub async fn list_exceptions(
    State(telescope): State<Arc<Telescope>>,
    Query(params): Query<ExceptionQueryParams>,
) -> Result<Json<ApiResponse<ExceptionPage>>, AppError> {
    let (limit, offset) = page(params.limit, params.offset);
    let filter = ExceptionFilter {
        kind: params.kind,
        search: params.search,
        limit: Some(limit),
        offset: Some(offset),
    };

    let (exceptions, total) = telescope.store().list_exceptions(&filter).await?;

    Ok(ApiResponse::ok(ExceptionPage {
        exceptions,
        total,
        limit,
        offset,
    }))
}

/// GET /api/exceptions/:uuid
pub async fn get_exception(
    State(telescope): State<Arc<Telescope>>,
    Path(uuid): Path<String>,
) -> Result<Json<ApiResponse<crate::telescope::CapturedException>>, AppError> {
    let exception = telescope
        .store()
        .get_exception_by_uuid(&uuid)
        .await?
        .ok_or_else(|| AppError::NotFound("Exception not found".to_string()))?;

    Ok(ApiResponse::ok(exception))
}

/// DELETE /api/requests - Remove every captured request
pub async fn clear_requests(
    State(telescope): State<Arc<Telescope>>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let count = telescope.store().clear_all_requests().await?;

    Ok(ApiResponse::ok(json!({
        "message": format!("Cleared {} captured requests", count),
        "count": count,
    })))
}

/// DELETE /api/exceptions - Remove every captured exception
pub async fn clear_exceptions(
    State(telescope): State<Arc<Telescope>>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let count = telescope.store().clear_all_exceptions().await?;

    Ok(ApiResponse::ok(json!({
        "message": format!("Cleared {} captured exceptions", count),
        "count": count,
    })))
}

/// GET /api/stats - Row counts per capture table
pub async fn get_stats(
    State(telescope): State<Arc<Telescope>>,
) -> Result<Json<ApiResponse<crate::telescope::models::StoreStats>>, AppError> {
    let stats = telescope.store().stats().await?;
    Ok(ApiResponse::ok(stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelescopeConfig;
    use crate::telescope::models::NewCapturedRequest;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn setup() -> (Arc<Telescope>, Router) {
        let telescope = Telescope::new(TelescopeConfig::in_memory()).await.unwrap();
        let app = router(telescope.clone());
        (telescope, app)
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn seed(telescope: &Telescope, method: &str, path: &str, status_code: u16) {
        telescope
            .persist(NewCapturedRequest {
                correlation_id: Some(uuid::Uuid::new_v4().to_string()),
                method: method.to_string(),
                path: path.to_string(),
                full_url: format!("http://localhost{}", path),
                status_code,
                ..Default::default()
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_requests_envelope() {
        let (telescope, app) = setup().await;
        seed(&telescope, "POST", "/api/complaints", 201).await;
        seed(&telescope, "GET", "/api/complaints", 200).await;

        let (status, body) = call(&app, "GET", "/api/requests?method=POST").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["total"], 1);
        assert_eq!(body["data"]["limit"], 50);
        assert_eq!(body["data"]["offset"], 0);
        assert_eq!(body["data"]["requests"][0]["statusCode"], 201);
    }

    #[tokio::test]
    async fn test_get_request_detail_and_not_found() {
        let (telescope, app) = setup().await;
        seed(&telescope, "GET", "/api/schemes", 200).await;

        let (_, list) = call(&app, "GET", "/api/requests?limit=1").await;
        let uuid = list["data"]["requests"][0]["uuid"].as_str().unwrap().to_string();

        let (status, body) = call(&app, "GET", &format!("/api/requests/{}", uuid)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["path"], "/api/schemes");
        assert!(body["data"]["queries"].is_array());

        let (status, body) = call(&app, "GET", "/api/requests/does-not-exist").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_clear_requests_reports_count() {
        let (telescope, app) = setup().await;
        seed(&telescope, "GET", "/a", 200).await;
        seed(&telescope, "GET", "/b", 200).await;

        let (status, body) = call(&app, "DELETE", "/api/requests").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["count"], 2);

        let (_, body) = call(&app, "GET", "/api/stats").await;
        assert_eq!(body["data"]["requests"], 0);
    }

    #[tokio::test]
    async fn test_exceptions_list_and_clear() {
        let (telescope, app) = setup().await;
        let report = crate::telescope::ExceptionReport::new("ValidationError", "title is required");
        let exc = telescope
            .capture_exception(&report, crate::telescope::RawValue::Null)
            .await
            .unwrap();

        let (_, body) = call(&app, "GET", "/api/exceptions?type=ValidationError").await;
        assert_eq!(body["data"]["total"], 1);
        assert_eq!(body["data"]["exceptions"][0]["type"], "ValidationError");

        let (_, body) = call(&app, "GET", &format!("/api/exceptions/{}", exc.uuid)).await;
        assert_eq!(body["data"]["message"], "title is required");

        let (_, body) = call(&app, "DELETE", "/api/exceptions").await;
        assert_eq!(body["data"]["count"], 1);
    }
}
