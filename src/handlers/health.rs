use crate::db::Database;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;

/// Health check endpoint
/// Returns 200 OK if the service is running
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({
        "status": "healthy",
        "service": "civic-telescope",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

/// Readiness check endpoint
/// Returns 200 OK once the business database answers a query
pub async fn readiness_check(State(db): State<Database>) -> impl IntoResponse {
    let result = db
        .traced("SELECT 1", |pool, sql| async move {
            sqlx::query_scalar::<_, i64>(sql).fetch_one(pool).await
        })
        .await;

    match result {
        Ok(_) => (StatusCode::OK, Json(json!({
            "status": "ready",
            "service": "civic-telescope",
        }))),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({
                "status": "unavailable",
                "service": "civic-telescope",
            })))
        }
    }
}
