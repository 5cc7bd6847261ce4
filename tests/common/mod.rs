//! Shared harness: a small civic API wired through the capture stack

#![allow(dead_code)]

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use civic_telescope::{
    config::TelescopeConfig,
    db::Database,
    error::AppError,
    server::create_app,
    telescope::{models::RequestFilter, CaptureHandle, Telescope, UploadedFile},
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

pub struct TestApp {
    pub telescope: Arc<Telescope>,
    pub db: Database,
    pub router: Router,
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(TelescopeConfig::in_memory()).await
}

pub async fn spawn_app_with(config: TelescopeConfig) -> TestApp {
    let telescope = Telescope::new(config).await.unwrap();
    let db = Database::connect("sqlite::memory:", Some(telescope.queries().clone()))
        .await
        .unwrap();

    let routes = Router::new()
        .route("/api/events", post(create_event))
        .route("/api/events/:marker", get(show_event))
        .route("/api/boom", get(boom))
        .route("/api/invalid", post(invalid))
        .route("/api/panic", get(panics))
        .route("/api/upload", post(upload))
        .layer(middleware::from_fn(fake_auth))
        .with_state(db.clone());

    let router = create_app(db.clone(), telescope.clone(), routes);

    TestApp {
        telescope,
        db,
        router,
    }
}

impl TestApp {
    /// Send a request and read the whole response body
    pub async fn send(&self, req: axum::http::Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(
            axum::http::Request::builder()
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn get_owned(&self, uri: String) -> (StatusCode, Value) {
        self.get(&uri).await
    }

    pub async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            axum::http::Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .header("host", "civic.test")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    /// Poll until at least `count` requests are stored and every
    /// captured query has been linked to its request
    pub async fn wait_for_requests(&self, count: i64) {
        for _ in 0..200 {
            self.telescope.flush().await;
            let stats = self.telescope.store().stats().await.unwrap();
            if stats.requests >= count && stats.unlinked_queries == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {} captured requests", count);
    }

    /// Poll until a request for `path` is stored
    pub async fn wait_for_path(&self, path: &str) {
        let filter = RequestFilter {
            search: Some(path.to_string()),
            ..Default::default()
        };
        for _ in 0..200 {
            let (_, total) = self.telescope.store().list_requests(&filter).await.unwrap();
            if total > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for a captured request to {}", path);
    }

    /// Give detached capture tasks a chance to run
    pub async fn settle(&self) {
        for _ in 0..5 {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.telescope.flush().await;
    }
}

/// Stands in for the real auth middleware: trusts `x-user-id`
async fn fake_auth(req: Request, next: Next) -> Response {
    let user_id = req
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let (Some(user_id), Some(handle)) = (user_id, req.extensions().get::<CaptureHandle>()) {
        handle.set_user_id(user_id);
    }

    next.run(req).await
}

async fn create_event(
    State(db): State<Database>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let title = payload["title"].as_str().unwrap_or("untitled").to_string();

    let stored: String = db
        .traced("SELECT ? AS title", |pool, sql| async move {
            sqlx::query_scalar(sql).bind(title).fetch_one(pool).await
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": { "title": stored } })),
    ))
}

async fn show_event(
    State(db): State<Database>,
    Path(marker): Path<String>,
) -> Result<Json<Value>, AppError> {
    tokio::time::sleep(Duration::from_millis(15)).await;

    let sql = format!("SELECT '{}' AS marker", marker.replace('\'', ""));
    let value: String = db
        .traced(&sql, |pool, sql| async move {
            sqlx::query_scalar(sql).fetch_one(pool).await
        })
        .await?;

    tokio::time::sleep(Duration::from_millis(15)).await;

    Ok(Json(json!({ "success": true, "data": { "marker": value } })))
}

async fn boom() -> Result<Json<Value>, AppError> {
    Err(AppError::internal("database exploded"))
}

async fn invalid() -> Result<Json<Value>, AppError> {
    Err(AppError::Validation("title is required".to_string()))
}

async fn panics() -> Json<Value> {
    panic!("handler blew up");
}

async fn upload(req: Request) -> Json<Value> {
    if let Some(handle) = req.extensions().get::<CaptureHandle>() {
        handle.add_uploaded_file(UploadedFile {
            field_name: "photo".to_string(),
            original_name: Some("pothole.jpg".to_string()),
            mime_type: Some("image/jpeg".to_string()),
            size: 48_213,
        });
    }

    Json(json!({ "success": true }))
}
