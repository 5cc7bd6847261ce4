/// End-to-end capture tests: requests, queries and exceptions flowing
/// through the middleware stack into the store and back out of the API
mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use civic_telescope::config::TelescopeConfig;
use common::{spawn_app, spawn_app_with};
use futures::future::join_all;
use serde_json::json;

#[tokio::test]
async fn test_capture_round_trip() {
    let app = spawn_app().await;

    let (status, _) = app
        .post_json(
            "/api/events?ward=4",
            json!({ "title": "Lake clean-up", "password": "hunter2" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    app.wait_for_requests(1).await;

    let (status, body) = app.get("/telescope/api/requests?limit=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["total"], 1);

    let captured = &body["data"]["requests"][0];
    assert_eq!(captured["method"], "POST");
    assert_eq!(captured["path"], "/api/events");
    assert_eq!(captured["statusCode"], 201);
    assert_eq!(captured["fullUrl"], "http://civic.test/api/events?ward=4");
    assert_eq!(captured["queryParams"]["ward"], "4");
    assert_eq!(captured["bodyParams"]["title"], "Lake clean-up");
    assert_eq!(captured["bodyParams"]["password"], "[REDACTED]");
    assert_eq!(captured["responseBody"]["data"]["title"], "Lake clean-up");
    assert_eq!(captured["responseHeaders"]["content-type"], "application/json");

    let uuid = captured["uuid"].as_str().unwrap();
    assert!(uuid::Uuid::parse_str(uuid).is_ok());
    assert!(!body.to_string().contains("hunter2"));

    let (status, detail) = app.get(&format!("/telescope/api/requests/{}", uuid)).await;
    assert_eq!(status, StatusCode::OK);
    let queries = detail["data"]["queries"].as_array().unwrap();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0]["sql"], "SELECT ? AS title");
    assert_eq!(queries[0]["bindings"], json!(["?"]));
}

#[tokio::test]
async fn test_excluded_paths_are_not_captured() {
    let app = spawn_app().await;

    let (status, _) = app.get("/telescope/api/requests").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app.get("/uploads/avatar.png").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    app.settle().await;

    let stats = app.telescope.store().stats().await.unwrap();
    assert_eq!(stats.requests, 0);
    assert_eq!(stats.exceptions, 0);
}

#[tokio::test]
async fn test_server_error_attaches_exception() {
    let app = spawn_app().await;

    let (status, body) = app.get("/api/boom").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "INTERNAL_ERROR");

    app.wait_for_requests(1).await;

    let (_, list) = app.get("/telescope/api/requests").await;
    let captured = &list["data"]["requests"][0];
    assert_eq!(captured["statusCode"], 500);
    let exception_id = captured["exceptionId"].as_i64().expect("exception id attached");

    let (_, exceptions) = app.get("/telescope/api/exceptions").await;
    let exception = &exceptions["data"]["exceptions"][0];
    assert_eq!(exception["id"].as_i64(), Some(exception_id));

    let uuid = exception["uuid"].as_str().unwrap();
    let (status, detail) = app.get(&format!("/telescope/api/exceptions/{}", uuid)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["data"]["message"], "database exploded");
    assert_eq!(detail["data"]["type"], "InternalError");
    assert_eq!(detail["data"]["code"], "INTERNAL_ERROR");
    assert_eq!(detail["data"]["context"]["path"], "/api/boom");
    assert_eq!(detail["data"]["context"]["statusCode"], 500);
}

#[tokio::test]
async fn test_validation_error_is_recorded() {
    let app = spawn_app().await;

    let (status, body) = app.post_json("/api/invalid", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    app.wait_for_requests(1).await;

    let (_, exceptions) = app.get("/telescope/api/exceptions?type=ValidationError").await;
    assert_eq!(exceptions["data"]["total"], 1);
    assert_eq!(exceptions["data"]["exceptions"][0]["message"], "title is required");
}

#[tokio::test]
async fn test_not_found_is_not_an_exception() {
    let app = spawn_app().await;

    let (status, _) = app.get("/api/nothing-here").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    app.wait_for_requests(1).await;

    let stats = app.telescope.store().stats().await.unwrap();
    assert_eq!(stats.exceptions, 0);
}

#[tokio::test]
async fn test_panic_is_captured() {
    let app = spawn_app().await;

    let (status, body) = app.get("/api/panic").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);

    app.wait_for_requests(1).await;

    let (_, exceptions) = app.get("/telescope/api/exceptions?type=panic").await;
    assert_eq!(exceptions["data"]["total"], 1);
    assert_eq!(exceptions["data"]["exceptions"][0]["message"], "handler blew up");

    let (_, list) = app.get("/telescope/api/requests").await;
    assert!(list["data"]["requests"][0]["exceptionId"].is_i64());
}

#[tokio::test]
async fn test_concurrent_queries_link_to_their_own_request() {
    let app = spawn_app().await;

    let markers = ["alpha", "bravo", "charlie", "delta"];
    let responses = join_all(
        markers
            .iter()
            .map(|marker| app.get_owned(format!("/api/events/{}", marker))),
    )
    .await;
    assert!(responses.iter().all(|(status, _)| *status == StatusCode::OK));

    app.wait_for_requests(markers.len() as i64).await;

    let (_, list) = app.get("/telescope/api/requests").await;
    let requests = list["data"]["requests"].as_array().unwrap();
    assert_eq!(requests.len(), markers.len());

    for request in requests {
        let path = request["path"].as_str().unwrap();
        let marker = path.rsplit('/').next().unwrap();

        let (_, detail) = app
            .get(&format!("/telescope/api/requests/{}", request["uuid"].as_str().unwrap()))
            .await;
        let queries = detail["data"]["queries"].as_array().unwrap();
        assert_eq!(queries.len(), 1, "one query for {}", path);
        assert!(
            queries[0]["sql"].as_str().unwrap().contains(marker),
            "query for {} linked to the wrong request",
            path
        );
    }

    let stats = app.telescope.store().stats().await.unwrap();
    assert_eq!(stats.unlinked_queries, 0);
}

#[tokio::test]
async fn test_authenticated_user_is_recorded() {
    let app = spawn_app().await;

    let (status, _) = app
        .send(
            Request::builder()
                .uri("/api/events/charlie")
                .header("x-user-id", "user-42")
                .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
                .header("user-agent", "civic-mobile/2.1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    app.wait_for_requests(1).await;

    let (_, list) = app.get("/telescope/api/requests?userId=user-42").await;
    assert_eq!(list["data"]["total"], 1);
    let captured = &list["data"]["requests"][0];
    assert_eq!(captured["userId"], "user-42");
    assert_eq!(captured["ipAddress"], "203.0.113.9");
    assert_eq!(captured["userAgent"], "civic-mobile/2.1");
}

#[tokio::test]
async fn test_uploaded_files_are_merged_into_body() {
    let app = spawn_app().await;

    let (status, _) = app.post_json("/api/upload", json!({ "caption": "Broken road" })).await;
    assert_eq!(status, StatusCode::OK);

    app.wait_for_requests(1).await;

    let (_, list) = app.get("/telescope/api/requests").await;
    let files = &list["data"]["requests"][0]["bodyParams"]["_files"];
    assert_eq!(files[0]["fieldName"], "photo");
    assert_eq!(files[0]["originalName"], "pothole.jpg");
    assert_eq!(files[0]["size"], 48_213);
}

#[tokio::test]
async fn test_retention_keeps_newest_requests() {
    let mut config = TelescopeConfig::in_memory();
    config.max_requests = 3;
    let app = spawn_app_with(config).await;

    for marker in ["one", "two", "three", "four", "five"] {
        let path = format!("/api/events/{}", marker);
        app.get(&path).await;
        // persist each before sending the next so creation order is fixed
        app.wait_for_path(&path).await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    app.settle().await;

    let (_, list) = app.get("/telescope/api/requests").await;
    assert_eq!(list["data"]["total"], 3);

    let mut paths: Vec<String> = list["data"]["requests"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["path"].as_str().unwrap().to_string())
        .collect();
    paths.sort();
    assert_eq!(paths, vec!["/api/events/five", "/api/events/four", "/api/events/three"]);
}

#[tokio::test]
async fn test_disabled_capture_records_nothing() {
    let app = spawn_app().await;
    app.telescope.set_enabled(false);

    let (status, _) = app.get("/api/boom").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    app.get("/api/events/delta").await;
    app.settle().await;

    let stats = app.telescope.store().stats().await.unwrap();
    assert_eq!(stats.requests, 0);
    assert_eq!(stats.exceptions, 0);
    assert_eq!(stats.queries, 0);
}

#[tokio::test]
async fn test_clear_requests_via_api() {
    let app = spawn_app().await;
    app.get("/api/events/echo").await;
    app.wait_for_requests(1).await;

    let (status, body) = app
        .send(
            Request::builder()
                .method("DELETE")
                .uri("/telescope/api/requests")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["count"], 1);

    // queries go with their request
    let stats = app.telescope.store().stats().await.unwrap();
    assert_eq!(stats.requests, 0);
    assert_eq!(stats.queries, 0);
}

#[tokio::test]
async fn test_health_endpoints() {
    let app = spawn_app().await;

    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = app.get("/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn test_oversized_body_is_redacted_before_bounding() {
    let mut config = TelescopeConfig::in_memory();
    config.max_body_size = 200;
    let app = spawn_app_with(config).await;

    let (status, _) = app
        .post_json(
            "/api/events",
            json!({ "password": "hunter2", "title": "x".repeat(1000) }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    app.wait_for_requests(1).await;

    let (_, list) = app.get("/telescope/api/requests").await;
    let captured = &list["data"]["requests"][0];
    let body_params = &captured["bodyParams"];

    assert_eq!(body_params["truncated"], true);
    let prefix = body_params["data"].as_str().unwrap();
    // bounded once, over the already-redacted body
    assert!(prefix.starts_with(r#"{"password":"[REDACTED]","title":"xxx"#));
    assert!(body_params.to_string().len() <= 200 + 28 + 16);

    assert_eq!(captured["responseBody"]["truncated"], true);
    assert!(!list.to_string().contains("hunter2"));
}

#[tokio::test]
async fn test_sensitive_query_params_are_redacted_in_url() {
    let app = spawn_app().await;

    let (status, _) = app
        .post_json("/api/events?token=abc123&ward=4", json!({ "title": "Ward meeting" }))
        .await;
    assert_eq!(status, StatusCode::CREATED);

    app.wait_for_requests(1).await;

    let (_, list) = app.get("/telescope/api/requests").await;
    let captured = &list["data"]["requests"][0];
    assert_eq!(captured["queryParams"]["token"], "[REDACTED]");
    assert_eq!(captured["queryParams"]["ward"], "4");
    assert_eq!(
        captured["fullUrl"],
        "http://civic.test/api/events?token=%5BREDACTED%5D&ward=4"
    );
    assert!(!list.to_string().contains("abc123"));
}
