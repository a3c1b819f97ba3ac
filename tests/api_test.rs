//! HTTP surface tests driven through the router, no sockets.

mod common;

use common::test_context;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use noema::llm::MockClient;
use noema::server::router;
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_ok_in_the_envelope() {
    let (ctx, _) = test_context(MockClient::new()).await;
    let response = router(ctx)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], serde_json::json!(true));
    assert_eq!(body["data"]["status"], serde_json::json!("ok"));
}

#[tokio::test]
async fn concatenated_urls_are_rejected_without_starting_a_run() {
    let (ctx, _) = test_context(MockClient::new()).await;
    let identity_before = ctx.identity.view().await.unwrap();

    let request = Request::post("/qa/run")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"goal":"Test login","url":"https://a.comhttps://b.com"}"#,
        ))
        .unwrap();
    let response = router(ctx.clone()).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["success"], serde_json::json!(false));
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("multiple URLs concatenated"));

    // no run was started, identity counters unchanged
    assert!(ctx.runs.list().is_empty());
    assert_eq!(ctx.store.runs.count().await.unwrap(), 0);
    let identity_after = ctx.identity.view().await.unwrap();
    assert_eq!(
        identity_after.identity.total_runs,
        identity_before.identity.total_runs
    );
}

#[tokio::test]
async fn start_run_returns_run_id_and_registers_the_run() {
    let (ctx, _factory) = test_context(MockClient::new()).await;
    let request = Request::post("/qa/run")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"goal":"Test login flow","url":"https://www.saucedemo.com","max_total_actions":1,"max_cycles_per_step":1}"#,
        ))
        .unwrap();
    let response = router(ctx.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["status"], serde_json::json!("started"));
    let run_id = body["data"]["run_id"].as_str().unwrap().to_string();
    assert!(ctx.runs.get(&run_id).is_some());

    // state endpoint serves a live view
    let response = router(ctx.clone())
        .oneshot(
            Request::get(format!("/run/{run_id}/state"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let state = body_json(response).await;
    assert_eq!(state["data"]["run_id"].as_str().unwrap(), run_id);
}

#[tokio::test]
async fn ingest_creates_observations_and_returns_ids() {
    let (ctx, _) = test_context(MockClient::new()).await;
    let request = Request::post("/ingest")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"type":"log","content":"warn: slow request\ninfo: ok","source":"ci"}"#,
        ))
        .unwrap();
    let response = router(ctx.clone()).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["chunk_count"], serde_json::json!(2));
    assert_eq!(ctx.store.observations.count().await.unwrap(), 2);

    let response = router(ctx)
        .oneshot(
            Request::post("/ingest")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"type":"smell","content":"?"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn evidence_routes_reject_traversal_and_serve_files() {
    let (ctx, _) = test_context(MockClient::new()).await;
    std::fs::write(ctx.store.screenshots_dir().join("shot_0001.png"), b"png").unwrap();

    let response = router(ctx.clone())
        .oneshot(
            Request::get("/evidence/screenshots/shot_0001.png")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "image/png"
    );

    let response = router(ctx.clone())
        .oneshot(
            Request::get("/evidence/screenshots/..%2Fsecrets.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_ne!(response.status(), StatusCode::OK);

    let response = router(ctx)
        .oneshot(
            Request::get("/evidence/videos/missing.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn listing_routes_return_enveloped_collections() {
    let (ctx, _) = test_context(MockClient::new()).await;
    for path in ["/runs", "/metrics", "/models", "/experiences", "/improvement"] {
        let response = router(ctx.clone())
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{path}");
        let body = body_json(response).await;
        assert_eq!(body["success"], serde_json::json!(true), "{path}");
        assert!(body["data"].is_array(), "{path}");
    }
}

#[tokio::test]
async fn run_events_honour_the_since_cursor() {
    let (ctx, _) = test_context(MockClient::new()).await;
    let first = ctx
        .narration
        .narrate(Some("run-x"), "I am starting the run");
    ctx.narration.narrate(Some("run-x"), "I am opening the page");
    ctx.narration.narrate(Some("run-y"), "I belong to another run");

    let response = router(ctx)
        .oneshot(
            Request::get(format!("/run/run-x/events?since={}", first.seq))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    let events = body["data"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0]["seq"].as_u64().unwrap() > first.seq);
}

#[tokio::test]
async fn unknown_runs_return_not_found() {
    let (ctx, _) = test_context(MockClient::new()).await;
    for (method, path) in [
        ("GET", "/run/nope/state"),
        ("GET", "/run/nope/report"),
        ("POST", "/run/nope/stop"),
        ("POST", "/run/nope/optimize"),
    ] {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let response = router(ctx.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{method} {path}");
    }
}
