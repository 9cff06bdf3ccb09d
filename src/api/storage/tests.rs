use axum::body::Body;
use axum::http::{header, Method, StatusCode};
use futures::StreamExt;
use serde_json::json;
use tower::ServiceExt;

use crate::progress::event::InboundEvent;
use crate::progress::session::ProgressUpdate;
use crate::progress::EventSource;
use crate::test_support;

async fn first_chunk(body: Body) -> String {
    let mut stream = body.into_data_stream();
    let chunk = stream.next().await.expect("chunk").expect("body bytes");
    String::from_utf8(chunk.to_vec()).expect("utf8")
}

#[tokio::test]
async fn connect_opens_event_stream_with_connected_frame() {
    let ctx = test_support::setup_test_context().await;

    let response = ctx
        .app
        .clone()
        .oneshot(test_support::request(
            Method::GET,
            "/api/storage/sse/connect?examCode=ex1&examName=Midterm&total=3",
        ))
        .await
        .expect("connect");

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(headers["x-accel-buffering"], "no");

    let chunk = first_chunk(response.into_body()).await;
    assert!(chunk.contains("event: connected"), "unexpected frame: {chunk}");
    assert!(chunk.contains("\"examCode\":\"EX1\""), "unexpected frame: {chunk}");
    assert!(chunk.contains("SSE connected"), "unexpected frame: {chunk}");

    let snapshot = ctx.state.hub().registry().snapshot("EX1").expect("session");
    assert_eq!(snapshot.exam_name, "Midterm");
    assert_eq!(snapshot.total, 3);
}

#[tokio::test]
async fn connect_without_exam_code_is_rejected() {
    let ctx = test_support::setup_test_context().await;

    let response = ctx
        .app
        .clone()
        .oneshot(test_support::request(Method::GET, "/api/storage/sse/connect?examCode="))
        .await
        .expect("connect");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(ctx.state.hub().registry().len(), 0);
}

#[tokio::test]
async fn connect_with_malformed_total_returns_json_error() {
    let ctx = test_support::setup_test_context().await;

    let response = ctx
        .app
        .clone()
        .oneshot(test_support::request(
            Method::GET,
            "/api/storage/sse/connect?examCode=EX1&total=abc",
        ))
        .await
        .expect("connect");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    let body = test_support::read_json(response).await;
    assert_eq!(body["status"], 400);
    let detail = body["detail"].as_str().expect("detail");
    assert!(detail.starts_with("Failed to deserialize query string"), "detail: {detail}");
    assert_eq!(ctx.state.hub().registry().len(), 0);
}

#[tokio::test]
async fn progress_updates_reach_the_stream() {
    let ctx = test_support::setup_test_context().await;

    let response = ctx
        .app
        .clone()
        .oneshot(test_support::request(
            Method::GET,
            "/api/storage/sse/connect?examCode=EX2&total=2",
        ))
        .await
        .expect("connect");
    let mut stream = response.into_body().into_data_stream();
    stream.next().await.expect("connected frame").expect("bytes");

    let event = InboundEvent::from_value(json!({"examCode": "EX2", "filename": "a.png"}))
        .expect("parse");
    ctx.state.hub().dispatch(event, EventSource::Topic).await.expect("dispatch");

    let chunk = stream.next().await.expect("update frame").expect("bytes");
    let chunk = String::from_utf8(chunk.to_vec()).expect("utf8");
    assert!(chunk.contains("event: recognition_update"), "unexpected frame: {chunk}");
    assert!(chunk.contains("\"index\":1"), "unexpected frame: {chunk}");
}

#[tokio::test]
async fn progress_lookup_returns_not_found_for_unknown_exam() {
    let ctx = test_support::setup_test_context().await;

    let response = ctx
        .app
        .clone()
        .oneshot(test_support::request(Method::GET, "/api/storage/progress/NOPE"))
        .await
        .expect("progress");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = test_support::read_json(response).await;
    assert_eq!(body["status"], 404);
}

#[tokio::test]
async fn active_processes_list_and_stop() {
    let ctx = test_support::setup_test_context().await;
    let registry = ctx.state.hub().registry();
    registry.get_or_create("EX1", Some("Midterm"), 4);
    registry.advance("EX1", &ProgressUpdate::item("a.png"), |_| json!({}));
    registry.get_or_create("EX0", None, 0);

    let response = ctx
        .app
        .clone()
        .oneshot(test_support::request(Method::GET, "/api/storage/active-processes"))
        .await
        .expect("list");
    assert_eq!(response.status(), StatusCode::OK);
    let body = test_support::read_json(response).await;
    assert_eq!(body.as_array().expect("array").len(), 2);
    assert_eq!(body[1]["examCode"], "EX1");
    assert_eq!(body[1]["index"], 1);
    assert_eq!(body[1]["status"], "processing");

    let response = ctx
        .app
        .clone()
        .oneshot(test_support::request(Method::GET, "/api/storage/progress/ex1"))
        .await
        .expect("progress");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(test_support::read_json(response).await["total"], 4);

    let response = ctx
        .app
        .clone()
        .oneshot(test_support::request(Method::DELETE, "/api/storage/active-processes/ex1"))
        .await
        .expect("stop");
    assert_eq!(response.status(), StatusCode::OK);
    let body = test_support::read_json(response).await;
    assert_eq!(body["examCode"], "EX1");
    assert_eq!(body["removed"], true);
    assert!(ctx.state.hub().registry().snapshot("EX1").is_none());
}
