mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::json;
use tower::util::ServiceExt;

use common::*;
use harbor_session_authority::routes;
use harbor_session_authority::state::AppState;
use harbor_transport::RecordingTransport;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn build_app() -> Router {
    let recording = RecordingTransport::new();
    placing_directory(&recording);
    app_over(&recording)
}

fn app_over(recording: &Arc<RecordingTransport>) -> Router {
    let authority = authority_with(recording, Duration::from_secs(3600));
    routes::router(AppState::new(authority, "lss-test"))
}

fn execute(body: serde_json::Value) -> Result<Request<Body>, axum::http::Error> {
    Request::builder()
        .method("POST")
        .uri("/execute")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
}

fn create_body(session_id: &str) -> serde_json::Value {
    json!({
        "action": "create_session",
        "session_id": session_id,
        "user_name": "ada",
        "project_name": "p1",
        "session_type": "pair",
        "service_name": "ui",
        "service_type": "UI",
        "service_url": "http://ui"
    })
}

#[tokio::test]
async fn create_session_replies_with_caller_slot() -> TestResult {
    let app = build_app();

    let response = app.clone().oneshot(execute(create_body("s1"))?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), 1024 * 64).await?;
    let reply: serde_json::Value = serde_json::from_slice(&bytes)?;
    assert_eq!(reply["service_id"], 1);
    assert_eq!(reply["tab_order"][0], "File");

    let response = app.clone().oneshot(execute(create_body("s1"))?).await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let bytes = body::to_bytes(response.into_body(), 1024 * 64).await?;
    let err: serde_json::Value = serde_json::from_slice(&bytes)?;
    assert_eq!(err["kind"], "duplicate_session");

    let response = app
        .clone()
        .oneshot(execute(json!({"action": "session_exists", "session_id": "s1"}))?)
        .await?;
    let bytes = body::to_bytes(response.into_body(), 1024).await?;
    assert_eq!(&bytes[..], b"TRUE");

    let response = app
        .oneshot(execute(json!({"action": "session_exists", "session_id": "nope"}))?)
        .await?;
    let bytes = body::to_bytes(response.into_body(), 1024).await?;
    assert_eq!(&bytes[..], b"FALSE");
    Ok(())
}

#[tokio::test]
async fn unknown_sessions_and_foreign_actions_are_rejected() -> TestResult {
    let app = build_app();

    let response = app
        .clone()
        .oneshot(execute(json!({
            "action": "confirm_service",
            "session_id": "ghost",
            "service_id": 1
        }))?)
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(execute(json!({
            "action": "reserve_session",
            "session_id": "s1",
            "user_name": "ada"
        }))?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn system_information_lists_sessions() -> TestResult {
    let app = build_app();
    app.clone().oneshot(execute(create_body("s2"))?).await?;

    let response = app
        .oneshot(execute(json!({"action": "get_system_information"}))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), 1024 * 64).await?;
    let info: serde_json::Value = serde_json::from_slice(&bytes)?;
    assert_eq!(info["url"], LSS);
    assert_eq!(info["directory_url"], DIRECTORY);
    assert_eq!(info["sessions"][0]["session_id"], "s2");
    assert_eq!(info["sessions"][0]["state"], "initializing");
    Ok(())
}

#[tokio::test]
async fn synchronous_broadcast_is_delivered_before_the_reply() -> TestResult {
    let recording = RecordingTransport::new();
    placing_directory(&recording);
    let app = app_over(&recording);
    app.clone().oneshot(execute(create_body("s1"))?).await?;
    for (service_id, url) in [(2, "http://a"), (3, "http://b")] {
        let response = app
            .clone()
            .oneshot(execute(json!({
                "action": "confirm_service",
                "session_id": "s1",
                "service_id": service_id,
                "service_url": url
            }))?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .oneshot(execute(json!({
            "action": "send_broadcast",
            "session_id": "s1",
            "service_id": 2,
            "message": "saved",
            "synchronous": true
        }))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let delivered: Vec<_> = recording
        .actions_named("broadcast")
        .into_iter()
        .map(|(to, _)| to)
        .collect();
    assert_eq!(delivered, vec!["http://b"]);
    Ok(())
}
