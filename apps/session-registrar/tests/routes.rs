use axum::body;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::json;
use tower::util::ServiceExt;

use harbor_session_registrar::registrar::{RegistrarSettings, SessionRegistrar};
use harbor_session_registrar::routes;
use harbor_session_registrar::state::AppState;
use harbor_transport::RecordingTransport;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn build_app() -> Router {
    let registrar = SessionRegistrar::new(RegistrarSettings::default(), RecordingTransport::new());
    routes::router(AppState::new(registrar, "gss-test"))
}

fn execute(body: serde_json::Value) -> Result<Request<Body>, axum::http::Error> {
    Request::builder()
        .method("POST")
        .uri("/execute")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
}

async fn json_body(response: axum::response::Response) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let bytes = body::to_bytes(response.into_body(), 1024 * 64).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[tokio::test]
async fn reserve_then_confirm_opens_the_session() -> TestResult {
    let app = build_app();

    let response = app
        .clone()
        .oneshot(execute(json!({
            "action": "register_session_service",
            "url": "http://lss-a"
        }))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await?["lss_id"], 1);

    let response = app
        .clone()
        .oneshot(execute(json!({
            "action": "reserve_session",
            "session_id": "p1",
            "user_name": "ada"
        }))?)
        .await?;
    assert_eq!(json_body(response).await?["lss_url"], "http://lss-a");

    let response = app
        .clone()
        .oneshot(execute(json!({
            "action": "confirm_session",
            "session_id": "p1",
            "user_name": "ada",
            "lss_id": 1
        }))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(execute(json!({"action": "check_project_open", "project_name": "p1"}))?)
        .await?;
    let open = json_body(response).await?;
    assert_eq!(open["open"], true);
    assert_eq!(open["user_name"], "ada");

    let response = app
        .oneshot(execute(json!({
            "action": "reserve_session",
            "session_id": "p1",
            "user_name": "bob"
        }))?)
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await?["kind"], "duplicate_session");
    Ok(())
}

#[tokio::test]
async fn reserving_without_authorities_is_no_capacity() -> TestResult {
    let response = build_app()
        .oneshot(execute(json!({
            "action": "reserve_session",
            "session_id": "p1",
            "user_name": "ada"
        }))?)
        .await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await?["kind"], "no_capacity");
    Ok(())
}
