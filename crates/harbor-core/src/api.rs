//! HTTP surface shared by every harbor process.
//!
//! All three delivery paths accept the same `Action` envelope; the per-process
//! [`ActionHandler`] decides what each action means.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use harbor_proto::{Action, REPLY_FALSE, REPLY_OK, REPLY_PING, REPLY_TRUE};
use harbor_transport::SENDER_HEADER;
use serde::Serialize;
use tracing::debug;

use crate::error::ControlError;
use crate::metrics;

/// Successful handler reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(&'static str),
    Json(serde_json::Value),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Text(REPLY_OK)
    }

    pub fn ping() -> Self {
        Reply::Text(REPLY_PING)
    }

    pub fn flag(value: bool) -> Self {
        Reply::Text(if value { REPLY_TRUE } else { REPLY_FALSE })
    }

    pub fn json<T: Serialize>(value: &T) -> Self {
        Reply::Json(serde_json::to_value(value).unwrap_or(serde_json::Value::Null))
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self {
            Reply::Text(text) => text.into_response(),
            Reply::Json(value) => Json(value).into_response(),
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_body())).into_response()
    }
}

pub type ActionResult = Result<Reply, ControlError>;

#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    async fn handle(&self, action: Action) -> ActionResult;

    fn process(&self) -> &ProcessInfo;
}

/// Identity and uptime of the running process, reported by `/readyz`.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    start: Instant,
    instance_id: String,
}

impl ProcessInfo {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            instance_id: instance_id.into(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    uptime_secs: u64,
    instance_id: String,
}

pub fn parse_action(body: &str) -> Result<Action, ControlError> {
    Action::from_json(body).map_err(|err| ControlError::InvalidRequest(err.to_string()))
}

pub fn unsupported(action: &Action) -> ControlError {
    ControlError::InvalidRequest(format!("unsupported action {}", action.name()))
}

type SharedHandler = Arc<dyn ActionHandler>;

async fn execute(
    State(handler): State<SharedHandler>,
    headers: HeaderMap,
    body: String,
) -> Result<Reply, ControlError> {
    let action = parse_action(&body)?;
    if let Some(sender) = headers.get(SENDER_HEADER).and_then(|v| v.to_str().ok()) {
        debug!(action = action.name(), sender, "action received");
    }
    handler.handle(action).await
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(handler): State<SharedHandler>) -> Json<ReadyResponse> {
    let process = handler.process();
    Json(ReadyResponse {
        status: "ok",
        uptime_secs: process.uptime_secs(),
        instance_id: process.instance_id().to_string(),
    })
}

async fn metrics_handler() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], metrics::gather())
}

pub fn router(handler: SharedHandler) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(ready))
        .route("/metrics", get(metrics_handler))
        .route("/execute", post(execute))
        .route("/queue", post(execute))
        .route("/execute-one-way", post(execute))
        .with_state(handler)
}

#[cfg(test)]
mod tests {
    use axum::body::{self, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    struct Echo {
        process: ProcessInfo,
    }

    #[async_trait]
    impl ActionHandler for Echo {
        async fn handle(&self, action: Action) -> ActionResult {
            match action {
                Action::Ping => Ok(Reply::ping()),
                other => Err(unsupported(&other)),
            }
        }

        fn process(&self) -> &ProcessInfo {
            &self.process
        }
    }

    fn app() -> Router {
        router(Arc::new(Echo {
            process: ProcessInfo::new("test"),
        }))
    }

    #[tokio::test]
    async fn every_delivery_path_dispatches() {
        for path in ["/execute", "/queue", "/execute-one-way"] {
            let res = app()
                .oneshot(
                    Request::post(path)
                        .body(Body::from(r#"{"action":"ping"}"#))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::OK);
            let bytes = body::to_bytes(res.into_body(), 1024).await.unwrap();
            assert_eq!(&bytes[..], b"Ping");
        }
    }

    #[tokio::test]
    async fn malformed_and_unsupported_actions_are_bad_requests() {
        for raw in ["not json", r#"{"action":"get_system_information"}"#] {
            let res = app()
                .oneshot(Request::post("/execute").body(Body::from(raw)).unwrap())
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::BAD_REQUEST);
            let bytes = body::to_bytes(res.into_body(), 1024 * 64).await.unwrap();
            let err: harbor_proto::ErrorBody = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(err.kind, harbor_proto::ErrorKind::InvalidRequest);
        }
    }
}
