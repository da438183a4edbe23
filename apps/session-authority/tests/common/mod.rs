#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use harbor_core::mandatory::MandatoryServiceSet;
use harbor_proto::{
    Action, ConfirmServiceRequest, CreateSessionRequest, Placement, PlacementBatch, ServiceSpec,
};
use harbor_session_authority::authority::{AuthoritySettings, SessionAuthority};
use harbor_transport::RecordingTransport;

pub const DIRECTORY: &str = "http://directory";
pub const LSS: &str = "http://lss";

pub fn pair_catalog() -> MandatoryServiceSet {
    let catalog = MandatoryServiceSet::new();
    catalog.add("pair", ServiceSpec::new("A", "typeA"));
    catalog.add("pair", ServiceSpec::new("B", "typeB"));
    catalog
}

/// Directory that places every requested service at `http://svc-<session>-<id>`.
pub fn placing_directory(recording: &RecordingTransport) {
    recording.respond_with(DIRECTORY, |outbound| {
        let batch = match outbound.parsed() {
            Some(Action::StartServices(req)) => PlacementBatch {
                placements: req
                    .services
                    .iter()
                    .map(|entry| Placement {
                        service_id: entry.service_id,
                        node_url: "http://node".into(),
                        service_url: Some(format!(
                            "http://svc-{}-{}",
                            req.session_id, entry.service_id
                        )),
                        websocket_url: None,
                    })
                    .collect(),
            },
            _ => return Ok("OK".into()),
        };
        Ok(serde_json::to_string(&batch).unwrap())
    });
}

pub fn authority_with(
    recording: &Arc<RecordingTransport>,
    health_interval: Duration,
) -> Arc<SessionAuthority> {
    let settings = AuthoritySettings {
        local_url: LSS.into(),
        directory_url: Some(DIRECTORY.into()),
        session_health_interval: health_interval,
        send_timeout: Duration::from_millis(200),
        ..AuthoritySettings::default()
    };
    SessionAuthority::with_catalog(settings, recording.clone(), pair_catalog())
}

pub fn create_request(session_id: &str) -> CreateSessionRequest {
    CreateSessionRequest {
        session_id: session_id.into(),
        user_name: "ada".into(),
        project_name: format!("project-{session_id}"),
        collection_name: "c1".into(),
        session_type: "pair".into(),
        credentials: serde_json::json!({ "token": "t" }),
        service_name: "ui".into(),
        service_type: "UI".into(),
        service_url: format!("http://ui-{session_id}"),
        start_relay: false,
    }
}

pub fn confirm(session_id: &str, service_id: u32, url: &str) -> ConfirmServiceRequest {
    ConfirmServiceRequest {
        session_id: session_id.into(),
        service_id,
        service_url: Some(url.into()),
    }
}

pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
