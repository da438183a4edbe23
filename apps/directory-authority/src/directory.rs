//! Global directory: one registration per local directory, and the relay that
//! forwards placement work to them.

use std::sync::{Arc, Weak};
use std::time::Duration;

use harbor_core::health::{ping, spawn_health_check, HealthCheckHandle, Probe};
use harbor_core::metrics::{HEALTH_FAILURES, PLACEMENTS};
use harbor_core::pool::{Endpoint, EndpointPool, Registration};
use harbor_core::ControlError;
use harbor_proto::{
    Action, LoadSample, Placement, PlacementBatch, RegisterDirectoryReply,
    RegisterDirectoryRequest, ServiceStoppedNotice, SessionClosedNotice, StartRelayRequest,
    StartServiceRequest, StartServicesRequest, UpdateLoadRequest,
};
use harbor_transport::{send_async, DeliveryClass, Outbound, Transport, TransportError};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AuthoritySettings {
    pub local_url: String,
    pub send_timeout: Duration,
    pub relay_type: String,
}

impl Default for AuthoritySettings {
    fn default() -> Self {
        Self {
            local_url: "http://127.0.0.1:8092".into(),
            send_timeout: Duration::from_secs(3),
            relay_type: "relay".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectorySummary {
    pub directory_id: u32,
    pub url: String,
    pub region: String,
    pub supported_types: Vec<String>,
    pub load: LoadSample,
    pub healthy: bool,
}

pub struct DirectoryAuthority {
    settings: AuthoritySettings,
    transport: Arc<dyn Transport>,
    directories: Mutex<EndpointPool>,
    gss_url: RwLock<Option<String>>,
    self_ref: Weak<DirectoryAuthority>,
}

impl DirectoryAuthority {
    pub fn new(settings: AuthoritySettings, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            settings,
            transport,
            directories: Mutex::new(EndpointPool::new(None)),
            gss_url: RwLock::new(None),
            self_ref: weak.clone(),
        })
    }

    pub fn local_url(&self) -> &str {
        &self.settings.local_url
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn gss_url(&self) -> Option<String> {
        self.gss_url.read().clone()
    }

    pub fn set_gss_url(&self, url: impl Into<String>) {
        *self.gss_url.write() = Some(url.into());
    }

    fn outbound(&self, receiver: &str, class: DeliveryClass, action: &Action) -> Outbound {
        Outbound::action(
            self.settings.local_url.as_str(),
            receiver,
            class,
            action,
            self.settings.send_timeout,
        )
    }

    // ---- registrations -------------------------------------------------------------

    pub fn register_directory(
        &self,
        req: RegisterDirectoryRequest,
    ) -> Result<RegisterDirectoryReply, ControlError> {
        let types = req.supported_types.len();
        let directory_id = self.directories.lock().register(Registration {
            url: req.url.clone(),
            region: req.region.clone(),
            supported_types: req.supported_types,
            load: req.load,
        })?;
        info!(directory_id, url = %req.url, region = %req.region, types, "directory registered");
        Ok(RegisterDirectoryReply { directory_id })
    }

    pub fn update_directory_load(&self, req: UpdateLoadRequest) -> Result<(), ControlError> {
        let mut directories = self.directories.lock();
        directories.update_load(req.id, req.load)?;
        if let Some(types) = req.supported_types {
            debug!(directory_id = req.id, types = types.len(), "directory types changed");
            directories.set_supported_types(req.id, types)?;
        }
        Ok(())
    }

    pub fn directories(&self) -> Vec<DirectorySummary> {
        self.directories
            .lock()
            .entries()
            .iter()
            .map(|d| DirectorySummary {
                directory_id: d.id,
                url: d.url.clone(),
                region: d.region.clone(),
                supported_types: d.supported_types.clone(),
                load: d.load,
                healthy: d.healthy,
            })
            .collect()
    }

    // ---- placement relay -------------------------------------------------------------

    pub async fn place_service(&self, req: StartServiceRequest) -> Result<Placement, ControlError> {
        let candidates = self
            .directories
            .lock()
            .ranked(&req.service_type, req.region.as_deref());
        let what = req.service_type.clone();
        self.relay(candidates, &what, Action::StartService(req)).await
    }

    /// A batch goes to a single directory that supports every requested type, so the
    /// whole session lands in one region.
    pub async fn place_services(
        &self,
        req: StartServicesRequest,
    ) -> Result<PlacementBatch, ControlError> {
        let Some(first) = req.services.first() else {
            return Ok(PlacementBatch {
                placements: Vec::new(),
            });
        };
        let candidates: Vec<Endpoint> = self
            .directories
            .lock()
            .ranked(&first.service_type, req.region.as_deref())
            .into_iter()
            .filter(|d| req.services.iter().all(|s| d.supports(&s.service_type)))
            .collect();
        let what = req
            .services
            .iter()
            .map(|s| s.service_type.as_str())
            .collect::<Vec<_>>()
            .join(",");
        self.relay(candidates, &what, Action::StartServices(req)).await
    }

    pub async fn place_relay(&self, req: StartRelayRequest) -> Result<Placement, ControlError> {
        let candidates = self
            .directories
            .lock()
            .ranked(&self.settings.relay_type, req.region.as_deref());
        let what = self.settings.relay_type.clone();
        self.relay(candidates, &what, Action::StartRelayService(req)).await
    }

    /// Offer `action` to each candidate in turn. Capacity and transport failures move
    /// on to the next one; any other error is final.
    async fn relay<T: DeserializeOwned>(
        &self,
        candidates: Vec<Endpoint>,
        what: &str,
        action: Action,
    ) -> Result<T, ControlError> {
        let mut last_err = ControlError::NoCapacity(format!("no directory supports {what}"));
        for candidate in candidates {
            let result = match self
                .transport
                .send(self.outbound(&candidate.url, DeliveryClass::Execute, &action))
                .await
            {
                Ok(reply) => serde_json::from_str::<T>(&reply).map_err(|_| {
                    ControlError::from(TransportError::unexpected("placement reply", reply))
                }),
                Err(err) => Err(ControlError::from_remote(err)),
            };
            match result {
                Ok(placed) => {
                    PLACEMENTS.with_label_values(&["relayed"]).inc();
                    info!(directory = %candidate.url, types = what, "placement relayed");
                    return Ok(placed);
                }
                Err(err @ (ControlError::NoCapacity(_) | ControlError::TransportFailure(_))) => {
                    warn!(directory = %candidate.url, types = what, error = %err, "directory could not place, trying next");
                    last_err = err;
                }
                Err(err) => {
                    PLACEMENTS.with_label_values(&["failed"]).inc();
                    return Err(err);
                }
            }
        }
        PLACEMENTS.with_label_values(&["no_capacity"]).inc();
        Err(last_err)
    }

    // ---- teardown fan-out --------------------------------------------------------------

    pub fn service_stopped(&self, notice: ServiceStoppedNotice) {
        self.fan_out(&Action::ServiceStopped(notice));
    }

    pub fn session_closed(&self, notice: SessionClosedNotice) {
        info!(session_id = %notice.session_id, "session closed");
        self.fan_out(&Action::SessionClosed(notice));
    }

    fn fan_out(&self, action: &Action) {
        for url in self.directories.lock().urls() {
            send_async(
                &self.transport,
                self.outbound(&url, DeliveryClass::Queue, action),
            );
        }
    }

    // ---- health --------------------------------------------------------------------------

    /// Probe every directory once, returning the ones that failed.
    pub async fn check_directories(&self) -> Vec<String> {
        let urls = self.directories.lock().urls();
        let mut failed = Vec::new();
        for url in urls {
            match ping(
                self.transport.as_ref(),
                &self.settings.local_url,
                &url,
                self.settings.send_timeout,
            )
            .await
            {
                Ok(()) => self.directories.lock().mark_healthy(&url),
                Err(err) => {
                    HEALTH_FAILURES.with_label_values(&["directory"]).inc();
                    warn!(directory = %url, error = %err, "directory failed health check");
                    self.directories.lock().mark_stale(&url);
                    failed.push(url);
                }
            }
        }
        failed
    }

    pub fn spawn_directory_monitor(&self, period: Duration) -> HealthCheckHandle {
        let weak = self.self_ref.clone();
        spawn_health_check("directory", period, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(authority) => {
                        authority.check_directories().await;
                        Probe::Continue
                    }
                    None => Probe::Stop,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use harbor_proto::{ErrorBody, ErrorKind, PlacementEntry};
    use harbor_transport::RecordingTransport;

    use super::*;

    fn directory(url: &str, region: &str, types: &[&str], cpu: f64) -> RegisterDirectoryRequest {
        RegisterDirectoryRequest {
            url: url.into(),
            region: region.into(),
            supported_types: types.iter().map(|t| t.to_string()).collect(),
            load: LoadSample::new(cpu, 0.0),
        }
    }

    fn start(service_type: &str, region: Option<&str>) -> StartServiceRequest {
        StartServiceRequest {
            session_id: "s1".into(),
            lss_url: "http://lss".into(),
            service_id: 2,
            service_name: service_type.into(),
            service_type: service_type.into(),
            region: region.map(str::to_string),
        }
    }

    fn placed(node: &str) -> String {
        format!(r#"{{"service_id":2,"node_url":"{node}"}}"#)
    }

    fn no_capacity() -> TransportError {
        TransportError::UnexpectedStatus {
            status: 503,
            body: serde_json::to_string(&ErrorBody {
                kind: ErrorKind::NoCapacity,
                message: "full".into(),
            })
            .unwrap(),
        }
    }

    #[test]
    fn live_duplicates_are_rejected_and_stale_ones_replaced() {
        let authority = DirectoryAuthority::new(AuthoritySettings::default(), RecordingTransport::new());
        let first = authority
            .register_directory(directory("http://lds1", "eu", &["A"], 10.0))
            .unwrap();
        assert!(authority
            .register_directory(directory("http://lds1", "eu", &["A"], 10.0))
            .is_err());

        authority.directories.lock().mark_stale("http://lds1");
        let again = authority
            .register_directory(directory("http://lds1", "eu", &["A", "B"], 10.0))
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(authority.directories()[0].supported_types, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn home_region_is_preferred_over_load() {
        let recording = RecordingTransport::new();
        recording.respond_with("http://eu", |_| Ok(placed("http://eu-node")));
        recording.respond_with("http://us", |_| Ok(placed("http://us-node")));
        let authority = DirectoryAuthority::new(AuthoritySettings::default(), recording.clone());
        authority.register_directory(directory("http://us", "us", &["A"], 5.0)).unwrap();
        authority.register_directory(directory("http://eu", "eu", &["A"], 70.0)).unwrap();

        let placement = authority.place_service(start("A", Some("eu"))).await.unwrap();
        assert_eq!(placement.node_url, "http://eu-node");

        let placement = authority.place_service(start("A", None)).await.unwrap();
        assert_eq!(placement.node_url, "http://us-node");
    }

    #[tokio::test]
    async fn full_or_unreachable_directories_fall_through() {
        let recording = RecordingTransport::new();
        recording.respond_with("http://lds1", |_| Err(no_capacity()));
        recording.set_unreachable("http://lds2", true);
        recording.respond_with("http://lds3", |_| Ok(placed("http://n3")));
        let authority = DirectoryAuthority::new(AuthoritySettings::default(), recording.clone());
        for (url, cpu) in [("http://lds1", 1.0), ("http://lds2", 2.0), ("http://lds3", 3.0)] {
            authority.register_directory(directory(url, "", &["A"], cpu)).unwrap();
        }

        let placement = authority.place_service(start("A", None)).await.unwrap();
        assert_eq!(placement.node_url, "http://n3");
        let tried: Vec<String> = recording
            .actions_named("start_service")
            .into_iter()
            .map(|(receiver, _)| receiver)
            .collect();
        assert_eq!(tried, vec!["http://lds1", "http://lds2", "http://lds3"]);
    }

    #[tokio::test]
    async fn last_error_is_returned_when_every_directory_fails() {
        let recording = RecordingTransport::new();
        recording.respond_with("http://lds1", |_| Err(no_capacity()));
        let authority = DirectoryAuthority::new(AuthoritySettings::default(), recording.clone());
        let err = authority.place_service(start("A", None)).await.unwrap_err();
        assert!(matches!(err, ControlError::NoCapacity(ref m) if m.contains("no directory")));

        authority.register_directory(directory("http://lds1", "", &["A"], 1.0)).unwrap();
        let err = authority.place_service(start("A", None)).await.unwrap_err();
        assert!(matches!(err, ControlError::NoCapacity(ref m) if m == "full"));
    }

    #[tokio::test]
    async fn batches_go_to_a_directory_supporting_every_type() {
        let recording = RecordingTransport::new();
        recording.respond_with("http://both", |_| {
            Ok(r#"{"placements":[{"service_id":2,"node_url":"http://a"},{"service_id":3,"node_url":"http://b"}]}"#.into())
        });
        let authority = DirectoryAuthority::new(AuthoritySettings::default(), recording.clone());
        authority.register_directory(directory("http://only-a", "", &["A"], 1.0)).unwrap();
        authority.register_directory(directory("http://both", "", &["A", "B"], 50.0)).unwrap();

        let batch = authority
            .place_services(StartServicesRequest {
                session_id: "s1".into(),
                lss_url: "http://lss".into(),
                services: vec![
                    PlacementEntry {
                        service_id: 2,
                        service_name: "A".into(),
                        service_type: "A".into(),
                    },
                    PlacementEntry {
                        service_id: 3,
                        service_name: "B".into(),
                        service_type: "B".into(),
                    },
                ],
                region: None,
            })
            .await
            .unwrap();
        assert_eq!(batch.placements.len(), 2);
        assert!(recording.sent_to("http://only-a").is_empty());
    }

    #[tokio::test]
    async fn unhealthy_directories_are_skipped_until_they_report() {
        let recording = RecordingTransport::new();
        recording.respond_with("http://lds1", |_| Ok(placed("http://n1")));
        let authority = DirectoryAuthority::new(AuthoritySettings::default(), recording.clone());
        let reply = authority
            .register_directory(directory("http://lds1", "", &["A"], 1.0))
            .unwrap();

        recording.set_unreachable("http://lds1", true);
        assert_eq!(authority.check_directories().await, vec!["http://lds1".to_string()]);
        assert!(authority.place_service(start("A", None)).await.is_err());

        recording.set_unreachable("http://lds1", false);
        authority
            .update_directory_load(UpdateLoadRequest {
                id: reply.directory_id,
                load: LoadSample::new(2.0, 0.0),
                supported_types: None,
            })
            .unwrap();
        assert!(authority.place_service(start("A", None)).await.is_ok());
    }

    #[tokio::test]
    async fn session_teardown_reaches_every_directory() {
        let recording = RecordingTransport::new();
        let authority = DirectoryAuthority::new(AuthoritySettings::default(), recording.clone());
        authority.register_directory(directory("http://lds1", "", &["A"], 1.0)).unwrap();
        authority.register_directory(directory("http://lds2", "", &["B"], 1.0)).unwrap();

        authority.session_closed(SessionClosedNotice {
            session_id: "s1".into(),
            lss_url: "http://lss".into(),
        });
        assert!(
            recording
                .wait_for(Duration::from_secs(1), |sent| sent
                    .iter()
                    .filter(|o| o.body.contains("session_closed"))
                    .count()
                    == 2)
                .await
        );
    }
}
