//! Local directory: a pool of worker nodes and the services placed on them.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use harbor_core::health::{ping, spawn_health_check, HealthCheckHandle, Probe};
use harbor_core::metrics::{HEALTH_FAILURES, PLACEMENTS};
use harbor_core::pool::{EndpointPool, Registration};
use harbor_core::ControlError;
use harbor_proto::{
    Action, LaunchReply, LaunchRequest, LoadSample, Placement, PlacementBatch, PlacementEntry,
    RegisterDirectoryRequest, RegisterNodeReply, RegisterNodeRequest, ServiceFailureNotice,
    ServiceId, ServiceStoppedNotice, SessionClosedNotice, StartRelayRequest,
    StartServiceRequest, StartServicesRequest, UpdateLoadRequest, REPLY_OK,
};
use harbor_transport::{send_async, DeliveryClass, Outbound, Transport, TransportError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DirectorySettings {
    pub local_url: String,
    pub region: String,
    pub stale_after: Duration,
    pub send_timeout: Duration,
    pub relay_type: String,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            local_url: "http://127.0.0.1:8093".into(),
            region: String::new(),
            stale_after: Duration::from_secs(30),
            send_timeout: Duration::from_secs(3),
            relay_type: "relay".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node_id: u32,
    pub url: String,
    pub supported_types: Vec<String>,
    pub load: LoadSample,
    pub eligible: bool,
    pub placed_services: usize,
}

#[derive(Debug, Clone)]
struct PlacedService {
    service_id: ServiceId,
    service_name: String,
    service_type: String,
    node_url: String,
    service_url: Option<String>,
}

#[derive(Debug, Clone)]
struct SessionPlacements {
    lss_url: String,
    services: Vec<PlacedService>,
}

pub struct DirectoryService {
    settings: DirectorySettings,
    transport: Arc<dyn Transport>,
    nodes: Mutex<EndpointPool>,
    placements: Mutex<HashMap<String, SessionPlacements>>,
    upstream_id: RwLock<Option<u32>>,
    reported_types: Mutex<Vec<String>>,
    self_ref: Weak<DirectoryService>,
}

impl DirectoryService {
    pub fn new(settings: DirectorySettings, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            nodes: Mutex::new(EndpointPool::new(Some(settings.stale_after))),
            settings,
            transport,
            placements: Mutex::new(HashMap::new()),
            upstream_id: RwLock::new(None),
            reported_types: Mutex::new(Vec::new()),
            self_ref: weak.clone(),
        })
    }

    pub fn local_url(&self) -> &str {
        &self.settings.local_url
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
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

    // ---- nodes ---------------------------------------------------------------

    pub fn register_node(&self, req: RegisterNodeRequest) -> Result<RegisterNodeReply, ControlError> {
        let node_id = self.nodes.lock().register(Registration {
            url: req.url.clone(),
            region: self.settings.region.clone(),
            supported_types: req.supported_types,
            load: req.load,
        })?;
        info!(node_id, url = %req.url, "node registered");
        Ok(RegisterNodeReply { node_id })
    }

    pub fn update_node_load(&self, req: UpdateLoadRequest) -> Result<(), ControlError> {
        let mut nodes = self.nodes.lock();
        nodes.update_load(req.id, req.load)?;
        if let Some(types) = req.supported_types {
            nodes.set_supported_types(req.id, types)?;
        }
        Ok(())
    }

    pub fn nodes(&self) -> Vec<NodeSummary> {
        let nodes = self.nodes.lock();
        let placements = self.placements.lock();
        nodes
            .entries()
            .iter()
            .map(|node| NodeSummary {
                node_id: node.id,
                url: node.url.clone(),
                supported_types: node.supported_types.clone(),
                load: node.load,
                eligible: nodes.is_eligible(&node.url),
                placed_services: placements
                    .values()
                    .flat_map(|p| p.services.iter())
                    .filter(|s| s.node_url == node.url)
                    .count(),
            })
            .collect()
    }

    // ---- placement -----------------------------------------------------------

    pub async fn place_service(&self, req: StartServiceRequest) -> Result<Placement, ControlError> {
        let entry = PlacementEntry {
            service_id: req.service_id,
            service_name: req.service_name,
            service_type: req.service_type,
        };
        self.place(&req.session_id, &req.lss_url, entry).await
    }

    /// Place every entry in order. The first failure aborts the batch.
    pub async fn place_services(
        &self,
        req: StartServicesRequest,
    ) -> Result<PlacementBatch, ControlError> {
        let mut placements = Vec::with_capacity(req.services.len());
        for entry in req.services {
            placements.push(self.place(&req.session_id, &req.lss_url, entry).await?);
        }
        Ok(PlacementBatch { placements })
    }

    pub async fn place_relay(&self, req: StartRelayRequest) -> Result<Placement, ControlError> {
        let entry = PlacementEntry {
            service_id: req.service_id,
            service_name: self.settings.relay_type.clone(),
            service_type: self.settings.relay_type.clone(),
        };
        self.place(&req.session_id, &req.lss_url, entry).await
    }

    async fn place(
        &self,
        session_id: &str,
        lss_url: &str,
        entry: PlacementEntry,
    ) -> Result<Placement, ControlError> {
        let node_url = self
            .nodes
            .lock()
            .least_loaded(&entry.service_type)
            .map(|node| node.url.clone());
        let Some(node_url) = node_url else {
            PLACEMENTS.with_label_values(&["no_capacity"]).inc();
            return Err(ControlError::NoCapacity(format!(
                "no node supports {}",
                entry.service_type
            )));
        };

        let action = Action::LaunchService(LaunchRequest {
            session_id: session_id.to_string(),
            lss_url: lss_url.to_string(),
            service_id: entry.service_id,
            service_name: entry.service_name.clone(),
            service_type: entry.service_type.clone(),
        });
        let launched = match self
            .transport
            .send(self.outbound(&node_url, DeliveryClass::Execute, &action))
            .await
        {
            Ok(reply) => parse_launch_reply(reply),
            Err(err) => Err(ControlError::from_remote(err)),
        };
        let launched = match launched {
            Ok(launched) => launched,
            Err(err) => {
                PLACEMENTS.with_label_values(&["failed"]).inc();
                warn!(session_id, node = %node_url, service = %entry.service_name, error = %err, "launch failed");
                return Err(err);
            }
        };

        PLACEMENTS.with_label_values(&["ok"]).inc();
        info!(
            session_id,
            service_id = entry.service_id,
            service = %entry.service_name,
            node = %node_url,
            "service placed"
        );
        self.placements
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| SessionPlacements {
                lss_url: lss_url.to_string(),
                services: Vec::new(),
            })
            .services
            .push(PlacedService {
                service_id: entry.service_id,
                service_name: entry.service_name,
                service_type: entry.service_type,
                node_url: node_url.clone(),
                service_url: launched.service_url.clone(),
            });
        Ok(Placement {
            service_id: entry.service_id,
            node_url,
            service_url: launched.service_url,
            websocket_url: launched.websocket_url,
        })
    }

    pub fn placed_in(&self, session_id: &str) -> usize {
        self.placements
            .lock()
            .get(session_id)
            .map_or(0, |p| p.services.len())
    }

    // ---- teardown notices ------------------------------------------------------

    pub fn service_stopped(&self, notice: ServiceStoppedNotice) {
        let mut placements = self.placements.lock();
        let Some(session) = placements.get_mut(&notice.session_id) else {
            debug!(session_id = %notice.session_id, "stop notice for unknown session");
            return;
        };
        let matches = |s: &PlacedService| {
            s.service_name == notice.service_name
                && s.service_type == notice.service_type
                && (notice.service_url.is_empty()
                    || s.service_url.as_deref() == Some(notice.service_url.as_str()))
        };
        if let Some(pos) = session.services.iter().position(matches) {
            let removed = session.services.remove(pos);
            debug!(session_id = %notice.session_id, service = %removed.service_name, node = %removed.node_url, "placement released");
        }
        if session.services.is_empty() {
            placements.remove(&notice.session_id);
        }
    }

    /// Forget a session and tell every node that hosted part of it to stop it.
    pub fn session_closed(&self, notice: SessionClosedNotice) {
        let Some(session) = self.placements.lock().remove(&notice.session_id) else {
            return;
        };
        let nodes: BTreeSet<String> = session.services.into_iter().map(|s| s.node_url).collect();
        info!(session_id = %notice.session_id, nodes = nodes.len(), "session closed");
        let action = Action::StopSession(SessionClosedNotice {
            session_id: notice.session_id,
            lss_url: session.lss_url,
        });
        for node in nodes {
            send_async(
                &self.transport,
                self.outbound(&node, DeliveryClass::Queue, &action),
            );
        }
    }

    // ---- health ----------------------------------------------------------------

    /// Probe every node once. Failed nodes go stale and each session with services
    /// on them is reported to its session authority.
    pub async fn check_nodes(&self) -> Vec<String> {
        let urls = self.nodes.lock().urls();
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
                Ok(()) => self.nodes.lock().mark_healthy(&url),
                Err(err) => {
                    HEALTH_FAILURES.with_label_values(&["node"]).inc();
                    warn!(node = %url, error = %err, "node failed health check");
                    self.nodes.lock().mark_stale(&url);
                    failed.push(url);
                }
            }
        }
        for url in &failed {
            self.report_node_failure(url);
        }
        failed
    }

    fn report_node_failure(&self, node_url: &str) {
        let affected: Vec<(String, ServiceFailureNotice)> = self
            .placements
            .lock()
            .iter()
            .filter_map(|(session_id, p)| {
                p.services.iter().find(|s| s.node_url == node_url).map(|s| {
                    (
                        p.lss_url.clone(),
                        ServiceFailureNotice {
                            session_id: session_id.clone(),
                            service_id: Some(s.service_id),
                            service_name: Some(s.service_name.clone()),
                            service_type: Some(s.service_type.clone()),
                        },
                    )
                })
            })
            .collect();
        for (lss_url, notice) in affected {
            warn!(session_id = %notice.session_id, node = %node_url, "reporting lost service");
            send_async(
                &self.transport,
                self.outbound(&lss_url, DeliveryClass::Queue, &Action::ServiceFailure(notice)),
            );
        }
    }

    pub fn spawn_node_monitor(&self, period: Duration) -> HealthCheckHandle {
        let weak = self.self_ref.clone();
        spawn_health_check("node", period, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(directory) => {
                        directory.check_nodes().await;
                        Probe::Continue
                    }
                    None => Probe::Stop,
                }
            }
        })
    }

    // ---- upstream view -----------------------------------------------------------

    pub fn upstream_id(&self) -> Option<u32> {
        *self.upstream_id.read()
    }

    pub fn set_upstream_id(&self, id: u32) {
        *self.upstream_id.write() = Some(id);
    }

    /// What the global directory needs to route work here.
    pub fn registration(&self) -> RegisterDirectoryRequest {
        let nodes = self.nodes.lock();
        let supported_types = nodes.supported_types();
        *self.reported_types.lock() = supported_types.clone();
        RegisterDirectoryRequest {
            url: self.settings.local_url.clone(),
            region: self.settings.region.clone(),
            supported_types,
            load: nodes.aggregate_load(),
        }
    }

    /// Load report for the global directory; carries the supported types only when
    /// they changed since the last report.
    pub fn load_report(&self) -> Option<UpdateLoadRequest> {
        let id = self.upstream_id()?;
        let nodes = self.nodes.lock();
        let types = nodes.supported_types();
        let mut reported = self.reported_types.lock();
        let supported_types = (*reported != types).then(|| {
            *reported = types.clone();
            types
        });
        Some(UpdateLoadRequest {
            id,
            load: nodes.aggregate_load(),
            supported_types,
        })
    }
}

fn parse_launch_reply(reply: String) -> Result<LaunchReply, ControlError> {
    if reply == REPLY_OK {
        return Ok(LaunchReply::default());
    }
    serde_json::from_str(&reply).map_err(|_| TransportError::unexpected("launch reply", reply).into())
}

#[cfg(test)]
mod tests {
    use harbor_transport::RecordingTransport;

    use super::*;

    fn node(url: &str, types: &[&str], cpu: f64) -> RegisterNodeRequest {
        RegisterNodeRequest {
            url: url.into(),
            supported_types: types.iter().map(|t| t.to_string()).collect(),
            load: LoadSample::new(cpu, 10.0),
        }
    }

    fn start(session_id: &str, service_id: u32, service_type: &str) -> StartServiceRequest {
        StartServiceRequest {
            session_id: session_id.into(),
            lss_url: "http://lss".into(),
            service_id,
            service_name: service_type.into(),
            service_type: service_type.into(),
            region: None,
        }
    }

    fn directory(recording: &Arc<RecordingTransport>) -> Arc<DirectoryService> {
        DirectoryService::new(DirectorySettings::default(), recording.clone())
    }

    #[tokio::test]
    async fn least_loaded_node_wins_and_ties_go_to_first() {
        let recording = RecordingTransport::new();
        let directory = directory(&recording);
        directory.register_node(node("http://n1", &["A"], 50.0)).unwrap();
        directory.register_node(node("http://n2", &["A"], 20.0)).unwrap();
        directory.register_node(node("http://n3", &["A"], 20.0)).unwrap();

        let placed = directory.place_service(start("s1", 2, "A")).await.unwrap();
        assert_eq!(placed.node_url, "http://n2");
        assert_eq!(recording.actions_named("launch_service")[0].0, "http://n2");
        assert_eq!(directory.placed_in("s1"), 1);
    }

    #[tokio::test]
    async fn unsupported_type_is_no_capacity() {
        let directory = directory(&RecordingTransport::new());
        directory.register_node(node("http://n1", &["A"], 5.0)).unwrap();
        let err = directory.place_service(start("s1", 2, "B")).await.unwrap_err();
        assert!(matches!(err, ControlError::NoCapacity(_)));
    }

    #[tokio::test]
    async fn batch_fails_fast() {
        let recording = RecordingTransport::new();
        let directory = directory(&recording);
        directory.register_node(node("http://n1", &["A"], 5.0)).unwrap();
        let batch = StartServicesRequest {
            session_id: "s1".into(),
            lss_url: "http://lss".into(),
            services: ["B", "A"]
                .iter()
                .enumerate()
                .map(|(i, t)| PlacementEntry {
                    service_id: i as u32 + 2,
                    service_name: t.to_string(),
                    service_type: t.to_string(),
                })
                .collect(),
            region: None,
        };
        assert!(directory.place_services(batch).await.is_err());
        assert!(recording.actions_named("launch_service").is_empty());
    }

    #[tokio::test]
    async fn launch_replies_carry_urls() {
        let recording = RecordingTransport::new();
        recording.respond_with("http://n1", |_| {
            Ok(r#"{"service_url":"http://n1:9001","websocket_url":"ws://n1:9002"}"#.into())
        });
        let directory = directory(&recording);
        directory.register_node(node("http://n1", &["relay"], 5.0)).unwrap();
        let placed = directory
            .place_relay(StartRelayRequest {
                session_id: "s1".into(),
                lss_url: "http://lss".into(),
                service_id: 1,
                region: None,
            })
            .await
            .unwrap();
        assert_eq!(placed.service_url.as_deref(), Some("http://n1:9001"));
        assert_eq!(placed.websocket_url.as_deref(), Some("ws://n1:9002"));
    }

    #[tokio::test]
    async fn closed_sessions_stop_on_every_node() {
        let recording = RecordingTransport::new();
        let directory = directory(&recording);
        directory.register_node(node("http://n1", &["A"], 5.0)).unwrap();
        directory.register_node(node("http://n2", &["B"], 5.0)).unwrap();
        directory.place_service(start("s1", 2, "A")).await.unwrap();
        directory.place_service(start("s1", 3, "B")).await.unwrap();

        directory.service_stopped(ServiceStoppedNotice {
            session_id: "s1".into(),
            service_name: "A".into(),
            service_type: "A".into(),
            service_url: String::new(),
        });
        assert_eq!(directory.placed_in("s1"), 1);

        directory.session_closed(SessionClosedNotice {
            session_id: "s1".into(),
            lss_url: "http://lss".into(),
        });
        assert_eq!(directory.placed_in("s1"), 0);
        assert!(
            recording
                .wait_for(Duration::from_secs(1), |sent| sent
                    .iter()
                    .any(|o| o.receiver == "http://n2" && o.body.contains("stop_session")))
                .await
        );
        assert!(recording
            .sent_to("http://n1")
            .iter()
            .all(|a| !matches!(a, Action::StopSession(_))));
    }

    #[tokio::test]
    async fn failed_node_goes_stale_and_reports_sessions() {
        let recording = RecordingTransport::new();
        let directory = directory(&recording);
        directory.register_node(node("http://n1", &["A"], 5.0)).unwrap();
        directory.register_node(node("http://n2", &["A"], 50.0)).unwrap();
        directory.place_service(start("s1", 2, "A")).await.unwrap();

        recording.set_unreachable("http://n1", true);
        assert_eq!(directory.check_nodes().await, vec!["http://n1".to_string()]);
        assert!(
            recording
                .wait_for(Duration::from_secs(1), |sent| sent
                    .iter()
                    .any(|o| o.receiver == "http://lss" && o.body.contains("service_failure")))
                .await
        );
        let placed = directory.place_service(start("s2", 2, "A")).await.unwrap();
        assert_eq!(placed.node_url, "http://n2");
    }

    #[tokio::test]
    async fn load_report_sends_types_only_on_change() {
        let directory = directory(&RecordingTransport::new());
        assert!(directory.load_report().is_none());
        directory.register_node(node("http://n1", &["A"], 40.0)).unwrap();
        let registration = directory.registration();
        assert_eq!(registration.supported_types, vec!["A"]);
        directory.set_upstream_id(3);

        let report = directory.load_report().unwrap();
        assert_eq!(report.id, 3);
        assert!(report.supported_types.is_none());

        directory.register_node(node("http://n2", &["B"], 20.0)).unwrap();
        let report = directory.load_report().unwrap();
        assert_eq!(report.supported_types, Some(vec!["A".to_string(), "B".to_string()]));
        assert_eq!(report.load.cpu_percent, 30.0);
    }
}
