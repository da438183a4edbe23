//! Session lifecycle for one local session authority.
//!
//! Lock order is always registry first, then a single session. A session lock is
//! never held across a network call: every send works on a snapshot taken under the
//! lock and released before the first await.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use harbor_core::broadcast::{
    broadcast_recipients, notice_recipients, Broadcaster, Delivery, Recipient,
};
use harbor_core::health::{ping, spawn_health_check, Probe};
use harbor_core::mandatory::{DebugServiceList, MandatoryServiceSet};
use harbor_core::metrics::{HEALTH_FAILURES, PLACEMENTS, SESSIONS};
use harbor_core::session::{Session, SessionState, SlotState};
use harbor_core::startup::{MembershipSource, StartupDispatchQueue, StartupRequest};
use harbor_core::ControlError;
use harbor_proto::{
    Action, ConfirmServiceReply, ConfirmServiceRequest, ConfirmSessionRequest,
    CreateSessionReply, CreateSessionRequest, MemberInfo, OpenSession, Placement, PlacementBatch,
    PlacementEntry, ProjectOpenReply, RegisterServiceReply, RegisterServiceRequest, RunNotice,
    ServiceFailureNotice, ServiceId, ServiceSpec, ServiceStoppedNotice, SessionClosedNotice,
    SessionNotice, SessionSummary, StartRelayRequest, StartServicesRequest, REPLY_OK,
};
use harbor_transport::{
    send_async, send_expect, DeliveryClass, Outbound, Transport, TransportError,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

type SharedSession = Arc<Mutex<Session>>;

#[derive(Debug, Clone)]
pub struct AuthoritySettings {
    pub local_url: String,
    pub region: Option<String>,
    pub directory_url: Option<String>,
    pub session_health_interval: Duration,
    pub send_timeout: Duration,
    pub ui_service_types: Vec<String>,
    pub tab_order: Vec<String>,
}

impl Default for AuthoritySettings {
    fn default() -> Self {
        Self {
            local_url: "http://127.0.0.1:8091".into(),
            region: None,
            directory_url: None,
            session_health_interval: Duration::from_secs(10),
            send_timeout: Duration::from_secs(3),
            ui_service_types: vec!["UI".into()],
            tab_order: default_tab_order(),
        }
    }
}

pub fn default_tab_order() -> Vec<String> {
    [
        "File",
        "View",
        "Model",
        "Modeling",
        "Mesh",
        "FIT-TD",
        "PHREEC",
        "GetDP",
        "ElmerFEM",
        "Post Processing",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Registration with the global session registrar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrarBinding {
    pub url: String,
    pub lss_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInformation {
    pub url: String,
    pub lss_id: Option<u32>,
    pub directory_url: Option<String>,
    pub debug_services: Vec<String>,
    pub sessions: Vec<SessionSummary>,
}

pub struct SessionAuthority {
    settings: AuthoritySettings,
    transport: Arc<dyn Transport>,
    sessions: Mutex<HashMap<String, SharedSession>>,
    mandatory: MandatoryServiceSet,
    debug: DebugServiceList,
    directory_url: RwLock<Option<String>>,
    registrar: RwLock<Option<RegistrarBinding>>,
    startup: StartupDispatchQueue,
    broadcaster: Broadcaster,
    self_ref: Weak<SessionAuthority>,
}

impl SessionAuthority {
    /// Build the authority and start its startup-queue consumer. Must be called
    /// inside a tokio runtime.
    pub fn new(settings: AuthoritySettings, transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::with_catalog(settings, transport, MandatoryServiceSet::with_defaults())
    }

    pub fn with_catalog(
        settings: AuthoritySettings,
        transport: Arc<dyn Transport>,
        mandatory: MandatoryServiceSet,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<SessionAuthority>| {
            let source: Weak<dyn MembershipSource> = weak.clone();
            let (startup, _consumer) = StartupDispatchQueue::spawn(
                source,
                Arc::clone(&transport),
                settings.local_url.clone(),
                settings.send_timeout,
            );
            let broadcaster = Broadcaster::new(
                Arc::clone(&transport),
                settings.local_url.clone(),
                settings.send_timeout,
            );
            Self {
                directory_url: RwLock::new(settings.directory_url.clone()),
                settings,
                transport,
                sessions: Mutex::new(HashMap::new()),
                mandatory,
                debug: DebugServiceList::new(),
                registrar: RwLock::new(None),
                startup,
                broadcaster,
                self_ref: weak.clone(),
            }
        })
    }

    pub fn local_url(&self) -> &str {
        &self.settings.local_url
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn directory_url(&self) -> Option<String> {
        self.directory_url.read().clone()
    }

    pub fn set_directory_url(&self, url: String) {
        info!(directory = %url, "directory url updated");
        *self.directory_url.write() = Some(url);
    }

    pub fn registrar(&self) -> Option<RegistrarBinding> {
        self.registrar.read().clone()
    }

    pub fn set_registrar(&self, binding: RegistrarBinding) {
        *self.registrar.write() = Some(binding);
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

    fn session(&self, session_id: &str) -> Result<SharedSession, ControlError> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ControlError::SessionNotFound(session_id.to_string()))
    }

    fn all_sessions(&self) -> Vec<SharedSession> {
        self.sessions.lock().values().cloned().collect()
    }

    fn tab_order_for(&self, service_type: &str) -> Option<Vec<String>> {
        self.settings
            .ui_service_types
            .iter()
            .any(|t| t == service_type)
            .then(|| self.settings.tab_order.clone())
    }

    // ---- session creation ----------------------------------------------------

    pub async fn create_session(
        &self,
        req: CreateSessionRequest,
    ) -> Result<CreateSessionReply, ControlError> {
        if req.session_id.is_empty() {
            return Err(ControlError::InvalidRequest("session id is empty".into()));
        }
        let shared = {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(&req.session_id) {
                return Err(ControlError::DuplicateSession(req.session_id));
            }
            let shared = Arc::new(Mutex::new(Session::from_request(&req)));
            sessions.insert(req.session_id.clone(), Arc::clone(&shared));
            shared
        };
        SESSIONS.with_label_values(&["created"]).inc();

        if let Some(registrar) = self.registrar() {
            if let Err(err) = self.confirm_with_registrar(&registrar, &req).await {
                warn!(session_id = %req.session_id, error = %err, "registrar refused session");
                self.sessions.lock().remove(&req.session_id);
                return Err(ControlError::RegistrationFailed(err.to_string()));
            }
        }

        let caller_id = {
            let mut session = shared.lock();
            let caller = session.add_slot(req.service_name.as_str(), req.service_type.as_str())?;
            caller.url = req.service_url.clone();
            caller.id
        };

        let mut websocket_url = None;
        if req.start_relay {
            match self.start_relay(&req.session_id, caller_id).await {
                Ok(placement) => {
                    websocket_url = placement.websocket_url.clone();
                    if let Some(slot) = shared.lock().slot_mut(caller_id) {
                        slot.websocket_url = placement.websocket_url;
                    }
                }
                Err(err) => {
                    warn!(session_id = %req.session_id, error = %err, "relay start failed");
                    self.finalize(&req.session_id).await;
                    return Err(err);
                }
            }
        }

        let entries = {
            let mut session = shared.lock();
            let mut entries = Vec::new();
            for spec in self.mandatory.get(&req.session_type) {
                let debug_hosted = self.debug.is_debug(&spec.name);
                let slot = session.add_slot(spec.name.as_str(), spec.service_type.as_str())?;
                slot.mandatory = true;
                slot.debug_hosted = debug_hosted;
                if !debug_hosted {
                    entries.push(PlacementEntry {
                        service_id: slot.id,
                        service_name: spec.name,
                        service_type: spec.service_type,
                    });
                }
            }
            session.advance_state(SessionState::Initializing);
            entries
        };
        self.start_health_loop(&req.session_id, &shared);

        info!(
            session_id = %req.session_id,
            user = %req.user_name,
            session_type = %req.session_type,
            caller = caller_id,
            placements = entries.len(),
            "session created"
        );

        if !entries.is_empty() {
            if let Some(this) = self.self_ref.upgrade() {
                let session_id = req.session_id.clone();
                tokio::spawn(async move {
                    this.place_mandatory(&session_id, entries).await;
                });
            }
        }

        Ok(CreateSessionReply {
            service_id: caller_id,
            websocket_url,
            tab_order: self.tab_order_for(&req.service_type),
        })
    }

    async fn confirm_with_registrar(
        &self,
        registrar: &RegistrarBinding,
        req: &CreateSessionRequest,
    ) -> Result<(), ControlError> {
        let action = Action::ConfirmSession(ConfirmSessionRequest {
            session_id: req.session_id.clone(),
            user_name: req.user_name.clone(),
            lss_id: registrar.lss_id,
        });
        send_expect(
            self.transport.as_ref(),
            self.outbound(&registrar.url, DeliveryClass::Execute, &action),
            REPLY_OK,
        )
        .await
        .map_err(ControlError::from_remote)
    }

    async fn start_relay(
        &self,
        session_id: &str,
        service_id: ServiceId,
    ) -> Result<Placement, ControlError> {
        let directory = self
            .directory_url()
            .ok_or_else(|| ControlError::NoCapacity("no directory service configured".into()))?;
        let action = Action::StartRelayService(StartRelayRequest {
            session_id: session_id.to_string(),
            lss_url: self.settings.local_url.clone(),
            service_id,
            region: self.settings.region.clone(),
        });
        let reply = self
            .transport
            .send(self.outbound(&directory, DeliveryClass::Execute, &action))
            .await
            .map_err(ControlError::from_remote)?;
        serde_json::from_str(&reply)
            .map_err(|_| TransportError::unexpected("relay placement", reply).into())
    }

    async fn place_mandatory(&self, session_id: &str, entries: Vec<PlacementEntry>) {
        let count = entries.len();
        match self.request_placements(session_id, entries).await {
            Ok(batch) => {
                PLACEMENTS.with_label_values(&["ok"]).inc_by(count as u64);
                if let Ok(shared) = self.session(session_id) {
                    let mut session = shared.lock();
                    for placement in batch.placements {
                        if let Some(slot) = session.slot_mut(placement.service_id) {
                            if slot.url.is_empty() {
                                slot.url = placement.service_url.unwrap_or_default();
                            }
                            if placement.websocket_url.is_some() {
                                slot.websocket_url = placement.websocket_url;
                            }
                        }
                    }
                }
                debug!(session_id, services = count, "mandatory services placed");
            }
            Err(err) => {
                PLACEMENTS.with_label_values(&["failed"]).inc();
                warn!(session_id, error = %err, "mandatory placement failed");
                if let Err(err) = self.emergency_shutdown(session_id).await {
                    debug!(session_id, error = %err, "session already gone after placement failure");
                }
            }
        }
    }

    async fn request_placements(
        &self,
        session_id: &str,
        services: Vec<PlacementEntry>,
    ) -> Result<PlacementBatch, ControlError> {
        let directory = self
            .directory_url()
            .ok_or_else(|| ControlError::NoCapacity("no directory service configured".into()))?;
        let action = Action::StartServices(StartServicesRequest {
            session_id: session_id.to_string(),
            lss_url: self.settings.local_url.clone(),
            services,
            region: self.settings.region.clone(),
        });
        let reply = self
            .transport
            .send(self.outbound(&directory, DeliveryClass::Execute, &action))
            .await
            .map_err(ControlError::from_remote)?;
        if reply == REPLY_OK {
            return Ok(PlacementBatch {
                placements: Vec::new(),
            });
        }
        serde_json::from_str(&reply)
            .map_err(|_| TransportError::unexpected("placement batch", reply).into())
    }

    fn start_health_loop(&self, session_id: &str, shared: &SharedSession) {
        let weak = self.self_ref.clone();
        let id = session_id.to_string();
        let handle = spawn_health_check(
            "session",
            self.settings.session_health_interval,
            move || {
                let weak = weak.clone();
                let id = id.clone();
                async move {
                    match weak.upgrade() {
                        Some(authority) => authority.probe_session(&id).await,
                        None => Probe::Stop,
                    }
                }
            },
        );
        shared.lock().set_health(handle);
    }

    /// One health round. The first failed slot hands the session to emergency
    /// shutdown on a separate task and ends the loop.
    async fn probe_session(&self, session_id: &str) -> Probe {
        let targets = match self.session(session_id) {
            Ok(shared) => {
                let session = shared.lock();
                if session.state().is_closing() {
                    return Probe::Stop;
                }
                session.reachable_alive(None)
            }
            Err(_) => return Probe::Stop,
        };
        for (service_id, url) in targets {
            if let Err(err) = ping(
                self.transport.as_ref(),
                &self.settings.local_url,
                &url,
                self.settings.send_timeout,
            )
            .await
            {
                HEALTH_FAILURES.with_label_values(&["session"]).inc();
                warn!(session_id, service_id, url = %url, error = %err, "service failed health check");
                if let Some(this) = self.self_ref.upgrade() {
                    let session_id = session_id.to_string();
                    tokio::spawn(async move {
                        let notice = ServiceFailureNotice {
                            session_id,
                            service_id: Some(service_id),
                            service_name: None,
                            service_type: None,
                        };
                        if let Err(err) = this.service_failed(notice).await {
                            debug!(error = %err, "failure escalation skipped");
                        }
                    });
                }
                return Probe::Stop;
            }
        }
        Probe::Continue
    }

    // ---- membership ----------------------------------------------------------

    pub async fn register_service(
        &self,
        req: RegisterServiceRequest,
    ) -> Result<RegisterServiceReply, ControlError> {
        let shared = self.session(&req.session_id)?;
        let service_id = {
            let mut session = shared.lock();
            let slot = session.add_slot(req.service_name.as_str(), req.service_type.as_str())?;
            slot.url = req.service_url.clone().unwrap_or_default();
            slot.id
        };

        let mut websocket_url = None;
        if req.start_relay {
            let placement = match self.start_relay(&req.session_id, service_id).await {
                Ok(placement) => placement,
                Err(err) => {
                    shared.lock().remove_slot(service_id);
                    return Err(err);
                }
            };
            websocket_url = placement.websocket_url.clone();
            if let Some(slot) = shared.lock().slot_mut(service_id) {
                slot.websocket_url = placement.websocket_url;
            }
        }

        info!(
            session_id = %req.session_id,
            service_id,
            service = %req.service_name,
            "service registered"
        );
        Ok(RegisterServiceReply {
            service_id,
            websocket_url,
            tab_order: self.tab_order_for(&req.service_type),
        })
    }

    pub async fn confirm_service(
        &self,
        req: ConfirmServiceRequest,
    ) -> Result<ConfirmServiceReply, ControlError> {
        let shared = self.session(&req.session_id)?;
        let mut connected: Option<(Vec<Recipient>, MemberInfo)> = None;
        let reply = {
            let mut session = shared.lock();
            if session.state().is_closing() {
                return Err(ControlError::SessionShuttingDown(req.session_id));
            }
            let slot = session.require_slot_mut(req.service_id)?;
            let newly_alive = match slot.state() {
                SlotState::Requested => {
                    if let Some(url) = req.service_url.clone() {
                        slot.url = url;
                    }
                    slot.advance(SlotState::Alive)
                        .map_err(|err| ControlError::InvalidRequest(err.to_string()))?;
                    true
                }
                SlotState::Alive => {
                    debug!(
                        session_id = %req.session_id,
                        service_id = req.service_id,
                        "duplicate confirmation ignored"
                    );
                    false
                }
                state => {
                    return Err(ControlError::InvalidRequest(format!(
                        "service {} is {}",
                        req.service_id,
                        state.as_str()
                    )))
                }
            };
            let service_type = slot.service_type.clone();

            if newly_alive {
                match session.state() {
                    SessionState::Initializing => {
                        self.activate_if_ready(&mut session);
                    }
                    SessionState::Active => {
                        let credentials = session.credentials.clone();
                        if let Some(slot) = session.slot_mut(req.service_id) {
                            if !slot.run_dispatched {
                                slot.run_dispatched = true;
                                self.dispatch_run(startup_request(
                                    &req.session_id,
                                    slot,
                                    &credentials,
                                ));
                            }
                        }
                        if let Some(slot) = session.slot(req.service_id) {
                            if slot.visible {
                                connected = Some((
                                    broadcast_recipients(&session, Some(req.service_id)),
                                    slot.member_info(),
                                ));
                            }
                        }
                    }
                    _ => {}
                }
            }

            ConfirmServiceReply {
                members: (session.state() == SessionState::Active).then(|| session.members()),
                tab_order: self.tab_order_for(&service_type),
            }
        };

        if let Some((recipients, subject)) = connected {
            let action = Action::ServiceConnected(
                SessionNotice::new(req.session_id.as_str()).with_subject(subject),
            );
            self.broadcaster
                .deliver(&recipients, DeliveryClass::Queue, &action, Delivery::Asynchronous)
                .await;
        }
        Ok(reply)
    }

    /// Move an initializing session to Active once no mandatory slot is pending and
    /// queue a run for every alive slot. Runs are queued with the session lock held,
    /// so the queue sees them in activation order.
    fn activate_if_ready(&self, session: &mut Session) -> bool {
        if session.state() != SessionState::Initializing || session.pending_mandatory() > 0 {
            return false;
        }
        session.advance_state(SessionState::Active);
        SESSIONS.with_label_values(&["activated"]).inc();
        info!(session_id = %session.id, "session active");
        let session_id = session.id.clone();
        let credentials = session.credentials.clone();
        for slot in session.slots_mut() {
            if slot.is_alive() && !slot.run_dispatched {
                slot.run_dispatched = true;
                self.dispatch_run(startup_request(&session_id, slot, &credentials));
            }
        }
        true
    }

    fn dispatch_run(&self, run: StartupRequest) {
        let session_id = run.session_id.clone();
        if !self.startup.enqueue(run) {
            warn!(session_id = %session_id, "startup queue closed");
        }
    }

    pub async fn service_closing(
        &self,
        session_id: &str,
        service_id: ServiceId,
    ) -> Result<(), ControlError> {
        let shared = self.session(session_id)?;
        let (removed, recipients, empty) = {
            let mut session = shared.lock();
            let removed = session
                .remove_slot(service_id)
                .ok_or_else(|| ControlError::service_not_found(session_id, service_id))?;
            let closing = session.state().is_closing();
            let recipients = if closing || !removed.is_alive() {
                Vec::new()
            } else {
                broadcast_recipients(&session, None)
            };
            let empty = session.is_empty();
            // A pending mandatory slot going away may be the last thing holding
            // activation back.
            if !empty && removed.mandatory {
                self.activate_if_ready(&mut session);
            }
            (removed, recipients, empty)
        };
        info!(session_id, service_id, service = %removed.name, "service closing");

        if !recipients.is_empty() {
            let action = Action::ServiceDisconnected(
                SessionNotice::new(session_id).with_subject(removed.member_info()),
            );
            self.broadcaster
                .deliver(&recipients, DeliveryClass::Queue, &action, Delivery::Asynchronous)
                .await;
        }
        if !removed.debug_hosted && !removed.url.is_empty() {
            self.notify_directory(Action::ServiceStopped(ServiceStoppedNotice {
                session_id: session_id.to_string(),
                service_name: removed.name.clone(),
                service_type: removed.service_type.clone(),
                service_url: removed.url.clone(),
            }));
        }
        if empty {
            self.finalize(session_id).await;
        }
        Ok(())
    }

    /// Any reported service failure takes the whole session down.
    pub async fn service_failed(&self, notice: ServiceFailureNotice) -> Result<(), ControlError> {
        let shared = self.session(&notice.session_id)?;
        let service_id = {
            let session = shared.lock();
            notice.service_id.or_else(|| match (&notice.service_name, &notice.service_type) {
                (Some(name), Some(service_type)) => session.find_slot(name, service_type),
                _ => None,
            })
        };
        warn!(
            session_id = %notice.session_id,
            service_id = ?service_id,
            service = ?notice.service_name,
            "service failure, shutting session down"
        );
        self.emergency_shutdown(&notice.session_id).await
    }

    pub async fn service_shutdown_completed(
        &self,
        session_id: &str,
        service_id: ServiceId,
    ) -> Result<(), ControlError> {
        let shared = self.session(session_id)?;
        let (closing, empty) = {
            let mut session = shared.lock();
            let slot = session.require_slot_mut(service_id)?;
            if slot.state() == SlotState::ShuttingDown {
                let _ = slot.advance(SlotState::Disconnected);
            }
            session.remove_slot(service_id);
            (session.state().is_closing(), session.is_empty())
        };
        debug!(session_id, service_id, "service shutdown completed");
        if closing && empty {
            self.finalize(session_id).await;
        }
        Ok(())
    }

    // ---- shutdown ------------------------------------------------------------

    pub async fn shutdown_session(
        &self,
        session_id: &str,
        initiator: ServiceId,
        emergency: bool,
    ) -> Result<(), ControlError> {
        if emergency {
            self.emergency_shutdown(session_id).await
        } else {
            self.graceful_shutdown(session_id, initiator).await
        }
    }

    pub async fn graceful_shutdown(
        &self,
        session_id: &str,
        initiator: ServiceId,
    ) -> Result<(), ControlError> {
        let shared = self.session(session_id)?;
        let (health, recipients, sender) = {
            let mut session = shared.lock();
            let sender = session
                .slot(initiator)
                .map(|s| s.member_info())
                .ok_or_else(|| ControlError::service_not_found(session_id, initiator))?;
            if !session.advance_state(SessionState::ShuttingDown) {
                debug!(session_id, "session already shutting down");
                return Ok(());
            }
            (
                session.take_health(),
                notice_recipients(&session, Some(initiator)),
                sender,
            )
        };
        if let Some(health) = health {
            health.stop().await;
        }
        info!(session_id, initiator, recipients = recipients.len(), "graceful shutdown");
        self.notify_registrar(Action::SessionClosing(harbor_proto::SessionRef {
            session_id: session_id.to_string(),
        }));

        let notice = SessionNotice::new(session_id).with_sender(Some(sender));
        self.broadcaster
            .deliver(
                &recipients,
                DeliveryClass::Execute,
                &Action::PreShutdown(notice.clone()),
                Delivery::Synchronous,
            )
            .await;
        self.broadcaster
            .deliver(
                &recipients,
                DeliveryClass::Execute,
                &Action::Shutdown(notice.closing()),
                Delivery::Synchronous,
            )
            .await;

        let empty = {
            let mut session = shared.lock();
            session.remove_slot(initiator);
            let requested: Vec<ServiceId> = session
                .slots()
                .filter(|s| s.state() == SlotState::Requested)
                .map(|s| s.id)
                .collect();
            for id in requested {
                session.remove_slot(id);
            }
            for slot in session.slots_mut() {
                if slot.is_alive() {
                    let _ = slot.advance(SlotState::ShuttingDown);
                }
            }
            session.is_empty()
        };
        if empty {
            self.finalize(session_id).await;
        }
        Ok(())
    }

    pub async fn emergency_shutdown(&self, session_id: &str) -> Result<(), ControlError> {
        let shared = self.session(session_id)?;
        let (health, recipients) = {
            let mut session = shared.lock();
            let first_teardown = session.advance_state(SessionState::ShuttingDown);
            if !session.begin_emergency() {
                debug!(session_id, "emergency shutdown already running");
                return Ok(());
            }
            // After a graceful shutdown the services were already told to stop.
            let recipients: Vec<Recipient> = if first_teardown {
                session
                    .slots()
                    .filter(|s| !s.url.is_empty() && s.state() != SlotState::Disconnected)
                    .map(|s| Recipient {
                        service_id: s.id,
                        url: s.url.clone(),
                    })
                    .collect()
            } else {
                Vec::new()
            };
            for slot in session.slots_mut() {
                if slot.is_alive() {
                    let _ = slot.advance(SlotState::ShuttingDown);
                }
            }
            (session.take_health(), recipients)
        };
        if let Some(health) = health {
            health.stop().await;
        }
        SESSIONS.with_label_values(&["emergency"]).inc();
        warn!(session_id, recipients = recipients.len(), "emergency shutdown");

        let notice = SessionNotice::new(session_id).closing();
        self.broadcaster
            .deliver(
                &recipients,
                DeliveryClass::Execute,
                &Action::EmergencyShutdown(notice),
                Delivery::Asynchronous,
            )
            .await;
        self.finalize(session_id).await;
        Ok(())
    }

    /// Drop the session and tell both upstream tiers it is gone.
    async fn finalize(&self, session_id: &str) {
        let Some(shared) = self.sessions.lock().remove(session_id) else {
            return;
        };
        let health = {
            let mut session = shared.lock();
            session.advance_state(SessionState::Closed);
            session.take_health()
        };
        if let Some(health) = health {
            health.stop().await;
        }
        SESSIONS.with_label_values(&["closed"]).inc();
        info!(session_id, "session closed");

        let closed = SessionClosedNotice {
            session_id: session_id.to_string(),
            lss_url: self.settings.local_url.clone(),
        };
        self.notify_registrar(Action::ShutdownSessionCompleted(closed.clone()));
        self.notify_directory(Action::SessionClosed(closed));
    }

    /// Stop every session health loop. Used on process exit.
    pub async fn stop_health_loops(&self) {
        let handles: Vec<_> = self
            .all_sessions()
            .into_iter()
            .filter_map(|shared| shared.lock().take_health())
            .collect();
        for handle in handles {
            handle.stop().await;
        }
    }

    fn notify_registrar(&self, action: Action) {
        if let Some(registrar) = self.registrar() {
            send_async(
                &self.transport,
                self.outbound(&registrar.url, DeliveryClass::Queue, &action),
            );
        }
    }

    fn notify_directory(&self, action: Action) {
        if let Some(directory) = self.directory_url() {
            send_async(
                &self.transport,
                self.outbound(&directory, DeliveryClass::Queue, &action),
            );
        }
    }

    // ---- broadcast and visibility ---------------------------------------------

    pub async fn broadcast(
        &self,
        session_id: &str,
        sender: ServiceId,
        message: &str,
        mode: Delivery,
    ) -> Result<usize, ControlError> {
        let shared = self.session(session_id)?;
        let (recipients, sender_info) = {
            let session = shared.lock();
            let sender_info = session
                .slot(sender)
                .map(|s| s.member_info())
                .ok_or_else(|| ControlError::service_not_found(session_id, sender))?;
            (broadcast_recipients(&session, Some(sender)), sender_info)
        };
        let action = Action::Broadcast(
            SessionNotice::new(session_id)
                .with_sender(Some(sender_info))
                .with_message(message),
        );
        Ok(self
            .broadcaster
            .deliver(&recipients, DeliveryClass::Queue, &action, mode)
            .await)
    }

    pub async fn set_visibility(
        &self,
        session_id: &str,
        service_id: ServiceId,
        visible: bool,
    ) -> Result<(), ControlError> {
        let shared = self.session(session_id)?;
        let announce = {
            let mut session = shared.lock();
            let slot = session.require_slot_mut(service_id)?;
            let reappeared = visible && !slot.visible && slot.is_alive();
            slot.visible = visible;
            let subject = slot.member_info();
            reappeared.then(|| (broadcast_recipients(&session, Some(service_id)), subject))
        };
        if let Some((recipients, subject)) = announce {
            let action =
                Action::ServiceConnected(SessionNotice::new(session_id).with_subject(subject));
            self.broadcaster
                .deliver(&recipients, DeliveryClass::Queue, &action, Delivery::Asynchronous)
                .await;
        }
        Ok(())
    }

    // ---- queries -------------------------------------------------------------

    pub fn session_exists(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    pub fn session_state(&self, session_id: &str) -> Result<SessionState, ControlError> {
        Ok(self.session(session_id)?.lock().state())
    }

    pub fn get_session(&self, session_id: &str) -> Result<SessionSummary, ControlError> {
        Ok(self.session(session_id)?.lock().summary())
    }

    pub fn services_in_session(&self, session_id: &str) -> Result<Vec<MemberInfo>, ControlError> {
        Ok(self.session(session_id)?.lock().members())
    }

    pub fn startup_completed(&self, session_id: &str) -> Result<bool, ControlError> {
        Ok(self.session(session_id)?.lock().pending_mandatory() == 0)
    }

    pub fn has_health_loop(&self, session_id: &str) -> Result<bool, ControlError> {
        Ok(self.session(session_id)?.lock().has_health_loop())
    }

    pub fn project_open(&self, project_name: &str) -> ProjectOpenReply {
        let user_name = self.all_sessions().into_iter().find_map(|shared| {
            let session = shared.lock();
            (session.project_name == project_name).then(|| session.user_name.clone())
        });
        ProjectOpenReply {
            open: user_name.is_some(),
            user_name,
        }
    }

    pub fn open_sessions(&self) -> Vec<OpenSession> {
        self.all_sessions()
            .into_iter()
            .map(|shared| {
                let session = shared.lock();
                OpenSession {
                    session_id: session.id.clone(),
                    user_name: session.user_name.clone(),
                }
            })
            .collect()
    }

    pub fn mandatory_services(&self, session_type: &str) -> Vec<ServiceSpec> {
        self.mandatory.get(session_type)
    }

    pub fn add_mandatory_service(&self, session_type: &str, spec: ServiceSpec) -> bool {
        let added = self.mandatory.add(session_type, spec.clone());
        if added {
            info!(session_type, service = %spec.name, "mandatory service added");
        }
        added
    }

    pub fn enable_service_debug(&self, service_name: &str) -> Result<(), ControlError> {
        if self.debug.enable(service_name, &self.mandatory) {
            info!(service = service_name, "debug hosting enabled");
            Ok(())
        } else {
            Err(ControlError::InvalidRequest(format!(
                "{service_name} is not a mandatory service"
            )))
        }
    }

    pub fn disable_service_debug(&self, service_name: &str) {
        self.debug.disable(service_name);
    }

    pub fn system_information(&self) -> SystemInformation {
        let mut sessions: Vec<SessionSummary> = self
            .all_sessions()
            .into_iter()
            .map(|shared| shared.lock().summary())
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        SystemInformation {
            url: self.settings.local_url.clone(),
            lss_id: self.registrar().map(|r| r.lss_id),
            directory_url: self.directory_url(),
            debug_services: self.debug.names(),
            sessions,
        }
    }
}

fn startup_request(
    session_id: &str,
    slot: &harbor_core::session::ServiceSlot,
    credentials: &serde_json::Value,
) -> StartupRequest {
    StartupRequest {
        session_id: session_id.to_string(),
        service_id: slot.id,
        name: slot.name.clone(),
        service_type: slot.service_type.clone(),
        url: slot.url.clone(),
        credentials: credentials.clone(),
    }
}

impl MembershipSource for SessionAuthority {
    fn run_notice(&self, request: &StartupRequest) -> Option<RunNotice> {
        let shared = self.session(&request.session_id).ok()?;
        let session = shared.lock();
        if session.state().is_closing() {
            return None;
        }
        // Ids are reused, so a queued run must still match the slot it was made for.
        let slot = session.slot(request.service_id)?;
        if slot.name != request.name || slot.url != request.url {
            return None;
        }
        Some(RunNotice {
            session_id: request.session_id.clone(),
            service_id: request.service_id,
            credentials: request.credentials.clone(),
            members: session.members(),
        })
    }
}
