//! Global session registrar.
//!
//! Keeps the set of local session authorities, hands out reservations for new
//! session ids and tracks which authority hosts which session. All state sits
//! behind one mutex; nothing is sent while it is held.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use harbor_core::health::{ping, spawn_health_check, HealthCheckHandle, Probe};
use harbor_core::metrics::{HEALTH_FAILURES, SESSIONS};
use harbor_core::{ControlError, IdAllocator};
use harbor_proto::{
    Action, ConfirmSessionRequest, GlobalDirectoryRef, LssSummary, ProjectOpenReply,
    RegisterLssReply, RegisterLssRequest, ReserveSessionReply, ReserveSessionRequest,
    SessionClosedNotice,
};
use harbor_transport::{send_async, DeliveryClass, Outbound, Transport};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RegistrarSettings {
    pub local_url: String,
    pub gds_url: Option<String>,
    pub reservation_timeout: Duration,
    pub send_timeout: Duration,
}

impl Default for RegistrarSettings {
    fn default() -> Self {
        Self {
            local_url: "http://127.0.0.1:8090".into(),
            gds_url: None,
            reservation_timeout: Duration::from_secs(15),
            send_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
struct OpenEntry {
    user_name: String,
    closing: bool,
}

#[derive(Debug, Clone)]
struct LssRecord {
    id: u32,
    url: String,
    sessions: BTreeMap<String, OpenEntry>,
}

#[derive(Debug, Clone)]
struct Reservation {
    user_name: String,
    lss_id: u32,
    created: Instant,
}

#[derive(Default)]
struct RegistrarState {
    lsses: Vec<LssRecord>,
    ids: IdAllocator,
    reservations: HashMap<String, Reservation>,
}

impl RegistrarState {
    fn lss(&self, id: u32) -> Option<&LssRecord> {
        self.lsses.iter().find(|l| l.id == id)
    }

    fn lss_mut(&mut self, id: u32) -> Option<&mut LssRecord> {
        self.lsses.iter_mut().find(|l| l.id == id)
    }

    fn owner_of(&self, session_id: &str) -> Option<&LssRecord> {
        self.lsses
            .iter()
            .find(|l| l.sessions.contains_key(session_id))
    }

    fn load_of(&self, lss: &LssRecord) -> usize {
        let pending = self
            .reservations
            .values()
            .filter(|r| r.lss_id == lss.id)
            .count();
        lss.sessions.len() + pending
    }

    fn remove_lss(&mut self, id: u32) -> Option<LssRecord> {
        let pos = self.lsses.iter().position(|l| l.id == id)?;
        let record = self.lsses.remove(pos);
        self.ids.free_id(id);
        self.reservations.retain(|_, r| r.lss_id != id);
        Some(record)
    }
}

pub struct SessionRegistrar {
    settings: RegistrarSettings,
    transport: Arc<dyn Transport>,
    state: Mutex<RegistrarState>,
    gds_url: RwLock<Option<String>>,
    self_ref: Weak<SessionRegistrar>,
}

impl SessionRegistrar {
    pub fn new(settings: RegistrarSettings, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            gds_url: RwLock::new(settings.gds_url.clone()),
            settings,
            transport,
            state: Mutex::new(RegistrarState::default()),
            self_ref: weak.clone(),
        })
    }

    pub fn local_url(&self) -> &str {
        &self.settings.local_url
    }

    pub fn gds_url(&self) -> Option<String> {
        self.gds_url.read().clone()
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

    /// Register an authority, or refresh a known one. A known url keeps its id and
    /// its session set is replaced by the one it reports.
    pub fn register_lss(&self, req: RegisterLssRequest) -> RegisterLssReply {
        let mut state = self.state.lock();
        let reported: BTreeMap<String, OpenEntry> = req
            .sessions
            .into_iter()
            .map(|s| {
                (
                    s.session_id,
                    OpenEntry {
                        user_name: s.user_name,
                        closing: false,
                    },
                )
            })
            .collect();

        let lss_id = match state.lsses.iter().position(|l| l.url == req.url) {
            Some(pos) => {
                let record = &mut state.lsses[pos];
                record.sessions = reported;
                info!(lss_id = record.id, url = %req.url, sessions = record.sessions.len(), "session authority re-registered");
                record.id
            }
            None => {
                let id = state.ids.grab_next_id();
                info!(lss_id = id, url = %req.url, sessions = reported.len(), "session authority registered");
                state.lsses.push(LssRecord {
                    id,
                    url: req.url,
                    sessions: reported,
                });
                id
            }
        };
        let claimed: Vec<String> = state
            .lss(lss_id)
            .map(|l| l.sessions.keys().cloned().collect())
            .unwrap_or_default();
        for session_id in claimed {
            state.reservations.remove(&session_id);
        }
        RegisterLssReply {
            lss_id,
            directory_url: self.gds_url(),
        }
    }

    /// Pick the authority with the fewest sessions for a new session id.
    pub fn reserve_session(
        &self,
        req: ReserveSessionRequest,
    ) -> Result<ReserveSessionReply, ControlError> {
        let mut state = self.state.lock();
        let holder = state
            .owner_of(&req.session_id)
            .and_then(|l| l.sessions.get(&req.session_id))
            .map(|e| e.user_name.clone())
            .or_else(|| {
                state
                    .reservations
                    .get(&req.session_id)
                    .map(|r| r.user_name.clone())
            });
        if let Some(holder) = holder {
            let message = if holder == req.user_name {
                format!("{} is already open in another instance", req.session_id)
            } else {
                format!("{} is open by another user", req.session_id)
            };
            return Err(ControlError::DuplicateSession(message));
        }

        let (lss_id, lss_url) = state
            .lsses
            .iter()
            .min_by_key(|l| state.load_of(l))
            .map(|l| (l.id, l.url.clone()))
            .ok_or_else(|| ControlError::NoCapacity("no session authority registered".into()))?;
        state.reservations.insert(
            req.session_id.clone(),
            Reservation {
                user_name: req.user_name.clone(),
                lss_id,
                created: Instant::now(),
            },
        );
        SESSIONS.with_label_values(&["reserved"]).inc();
        debug!(session_id = %req.session_id, user = %req.user_name, lss_id, "session reserved");
        Ok(ReserveSessionReply { lss_url })
    }

    /// Turn a reservation into an open session on the authority that asked.
    pub fn confirm_session(&self, req: ConfirmSessionRequest) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        let reservation = state
            .reservations
            .get(&req.session_id)
            .cloned()
            .ok_or_else(|| ControlError::SessionNotFound(req.session_id.clone()))?;
        if reservation.lss_id != req.lss_id {
            return Err(ControlError::InvalidRequest(format!(
                "{} is reserved on a different session authority",
                req.session_id
            )));
        }
        if reservation.user_name != req.user_name {
            return Err(ControlError::InvalidRequest(format!(
                "{} was reserved by a different user",
                req.session_id
            )));
        }
        let lss = state
            .lss_mut(req.lss_id)
            .ok_or_else(|| ControlError::InvalidRequest(format!("unknown lss {}", req.lss_id)))?;
        lss.sessions.insert(
            req.session_id.clone(),
            OpenEntry {
                user_name: req.user_name.clone(),
                closing: false,
            },
        );
        state.reservations.remove(&req.session_id);
        info!(session_id = %req.session_id, lss_id = req.lss_id, "session confirmed");
        Ok(())
    }

    pub fn session_exists(&self, session_id: &str) -> bool {
        self.state.lock().owner_of(session_id).is_some()
    }

    /// Projects are opened as sessions named after them.
    pub fn project_open(&self, project_name: &str) -> ProjectOpenReply {
        let state = self.state.lock();
        let user_name = state
            .owner_of(project_name)
            .and_then(|l| l.sessions.get(project_name))
            .map(|e| e.user_name.clone());
        ProjectOpenReply {
            open: user_name.is_some(),
            user_name,
        }
    }

    pub fn session_closing(&self, session_id: &str) {
        let mut state = self.state.lock();
        let entry = state
            .lsses
            .iter_mut()
            .find_map(|l| l.sessions.get_mut(session_id));
        match entry {
            Some(entry) => {
                entry.closing = true;
                debug!(session_id, "session closing");
            }
            None => debug!(session_id, "closing notice for unknown session"),
        }
    }

    /// Forget a closed session and pass the notice on to the global directory.
    pub fn session_closed(&self, notice: SessionClosedNotice) {
        let removed = {
            let mut state = self.state.lock();
            state.reservations.remove(&notice.session_id);
            state
                .lsses
                .iter_mut()
                .find_map(|l| {
                    l.sessions
                        .remove(&notice.session_id)
                        .map(|entry| (l.url.clone(), entry.closing))
                })
        };
        let Some((lss_url, announced)) = removed else {
            debug!(session_id = %notice.session_id, "close notice for unknown session");
            return;
        };
        SESSIONS.with_label_values(&["closed"]).inc();
        info!(session_id = %notice.session_id, lss = %lss_url, announced, "session closed");
        if let Some(gds) = self.gds_url() {
            let forwarded = SessionClosedNotice {
                session_id: notice.session_id,
                lss_url,
            };
            send_async(
                &self.transport,
                self.outbound(&gds, DeliveryClass::Queue, &Action::SessionClosed(forwarded)),
            );
        }
    }

    /// Store the global directory url and push it to every authority.
    pub fn register_global_directory(&self, url: String) {
        info!(gds = %url, "global directory registered");
        *self.gds_url.write() = Some(url.clone());
        let targets: Vec<String> = self.state.lock().lsses.iter().map(|l| l.url.clone()).collect();
        let action = Action::RegisterGlobalDirectory(GlobalDirectoryRef { url });
        for lss in targets {
            send_async(
                &self.transport,
                self.outbound(&lss, DeliveryClass::Queue, &action),
            );
        }
    }

    pub fn system_information(&self) -> Vec<LssSummary> {
        let state = self.state.lock();
        state
            .lsses
            .iter()
            .map(|l| LssSummary {
                lss_id: l.id,
                url: l.url.clone(),
                sessions: l.sessions.keys().cloned().collect(),
                pending: state
                    .reservations
                    .iter()
                    .filter(|(_, r)| r.lss_id == l.id)
                    .map(|(id, _)| id.clone())
                    .collect(),
            })
            .collect()
    }

    pub fn lss_count(&self) -> usize {
        self.state.lock().lsses.len()
    }

    /// Drop reservations older than the reservation timeout. Returns how many went.
    pub fn sweep_reservations(&self) -> usize {
        let timeout = self.settings.reservation_timeout;
        let mut state = self.state.lock();
        let before = state.reservations.len();
        state.reservations.retain(|session_id, r| {
            let keep = r.created.elapsed() < timeout;
            if !keep {
                warn!(session_id = %session_id, lss_id = r.lss_id, "reservation expired");
            }
            keep
        });
        before - state.reservations.len()
    }

    /// Ping every authority once; unreachable ones are dropped with their sessions.
    pub async fn check_lsses(&self) -> Vec<u32> {
        let targets: Vec<(u32, String)> = self
            .state
            .lock()
            .lsses
            .iter()
            .map(|l| (l.id, l.url.clone()))
            .collect();
        let mut failed = Vec::new();
        for (id, url) in targets {
            if let Err(err) = ping(
                self.transport.as_ref(),
                &self.settings.local_url,
                &url,
                self.settings.send_timeout,
            )
            .await
            {
                HEALTH_FAILURES.with_label_values(&["lss"]).inc();
                warn!(lss_id = id, url = %url, error = %err, "session authority failed health check");
                failed.push(id);
            }
        }
        if !failed.is_empty() {
            let mut state = self.state.lock();
            for id in &failed {
                if let Some(record) = state.remove_lss(*id) {
                    warn!(
                        lss_id = id,
                        url = %record.url,
                        sessions = record.sessions.len(),
                        "session authority removed"
                    );
                }
            }
        }
        failed
    }

    pub fn spawn_lss_monitor(&self, period: Duration) -> HealthCheckHandle {
        let weak = self.self_ref.clone();
        spawn_health_check("lss", period, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(registrar) => {
                        registrar.check_lsses().await;
                        Probe::Continue
                    }
                    None => Probe::Stop,
                }
            }
        })
    }

    pub fn spawn_reservation_sweep(&self, period: Duration) -> HealthCheckHandle {
        let weak = self.self_ref.clone();
        spawn_health_check("reservations", period, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(registrar) => {
                        registrar.sweep_reservations();
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
    use harbor_proto::OpenSession;
    use harbor_transport::RecordingTransport;

    use super::*;

    fn registrar(recording: &Arc<RecordingTransport>) -> Arc<SessionRegistrar> {
        SessionRegistrar::new(
            RegistrarSettings {
                gds_url: Some("http://gds".into()),
                ..RegistrarSettings::default()
            },
            recording.clone(),
        )
    }

    fn lss(url: &str) -> RegisterLssRequest {
        RegisterLssRequest {
            url: url.into(),
            sessions: Vec::new(),
        }
    }

    fn reserve(session_id: &str, user: &str) -> ReserveSessionRequest {
        ReserveSessionRequest {
            session_id: session_id.into(),
            user_name: user.into(),
        }
    }

    fn confirm(session_id: &str, user: &str, lss_id: u32) -> ConfirmSessionRequest {
        ConfirmSessionRequest {
            session_id: session_id.into(),
            user_name: user.into(),
            lss_id,
        }
    }

    #[tokio::test]
    async fn re_registration_keeps_the_id() {
        let registrar = registrar(&RecordingTransport::new());
        let first = registrar.register_lss(lss("http://lss-a"));
        let second = registrar.register_lss(lss("http://lss-b"));
        assert_eq!((first.lss_id, second.lss_id), (1, 2));
        assert_eq!(first.directory_url.as_deref(), Some("http://gds"));

        let again = registrar.register_lss(RegisterLssRequest {
            url: "http://lss-a".into(),
            sessions: vec![OpenSession {
                session_id: "p1".into(),
                user_name: "ada".into(),
            }],
        });
        assert_eq!(again.lss_id, 1);
        assert!(registrar.session_exists("p1"));
        assert_eq!(registrar.lss_count(), 2);
    }

    #[tokio::test]
    async fn reservations_spread_over_least_busy_authority() {
        let registrar = registrar(&RecordingTransport::new());
        registrar.register_lss(lss("http://lss-a"));
        registrar.register_lss(lss("http://lss-b"));

        let a = registrar.reserve_session(reserve("s1", "ada")).unwrap();
        assert_eq!(a.lss_url, "http://lss-a");
        let b = registrar.reserve_session(reserve("s2", "ada")).unwrap();
        assert_eq!(b.lss_url, "http://lss-b");
        let c = registrar.reserve_session(reserve("s3", "bob")).unwrap();
        assert_eq!(c.lss_url, "http://lss-a");
    }

    #[tokio::test]
    async fn duplicate_reservations_name_the_holder() {
        let registrar = registrar(&RecordingTransport::new());
        registrar.register_lss(lss("http://lss-a"));
        registrar.reserve_session(reserve("s1", "ada")).unwrap();

        let same = registrar.reserve_session(reserve("s1", "ada")).unwrap_err();
        assert!(same.to_string().contains("another instance"));
        let other = registrar.reserve_session(reserve("s1", "bob")).unwrap_err();
        assert!(other.to_string().contains("another user"));
        assert!(matches!(other, ControlError::DuplicateSession(_)));
    }

    #[tokio::test]
    async fn confirmation_validates_authority_and_user() {
        let registrar = registrar(&RecordingTransport::new());
        registrar.register_lss(lss("http://lss-a"));
        registrar.register_lss(lss("http://lss-b"));
        registrar.reserve_session(reserve("s1", "ada")).unwrap();

        assert!(matches!(
            registrar.confirm_session(confirm("nope", "ada", 1)),
            Err(ControlError::SessionNotFound(_))
        ));
        assert!(registrar.confirm_session(confirm("s1", "ada", 2)).is_err());
        assert!(registrar.confirm_session(confirm("s1", "bob", 1)).is_err());
        registrar.confirm_session(confirm("s1", "ada", 1)).unwrap();

        assert!(registrar.session_exists("s1"));
        let open = registrar.project_open("s1");
        assert_eq!(open.user_name.as_deref(), Some("ada"));
        assert!(registrar.reserve_session(reserve("s1", "ada")).is_err());
    }

    #[tokio::test]
    async fn closed_sessions_are_forwarded_to_the_global_directory() {
        let recording = RecordingTransport::new();
        let registrar = registrar(&recording);
        registrar.register_lss(lss("http://lss-a"));
        registrar.reserve_session(reserve("s1", "ada")).unwrap();
        registrar.confirm_session(confirm("s1", "ada", 1)).unwrap();

        registrar.session_closing("s1");
        assert!(registrar.session_exists("s1"));
        registrar.session_closed(SessionClosedNotice {
            session_id: "s1".into(),
            lss_url: String::new(),
        });
        assert!(!registrar.session_exists("s1"));
        assert!(
            recording
                .wait_for(Duration::from_secs(1), |sent| sent
                    .iter()
                    .any(|o| o.receiver == "http://gds"))
                .await
        );
        let Action::SessionClosed(notice) = &recording.sent_to("http://gds")[0] else {
            panic!("expected session_closed");
        };
        assert_eq!(notice.lss_url, "http://lss-a");
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_reservations_expire() {
        let registrar = registrar(&RecordingTransport::new());
        registrar.register_lss(lss("http://lss-a"));
        registrar.reserve_session(reserve("s1", "ada")).unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(registrar.sweep_reservations(), 0);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(registrar.sweep_reservations(), 1);
        registrar.reserve_session(reserve("s1", "bob")).unwrap();
    }

    #[tokio::test]
    async fn failed_authorities_are_dropped_with_their_sessions() {
        let recording = RecordingTransport::new();
        let registrar = registrar(&recording);
        registrar.register_lss(lss("http://lss-a"));
        registrar.register_lss(lss("http://lss-b"));
        registrar.reserve_session(reserve("s1", "ada")).unwrap();
        registrar.confirm_session(confirm("s1", "ada", 1)).unwrap();

        recording.set_unreachable("http://lss-a", true);
        assert_eq!(registrar.check_lsses().await, vec![1]);
        assert!(!registrar.session_exists("s1"));
        assert_eq!(registrar.lss_count(), 1);

        let again = registrar.register_lss(lss("http://lss-c"));
        assert_eq!(again.lss_id, 1);
    }

    #[tokio::test]
    async fn new_global_directory_is_pushed_to_authorities() {
        let recording = RecordingTransport::new();
        let registrar = registrar(&recording);
        registrar.register_lss(lss("http://lss-a"));
        registrar.register_global_directory("http://gds-2".into());
        assert_eq!(registrar.gds_url().as_deref(), Some("http://gds-2"));
        assert!(
            recording
                .wait_for(Duration::from_secs(1), |sent| sent
                    .iter()
                    .any(|o| o.receiver == "http://lss-a"))
                .await
        );
    }
}
