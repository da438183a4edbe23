//! Shared wire definitions for every harbor tier.
//! Session authorities, registrars, directories and worker nodes all speak the
//! same `Action` envelope, so the types live here without any runtime code.

use serde::{Deserialize, Serialize};

pub mod directory;
pub mod registrar;
pub mod session;

pub use directory::*;
pub use registrar::*;
pub use session::*;

pub type ServiceId = u32;

pub const REPLY_OK: &str = "OK";
pub const REPLY_PING: &str = "Ping";
pub const REPLY_TRUE: &str = "TRUE";
pub const REPLY_FALSE: &str = "FALSE";

/// Every message exchanged between harbor processes.
///
/// Serialized as an internally tagged object: `{"action": "confirm_service", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Ping,

    // Session authority inbound.
    CreateSession(CreateSessionRequest),
    RegisterService(RegisterServiceRequest),
    ConfirmService(ConfirmServiceRequest),
    ServiceClosing(ServiceRef),
    ServiceFailure(ServiceFailureNotice),
    ServiceStartupFailed(ServiceFailureNotice),
    ServiceShutdownCompleted(ServiceRef),
    ShutdownSession(ShutdownSessionRequest),
    SendBroadcast(BroadcastRequest),
    ShowService(ServiceRef),
    HideService(ServiceRef),
    SessionExists(SessionRef),
    GetServicesInSession(SessionRef),
    CheckStartupCompleted(SessionRef),
    CheckProjectOpen(ProjectRef),
    GetMandatoryServices(SessionTypeRef),
    AddMandatoryService(MandatoryServiceRequest),
    EnableServiceDebug(ServiceNameRef),
    DisableServiceDebug(ServiceNameRef),
    GetSystemInformation,
    RegisterGlobalDirectory(GlobalDirectoryRef),

    // Worker bound notices.
    Run(RunNotice),
    PreShutdown(SessionNotice),
    Shutdown(SessionNotice),
    EmergencyShutdown(SessionNotice),
    ServiceConnected(SessionNotice),
    ServiceDisconnected(SessionNotice),
    Broadcast(SessionNotice),

    // Directory tier.
    StartService(StartServiceRequest),
    StartServices(StartServicesRequest),
    StartRelayService(StartRelayRequest),
    RegisterNode(RegisterNodeRequest),
    UpdateNodeLoad(UpdateLoadRequest),
    RegisterDirectory(RegisterDirectoryRequest),
    UpdateDirectoryLoad(UpdateLoadRequest),
    ServiceStopped(ServiceStoppedNotice),
    SessionClosed(SessionClosedNotice),
    LaunchService(LaunchRequest),
    StopSession(SessionClosedNotice),

    // Session registrar.
    RegisterSessionService(RegisterLssRequest),
    ReserveSession(ReserveSessionRequest),
    ConfirmSession(ConfirmSessionRequest),
    SessionClosing(SessionRef),
    ShutdownSessionCompleted(SessionClosedNotice),
}

impl Action {
    /// Stable action name, matching the serialized tag.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Ping => "ping",
            Action::CreateSession(_) => "create_session",
            Action::RegisterService(_) => "register_service",
            Action::ConfirmService(_) => "confirm_service",
            Action::ServiceClosing(_) => "service_closing",
            Action::ServiceFailure(_) => "service_failure",
            Action::ServiceStartupFailed(_) => "service_startup_failed",
            Action::ServiceShutdownCompleted(_) => "service_shutdown_completed",
            Action::ShutdownSession(_) => "shutdown_session",
            Action::SendBroadcast(_) => "send_broadcast",
            Action::ShowService(_) => "show_service",
            Action::HideService(_) => "hide_service",
            Action::SessionExists(_) => "session_exists",
            Action::GetServicesInSession(_) => "get_services_in_session",
            Action::CheckStartupCompleted(_) => "check_startup_completed",
            Action::CheckProjectOpen(_) => "check_project_open",
            Action::GetMandatoryServices(_) => "get_mandatory_services",
            Action::AddMandatoryService(_) => "add_mandatory_service",
            Action::EnableServiceDebug(_) => "enable_service_debug",
            Action::DisableServiceDebug(_) => "disable_service_debug",
            Action::GetSystemInformation => "get_system_information",
            Action::RegisterGlobalDirectory(_) => "register_global_directory",
            Action::Run(_) => "run",
            Action::PreShutdown(_) => "pre_shutdown",
            Action::Shutdown(_) => "shutdown",
            Action::EmergencyShutdown(_) => "emergency_shutdown",
            Action::ServiceConnected(_) => "service_connected",
            Action::ServiceDisconnected(_) => "service_disconnected",
            Action::Broadcast(_) => "broadcast",
            Action::StartService(_) => "start_service",
            Action::StartServices(_) => "start_services",
            Action::StartRelayService(_) => "start_relay_service",
            Action::RegisterNode(_) => "register_node",
            Action::UpdateNodeLoad(_) => "update_node_load",
            Action::RegisterDirectory(_) => "register_directory",
            Action::UpdateDirectoryLoad(_) => "update_directory_load",
            Action::ServiceStopped(_) => "service_stopped",
            Action::SessionClosed(_) => "session_closed",
            Action::LaunchService(_) => "launch_service",
            Action::StopSession(_) => "stop_session",
            Action::RegisterSessionService(_) => "register_session_service",
            Action::ReserveSession(_) => "reserve_session",
            Action::ConfirmSession(_) => "confirm_session",
            Action::SessionClosing(_) => "session_closing",
            Action::ShutdownSessionCompleted(_) => "shutdown_session_completed",
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is a plain struct of strings, numbers and json values.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Machine readable error category carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DuplicateSession,
    SessionNotFound,
    ServiceNotFound,
    NoCapacity,
    RegistrationFailed,
    TransportFailure,
    SessionShuttingDown,
    InvalidRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Resource usage sample reported by worker nodes and directories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    #[serde(default)]
    pub physical_available: u64,
    #[serde(default)]
    pub physical_total: u64,
    #[serde(default)]
    pub virtual_available: u64,
    #[serde(default)]
    pub virtual_total: u64,
}

impl LoadSample {
    pub fn new(cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            cpu_percent,
            memory_percent,
            ..Self::default()
        }
    }

    /// Load used for placement: the busier of cpu and memory.
    pub fn load(&self) -> f64 {
        self.cpu_percent.max(self.memory_percent)
    }

    pub fn is_valid(&self) -> bool {
        let in_range = |v: f64| v.is_finite() && (0.0..=100.0).contains(&v);
        in_range(self.cpu_percent)
            && in_range(self.memory_percent)
            && (self.physical_total == 0 || self.physical_available <= self.physical_total)
            && (self.virtual_total == 0 || self.virtual_available <= self.virtual_total)
    }

    /// Mean of the given samples, or `None` when empty.
    pub fn mean<'a>(samples: impl IntoIterator<Item = &'a LoadSample>) -> Option<LoadSample> {
        let mut count = 0u64;
        let mut acc = LoadSample::default();
        for s in samples {
            count += 1;
            acc.cpu_percent += s.cpu_percent;
            acc.memory_percent += s.memory_percent;
            acc.physical_available += s.physical_available;
            acc.physical_total += s.physical_total;
            acc.virtual_available += s.virtual_available;
            acc.virtual_total += s.virtual_total;
        }
        if count == 0 {
            return None;
        }
        acc.cpu_percent /= count as f64;
        acc.memory_percent /= count as f64;
        Some(acc)
    }
}
