use serde::{Deserialize, Serialize};

use crate::ServiceId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: String,
    pub user_name: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub collection_name: String,
    pub session_type: String,
    /// Opaque pass-through handed to every service in the run notification.
    #[serde(default)]
    pub credentials: serde_json::Value,
    pub service_name: String,
    pub service_type: String,
    #[serde(default)]
    pub service_url: String,
    #[serde(default)]
    pub start_relay: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionReply {
    pub service_id: ServiceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_order: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterServiceRequest {
    pub session_id: String,
    pub service_name: String,
    pub service_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default)]
    pub start_relay: bool,
}

/// Reply to service registration; shares the shape of a session creation reply.
pub type RegisterServiceReply = CreateSessionReply;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmServiceRequest {
    pub session_id: String,
    pub service_id: ServiceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfirmServiceReply {
    /// Present once the session is fully up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<MemberInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_order: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub session_id: String,
    pub service_id: ServiceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub project_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectOpenReply {
    pub open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTypeRef {
    pub session_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNameRef {
    pub service_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalDirectoryRef {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MandatoryServiceRequest {
    pub session_type: String,
    pub service_name: String,
    pub service_type: String,
}

/// A (name, type) pair from the mandatory catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
        }
    }
}

/// Failure report keyed either by id or by (name, type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFailureNotice {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<ServiceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownSessionRequest {
    pub session_id: String,
    pub service_id: ServiceId,
    #[serde(default)]
    pub emergency: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub session_id: String,
    pub service_id: ServiceId,
    pub message: String,
    /// Wait for every recipient before answering.
    #[serde(default)]
    pub synchronous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub service_id: ServiceId,
    pub name: String,
    pub service_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunNotice {
    pub session_id: String,
    pub service_id: ServiceId,
    #[serde(default)]
    pub credentials: serde_json::Value,
    pub members: Vec<MemberInfo>,
}

/// Generic session scoped notice sent to member services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNotice {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<MemberInfo>,
    /// The member a connect/disconnect notice is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<MemberInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_exists: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SessionNotice {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            sender: None,
            subject: None,
            session_exists: None,
            message: None,
        }
    }

    pub fn with_sender(mut self, sender: Option<MemberInfo>) -> Self {
        self.sender = sender;
        self
    }

    pub fn with_subject(mut self, subject: MemberInfo) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn closing(mut self) -> Self {
        self.session_exists = Some(false);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSummary {
    pub service_id: ServiceId,
    pub name: String,
    pub service_type: String,
    pub url: String,
    pub state: String,
    pub visible: bool,
    pub debug_hosted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_name: String,
    pub project_name: String,
    pub session_type: String,
    pub state: String,
    pub services: Vec<SlotSummary>,
}
