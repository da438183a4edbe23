use serde::{Deserialize, Serialize};

use crate::{LoadSample, ServiceId};

/// Placement request for a single service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartServiceRequest {
    pub session_id: String,
    pub lss_url: String,
    pub service_id: ServiceId,
    pub service_name: String,
    pub service_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementEntry {
    pub service_id: ServiceId,
    pub service_name: String,
    pub service_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartServicesRequest {
    pub session_id: String,
    pub lss_url: String,
    pub services: Vec<PlacementEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRelayRequest {
    pub session_id: String,
    pub lss_url: String,
    pub service_id: ServiceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Where a service ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub service_id: ServiceId,
    pub node_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementBatch {
    pub placements: Vec<Placement>,
}

/// Instruction sent from a directory to the chosen worker node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub session_id: String,
    pub lss_url: String,
    pub service_id: ServiceId,
    pub service_name: String,
    pub service_type: String,
}

/// Node answer to a launch. Nodes may also answer with a plain `OK`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LaunchReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub url: String,
    pub supported_types: Vec<String>,
    pub load: LoadSample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterNodeReply {
    pub node_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateLoadRequest {
    pub id: u32,
    pub load: LoadSample,
    /// Directories resend their supported types when the set changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDirectoryRequest {
    pub url: String,
    #[serde(default)]
    pub region: String,
    pub supported_types: Vec<String>,
    pub load: LoadSample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterDirectoryReply {
    pub directory_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStoppedNotice {
    pub session_id: String,
    pub service_name: String,
    pub service_type: String,
    #[serde(default)]
    pub service_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClosedNotice {
    pub session_id: String,
    #[serde(default)]
    pub lss_url: String,
}
