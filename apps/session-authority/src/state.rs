use std::sync::Arc;

use harbor_core::api::ProcessInfo;

use crate::authority::SessionAuthority;

#[derive(Clone)]
pub struct AppState {
    authority: Arc<SessionAuthority>,
    process: ProcessInfo,
}

impl AppState {
    pub fn new(authority: Arc<SessionAuthority>, instance_id: impl Into<String>) -> Self {
        Self {
            authority,
            process: ProcessInfo::new(instance_id),
        }
    }

    pub fn authority(&self) -> &Arc<SessionAuthority> {
        &self.authority
    }

    pub fn process(&self) -> &ProcessInfo {
        &self.process
    }
}
