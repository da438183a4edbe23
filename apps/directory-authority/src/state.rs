use std::sync::Arc;

use harbor_core::api::ProcessInfo;

use crate::directory::DirectoryAuthority;

#[derive(Clone)]
pub struct AppState {
    authority: Arc<DirectoryAuthority>,
    process: ProcessInfo,
}

impl AppState {
    pub fn new(authority: Arc<DirectoryAuthority>, instance_id: impl Into<String>) -> Self {
        Self {
            authority,
            process: ProcessInfo::new(instance_id),
        }
    }

    pub fn authority(&self) -> &Arc<DirectoryAuthority> {
        &self.authority
    }

    pub fn process(&self) -> &ProcessInfo {
        &self.process
    }
}
