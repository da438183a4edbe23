use std::sync::Arc;

use harbor_core::api::ProcessInfo;

use crate::directory::DirectoryService;

#[derive(Clone)]
pub struct AppState {
    directory: Arc<DirectoryService>,
    process: ProcessInfo,
}

impl AppState {
    pub fn new(directory: Arc<DirectoryService>, instance_id: impl Into<String>) -> Self {
        Self {
            directory,
            process: ProcessInfo::new(instance_id),
        }
    }

    pub fn directory(&self) -> &Arc<DirectoryService> {
        &self.directory
    }

    pub fn process(&self) -> &ProcessInfo {
        &self.process
    }
}
