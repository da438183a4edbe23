use std::sync::Arc;

use harbor_core::api::ProcessInfo;

use crate::registrar::SessionRegistrar;

#[derive(Clone)]
pub struct AppState {
    registrar: Arc<SessionRegistrar>,
    process: ProcessInfo,
}

impl AppState {
    pub fn new(registrar: Arc<SessionRegistrar>, instance_id: impl Into<String>) -> Self {
        Self {
            registrar,
            process: ProcessInfo::new(instance_id),
        }
    }

    pub fn registrar(&self) -> &Arc<SessionRegistrar> {
        &self.registrar
    }

    pub fn process(&self) -> &ProcessInfo {
        &self.process
    }
}
