use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use harbor_core::api::{self, unsupported, ActionHandler, ActionResult, ProcessInfo, Reply};
use harbor_proto::Action;

use crate::state::AppState;

#[async_trait]
impl ActionHandler for AppState {
    async fn handle(&self, action: Action) -> ActionResult {
        let authority = self.authority();
        match action {
            Action::Ping => Ok(Reply::ping()),
            Action::RegisterDirectory(req) => {
                Ok(Reply::json(&authority.register_directory(req)?))
            }
            Action::UpdateDirectoryLoad(req) => {
                authority.update_directory_load(req)?;
                Ok(Reply::ok())
            }
            Action::StartService(req) => Ok(Reply::json(&authority.place_service(req).await?)),
            Action::StartServices(req) => Ok(Reply::json(&authority.place_services(req).await?)),
            Action::StartRelayService(req) => Ok(Reply::json(&authority.place_relay(req).await?)),
            Action::ServiceStopped(notice) => {
                authority.service_stopped(notice);
                Ok(Reply::ok())
            }
            Action::SessionClosed(notice) => {
                authority.session_closed(notice);
                Ok(Reply::ok())
            }
            Action::GetSystemInformation => Ok(Reply::json(&authority.directories())),
            other => Err(unsupported(&other)),
        }
    }

    fn process(&self) -> &ProcessInfo {
        AppState::process(self)
    }
}

pub fn router(state: AppState) -> Router {
    api::router(Arc::new(state))
}
