use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use harbor_core::api::{self, unsupported, ActionHandler, ActionResult, ProcessInfo, Reply};
use harbor_proto::Action;

use crate::state::AppState;

#[async_trait]
impl ActionHandler for AppState {
    async fn handle(&self, action: Action) -> ActionResult {
        let directory = self.directory();
        match action {
            Action::Ping => Ok(Reply::ping()),
            Action::RegisterNode(req) => Ok(Reply::json(&directory.register_node(req)?)),
            Action::UpdateNodeLoad(req) => {
                directory.update_node_load(req)?;
                Ok(Reply::ok())
            }
            Action::StartService(req) => Ok(Reply::json(&directory.place_service(req).await?)),
            Action::StartServices(req) => Ok(Reply::json(&directory.place_services(req).await?)),
            Action::StartRelayService(req) => Ok(Reply::json(&directory.place_relay(req).await?)),
            Action::ServiceStopped(notice) => {
                directory.service_stopped(notice);
                Ok(Reply::ok())
            }
            Action::SessionClosed(notice) => {
                directory.session_closed(notice);
                Ok(Reply::ok())
            }
            Action::GetSystemInformation => Ok(Reply::json(&directory.nodes())),
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
