use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use harbor_core::api::{self, unsupported, ActionHandler, ActionResult, ProcessInfo, Reply};
use harbor_proto::Action;

use crate::state::AppState;

#[async_trait]
impl ActionHandler for AppState {
    async fn handle(&self, action: Action) -> ActionResult {
        let registrar = self.registrar();
        match action {
            Action::Ping => Ok(Reply::ping()),
            Action::RegisterSessionService(req) => Ok(Reply::json(&registrar.register_lss(req))),
            Action::ReserveSession(req) => Ok(Reply::json(&registrar.reserve_session(req)?)),
            Action::ConfirmSession(req) => {
                registrar.confirm_session(req)?;
                Ok(Reply::ok())
            }
            Action::SessionClosing(r) => {
                registrar.session_closing(&r.session_id);
                Ok(Reply::ok())
            }
            Action::ShutdownSessionCompleted(notice) | Action::SessionClosed(notice) => {
                registrar.session_closed(notice);
                Ok(Reply::ok())
            }
            Action::SessionExists(r) => Ok(Reply::flag(registrar.session_exists(&r.session_id))),
            Action::CheckProjectOpen(r) => Ok(Reply::json(&registrar.project_open(&r.project_name))),
            Action::RegisterGlobalDirectory(r) => {
                registrar.register_global_directory(r.url);
                Ok(Reply::ok())
            }
            Action::GetSystemInformation => Ok(Reply::json(&registrar.system_information())),
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
