use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use harbor_core::api::{self, unsupported, ActionHandler, ActionResult, ProcessInfo, Reply};
use harbor_core::broadcast::Delivery;
use harbor_proto::{Action, ServiceSpec};

use crate::state::AppState;

#[async_trait]
impl ActionHandler for AppState {
    async fn handle(&self, action: Action) -> ActionResult {
        let authority = self.authority();
        match action {
            Action::Ping => Ok(Reply::ping()),
            Action::CreateSession(req) => Ok(Reply::json(&authority.create_session(req).await?)),
            Action::RegisterService(req) => {
                Ok(Reply::json(&authority.register_service(req).await?))
            }
            Action::ConfirmService(req) => Ok(Reply::json(&authority.confirm_service(req).await?)),
            Action::ServiceClosing(r) => {
                authority.service_closing(&r.session_id, r.service_id).await?;
                Ok(Reply::ok())
            }
            Action::ServiceFailure(notice) | Action::ServiceStartupFailed(notice) => {
                authority.service_failed(notice).await?;
                Ok(Reply::ok())
            }
            Action::ServiceShutdownCompleted(r) => {
                authority
                    .service_shutdown_completed(&r.session_id, r.service_id)
                    .await?;
                Ok(Reply::ok())
            }
            Action::ShutdownSession(req) => {
                authority
                    .shutdown_session(&req.session_id, req.service_id, req.emergency)
                    .await?;
                Ok(Reply::ok())
            }
            Action::SendBroadcast(req) => {
                let delivery = if req.synchronous {
                    Delivery::Synchronous
                } else {
                    Delivery::Asynchronous
                };
                authority
                    .broadcast(&req.session_id, req.service_id, &req.message, delivery)
                    .await?;
                Ok(Reply::ok())
            }
            Action::ShowService(r) => {
                authority
                    .set_visibility(&r.session_id, r.service_id, true)
                    .await?;
                Ok(Reply::ok())
            }
            Action::HideService(r) => {
                authority
                    .set_visibility(&r.session_id, r.service_id, false)
                    .await?;
                Ok(Reply::ok())
            }
            Action::SessionExists(r) => Ok(Reply::flag(authority.session_exists(&r.session_id))),
            Action::GetServicesInSession(r) => {
                Ok(Reply::json(&authority.services_in_session(&r.session_id)?))
            }
            Action::CheckStartupCompleted(r) => {
                Ok(Reply::flag(authority.startup_completed(&r.session_id)?))
            }
            Action::CheckProjectOpen(r) => Ok(Reply::json(&authority.project_open(&r.project_name))),
            Action::GetMandatoryServices(r) => {
                Ok(Reply::json(&authority.mandatory_services(&r.session_type)))
            }
            Action::AddMandatoryService(req) => {
                authority.add_mandatory_service(
                    &req.session_type,
                    ServiceSpec::new(req.service_name, req.service_type),
                );
                Ok(Reply::ok())
            }
            Action::EnableServiceDebug(r) => {
                authority.enable_service_debug(&r.service_name)?;
                Ok(Reply::ok())
            }
            Action::DisableServiceDebug(r) => {
                authority.disable_service_debug(&r.service_name);
                Ok(Reply::ok())
            }
            Action::GetSystemInformation => Ok(Reply::json(&authority.system_information())),
            Action::RegisterGlobalDirectory(r) => {
                authority.set_directory_url(r.url);
                Ok(Reply::ok())
            }
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
