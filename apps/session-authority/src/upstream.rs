use std::sync::Arc;
use std::time::Duration;

use harbor_core::health::HealthCheckHandle;
use harbor_core::link::{register_with_retry, RetryPolicy, UpstreamLink};
use harbor_core::ControlError;
use harbor_proto::{Action, RegisterLssReply, RegisterLssRequest};
use harbor_transport::{DeliveryClass, Outbound, TransportError};
use tracing::info;

use crate::authority::{RegistrarBinding, SessionAuthority};

/// Register once with the registrar at `gss_url` and record the binding.
pub async fn register_once(
    authority: &SessionAuthority,
    gss_url: &str,
    timeout: Duration,
) -> Result<u32, ControlError> {
    let action = Action::RegisterSessionService(RegisterLssRequest {
        url: authority.local_url().to_string(),
        sessions: authority.open_sessions(),
    });
    let outbound = Outbound::action(
        authority.local_url(),
        gss_url,
        DeliveryClass::Execute,
        &action,
        timeout,
    );
    let reply = authority
        .transport()
        .send(outbound)
        .await
        .map_err(ControlError::from_remote)?;
    let reply: RegisterLssReply = serde_json::from_str(&reply)
        .map_err(|_| ControlError::from(TransportError::unexpected("lss registration", reply)))?;

    authority.set_registrar(RegistrarBinding {
        url: gss_url.to_string(),
        lss_id: reply.lss_id,
    });
    if let Some(directory) = reply.directory_url {
        authority.set_directory_url(directory);
    }
    info!(gss = gss_url, lss_id = reply.lss_id, "registered with session registrar");
    Ok(reply.lss_id)
}

/// Bootstrap registration. Exhausting `policy` is fatal for the process.
pub async fn register(
    authority: &SessionAuthority,
    gss_url: &str,
    policy: RetryPolicy,
    timeout: Duration,
) -> Result<u32, ControlError> {
    register_with_retry(gss_url, policy, || register_once(authority, gss_url, timeout)).await
}

/// Ping the registrar every `period`, re-registering after a failed ping.
pub fn spawn_monitor(
    authority: &Arc<SessionAuthority>,
    gss_url: &str,
    period: Duration,
    timeout: Duration,
) -> HealthCheckHandle {
    let link = UpstreamLink::new(
        "gss",
        authority.local_url(),
        gss_url,
        authority.transport(),
        timeout,
    );
    let authority = Arc::clone(authority);
    let gss_url = gss_url.to_string();
    link.spawn_monitor(period, move || {
        let authority = Arc::clone(&authority);
        let gss_url = gss_url.clone();
        async move {
            register_once(&authority, &gss_url, timeout).await?;
            Ok(())
        }
    })
}

#[cfg(test)]
mod tests {
    use harbor_transport::RecordingTransport;

    use super::*;
    use crate::authority::AuthoritySettings;

    #[tokio::test(start_paused = true)]
    async fn bootstrap_records_binding_and_directory() {
        let recording = RecordingTransport::new();
        recording.respond_with("http://gss", |_| {
            Ok(r#"{"lss_id":4,"directory_url":"http://gds"}"#.into())
        });
        let authority = SessionAuthority::new(AuthoritySettings::default(), recording.clone());
        let id = register(
            &authority,
            "http://gss",
            RetryPolicy::default(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(id, 4);
        assert_eq!(authority.registrar().unwrap().lss_id, 4);
        assert_eq!(authority.directory_url().as_deref(), Some("http://gds"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_registrar_is_fatal() {
        let recording = RecordingTransport::new();
        recording.set_unreachable("http://gss", true);
        let authority = SessionAuthority::new(AuthoritySettings::default(), recording.clone());
        let policy = RetryPolicy {
            interval: Duration::from_millis(500),
            max_attempts: 4,
        };
        let err = register(&authority, "http://gss", policy, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::RegistrationFailed(_)));
        assert_eq!(recording.sent_to("http://gss").len(), 4);
    }
}
