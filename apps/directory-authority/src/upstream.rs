use std::sync::Arc;
use std::time::Duration;

use harbor_core::health::HealthCheckHandle;
use harbor_core::link::{register_with_retry, RetryPolicy, UpstreamLink};
use harbor_core::ControlError;
use harbor_proto::{Action, GlobalDirectoryRef, REPLY_OK};
use harbor_transport::{DeliveryClass, Outbound, TransportError};
use tracing::info;

use crate::directory::DirectoryAuthority;

/// Announce this directory to the registrar, which hands the url on to every
/// session authority.
pub async fn announce_once(
    authority: &DirectoryAuthority,
    gss_url: &str,
    timeout: Duration,
) -> Result<(), ControlError> {
    let outbound = Outbound::action(
        authority.local_url(),
        gss_url,
        DeliveryClass::Execute,
        &Action::RegisterGlobalDirectory(GlobalDirectoryRef {
            url: authority.local_url().to_string(),
        }),
        timeout,
    );
    let reply = authority
        .transport()
        .send(outbound)
        .await
        .map_err(ControlError::from_remote)?;
    if reply != REPLY_OK {
        return Err(TransportError::unexpected("global directory announcement", reply).into());
    }
    authority.set_gss_url(gss_url);
    info!(gss = gss_url, "announced to session registrar");
    Ok(())
}

pub async fn announce(
    authority: &DirectoryAuthority,
    gss_url: &str,
    policy: RetryPolicy,
    timeout: Duration,
) -> Result<(), ControlError> {
    register_with_retry(gss_url, policy, || announce_once(authority, gss_url, timeout)).await
}

/// Re-announce after the registrar comes back from a failed check.
pub fn spawn_monitor(
    authority: &Arc<DirectoryAuthority>,
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
        async move { announce_once(&authority, &gss_url, timeout).await }
    })
}
