use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use harbor_transport::Transport;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::ControlError;
use crate::health::{ping, spawn_health_check, HealthCheckHandle, Probe};
use crate::metrics::{HEALTH_FAILURES, REGISTRATIONS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_attempts: 40,
        }
    }
}

/// Run `attempt` until it succeeds or the policy's attempts are used up.
pub async fn register_with_retry<T, F, Fut>(
    target: &str,
    policy: RetryPolicy,
    mut attempt: F,
) -> Result<T, ControlError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControlError>>,
{
    let attempts = policy.max_attempts.max(1);
    for n in 1..=attempts {
        match attempt().await {
            Ok(value) => {
                REGISTRATIONS.with_label_values(&["ok"]).inc();
                info!(target_url = %target, attempt = n, "registered upstream");
                return Ok(value);
            }
            Err(err) => {
                REGISTRATIONS.with_label_values(&["retry"]).inc();
                debug!(target_url = %target, attempt = n, error = %err, "registration attempt failed");
                if n < attempts {
                    tokio::time::sleep(policy.interval).await;
                }
            }
        }
    }
    REGISTRATIONS.with_label_values(&["failed"]).inc();
    Err(ControlError::RegistrationFailed(format!(
        "{target} did not accept registration after {attempts} attempts"
    )))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Checking,
    Connected,
}

/// Liveness view of the process this one registered with.
pub struct UpstreamLink {
    kind: &'static str,
    local_url: String,
    remote_url: String,
    timeout: Duration,
    transport: Arc<dyn Transport>,
    state: Mutex<LinkState>,
}

impl UpstreamLink {
    pub fn new(
        kind: &'static str,
        local_url: impl Into<String>,
        remote_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            local_url: local_url.into(),
            remote_url: remote_url.into(),
            timeout,
            transport,
            state: Mutex::new(LinkState::Disconnected),
        })
    }

    pub fn remote_url(&self) -> &str {
        &self.remote_url
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: LinkState) {
        *self.state.lock() = state;
    }

    /// Ping the upstream once and record the outcome.
    pub async fn check(&self) -> bool {
        self.set_state(LinkState::Checking);
        match ping(
            self.transport.as_ref(),
            &self.local_url,
            &self.remote_url,
            self.timeout,
        )
        .await
        {
            Ok(()) => {
                self.set_state(LinkState::Connected);
                true
            }
            Err(err) => {
                HEALTH_FAILURES.with_label_values(&[self.kind]).inc();
                warn!(link = self.kind, remote = %self.remote_url, error = %err, "upstream unreachable");
                self.set_state(LinkState::Disconnected);
                false
            }
        }
    }

    /// Ping every `period`; after a failed ping, run `reregister` once per tick until
    /// it succeeds.
    pub fn spawn_monitor<F, Fut>(self: &Arc<Self>, period: Duration, reregister: F) -> HealthCheckHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ControlError>> + Send + 'static,
    {
        let link = Arc::clone(self);
        let reregister = Arc::new(reregister);
        spawn_health_check(self.kind, period, move || {
            let link = Arc::clone(&link);
            let reregister = Arc::clone(&reregister);
            async move {
                if link.check().await {
                    return Probe::Continue;
                }
                match reregister().await {
                    Ok(()) => {
                        info!(link = link.kind, remote = %link.remote_url, "re-registered upstream");
                        link.set_state(LinkState::Connected);
                    }
                    Err(err) => {
                        warn!(link = link.kind, remote = %link.remote_url, error = %err, "re-registration failed");
                    }
                }
                Probe::Continue
            }
        })
    }
}
