//! Periodic liveness probing.
//!
//! A health loop is a tokio task that runs a probe closure once per period until the
//! probe asks it to stop or its [`CancellationToken`] fires. Callers that need to tear
//! the loop down from inside a probe must hand the teardown to a separate task and
//! return [`Probe::Stop`]; joining the loop from within itself would never complete.

use std::future::Future;
use std::time::Duration;

use harbor_proto::{Action, REPLY_PING};
use harbor_transport::{send_expect, DeliveryClass, Outbound, Transport, TransportError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Continue,
    Stop,
}

pub struct HealthCheckHandle {
    name: &'static str,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl HealthCheckHandle {
    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Request cancellation without waiting for the loop to exit.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel the loop and wait for it to finish.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(err) = self.join.await {
            if err.is_panic() {
                warn!(health_loop = self.name, "health loop panicked");
            }
        }
    }
}

impl std::fmt::Debug for HealthCheckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheckHandle")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Spawn a loop calling `probe` every `period`. The first probe runs one full period
/// after spawning.
pub fn spawn_health_check<F, Fut>(
    name: &'static str,
    period: Duration,
    mut probe: F,
) -> HealthCheckHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Probe> + Send + 'static,
{
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let outcome = tokio::select! {
                _ = cancelled.cancelled() => break,
                outcome = probe() => outcome,
            };
            if outcome == Probe::Stop {
                break;
            }
        }
        debug!(health_loop = name, "health loop exited");
    });
    HealthCheckHandle { name, token, join }
}

/// Ping `receiver` and require the `Ping` reply. Wrong content, transport failure and
/// timeout all come back as errors.
pub async fn ping(
    transport: &dyn Transport,
    sender: &str,
    receiver: &str,
    timeout: Duration,
) -> Result<(), TransportError> {
    let outbound = Outbound::action(
        sender,
        receiver,
        DeliveryClass::ExecuteOneWay,
        &Action::Ping,
        timeout,
    );
    match tokio::time::timeout(timeout, send_expect(transport, outbound, REPLY_PING)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}
