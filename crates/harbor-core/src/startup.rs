//! Run notifications for services whose session is fully up.
//!
//! Entries go into one unbounded FIFO drained by a single consumer task. Membership
//! is resolved when an entry is dequeued, not when it is queued, so every run notice
//! carries the session's membership at send time.

use std::sync::{Arc, Weak};
use std::time::Duration;

use harbor_proto::{Action, RunNotice, ServiceId};
use harbor_transport::{DeliveryClass, Outbound, Transport};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::STARTUP_NOTIFICATIONS;

#[derive(Debug, Clone, PartialEq)]
pub struct StartupRequest {
    pub session_id: String,
    pub service_id: ServiceId,
    pub name: String,
    pub service_type: String,
    pub url: String,
    pub credentials: Value,
}

/// Resolves the run notice for a queued entry; `None` when its session or slot is gone.
pub trait MembershipSource: Send + Sync {
    fn run_notice(&self, request: &StartupRequest) -> Option<RunNotice>;
}

#[derive(Clone)]
pub struct StartupDispatchQueue {
    tx: mpsc::UnboundedSender<StartupRequest>,
}

impl StartupDispatchQueue {
    /// Start the consumer. It exits once every queue handle is dropped or the
    /// membership source is gone.
    pub fn spawn(
        source: Weak<dyn MembershipSource>,
        transport: Arc<dyn Transport>,
        local_url: String,
        timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<StartupRequest>();
        let handle = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let Some(source) = source.upgrade() else {
                    break;
                };
                let notice = source.run_notice(&request);
                drop(source);
                let Some(notice) = notice else {
                    STARTUP_NOTIFICATIONS.with_label_values(&["dropped"]).inc();
                    info!(
                        session_id = %request.session_id,
                        service_id = request.service_id,
                        "session gone, dropping run notification"
                    );
                    continue;
                };
                let outbound = Outbound::action(
                    local_url.as_str(),
                    request.url.as_str(),
                    DeliveryClass::Execute,
                    &Action::Run(notice),
                    timeout,
                );
                match transport.send(outbound).await {
                    Ok(_) => {
                        STARTUP_NOTIFICATIONS.with_label_values(&["sent"]).inc();
                        debug!(
                            session_id = %request.session_id,
                            service_id = request.service_id,
                            service = %request.name,
                            "run notification sent"
                        );
                    }
                    Err(err) => {
                        STARTUP_NOTIFICATIONS.with_label_values(&["failed"]).inc();
                        warn!(
                            session_id = %request.session_id,
                            service_id = request.service_id,
                            url = %request.url,
                            error = %err,
                            "run notification failed"
                        );
                    }
                }
            }
            debug!("startup dispatch consumer exited");
        });
        (Self { tx }, handle)
    }

    /// Never blocks. Returns `false` only when the consumer has exited.
    pub fn enqueue(&self, request: StartupRequest) -> bool {
        self.tx.send(request).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use harbor_transport::RecordingTransport;
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Sessions {
        open: Mutex<HashSet<String>>,
    }

    impl MembershipSource for Sessions {
        fn run_notice(&self, request: &StartupRequest) -> Option<RunNotice> {
            self.open.lock().contains(&request.session_id).then(|| RunNotice {
                session_id: request.session_id.clone(),
                service_id: request.service_id,
                credentials: request.credentials.clone(),
                members: Vec::new(),
            })
        }
    }

    fn request(session: &str, id: ServiceId) -> StartupRequest {
        StartupRequest {
            session_id: session.into(),
            service_id: id,
            name: format!("svc{id}"),
            service_type: "T".into(),
            url: format!("http://svc{id}"),
            credentials: Value::Null,
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn dispatches_in_fifo_order_and_drops_closed_sessions() {
        let sessions = Arc::new(Sessions::default());
        sessions.open.lock().insert("s1".into());
        let recording = RecordingTransport::new();
        let weak: Weak<dyn MembershipSource> = Arc::downgrade(&sessions) as Weak<dyn MembershipSource>;
        let (queue, _consumer) = StartupDispatchQueue::spawn(
            weak,
            recording.clone(),
            "http://lss".into(),
            Duration::from_secs(1),
        );

        for id in 1..=5 {
            assert!(queue.enqueue(request("s1", id)));
        }
        assert!(queue.enqueue(request("gone", 9)));

        assert!(
            recording
                .wait_for(Duration::from_secs(5), |sent| sent.len() == 5)
                .await
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        let order: Vec<_> = recording
            .actions_named("run")
            .into_iter()
            .map(|(to, _)| to)
            .collect();
        assert_eq!(
            order,
            (1..=5).map(|id| format!("http://svc{id}")).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn failed_sends_are_not_retried() {
        let sessions = Arc::new(Sessions::default());
        sessions.open.lock().insert("s1".into());
        let recording = RecordingTransport::new();
        recording.set_unreachable("http://svc1", true);
        let weak: Weak<dyn MembershipSource> = Arc::downgrade(&sessions) as Weak<dyn MembershipSource>;
        let (queue, _consumer) = StartupDispatchQueue::spawn(
            weak,
            recording.clone(),
            "http://lss".into(),
            Duration::from_secs(1),
        );
        queue.enqueue(request("s1", 1));
        queue.enqueue(request("s1", 2));
        assert!(
            recording
                .wait_for(Duration::from_secs(5), |sent| sent.len() == 2)
                .await
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recording.sent_to("http://svc1").len(), 1);
    }
}
