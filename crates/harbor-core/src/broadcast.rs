use std::sync::Arc;
use std::time::Duration;

use harbor_proto::{Action, ServiceId};
use harbor_transport::{send_async, DeliveryClass, Outbound, Transport};
use tracing::warn;

use crate::metrics::BROADCAST_DELIVERIES;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub service_id: ServiceId,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// One recipient after the other; failures are logged and skipped.
    Synchronous,
    /// Fire every send without waiting.
    Asynchronous,
}

/// Alive, visible, broadcast-receiving slots other than `sender`.
pub fn broadcast_recipients(session: &Session, sender: Option<ServiceId>) -> Vec<Recipient> {
    session
        .slots()
        .filter(|s| s.is_alive() && s.receives_broadcast && s.visible)
        .filter(|s| Some(s.id) != sender && !s.url.is_empty())
        .map(|s| Recipient {
            service_id: s.id,
            url: s.url.clone(),
        })
        .collect()
}

/// Every alive slot with a url other than `except`, regardless of visibility.
pub fn notice_recipients(session: &Session, except: Option<ServiceId>) -> Vec<Recipient> {
    session
        .reachable_alive(except)
        .into_iter()
        .map(|(service_id, url)| Recipient { service_id, url })
        .collect()
}

/// Sends one action to a snapshot of recipients.
#[derive(Clone)]
pub struct Broadcaster {
    transport: Arc<dyn Transport>,
    local_url: String,
    timeout: Duration,
}

impl Broadcaster {
    pub fn new(transport: Arc<dyn Transport>, local_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            transport,
            local_url: local_url.into(),
            timeout,
        }
    }

    /// Returns the number of recipients that acknowledged (synchronous) or were
    /// dispatched to (asynchronous).
    pub async fn deliver(
        &self,
        recipients: &[Recipient],
        class: DeliveryClass,
        action: &Action,
        mode: Delivery,
    ) -> usize {
        let mut delivered = 0;
        for recipient in recipients {
            let outbound = Outbound::action(
                self.local_url.as_str(),
                recipient.url.as_str(),
                class,
                action,
                self.timeout,
            );
            match mode {
                Delivery::Asynchronous => {
                    send_async(&self.transport, outbound);
                    BROADCAST_DELIVERIES.with_label_values(&["dispatched"]).inc();
                    delivered += 1;
                }
                Delivery::Synchronous => match self.transport.send(outbound).await {
                    Ok(_) => {
                        BROADCAST_DELIVERIES.with_label_values(&["delivered"]).inc();
                        delivered += 1;
                    }
                    Err(err) => {
                        BROADCAST_DELIVERIES.with_label_values(&["failed"]).inc();
                        warn!(
                            action = action.name(),
                            service_id = recipient.service_id,
                            url = %recipient.url,
                            error = %err,
                            "notice delivery failed"
                        );
                    }
                },
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use harbor_proto::{CreateSessionRequest, SessionNotice};
    use harbor_transport::RecordingTransport;
    use serde_json::Value;

    use super::*;
    use crate::session::SlotState;

    fn session_with(slots: &[(&str, bool, bool)]) -> Session {
        let mut session = Session::from_request(&CreateSessionRequest {
            session_id: "s1".into(),
            user_name: "ada".into(),
            project_name: String::new(),
            collection_name: String::new(),
            session_type: "custom".into(),
            credentials: Value::Null,
            service_name: "ui".into(),
            service_type: "UI".into(),
            service_url: String::new(),
            start_relay: false,
        });
        for (name, receives, visible) in slots {
            let slot = session.add_slot(*name, *name).unwrap();
            slot.url = format!("http://{name}");
            slot.receives_broadcast = *receives;
            slot.visible = *visible;
            slot.advance(SlotState::Alive).unwrap();
        }
        session
    }

    #[test]
    fn excludes_sender_non_receivers_and_hidden() {
        let session = session_with(&[
            ("a", true, true),
            ("b", true, true),
            ("quiet", false, true),
            ("hidden", true, false),
            ("c", true, true),
        ]);
        let ids: Vec<_> = broadcast_recipients(&session, Some(2))
            .into_iter()
            .map(|r| r.service_id)
            .collect();
        assert_eq!(ids, vec![1, 5]);
        assert_eq!(notice_recipients(&session, Some(2)).len(), 4);
    }

    #[tokio::test]
    async fn synchronous_delivery_continues_past_failures() {
        let session = session_with(&[("a", true, true), ("b", true, true), ("c", true, true)]);
        let recording = RecordingTransport::new();
        recording.set_unreachable("http://b", true);
        let broadcaster = Broadcaster::new(recording.clone(), "http://lss", Duration::from_secs(1));

        let action = Action::Broadcast(SessionNotice::new("s1").with_message("hi"));
        let delivered = broadcaster
            .deliver(
                &broadcast_recipients(&session, None),
                DeliveryClass::Execute,
                &action,
                Delivery::Synchronous,
            )
            .await;
        assert_eq!(delivered, 2);
        assert_eq!(recording.actions_named("broadcast").len(), 3);
    }
}
