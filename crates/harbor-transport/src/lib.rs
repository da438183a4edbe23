//! Message transport between harbor processes.
//!
//! The control plane only needs two primitives: a request/response `send` bounded by a
//! timeout, and a fire-and-forget variant. Everything else (encoding, retries, routing)
//! stays with the callers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harbor_proto::Action;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

mod http;
mod memory;

pub use http::HttpTransport;
pub use memory::{RecordingTransport, Responder};

/// Header carrying the url of the sending process.
pub const SENDER_HEADER: &str = "x-harbor-sender";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClass {
    /// Buffered delivery; the receiver may process it later.
    Queue,
    /// Synchronous execute; the response is the handler's reply.
    Execute,
    /// Reduced-trust execute used for administrative pings.
    ExecuteOneWay,
}

impl DeliveryClass {
    pub fn path(self) -> &'static str {
        match self {
            DeliveryClass::Queue => "/queue",
            DeliveryClass::Execute => "/execute",
            DeliveryClass::ExecuteOneWay => "/execute-one-way",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Outbound {
    pub sender: String,
    pub receiver: String,
    pub class: DeliveryClass,
    pub body: String,
    pub timeout: Duration,
}

impl Outbound {
    pub fn action(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        class: DeliveryClass,
        action: &Action,
        timeout: Duration,
    ) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            class,
            body: action.to_json(),
            timeout,
        }
    }

    /// Decode the body back into an action, if it is one.
    pub fn parsed(&self) -> Option<Action> {
        Action::from_json(&self.body).ok()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("request timed out")]
    Timeout,
    #[error("receiver unreachable: {0}")]
    Unreachable(String),
    #[error("unexpected response: expected {expected:?}, got {actual:?}")]
    UnexpectedResponse { expected: String, actual: String },
}

impl TransportError {
    pub fn unexpected(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        TransportError::UnexpectedResponse {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, outbound: Outbound) -> Result<String, TransportError>;
}

/// Fire-and-forget delivery. Failures are only logged.
pub fn send_async(transport: &Arc<dyn Transport>, outbound: Outbound) -> JoinHandle<()> {
    let transport = Arc::clone(transport);
    tokio::spawn(async move {
        let receiver = outbound.receiver.clone();
        if let Err(err) = transport.send(outbound).await {
            debug!(receiver = %receiver, error = %err, "async send failed");
        }
    })
}

/// Send and require the exact `expected` reply.
pub async fn send_expect(
    transport: &dyn Transport,
    outbound: Outbound,
    expected: &str,
) -> Result<(), TransportError> {
    let reply = transport.send(outbound).await?;
    if reply == expected {
        Ok(())
    } else {
        Err(TransportError::unexpected(expected, reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_proto::{REPLY_OK, REPLY_PING};

    #[tokio::test]
    async fn send_expect_checks_reply() {
        let transport = RecordingTransport::new();
        let ping = Outbound::action(
            "http://a",
            "http://b",
            DeliveryClass::ExecuteOneWay,
            &Action::Ping,
            Duration::from_secs(1),
        );
        send_expect(transport.as_ref(), ping.clone(), REPLY_PING)
            .await
            .unwrap();
        let err = send_expect(transport.as_ref(), ping, REPLY_OK)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnexpectedResponse { .. }));
    }

    #[tokio::test]
    async fn send_async_records_delivery() {
        let recording = RecordingTransport::new();
        let transport: Arc<dyn Transport> = recording.clone();
        let handle = send_async(
            &transport,
            Outbound::action(
                "http://a",
                "http://b",
                DeliveryClass::Execute,
                &Action::Ping,
                Duration::from_secs(1),
            ),
        );
        handle.await.unwrap();
        assert_eq!(recording.sent_to("http://b").len(), 1);
    }

    #[test]
    fn bodies_use_the_protocol_encoding() {
        let outbound = Outbound::action(
            "http://a",
            "http://b",
            DeliveryClass::Queue,
            &Action::Ping,
            Duration::from_secs(1),
        );
        assert_eq!(outbound.body, Action::Ping.to_json());
        assert_eq!(outbound.parsed(), Some(Action::Ping));

        let raw = Outbound {
            body: "OK".into(),
            ..outbound
        };
        assert_eq!(raw.parsed(), None);
    }
}
