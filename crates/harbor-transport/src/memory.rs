use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harbor_proto::{Action, REPLY_OK, REPLY_PING};
use parking_lot::Mutex;

use crate::{Outbound, Transport, TransportError};

pub type Responder = Arc<dyn Fn(&Outbound) -> Result<String, TransportError> + Send + Sync>;

/// In-memory transport for tests and local wiring.
///
/// Every send is recorded, including sends to unreachable receivers. Unless a
/// responder is installed for the receiver, pings are answered with `Ping` and
/// everything else with `OK`.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Outbound>>,
    responders: Mutex<HashMap<String, Responder>>,
    unreachable: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond_with<F>(&self, receiver: &str, responder: F)
    where
        F: Fn(&Outbound) -> Result<String, TransportError> + Send + Sync + 'static,
    {
        self.responders
            .lock()
            .insert(receiver.to_string(), Arc::new(responder));
    }

    pub fn set_unreachable(&self, receiver: &str, unreachable: bool) {
        let mut guard = self.unreachable.lock();
        if unreachable {
            guard.insert(receiver.to_string());
        } else {
            guard.remove(receiver);
        }
    }

    pub fn sent(&self) -> Vec<Outbound> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, receiver: &str) -> Vec<Action> {
        self.sent
            .lock()
            .iter()
            .filter(|o| o.receiver == receiver)
            .filter_map(Outbound::parsed)
            .collect()
    }

    /// `(receiver, action)` for every recorded action with the given name.
    pub fn actions_named(&self, name: &str) -> Vec<(String, Action)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|o| o.parsed().map(|a| (o.receiver.clone(), a)))
            .filter(|(_, a)| a.name() == name)
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Poll until `predicate` holds over the recorded sends or `timeout` elapses.
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[Outbound]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(&self.sent.lock()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn default_reply(outbound: &Outbound) -> String {
        match outbound.parsed() {
            Some(Action::Ping) => REPLY_PING.to_string(),
            _ => REPLY_OK.to_string(),
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, outbound: Outbound) -> Result<String, TransportError> {
        self.sent.lock().push(outbound.clone());
        if self.unreachable.lock().contains(&outbound.receiver) {
            return Err(TransportError::Unreachable(outbound.receiver));
        }
        let responder = self.responders.lock().get(&outbound.receiver).cloned();
        match responder {
            Some(responder) => responder(&outbound),
            None => Ok(Self::default_reply(&outbound)),
        }
    }
}
