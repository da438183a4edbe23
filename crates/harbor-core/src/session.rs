use harbor_proto::{CreateSessionRequest, MemberInfo, ServiceId, SessionSummary, SlotSummary};
use serde_json::Value;
use thiserror::Error;

use crate::error::ControlError;
use crate::health::HealthCheckHandle;
use crate::ids::IdAllocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Created,
    Initializing,
    Active,
    ShuttingDown,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Initializing => "initializing",
            SessionState::Active => "active",
            SessionState::ShuttingDown => "shutting_down",
            SessionState::Closed => "closed",
        }
    }

    pub fn is_closing(self) -> bool {
        matches!(self, SessionState::ShuttingDown | SessionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Requested,
    Alive,
    ShuttingDown,
    Disconnected,
}

impl SlotState {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotState::Requested => "requested",
            SlotState::Alive => "alive",
            SlotState::ShuttingDown => "shutting_down",
            SlotState::Disconnected => "disconnected",
        }
    }

    fn successor(self) -> Option<SlotState> {
        match self {
            SlotState::Requested => Some(SlotState::Alive),
            SlotState::Alive => Some(SlotState::ShuttingDown),
            SlotState::ShuttingDown => Some(SlotState::Disconnected),
            SlotState::Disconnected => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("slot cannot move from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: SlotState,
    pub to: SlotState,
}

/// One worker process bound to a session.
#[derive(Debug, Clone)]
pub struct ServiceSlot {
    pub id: ServiceId,
    pub name: String,
    pub service_type: String,
    pub url: String,
    pub websocket_url: Option<String>,
    pub debug_hosted: bool,
    pub receives_broadcast: bool,
    pub visible: bool,
    /// Part of the session's mandatory set; gates activation.
    pub mandatory: bool,
    pub run_dispatched: bool,
    state: SlotState,
}

impl ServiceSlot {
    pub fn new(id: ServiceId, name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            service_type: service_type.into(),
            url: String::new(),
            websocket_url: None,
            debug_hosted: false,
            receives_broadcast: true,
            visible: true,
            mandatory: false,
            run_dispatched: false,
            state: SlotState::Requested,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state == SlotState::Alive
    }

    /// Move one step along `Requested → Alive → ShuttingDown → Disconnected`.
    pub fn advance(&mut self, next: SlotState) -> Result<(), InvalidTransition> {
        if self.state.successor() == Some(next) {
            self.state = next;
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self.state,
                to: next,
            })
        }
    }

    pub fn member_info(&self) -> MemberInfo {
        MemberInfo {
            service_id: self.id,
            name: self.name.clone(),
            service_type: self.service_type.clone(),
            url: self.url.clone(),
            websocket_url: self.websocket_url.clone(),
        }
    }

    pub fn summary(&self) -> SlotSummary {
        SlotSummary {
            service_id: self.id,
            name: self.name.clone(),
            service_type: self.service_type.clone(),
            url: self.url.clone(),
            state: self.state.as_str().to_string(),
            visible: self.visible,
            debug_hosted: self.debug_hosted,
        }
    }
}

pub struct Session {
    pub id: String,
    pub user_name: String,
    pub project_name: String,
    pub collection_name: String,
    pub session_type: String,
    pub credentials: Value,
    state: SessionState,
    slots: Vec<ServiceSlot>,
    ids: IdAllocator,
    health: Option<HealthCheckHandle>,
    emergency: bool,
}

impl Session {
    pub fn from_request(req: &CreateSessionRequest) -> Self {
        Self {
            id: req.session_id.clone(),
            user_name: req.user_name.clone(),
            project_name: req.project_name.clone(),
            collection_name: req.collection_name.clone(),
            session_type: req.session_type.clone(),
            credentials: req.credentials.clone(),
            state: SessionState::Created,
            slots: Vec::new(),
            ids: IdAllocator::new(),
            health: None,
            emergency: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Forward-only state change. Returns `false` if `next` is not ahead of the
    /// current state.
    pub fn advance_state(&mut self, next: SessionState) -> bool {
        if next > self.state {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Claim the emergency teardown. Only the first caller gets `true`.
    pub fn begin_emergency(&mut self) -> bool {
        !std::mem::replace(&mut self.emergency, true)
    }

    pub fn add_slot(
        &mut self,
        name: impl Into<String>,
        service_type: impl Into<String>,
    ) -> Result<&mut ServiceSlot, ControlError> {
        if self.state.is_closing() {
            return Err(ControlError::SessionShuttingDown(self.id.clone()));
        }
        let id = self.ids.grab_next_id();
        self.slots.push(ServiceSlot::new(id, name, service_type));
        let last = self.slots.len() - 1;
        Ok(&mut self.slots[last])
    }

    pub fn slot(&self, id: ServiceId) -> Option<&ServiceSlot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn slot_mut(&mut self, id: ServiceId) -> Option<&mut ServiceSlot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }

    pub fn require_slot_mut(&mut self, id: ServiceId) -> Result<&mut ServiceSlot, ControlError> {
        let session_id = self.id.clone();
        self.slot_mut(id)
            .ok_or_else(|| ControlError::service_not_found(&session_id, id))
    }

    /// First slot with the given name and type.
    pub fn find_slot(&self, name: &str, service_type: &str) -> Option<ServiceId> {
        self.slots
            .iter()
            .find(|s| s.name == name && s.service_type == service_type)
            .map(|s| s.id)
    }

    pub fn remove_slot(&mut self, id: ServiceId) -> Option<ServiceSlot> {
        let index = self.slots.iter().position(|s| s.id == id)?;
        let slot = self.slots.remove(index);
        self.ids.free_id(id);
        Some(slot)
    }

    pub fn slots(&self) -> impl Iterator<Item = &ServiceSlot> {
        self.slots.iter()
    }

    pub fn slots_mut(&mut self) -> impl Iterator<Item = &mut ServiceSlot> {
        self.slots.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn pending_mandatory(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.mandatory && s.state == SlotState::Requested)
            .count()
    }

    /// Alive, visible members in slot order.
    pub fn members(&self) -> Vec<MemberInfo> {
        self.slots
            .iter()
            .filter(|s| s.is_alive() && s.visible)
            .map(ServiceSlot::member_info)
            .collect()
    }

    /// `(id, url)` of every alive slot with a known url, optionally skipping one.
    pub fn reachable_alive(&self, except: Option<ServiceId>) -> Vec<(ServiceId, String)> {
        self.slots
            .iter()
            .filter(|s| s.is_alive() && !s.url.is_empty() && Some(s.id) != except)
            .map(|s| (s.id, s.url.clone()))
            .collect()
    }

    pub fn set_health(&mut self, handle: HealthCheckHandle) {
        self.health = Some(handle);
    }

    pub fn take_health(&mut self) -> Option<HealthCheckHandle> {
        self.health.take()
    }

    pub fn has_health_loop(&self) -> bool {
        self.health.as_ref().is_some_and(HealthCheckHandle::is_running)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            user_name: self.user_name.clone(),
            project_name: self.project_name.clone(),
            session_type: self.session_type.clone(),
            state: self.state.as_str().to_string(),
            services: self.slots.iter().map(ServiceSlot::summary).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::from_request(&CreateSessionRequest {
            session_id: "s1".into(),
            user_name: "ada".into(),
            project_name: "wing".into(),
            collection_name: "c1".into(),
            session_type: "development".into(),
            credentials: Value::Null,
            service_name: "ui".into(),
            service_type: "UI".into(),
            service_url: "http://ui".into(),
            start_relay: false,
        })
    }

    #[test]
    fn slot_transitions_only_move_forward() {
        let mut slot = ServiceSlot::new(1, "Model", "Model");
        assert!(slot.advance(SlotState::ShuttingDown).is_err());
        slot.advance(SlotState::Alive).unwrap();
        assert!(slot.advance(SlotState::Requested).is_err());
        assert!(slot.advance(SlotState::Alive).is_err());
        slot.advance(SlotState::ShuttingDown).unwrap();
        slot.advance(SlotState::Disconnected).unwrap();
        let err = slot.advance(SlotState::Alive).unwrap_err();
        assert_eq!(err.from, SlotState::Disconnected);
        assert_eq!(slot.state(), SlotState::Disconnected);
    }

    #[test]
    fn session_state_never_moves_back() {
        let mut s = session();
        assert!(s.advance_state(SessionState::Initializing));
        assert!(s.advance_state(SessionState::Active));
        assert!(!s.advance_state(SessionState::Initializing));
        assert!(s.advance_state(SessionState::ShuttingDown));
        assert_eq!(s.state(), SessionState::ShuttingDown);
    }

    #[test]
    fn emergency_is_claimed_once() {
        let mut s = session();
        assert!(s.begin_emergency());
        assert!(!s.begin_emergency());
    }

    #[test]
    fn closing_session_rejects_new_slots() {
        let mut s = session();
        s.add_slot("ui", "UI").unwrap();
        s.advance_state(SessionState::ShuttingDown);
        assert!(matches!(
            s.add_slot("late", "Model"),
            Err(ControlError::SessionShuttingDown(_))
        ));
    }

    #[test]
    fn removed_slot_ids_are_reused() {
        let mut s = session();
        let a = s.add_slot("a", "A").unwrap().id;
        let b = s.add_slot("b", "B").unwrap().id;
        let c = s.add_slot("c", "C").unwrap().id;
        assert_eq!((a, b, c), (1, 2, 3));
        s.remove_slot(b).unwrap();
        assert_eq!(s.add_slot("d", "D").unwrap().id, 2);
        assert!(s.remove_slot(b).is_some());
        assert!(s.remove_slot(b).is_none());
    }

    #[test]
    fn members_are_alive_and_visible() {
        let mut s = session();
        let ui = s.add_slot("ui", "UI").unwrap();
        ui.url = "http://ui".into();
        ui.advance(SlotState::Alive).unwrap();
        let hidden = s.add_slot("hidden", "Model").unwrap();
        hidden.url = "http://hidden".into();
        hidden.visible = false;
        hidden.advance(SlotState::Alive).unwrap();
        s.add_slot("pending", "Model").unwrap().mandatory = true;

        let members: Vec<_> = s.members().into_iter().map(|m| m.name).collect();
        assert_eq!(members, vec!["ui"]);
        assert_eq!(s.pending_mandatory(), 1);
        assert_eq!(s.reachable_alive(Some(1)), vec![(2, "http://hidden".to_string())]);
    }
}
