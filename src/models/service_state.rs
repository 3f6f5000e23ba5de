use nostr_sdk::prelude::*;
use serde_json::{Value, json};

use crate::error::ProtocolError;
use crate::models::relay::{NetworkType, Relay};

/// Pipeline services that own rows in the `service_state` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceName {
    Seeder,
    Finder,
    Validator,
    Monitor,
    Synchronizer,
}

impl ServiceName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::Seeder => "seeder",
            ServiceName::Finder => "finder",
            ServiceName::Validator => "validator",
            ServiceName::Monitor => "monitor",
            ServiceName::Synchronizer => "synchronizer",
        }
    }
}

impl ServiceName {
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            "seeder" => Ok(ServiceName::Seeder),
            "finder" => Ok(ServiceName::Finder),
            "validator" => Ok(ServiceName::Validator),
            "monitor" => Ok(ServiceName::Monitor),
            "synchronizer" => Ok(ServiceName::Synchronizer),
            other => Err(ProtocolError::InvalidServiceState(format!(
                "unknown service name {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of state a service persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateType {
    Cursor,
    Candidate,
    Other,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Cursor => "cursor",
            StateType::Candidate => "candidate",
            StateType::Other => "other",
        }
    }
}

impl StateType {
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            "cursor" => Ok(StateType::Cursor),
            "candidate" => Ok(StateType::Candidate),
            "other" => Ok(StateType::Other),
            other => Err(ProtocolError::InvalidServiceState(format!(
                "unknown state type {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the shared pipeline state table.
///
/// Keyed by (service, type, key); upserts are last-writer-wins on
/// `updated_at`. The value shape is owned by the writing service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    pub service_name: ServiceName,
    pub state_type: StateType,
    pub state_key: String,
    pub state_value: Value,
    pub updated_at: i64,
}

impl ServiceState {
    pub fn new(
        service_name: ServiceName,
        state_type: StateType,
        state_key: impl Into<String>,
        state_value: Value,
        updated_at: i64,
    ) -> Result<Self, ProtocolError> {
        if updated_at < 0 {
            return Err(ProtocolError::InvalidServiceState(format!(
                "updated_at must be non-negative, got {updated_at}"
            )));
        }
        let state_key = state_key.into();
        if state_key.is_empty() {
            return Err(ProtocolError::InvalidServiceState(
                "state_key must not be empty".to_string(),
            ));
        }
        Ok(Self {
            service_name,
            state_type,
            state_key,
            state_value,
            updated_at,
        })
    }
}

/// A relay URL awaiting protocol validation.
///
/// View over a `(service=*, type=candidate)` state row: the key is the
/// relay URL, the value carries the detected network and the failure
/// counter maintained by the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub relay: Relay,
    pub failures: u32,
}

impl Candidate {
    pub fn new(relay: Relay) -> Self {
        Self { relay, failures: 0 }
    }

    pub fn network(&self) -> NetworkType {
        self.relay.network()
    }

    /// State row representing this candidate. The candidate set belongs
    /// to the validator (its consumer); seeder and finder insert rows
    /// under that name.
    pub fn to_state(&self, owner: ServiceName, updated_at: i64) -> Result<ServiceState, ProtocolError> {
        ServiceState::new(
            owner,
            StateType::Candidate,
            self.relay.url(),
            json!({
                "network": self.network().as_str(),
                "failures": self.failures,
            }),
            updated_at,
        )
    }

    /// Rebuild a candidate from a state row, tolerating missing fields.
    pub fn from_state(state: &ServiceState) -> Result<Self, ProtocolError> {
        let relay = Relay::parse(&state.state_key)?;
        let failures = state
            .state_value
            .get("failures")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        Ok(Self { relay, failures })
    }
}

/// Per-relay scanning position of the synchronizer.
///
/// `event_id` is only meaningful alongside `seen_at`; a lone event id is
/// rejected at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRelayCursor {
    pub relay_url: String,
    pub seen_at: Option<i64>,
    pub event_id: Option<EventId>,
}

impl EventRelayCursor {
    pub fn new(
        relay_url: impl Into<String>,
        seen_at: Option<i64>,
        event_id: Option<EventId>,
    ) -> Result<Self, ProtocolError> {
        if seen_at.is_none() && event_id.is_some() {
            return Err(ProtocolError::InvalidServiceState(
                "event_id requires seen_at".to_string(),
            ));
        }
        Ok(Self {
            relay_url: relay_url.into(),
            seen_at,
            event_id,
        })
    }

    pub fn empty(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            seen_at: None,
            event_id: None,
        }
    }

    pub fn to_state(&self, updated_at: i64) -> Result<ServiceState, ProtocolError> {
        ServiceState::new(
            ServiceName::Synchronizer,
            StateType::Cursor,
            &self.relay_url,
            json!({
                "seen_at": self.seen_at,
                "event_id": self.event_id.map(|id| id.to_hex()),
            }),
            updated_at,
        )
    }

    pub fn from_state(state: &ServiceState) -> Result<Self, ProtocolError> {
        let seen_at = state.state_value.get("seen_at").and_then(Value::as_i64);
        let event_id = match state.state_value.get("event_id").and_then(Value::as_str) {
            Some(hex) => Some(
                EventId::from_hex(hex)
                    .map_err(|e| ProtocolError::InvalidServiceState(format!("event_id: {e}")))?,
            ),
            None => None,
        };
        Self::new(state.state_key.clone(), seen_at, event_id)
    }
}
