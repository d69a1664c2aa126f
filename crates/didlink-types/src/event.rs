//! Event types published on an agent's event bus.

use crate::connection::{
    AbandonReason, ConnectionId, ConnectionRole, ConnectionState, InvitationId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Create a new random EventId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discriminant used to subscribe to a class of events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConnectionStateChanged,
    HandshakeTimedOut,
}

/// A connection record moved between states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub connection_id: ConnectionId,
    pub out_of_band_id: InvitationId,
    pub role: ConnectionRole,
    /// `None` when the record was just created.
    pub previous_state: Option<ConnectionState>,
    pub new_state: ConnectionState,
    /// Set when `new_state` is `Abandoned`.
    pub reason: Option<AbandonReason>,
}

/// A record exceeded the dwell time of its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutNotice {
    pub connection_id: ConnectionId,
    pub out_of_band_id: InvitationId,
    pub expired_state: ConnectionState,
    pub dwell_ms: u64,
}

/// The payload of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    ConnectionStateChanged(StateChange),
    HandshakeTimedOut(TimeoutNotice),
}

/// An event on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn state_changed(change: StateChange) -> Self {
        Self::new(EventPayload::ConnectionStateChanged(change))
    }

    pub fn timed_out(notice: TimeoutNotice) -> Self {
        Self::new(EventPayload::HandshakeTimedOut(notice))
    }

    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::ConnectionStateChanged(_) => EventKind::ConnectionStateChanged,
            EventPayload::HandshakeTimedOut(_) => EventKind::HandshakeTimedOut,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        match &self.payload {
            EventPayload::ConnectionStateChanged(c) => c.connection_id,
            EventPayload::HandshakeTimedOut(t) => t.connection_id,
        }
    }

    pub fn out_of_band_id(&self) -> &InvitationId {
        match &self.payload {
            EventPayload::ConnectionStateChanged(c) => &c.out_of_band_id,
            EventPayload::HandshakeTimedOut(t) => &t.out_of_band_id,
        }
    }

    /// The state change carried by this event, if it is one.
    pub fn as_state_change(&self) -> Option<&StateChange> {
        match &self.payload {
            EventPayload::ConnectionStateChanged(c) => Some(c),
            _ => None,
        }
    }
}
