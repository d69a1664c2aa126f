//! Accept policy: whether the next local handshake step runs on its own.

use didlink_types::config::ConnectionsConfig;
use didlink_types::connection::{ConnectionRecord, ConnectionRole, ConnectionState};
use std::sync::Arc;

/// A step this agent has to take to move a record forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingStep {
    /// Invitee in `Invited`: send the connection request.
    SendRequest,
    /// Inviter in `Requested`: send the signed response.
    SendResponse,
    /// Invitee in `Responded`: send the acknowledgment.
    SendAck,
}

impl PendingStep {
    /// The local step owed for a record in `state`, if any. Every other
    /// combination is waiting on the peer or finished.
    pub fn for_record(role: ConnectionRole, state: ConnectionState) -> Option<Self> {
        match (role, state) {
            (ConnectionRole::Invitee, ConnectionState::Invited) => Some(Self::SendRequest),
            (ConnectionRole::Inviter, ConnectionState::Requested) => Some(Self::SendResponse),
            (ConnectionRole::Invitee, ConnectionState::Responded) => Some(Self::SendAck),
            _ => None,
        }
    }
}

impl std::fmt::Display for PendingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendRequest => f.write_str("send_request"),
            Self::SendResponse => f.write_str("send_response"),
            Self::SendAck => f.write_str("send_ack"),
        }
    }
}

/// Consulted once after every transition that leaves a local step pending.
pub trait AcceptPolicy: Send + Sync {
    fn may_proceed(&self, record: &ConnectionRecord, step: PendingStep) -> bool;
}

/// Take every step immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAccept;

impl AcceptPolicy for AutoAccept {
    fn may_proceed(&self, _record: &ConnectionRecord, _step: PendingStep) -> bool {
        true
    }
}

/// Wait for an explicit `approve` before every step.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualApproval;

impl AcceptPolicy for ManualApproval {
    fn may_proceed(&self, _record: &ConnectionRecord, _step: PendingStep) -> bool {
        false
    }
}

/// The policy selected by `connections.auto_accept`.
pub fn policy_from_config(config: &ConnectionsConfig) -> Arc<dyn AcceptPolicy> {
    if config.auto_accept {
        Arc::new(AutoAccept)
    } else {
        Arc::new(ManualApproval)
    }
}
