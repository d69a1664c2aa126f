//! Connection records and the handshake state lattice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random ConnectionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of an out-of-band invitation (the `@id` field).
///
/// Locally issued ids are UUID v4; ids of received invitations are kept
/// verbatim, whatever their format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvitationId(String);

impl InvitationId {
    /// Generate a fresh, unguessable invitation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for InvitationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for InvitationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for InvitationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handshake state of a connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Invited,
    Requested,
    Responded,
    /// Terminal success: the connection is ready for use.
    Completed,
    /// Terminal failure.
    Abandoned,
}

impl ConnectionState {
    fn rank(self) -> u8 {
        match self {
            Self::Invited => 0,
            Self::Requested => 1,
            Self::Responded => 2,
            Self::Completed => 3,
            Self::Abandoned => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned)
    }

    /// Whether moving from `self` to `next` respects the lattice: strictly
    /// forward one step along the happy path, or into `Abandoned` from any
    /// non-terminal state.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Abandoned => true,
            Self::Invited => false,
            _ => next.rank() == self.rank() + 1,
        }
    }

    /// Whether `self` is at or past `other` on the happy path.
    pub fn has_reached(self, other: ConnectionState) -> bool {
        self != Self::Abandoned && other != Self::Abandoned && self.rank() >= other.rank()
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Invited => "invited",
            Self::Requested => "requested",
            Self::Responded => "responded",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// Which side of the invitation this agent is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    Inviter,
    Invitee,
}

impl std::fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inviter => f.write_str("inviter"),
            Self::Invitee => f.write_str("invitee"),
        }
    }
}

/// Which handshake protocol a record runs, fixed by the invitation shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeProtocol {
    /// DID exchange, started from a standard out-of-band invitation.
    DidExchange,
    /// Connections 1.0, started from a legacy invitation.
    Connections,
}

impl std::fmt::Display for HandshakeProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DidExchange => f.write_str("didexchange/1.0"),
            Self::Connections => f.write_str("connections/1.0"),
        }
    }
}

/// Why a record ended up `Abandoned`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbandonReason {
    /// The record sat in `state` longer than its configured dwell time.
    Timeout { state: ConnectionState },
    /// The peer's response signature did not verify.
    SignatureVerificationFailed { detail: String },
    /// The peer reported a protocol problem.
    ProblemReport { code: String, explain: String },
    /// Abandoned on request of the local agent.
    Cancelled { detail: String },
}

impl AbandonReason {
    /// Short code carried in problem reports sent to the peer.
    pub fn code(&self) -> &str {
        match self {
            Self::Timeout { .. } => "handshake_timeout",
            Self::SignatureVerificationFailed { .. } => "response_not_accepted",
            Self::ProblemReport { code, .. } => code,
            Self::Cancelled { .. } => "abandoned",
        }
    }
}

impl std::fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { state } => write!(f, "timed out in state {state}"),
            Self::SignatureVerificationFailed { detail } => {
                write!(f, "signature verification failed: {detail}")
            }
            Self::ProblemReport { code, explain } => {
                write!(f, "peer reported problem {code}: {explain}")
            }
            Self::Cancelled { detail } => write!(f, "cancelled: {detail}"),
        }
    }
}

/// The stateful entity tracking one handshake attempt.
///
/// Only the connection manager mutates records; everyone else sees clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    /// Invitation that originated this record (non-owning).
    pub out_of_band_id: InvitationId,
    pub role: ConnectionRole,
    pub protocol: HandshakeProtocol,
    pub state: ConnectionState,
    /// Thread id of the handshake (the request's `@id`).
    pub thread_id: Option<String>,
    pub their_label: Option<String>,
    pub their_endpoint: Option<String>,
    /// The peer's public key, hex encoded.
    pub their_key: Option<String>,
    pub abandon_reason: Option<AbandonReason>,
    pub created_at: DateTime<Utc>,
    /// When the current state was entered.
    pub updated_at: DateTime<Utc>,
}

impl ConnectionRecord {
    /// A fresh record in `Invited`.
    pub fn invited(
        out_of_band_id: InvitationId,
        role: ConnectionRole,
        protocol: HandshakeProtocol,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ConnectionId::new(),
            out_of_band_id,
            role,
            protocol,
            state: ConnectionState::Invited,
            thread_id: None,
            their_label: None,
            their_endpoint: None,
            their_key: None,
            abandon_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ConnectionState; 5] = [
        ConnectionState::Invited,
        ConnectionState::Requested,
        ConnectionState::Responded,
        ConnectionState::Completed,
        ConnectionState::Abandoned,
    ];

    #[test]
    fn test_happy_path_is_single_steps() {
        use ConnectionState::*;
        assert!(Invited.can_transition_to(Requested));
        assert!(Requested.can_transition_to(Responded));
        assert!(Responded.can_transition_to(Completed));
        assert!(!Invited.can_transition_to(Responded));
        assert!(!Invited.can_transition_to(Completed));
    }

    #[test]
    fn test_never_regresses() {
        for from in ALL {
            for to in ALL {
                if from.can_transition_to(to) && to != ConnectionState::Abandoned {
                    assert!(to.rank() > from.rank(), "{from} -> {to} regresses");
                }
            }
        }
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        for to in ALL {
            assert!(!ConnectionState::Completed.can_transition_to(to));
            assert!(!ConnectionState::Abandoned.can_transition_to(to));
        }
    }

    #[test]
    fn test_abandon_from_any_non_terminal() {
        for from in ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(ConnectionState::Abandoned));
        }
    }

    #[test]
    fn test_has_reached() {
        assert!(ConnectionState::Completed.has_reached(ConnectionState::Requested));
        assert!(!ConnectionState::Invited.has_reached(ConnectionState::Requested));
        assert!(!ConnectionState::Abandoned.has_reached(ConnectionState::Invited));
    }

    #[test]
    fn test_record_serializes_state_snake_case() {
        let record = ConnectionRecord::invited(
            InvitationId::from("inv-1"),
            ConnectionRole::Inviter,
            HandshakeProtocol::DidExchange,
        );
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"state\":\"invited\""));
        assert!(json.contains("\"out_of_band_id\":\"inv-1\""));
        let back: ConnectionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
