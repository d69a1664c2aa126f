//! Shared error types for didlink.

use crate::connection::{ConnectionId, ConnectionState, HandshakeProtocol};
use thiserror::Error;

/// Errors reported by a transport gateway.
#[derive(Error, Debug)]
pub enum TransportError {
    /// No route to the endpoint.
    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),

    /// The remote side refused the message.
    #[error("Rejected by {endpoint}: {reason}")]
    Rejected {
        /// Where the message was sent.
        endpoint: String,
        /// What the remote said.
        reason: String,
    },

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error type for didlink.
#[derive(Error, Debug)]
pub enum DidLinkError {
    /// The invitation payload does not decode to valid JSON.
    #[error("Malformed invitation: {0}")]
    MalformedInvitation(String),

    /// The payload matches neither the standard nor the legacy shape.
    #[error("Unsupported invitation shape: {0}")]
    UnsupportedInvitationShape(String),

    /// A handshake message referenced an invitation this agent does not know.
    #[error("Unknown invitation: {0}")]
    UnknownInvitation(String),

    /// The handshake step was already taken for this record.
    #[error("Duplicate request for connection {connection_id} (state '{state}')")]
    DuplicateRequest {
        /// The record that rejected the message.
        connection_id: ConnectionId,
        /// Its state at the time.
        state: ConnectionState,
    },

    /// The peer's response signature did not verify.
    #[error("Signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    /// The record exceeded its dwell time.
    #[error("Handshake timed out for connection {connection_id} in state '{state}'")]
    HandshakeTimeout {
        /// The record that expired.
        connection_id: ConnectionId,
        /// The state it expired in.
        state: ConnectionState,
    },

    /// Propagated from the transport gateway; never retried here.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The identity has no service endpoint to put in an invitation.
    #[error("Identity '{0}' has no service endpoint")]
    MissingServiceEndpoint(String),

    /// The invitation was already received by this agent.
    #[error("Invitation already received: {0}")]
    InvitationAlreadyReceived(String),

    /// The requested connection record was not found.
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// The record is in the wrong state for the requested operation.
    #[error("Connection is in invalid state '{current}' for operation '{operation}'")]
    InvalidState {
        /// The current state of the record.
        current: ConnectionState,
        /// The operation that was attempted.
        operation: String,
    },

    /// A message of one handshake protocol arrived for a record of the other.
    #[error("Protocol mismatch: record runs {expected}, message is {got}")]
    ProtocolMismatch {
        /// The record's protocol.
        expected: HandshakeProtocol,
        /// The message's protocol.
        got: HandshakeProtocol,
    },

    /// A handshake message could not be decoded.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The key service failed.
    #[error("Key service error: {0}")]
    Key(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON encoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Alias for Result with DidLinkError.
pub type DidLinkResult<T> = Result<T, DidLinkError>;
