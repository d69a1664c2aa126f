//! Handshake message types.
//!
//! Every message is a JSON object tagged by `@type`. All messages of one
//! handshake share a thread: `thid` is the request's `@id`, `pthid` is the
//! invitation's `@id`, which is what inbound routing keys on.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use didlink_types::connection::{HandshakeProtocol, InvitationId};
use didlink_types::error::{DidLinkError, DidLinkResult};
use serde::{Deserialize, Serialize};

/// Thread decorator (`~thread`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub thid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pthid: Option<String>,
}

impl Thread {
    pub fn new(thid: impl Into<String>, invitation_id: &InvitationId) -> Self {
        Self {
            thid: thid.into(),
            pthid: Some(invitation_id.to_string()),
        }
    }
}

/// How to reach and authenticate the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Sender's public key (hex).
    pub verkey: String,
    /// Where replies should go. Absent when the sender has no inbound
    /// endpoint; replies then go to the transport source address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub routing_keys: Vec<String>,
}

/// Signature decorator (`connection~sig`) over a serialized [`ConnectionInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureDecorator {
    /// Public key that produced the signature (hex).
    pub signer: String,
    /// base64url of the signed bytes.
    pub sig_data: String,
    /// base64url of the signature.
    pub signature: String,
}

impl SignatureDecorator {
    pub fn new(signer: impl Into<String>, data: &[u8], signature: &[u8]) -> Self {
        Self {
            signer: signer.into(),
            sig_data: URL_SAFE_NO_PAD.encode(data),
            signature: URL_SAFE_NO_PAD.encode(signature),
        }
    }

    pub fn signed_data(&self) -> DidLinkResult<Vec<u8>> {
        URL_SAFE_NO_PAD
            .decode(&self.sig_data)
            .map_err(|e| DidLinkError::MalformedMessage(format!("sigData is not base64url: {e}")))
    }

    pub fn signature_bytes(&self) -> DidLinkResult<Vec<u8>> {
        URL_SAFE_NO_PAD
            .decode(&self.signature)
            .map_err(|e| DidLinkError::MalformedMessage(format!("signature is not base64url: {e}")))
    }

    /// The connection info carried in the signed data.
    pub fn connection_info(&self) -> DidLinkResult<ConnectionInfo> {
        let data = self.signed_data()?;
        serde_json::from_slice(&data)
            .map_err(|e| DidLinkError::MalformedMessage(format!("signed data: {e}")))
    }
}

/// Request: the invitee asks to connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
    pub label: String,
    pub connection: ConnectionInfo,
}

/// Response: the inviter answers with signed connection info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionResponse {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
    #[serde(rename = "connection~sig")]
    pub connection_sig: SignatureDecorator,
}

/// Acknowledgment: the invitee confirms the response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Tells the peer the handshake was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemReport {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
    pub code: String,
    pub explain: String,
}

/// Position of a message in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeStep {
    Request,
    Response,
    Complete,
    ProblemReport,
}

impl std::fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Complete => "complete",
            Self::ProblemReport => "problem_report",
        };
        f.write_str(s)
    }
}

/// A handshake message of either protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum HandshakeMessage {
    #[serde(rename = "https://didcomm.org/didexchange/1.0/request")]
    ExchangeRequest(ConnectionRequest),
    #[serde(rename = "https://didcomm.org/didexchange/1.0/response")]
    ExchangeResponse(ConnectionResponse),
    #[serde(rename = "https://didcomm.org/didexchange/1.0/complete")]
    ExchangeComplete(HandshakeAck),
    #[serde(rename = "https://didcomm.org/connections/1.0/request")]
    LegacyRequest(ConnectionRequest),
    #[serde(rename = "https://didcomm.org/connections/1.0/response")]
    LegacyResponse(ConnectionResponse),
    #[serde(rename = "https://didcomm.org/notification/1.0/ack")]
    LegacyAck(HandshakeAck),
    #[serde(rename = "https://didcomm.org/didexchange/1.0/problem_report")]
    ProblemReport(ProblemReport),
}

/// Fresh message id.
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl HandshakeMessage {
    /// A request; its `@id` starts the thread.
    pub fn request(
        protocol: HandshakeProtocol,
        invitation_id: &InvitationId,
        label: impl Into<String>,
        connection: ConnectionInfo,
    ) -> Self {
        let id = new_message_id();
        let body = ConnectionRequest {
            thread: Thread::new(id.clone(), invitation_id),
            id,
            label: label.into(),
            connection,
        };
        match protocol {
            HandshakeProtocol::DidExchange => Self::ExchangeRequest(body),
            HandshakeProtocol::Connections => Self::LegacyRequest(body),
        }
    }

    pub fn response(
        protocol: HandshakeProtocol,
        thread: Thread,
        connection_sig: SignatureDecorator,
    ) -> Self {
        let body = ConnectionResponse {
            id: new_message_id(),
            thread,
            connection_sig,
        };
        match protocol {
            HandshakeProtocol::DidExchange => Self::ExchangeResponse(body),
            HandshakeProtocol::Connections => Self::LegacyResponse(body),
        }
    }

    pub fn complete(protocol: HandshakeProtocol, thread: Thread) -> Self {
        match protocol {
            HandshakeProtocol::DidExchange => Self::ExchangeComplete(HandshakeAck {
                id: new_message_id(),
                thread,
                status: None,
            }),
            HandshakeProtocol::Connections => Self::LegacyAck(HandshakeAck {
                id: new_message_id(),
                thread,
                status: Some("OK".to_string()),
            }),
        }
    }

    pub fn problem_report(
        thread: Thread,
        code: impl Into<String>,
        explain: impl Into<String>,
    ) -> Self {
        Self::ProblemReport(ProblemReport {
            id: new_message_id(),
            thread,
            code: code.into(),
            explain: explain.into(),
        })
    }

    pub fn step(&self) -> HandshakeStep {
        match self {
            Self::ExchangeRequest(_) | Self::LegacyRequest(_) => HandshakeStep::Request,
            Self::ExchangeResponse(_) | Self::LegacyResponse(_) => HandshakeStep::Response,
            Self::ExchangeComplete(_) | Self::LegacyAck(_) => HandshakeStep::Complete,
            Self::ProblemReport(_) => HandshakeStep::ProblemReport,
        }
    }

    /// The protocol this message belongs to. Problem reports are shared.
    pub fn protocol(&self) -> Option<HandshakeProtocol> {
        match self {
            Self::ExchangeRequest(_) | Self::ExchangeResponse(_) | Self::ExchangeComplete(_) => {
                Some(HandshakeProtocol::DidExchange)
            }
            Self::LegacyRequest(_) | Self::LegacyResponse(_) | Self::LegacyAck(_) => {
                Some(HandshakeProtocol::Connections)
            }
            Self::ProblemReport(_) => None,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::ExchangeRequest(m) | Self::LegacyRequest(m) => &m.id,
            Self::ExchangeResponse(m) | Self::LegacyResponse(m) => &m.id,
            Self::ExchangeComplete(m) | Self::LegacyAck(m) => &m.id,
            Self::ProblemReport(m) => &m.id,
        }
    }

    pub fn thread(&self) -> &Thread {
        match self {
            Self::ExchangeRequest(m) | Self::LegacyRequest(m) => &m.thread,
            Self::ExchangeResponse(m) | Self::LegacyResponse(m) => &m.thread,
            Self::ExchangeComplete(m) | Self::LegacyAck(m) => &m.thread,
            Self::ProblemReport(m) => &m.thread,
        }
    }

    /// The invitation this message refers to (`~thread.pthid`).
    pub fn invitation_id(&self) -> Option<InvitationId> {
        self.thread().pthid.as_deref().map(InvitationId::from)
    }

    pub fn encode(&self) -> DidLinkResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> DidLinkResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| DidLinkError::MalformedMessage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            verkey: "ab".repeat(32),
            endpoint: Some("http://localhost:3002".to_string()),
            routing_keys: vec![],
        }
    }

    #[test]
    fn test_request_wire_shape() {
        let invitation_id = InvitationId::from("inv-1");
        let msg = HandshakeMessage::request(
            HandshakeProtocol::DidExchange,
            &invitation_id,
            "demo-agent-bob",
            info(),
        );
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["@type"], "https://didcomm.org/didexchange/1.0/request");
        assert_eq!(json["~thread"]["pthid"], "inv-1");
        assert_eq!(json["~thread"]["thid"], json["@id"]);
        assert_eq!(json["label"], "demo-agent-bob");
        assert_eq!(json["connection"]["endpoint"], "http://localhost:3002");
    }

    #[test]
    fn test_legacy_variants() {
        let invitation_id = InvitationId::from("inv-2");
        let request = HandshakeMessage::request(
            HandshakeProtocol::Connections,
            &invitation_id,
            "bob",
            info(),
        );
        assert!(matches!(request, HandshakeMessage::LegacyRequest(_)));
        assert_eq!(request.protocol(), Some(HandshakeProtocol::Connections));

        let ack = HandshakeMessage::complete(HandshakeProtocol::Connections, request.thread().clone());
        let json: serde_json::Value = serde_json::from_slice(&ack.encode().unwrap()).unwrap();
        assert_eq!(json["@type"], "https://didcomm.org/notification/1.0/ack");
        assert_eq!(json["status"], "OK");
        assert_eq!(ack.step(), HandshakeStep::Complete);
    }

    #[test]
    fn test_decode_dispatches_on_type() {
        let invitation_id = InvitationId::from("inv-3");
        let thread = Thread::new("thread-1", &invitation_id);
        let original = HandshakeMessage::response(
            HandshakeProtocol::DidExchange,
            thread,
            SignatureDecorator::new("ab", b"data", b"sig"),
        );
        let decoded = HandshakeMessage::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.step(), HandshakeStep::Response);
        assert_eq!(decoded.invitation_id(), Some(invitation_id));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let bytes = br#"{"@type":"https://didcomm.org/basicmessage/1.0/message","@id":"x"}"#;
        assert!(matches!(
            HandshakeMessage::decode(bytes),
            Err(DidLinkError::MalformedMessage(_))
        ));
        assert!(matches!(
            HandshakeMessage::decode(b"not json"),
            Err(DidLinkError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_problem_report_has_no_protocol() {
        let report = HandshakeMessage::problem_report(
            Thread::new("t", &InvitationId::from("inv")),
            "abandoned",
            "user cancelled",
        );
        assert_eq!(report.protocol(), None);
        assert_eq!(report.step(), HandshakeStep::ProblemReport);
    }

    #[test]
    fn test_signature_decorator_carries_connection_info() {
        let data = serde_json::to_vec(&info()).unwrap();
        let sig = SignatureDecorator::new("ab", &data, &[7u8; 64]);
        assert_eq!(sig.connection_info().unwrap(), info());
        assert_eq!(sig.signature_bytes().unwrap(), vec![7u8; 64]);

        let broken = SignatureDecorator {
            sig_data: "***".to_string(),
            ..sig
        };
        assert!(broken.connection_info().is_err());
    }
}
