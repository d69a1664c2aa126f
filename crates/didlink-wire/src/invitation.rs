//! Out-of-band invitations and their URL encoding.
//!
//! Two wire shapes exist. The standard shape carries a `services` list; the
//! legacy (connections 1.0) shape carries a single flat `serviceEndpoint`.
//! Neither carries a reliable version discriminant, so decoding sniffs the
//! shape and only uses `@type` to reject payloads that contradict it.
//!
//! URL form: `https://<domain>/?oob=<base64url(JSON)>`.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use didlink_types::connection::{HandshakeProtocol, InvitationId};
use didlink_types::error::{DidLinkError, DidLinkResult};
use didlink_types::identity::IdentityRecord;
use serde::{Deserialize, Serialize};
use url::Url;

/// `@type` of a standard out-of-band invitation.
pub const OUT_OF_BAND_INVITATION_TYPE: &str = "https://didcomm.org/out-of-band/1.1/invitation";
/// `@type` of a legacy connections invitation.
pub const LEGACY_INVITATION_TYPE: &str = "https://didcomm.org/connections/1.0/invitation";
/// Handshake protocol advertised by standard invitations.
pub const DIDEXCHANGE_PROTOCOL: &str = "https://didcomm.org/didexchange/1.0";

/// Query parameter carrying the payload.
const URL_PARAM: &str = "oob";
/// Older agents put legacy invitations under `c_i`; accepted on decode only.
const LEGACY_URL_PARAM: &str = "c_i";

fn default_out_of_band_type() -> String {
    OUT_OF_BAND_INVITATION_TYPE.to_string()
}

fn default_legacy_type() -> String {
    LEGACY_INVITATION_TYPE.to_string()
}

/// One service entry of a standard invitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationService {
    pub service_endpoint: String,
    #[serde(default)]
    pub routing_keys: Vec<String>,
    /// Keys the inviter will sign its response with (hex).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipient_keys: Vec<String>,
}

/// Standard out-of-band invitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutOfBandInvitation {
    #[serde(rename = "@type", default = "default_out_of_band_type")]
    pub type_: String,
    #[serde(rename = "@id")]
    pub id: InvitationId,
    pub label: String,
    /// Application hint, opaque to the handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_code: Option<String>,
    #[serde(
        rename = "handshake_protocols",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub handshake_protocols: Vec<String>,
    pub services: Vec<InvitationService>,
}

/// Legacy single-purpose invitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyInvitation {
    #[serde(rename = "@type", default = "default_legacy_type")]
    pub type_: String,
    #[serde(rename = "@id")]
    pub id: InvitationId,
    pub label: String,
    pub service_endpoint: String,
    #[serde(default)]
    pub routing_keys: Vec<String>,
    #[serde(default)]
    pub recipient_keys: Vec<String>,
}

/// A decoded invitation of either shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invitation {
    OutOfBand(OutOfBandInvitation),
    Legacy(LegacyInvitation),
}

impl Invitation {
    pub fn id(&self) -> &InvitationId {
        match self {
            Self::OutOfBand(inv) => &inv.id,
            Self::Legacy(inv) => &inv.id,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::OutOfBand(inv) => &inv.label,
            Self::Legacy(inv) => &inv.label,
        }
    }

    pub fn goal_code(&self) -> Option<&str> {
        match self {
            Self::OutOfBand(inv) => inv.goal_code.as_deref(),
            Self::Legacy(_) => None,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy(_))
    }

    /// The handshake a record started from this invitation must run.
    pub fn protocol(&self) -> HandshakeProtocol {
        match self {
            Self::OutOfBand(_) => HandshakeProtocol::DidExchange,
            Self::Legacy(_) => HandshakeProtocol::Connections,
        }
    }

    /// Endpoints of the issuer, in preference order.
    pub fn endpoints(&self) -> Vec<&str> {
        match self {
            Self::OutOfBand(inv) => inv
                .services
                .iter()
                .map(|s| s.service_endpoint.as_str())
                .collect(),
            Self::Legacy(inv) => vec![inv.service_endpoint.as_str()],
        }
    }

    pub fn primary_endpoint(&self) -> Option<&str> {
        self.endpoints().into_iter().next()
    }

    /// Every recipient key the invitation names, deduplicated.
    pub fn recipient_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        let candidates: Box<dyn Iterator<Item = &String> + '_> = match self {
            Self::OutOfBand(inv) => Box::new(inv.services.iter().flat_map(|s| &s.recipient_keys)),
            Self::Legacy(inv) => Box::new(inv.recipient_keys.iter()),
        };
        for key in candidates {
            if !keys.contains(&key.as_str()) {
                keys.push(key);
            }
        }
        keys
    }

    /// Serialize to the JSON payload of this invitation's shape.
    pub fn to_json(&self) -> DidLinkResult<String> {
        let json = match self {
            Self::OutOfBand(inv) => serde_json::to_string(inv)?,
            Self::Legacy(inv) => serde_json::to_string(inv)?,
        };
        Ok(json)
    }

    /// Parse a JSON payload, sniffing which shape it is.
    pub fn from_json(json: &str) -> DidLinkResult<Self> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| DidLinkError::MalformedInvitation(format!("payload is not JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Encode as `https://<domain>/?oob=<base64url(JSON)>`.
    ///
    /// `domain` may be a bare host or a full base URL; any query it carries is
    /// replaced.
    pub fn to_url(&self, domain: &str) -> DidLinkResult<String> {
        let base = if domain.contains("://") {
            domain.to_string()
        } else {
            format!("https://{domain}")
        };
        let mut url = Url::parse(&base).map_err(|e| {
            DidLinkError::MalformedInvitation(format!("invalid domain '{domain}': {e}"))
        })?;
        let encoded = URL_SAFE_NO_PAD.encode(self.to_json()?);
        url.query_pairs_mut()
            .clear()
            .append_pair(URL_PARAM, &encoded);
        Ok(url.to_string())
    }

    /// Decode an invitation URL produced by [`Invitation::to_url`] (or by
    /// another agent using the same format).
    pub fn from_url(input: &str) -> DidLinkResult<Self> {
        let url = Url::parse(input.trim())
            .map_err(|e| DidLinkError::MalformedInvitation(format!("not a URL: {e}")))?;
        let payload = url
            .query_pairs()
            .find(|(k, _)| k == URL_PARAM || k == LEGACY_URL_PARAM)
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| {
                DidLinkError::MalformedInvitation(format!("missing '{URL_PARAM}' parameter"))
            })?;
        let bytes = decode_base64(&payload)?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| DidLinkError::MalformedInvitation(format!("payload is not JSON: {e}")))?;
        Self::from_value(value)
    }

    fn from_value(value: serde_json::Value) -> DidLinkResult<Self> {
        let (has_services, has_endpoint, declared) = match value.as_object() {
            Some(obj) => (
                obj.contains_key("services"),
                obj.contains_key("serviceEndpoint"),
                obj.get("@type").and_then(|t| t.as_str()).map(str::to_owned),
            ),
            None => {
                return Err(DidLinkError::UnsupportedInvitationShape(
                    "payload is not a JSON object".into(),
                ))
            }
        };

        match (has_services, has_endpoint) {
            (true, false) => {
                if let Some(t) = declared.filter(|t| !is_out_of_band_type(t)) {
                    return Err(DidLinkError::UnsupportedInvitationShape(format!(
                        "'@type' {t} contradicts the out-of-band shape"
                    )));
                }
                serde_json::from_value(value)
                    .map(Self::OutOfBand)
                    .map_err(|e| {
                        DidLinkError::UnsupportedInvitationShape(format!(
                            "invalid out-of-band invitation: {e}"
                        ))
                    })
            }
            (false, true) => {
                if let Some(t) = declared.filter(|t| !is_legacy_type(t)) {
                    return Err(DidLinkError::UnsupportedInvitationShape(format!(
                        "'@type' {t} contradicts the legacy shape"
                    )));
                }
                serde_json::from_value(value).map(Self::Legacy).map_err(|e| {
                    DidLinkError::UnsupportedInvitationShape(format!(
                        "invalid legacy invitation: {e}"
                    ))
                })
            }
            (true, true) => Err(DidLinkError::UnsupportedInvitationShape(
                "both 'services' and 'serviceEndpoint' present".into(),
            )),
            (false, false) => Err(DidLinkError::UnsupportedInvitationShape(
                "neither 'services' nor 'serviceEndpoint' present".into(),
            )),
        }
    }
}

fn is_out_of_band_type(t: &str) -> bool {
    t.contains("out-of-band/1.") && t.ends_with("/invitation")
}

fn is_legacy_type(t: &str) -> bool {
    t.ends_with("connections/1.0/invitation")
}

/// Accepts padded or unpadded, URL-safe or standard alphabet.
fn decode_base64(payload: &str) -> DidLinkResult<Vec<u8>> {
    let trimmed = payload.trim().trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        // form decoding turns '+' into ' '
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed.replace(' ', "+")))
        .map_err(|e| DidLinkError::MalformedInvitation(format!("payload is not base64: {e}")))
}

/// Builds invitations from an identity.
pub struct InvitationBuilder<'a> {
    identity: &'a IdentityRecord,
    goal_code: Option<String>,
    recipient_keys: Vec<String>,
}

impl<'a> InvitationBuilder<'a> {
    pub fn new(identity: &'a IdentityRecord) -> Self {
        Self {
            identity,
            goal_code: None,
            recipient_keys: Vec::new(),
        }
    }

    pub fn goal_code(mut self, goal_code: impl Into<String>) -> Self {
        self.goal_code = Some(goal_code.into());
        self
    }

    pub fn recipient_key(mut self, key: impl Into<String>) -> Self {
        self.recipient_keys.push(key.into());
        self
    }

    /// A standard invitation with one service per identity endpoint.
    pub fn build(self) -> DidLinkResult<Invitation> {
        self.require_endpoint()?;
        let services = self
            .identity
            .service_endpoints
            .iter()
            .map(|endpoint| InvitationService {
                service_endpoint: endpoint.clone(),
                routing_keys: self.identity.routing_keys.clone(),
                recipient_keys: self.recipient_keys.clone(),
            })
            .collect();

        Ok(Invitation::OutOfBand(OutOfBandInvitation {
            type_: default_out_of_band_type(),
            id: InvitationId::generate(),
            label: self.identity.label.clone(),
            goal_code: self.goal_code,
            handshake_protocols: vec![DIDEXCHANGE_PROTOCOL.to_string()],
            services,
        }))
    }

    /// A legacy invitation pointing at the identity's primary endpoint.
    /// Goal codes have no place in this shape and are dropped.
    pub fn build_legacy(self) -> DidLinkResult<Invitation> {
        let endpoint = self.require_endpoint()?.to_string();
        Ok(Invitation::Legacy(LegacyInvitation {
            type_: default_legacy_type(),
            id: InvitationId::generate(),
            label: self.identity.label.clone(),
            service_endpoint: endpoint,
            routing_keys: self.identity.routing_keys.clone(),
            recipient_keys: self.recipient_keys,
        }))
    }

    fn require_endpoint(&self) -> DidLinkResult<&str> {
        self.identity
            .primary_endpoint()
            .ok_or_else(|| DidLinkError::MissingServiceEndpoint(self.identity.label.clone()))
    }
}

/// Create a standard invitation for `identity`.
pub fn create_invitation(identity: &IdentityRecord) -> DidLinkResult<Invitation> {
    InvitationBuilder::new(identity).build()
}

/// Create a legacy invitation for `identity`.
pub fn create_legacy_invitation(identity: &IdentityRecord) -> DidLinkResult<Invitation> {
    InvitationBuilder::new(identity).build_legacy()
}

#[cfg(test)]
mod tests {
    use super::*;
    use didlink_types::identity::KeyHandle;

    fn acme() -> IdentityRecord {
        IdentityRecord::new("demo-agent-acme", KeyHandle::new("acme"))
            .with_endpoint("http://localhost:3001")
    }

    fn url_payload(url: &str) -> serde_json::Value {
        let encoded = url.split("oob=").nth(1).unwrap();
        let bytes = URL_SAFE_NO_PAD.decode(encoded).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn url_with_payload(json: &serde_json::Value) -> String {
        format!(
            "https://example.org/?oob={}",
            URL_SAFE_NO_PAD.encode(json.to_string())
        )
    }

    #[test]
    fn test_round_trip_standard() {
        let invitation = InvitationBuilder::new(&acme())
            .goal_code("aries.vc.issue")
            .recipient_key("ab12")
            .build()
            .unwrap();
        let url = invitation.to_url("https://example.org").unwrap();
        assert!(url.starts_with("https://example.org/?oob="));
        assert_eq!(Invitation::from_url(&url).unwrap(), invitation);
    }

    #[test]
    fn test_round_trip_legacy() {
        let invitation = InvitationBuilder::new(&acme())
            .recipient_key("ab12")
            .build_legacy()
            .unwrap();
        let url = invitation.to_url("example.org").unwrap();
        assert!(url.starts_with("https://example.org/?oob="));
        let decoded = Invitation::from_url(&url).unwrap();
        assert!(decoded.is_legacy());
        assert_eq!(decoded, invitation);
    }

    #[test]
    fn test_to_url_is_deterministic() {
        let invitation = create_invitation(&acme()).unwrap();
        assert_eq!(
            invitation.to_url("https://example.org").unwrap(),
            invitation.to_url("https://example.org").unwrap()
        );
    }

    #[test]
    fn test_fresh_ids() {
        let a = create_invitation(&acme()).unwrap();
        let b = create_invitation(&acme()).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(uuid::Uuid::parse_str(a.id().as_str()).is_ok());
    }

    #[test]
    fn test_standard_json_fields() {
        let invitation = InvitationBuilder::new(&acme())
            .goal_code("p2p-messaging")
            .build()
            .unwrap();
        let json = url_payload(&invitation.to_url("https://example.org").unwrap());
        assert_eq!(json["label"], "demo-agent-acme");
        assert_eq!(json["goalCode"], "p2p-messaging");
        assert_eq!(json["@id"], invitation.id().as_str());
        assert_eq!(
            json["services"][0]["serviceEndpoint"],
            "http://localhost:3001"
        );
        assert!(json["services"][0]["routingKeys"].is_array());
        assert!(json.get("serviceEndpoint").is_none());
    }

    #[test]
    fn test_legacy_json_fields() {
        let invitation = InvitationBuilder::new(&acme())
            .recipient_key("ab12")
            .build_legacy()
            .unwrap();
        let json = url_payload(&invitation.to_url("https://example.org").unwrap());
        assert_eq!(json["serviceEndpoint"], "http://localhost:3001");
        assert_eq!(json["recipientKeys"][0], "ab12");
        assert!(json["routingKeys"].is_array());
        assert!(json.get("services").is_none());
        assert!(json.get("goalCode").is_none());
    }

    #[test]
    fn test_shapes_never_cross_decode() {
        let standard = create_invitation(&acme()).unwrap();
        let legacy = create_legacy_invitation(&acme()).unwrap();
        let decoded_standard =
            Invitation::from_url(&standard.to_url("https://example.org").unwrap()).unwrap();
        let decoded_legacy =
            Invitation::from_url(&legacy.to_url("https://example.org").unwrap()).unwrap();
        assert!(matches!(decoded_standard, Invitation::OutOfBand(_)));
        assert!(matches!(decoded_legacy, Invitation::Legacy(_)));
        assert_eq!(decoded_standard.protocol(), HandshakeProtocol::DidExchange);
        assert_eq!(decoded_legacy.protocol(), HandshakeProtocol::Connections);
    }

    #[test]
    fn test_type_contradicting_shape_rejected() {
        let legacy = create_legacy_invitation(&acme()).unwrap();
        let mut json = url_payload(&legacy.to_url("https://example.org").unwrap());
        json["@type"] = serde_json::json!(OUT_OF_BAND_INVITATION_TYPE);
        let err = Invitation::from_url(&url_with_payload(&json)).unwrap_err();
        assert!(matches!(err, DidLinkError::UnsupportedInvitationShape(_)));
    }

    #[test]
    fn test_shape_sniffed_without_type() {
        let json = serde_json::json!({
            "@id": "legacy-1",
            "label": "old-agent",
            "serviceEndpoint": "http://localhost:4000",
            "routingKeys": [],
            "recipientKeys": ["cd34"],
        });
        let decoded = Invitation::from_url(&url_with_payload(&json)).unwrap();
        assert!(decoded.is_legacy());
        assert_eq!(decoded.recipient_keys(), vec!["cd34"]);
    }

    #[test]
    fn test_neither_shape_rejected() {
        let json = serde_json::json!({"@id": "x", "label": "nobody"});
        let err = Invitation::from_url(&url_with_payload(&json)).unwrap_err();
        assert!(matches!(err, DidLinkError::UnsupportedInvitationShape(_)));

        let both = serde_json::json!({
            "@id": "x",
            "label": "both",
            "serviceEndpoint": "http://a",
            "services": [],
        });
        let err = Invitation::from_url(&url_with_payload(&both)).unwrap_err();
        assert!(matches!(err, DidLinkError::UnsupportedInvitationShape(_)));
    }

    #[test]
    fn test_non_object_json_is_unsupported() {
        let err = Invitation::from_url(&url_with_payload(&serde_json::json!([1, 2]))).unwrap_err();
        assert!(matches!(err, DidLinkError::UnsupportedInvitationShape(_)));
    }

    #[test]
    fn test_malformed_payloads() {
        // valid base64, not JSON
        let not_json = format!("https://example.org/?oob={}", URL_SAFE_NO_PAD.encode("hello"));
        for url in [
            "not a url",
            "https://example.org/?foo=bar",
            "https://example.org/?oob=%%%%",
            not_json.as_str(),
        ] {
            let err = Invitation::from_url(url).unwrap_err();
            assert!(
                matches!(err, DidLinkError::MalformedInvitation(_)),
                "{url}: {err}"
            );
        }
    }

    #[test]
    fn test_legacy_param_alias_and_padded_base64() {
        let legacy = create_legacy_invitation(&acme()).unwrap();
        let padded = base64::engine::general_purpose::URL_SAFE.encode(legacy.to_json().unwrap());
        let url = format!("https://example.org?c_i={padded}");
        assert_eq!(Invitation::from_url(&url).unwrap(), legacy);
    }

    #[test]
    fn test_missing_endpoint() {
        let bob = IdentityRecord::new("bob", KeyHandle::new("bob"));
        assert!(matches!(
            create_invitation(&bob),
            Err(DidLinkError::MissingServiceEndpoint(_))
        ));
        assert!(matches!(
            create_legacy_invitation(&bob),
            Err(DidLinkError::MissingServiceEndpoint(_))
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let invitation = create_invitation(&acme()).unwrap();
        let json = invitation.to_json().unwrap();
        assert_eq!(Invitation::from_json(&json).unwrap(), invitation);
        assert!(matches!(
            Invitation::from_json("{nope"),
            Err(DidLinkError::MalformedInvitation(_))
        ));
    }
}
