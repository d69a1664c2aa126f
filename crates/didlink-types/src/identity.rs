//! Agent identity: the addressable face an agent presents to peers.

use serde::{Deserialize, Serialize};

/// Opaque handle to key material held by the external key service.
///
/// The core never looks inside; it only hands the handle back to
/// [`KeyService`](crate::keys::KeyService) calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyHandle(String);

impl KeyHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One agent's addressable identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Human-readable label. Not unique, display only.
    pub label: String,
    /// Routable addresses, in preference order.
    pub service_endpoints: Vec<String>,
    /// Routing keys advertised alongside the endpoints.
    pub routing_keys: Vec<String>,
    /// Handle to this agent's signing key.
    pub wallet_key: KeyHandle,
}

impl IdentityRecord {
    pub fn new(label: impl Into<String>, wallet_key: KeyHandle) -> Self {
        Self {
            label: label.into(),
            service_endpoints: Vec::new(),
            routing_keys: Vec::new(),
            wallet_key,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.service_endpoints.push(endpoint.into());
        self
    }

    pub fn with_routing_keys(mut self, keys: Vec<String>) -> Self {
        self.routing_keys = keys;
        self
    }

    /// Whether this identity can act as an inviter (has at least one endpoint).
    pub fn is_addressable(&self) -> bool {
        !self.service_endpoints.is_empty()
    }

    /// The preferred endpoint, if any.
    pub fn primary_endpoint(&self) -> Option<&str> {
        self.service_endpoints.first().map(String::as_str)
    }
}
