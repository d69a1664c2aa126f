//! Agent configuration types.
//!
//! Every section defaults sensibly, so an empty TOML document is a valid
//! configuration.

use crate::connection::ConnectionState;
use crate::error::{DidLinkError, DidLinkResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default dwell time for the in-flight handshake states (60 s).
const DEFAULT_STEP_TIMEOUT_MS: u64 = 60_000;

/// Top-level configuration of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Label shown to peers in invitations and requests.
    pub label: String,
    /// Endpoints this agent is reachable on. Required to issue invitations.
    pub endpoints: Vec<String>,
    /// Routing keys advertised alongside the endpoints.
    pub routing_keys: Vec<String>,
    pub wallet: WalletConfig,
    pub connections: ConnectionsConfig,
    pub timeouts: TimeoutConfig,
    pub events: EventsConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            label: "didlink-agent".to_string(),
            endpoints: Vec::new(),
            routing_keys: Vec::new(),
            wallet: WalletConfig::default(),
            connections: ConnectionsConfig::default(),
            timeouts: TimeoutConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> DidLinkResult<()> {
        if self.label.trim().is_empty() {
            return Err(DidLinkError::Config("label must not be empty".into()));
        }
        if !self.wallet.id.is_empty() && self.wallet.key.is_empty() {
            return Err(DidLinkError::Config(format!(
                "wallet '{}' has no key",
                self.wallet.id
            )));
        }
        if self.timeouts.sweep_interval_ms == 0 {
            return Err(DidLinkError::Config(
                "timeouts.sweep_interval_ms must be greater than zero".into(),
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(DidLinkError::Config(
                "events.channel_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Seed the agent's signing key is derived from: the wallet id and key
    /// when a wallet is configured, otherwise the label.
    pub fn wallet_seed(&self) -> String {
        if self.wallet.key.is_empty() {
            self.label.clone()
        } else {
            format!("{}:{}", self.wallet.id, self.wallet.key)
        }
    }
}

/// The agent's key wallet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub id: String,
    /// Secret the wallet's signing key is derived from.
    pub key: String,
}

/// Connection protocol settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionsConfig {
    /// Take every handshake step without waiting for an explicit approval.
    pub auto_accept: bool,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self { auto_accept: true }
    }
}

/// Maximum dwell time per non-terminal state, in milliseconds.
///
/// `None` means the state never times out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Outstanding invitations wait forever unless set.
    pub invited_ms: Option<u64>,
    pub requested_ms: Option<u64>,
    pub responded_ms: Option<u64>,
    /// How often the monitor looks for expired records.
    pub sweep_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            invited_ms: None,
            requested_ms: Some(DEFAULT_STEP_TIMEOUT_MS),
            responded_ms: Some(DEFAULT_STEP_TIMEOUT_MS),
            sweep_interval_ms: 1_000,
        }
    }
}

impl TimeoutConfig {
    /// Dwell limit for `state`. Terminal states have none.
    pub fn limit_for(&self, state: ConnectionState) -> Option<Duration> {
        let ms = match state {
            ConnectionState::Invited => self.invited_ms,
            ConnectionState::Requested => self.requested_ms,
            ConnectionState::Responded => self.responded_ms,
            ConnectionState::Completed | ConnectionState::Abandoned => None,
        };
        ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Event bus sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events retained in the history ring buffer.
    pub history_size: usize,
    /// Capacity of the broadcast channel for async subscribers.
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            history_size: 1000,
            channel_capacity: 1024,
        }
    }
}
