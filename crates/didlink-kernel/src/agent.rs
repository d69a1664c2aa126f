//! Agent: one identity with its event bus, connection manager, transport
//! binding and timeout monitor.

use crate::accept::{policy_from_config, AcceptPolicy};
use crate::connections::ConnectionManager;
use crate::error::{KernelError, KernelResult};
use crate::event_bus::EventBus;
use crate::keystore::InMemoryKeyStore;
use crate::timeout::spawn_timeout_monitor;
use async_trait::async_trait;
use didlink_types::config::AgentConfig;
use didlink_types::connection::{ConnectionId, ConnectionRecord};
use didlink_types::identity::{IdentityRecord, KeyHandle};
use didlink_types::keys::KeyService;
use didlink_wire::invitation::Invitation;
use didlink_wire::transport::{InboundHandler, TransportGateway};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info};

/// Forwards gateway traffic to the manager without keeping it alive.
struct InboundRouter(Weak<ConnectionManager>);

#[async_trait]
impl InboundHandler for InboundRouter {
    async fn on_message(&self, message: Vec<u8>, source: String) {
        match self.0.upgrade() {
            Some(manager) => manager.on_message(message, source).await,
            None => debug!(%source, "Agent gone, dropping inbound message"),
        }
    }
}

/// A running agent.
pub struct Agent {
    config: AgentConfig,
    bus: Arc<EventBus>,
    connections: Arc<ConnectionManager>,
    shutdown_tx: watch::Sender<bool>,
}

impl Agent {
    /// Boot an agent with the accept policy chosen by
    /// `connections.auto_accept`.
    pub async fn boot(
        config: AgentConfig,
        keys: Arc<dyn KeyService>,
        key: KeyHandle,
        gateway: Arc<dyn TransportGateway>,
    ) -> KernelResult<Self> {
        let policy = policy_from_config(&config.connections);
        Self::boot_with_policy(config, keys, key, gateway, policy).await
    }

    /// Boot an agent whose key lives in an [`InMemoryKeyStore`], derived
    /// from the configured wallet.
    pub async fn boot_in_memory(
        config: AgentConfig,
        gateway: Arc<dyn TransportGateway>,
    ) -> KernelResult<Self> {
        let keys = Arc::new(InMemoryKeyStore::new());
        let key = keys.derive_key(&config.wallet_seed());
        Self::boot(config, keys, key, gateway).await
    }

    /// Boot an agent with a custom accept policy.
    pub async fn boot_with_policy(
        config: AgentConfig,
        keys: Arc<dyn KeyService>,
        key: KeyHandle,
        gateway: Arc<dyn TransportGateway>,
        policy: Arc<dyn AcceptPolicy>,
    ) -> KernelResult<Self> {
        config.validate()?;
        let public_key = keys
            .public_key(&key)
            .await
            .map_err(|e| KernelError::BootFailed(format!("key service: {e}")))?;

        let mut identity = IdentityRecord::new(config.label.clone(), key)
            .with_routing_keys(config.routing_keys.clone());
        for endpoint in &config.endpoints {
            identity = identity.with_endpoint(endpoint.clone());
        }

        let bus = Arc::new(EventBus::with_config(&config.events));
        let connections = Arc::new(ConnectionManager::new(
            identity,
            public_key,
            keys,
            gateway.clone(),
            bus.clone(),
            policy,
            config.timeouts.clone(),
        ));
        gateway.register_inbound(Arc::new(InboundRouter(Arc::downgrade(&connections))));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        spawn_timeout_monitor(&connections, config.timeouts.sweep_interval(), shutdown_rx);

        info!(
            label = %config.label,
            endpoints = ?config.endpoints,
            auto_accept = config.connections.auto_accept,
            "Agent booted"
        );
        Ok(Self {
            config,
            bus,
            connections,
            shutdown_tx,
        })
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn identity(&self) -> &IdentityRecord {
        self.connections.identity()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub async fn create_invitation(&self) -> KernelResult<Invitation> {
        Ok(self.connections.create_invitation(None).await?)
    }

    pub async fn create_invitation_with_goal_code(
        &self,
        goal_code: &str,
    ) -> KernelResult<Invitation> {
        Ok(self.connections.create_invitation(Some(goal_code)).await?)
    }

    pub async fn create_legacy_invitation(&self) -> KernelResult<Invitation> {
        Ok(self.connections.create_legacy_invitation().await?)
    }

    pub async fn receive_invitation(&self, invitation: Invitation) -> KernelResult<ConnectionRecord> {
        Ok(self.connections.receive_invitation(invitation).await?)
    }

    /// Decode an invitation URL and accept it.
    pub async fn receive_invitation_from_url(&self, url: &str) -> KernelResult<ConnectionRecord> {
        let invitation = Invitation::from_url(url)?;
        self.receive_invitation(invitation).await
    }

    pub async fn approve(&self, id: ConnectionId) -> KernelResult<ConnectionRecord> {
        Ok(self.connections.approve(id).await?)
    }

    pub async fn abandon(&self, id: ConnectionId, detail: &str) -> KernelResult<ConnectionRecord> {
        Ok(self.connections.abandon(id, detail).await?)
    }

    /// Stop the timeout monitor. Records and the event bus stay readable.
    pub fn shutdown(&self) {
        info!(label = %self.config.label, "Agent shutting down");
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
