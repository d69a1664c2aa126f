//! In-process transport.
//!
//! A [`MemoryNetwork`] routes messages between gateways living in the same
//! process. Delivery is asynchronous: `send` returns as soon as the message
//! is handed to a spawned task, mirroring a real network.

use crate::transport::{InboundHandler, TransportGateway};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use didlink_types::error::TransportError;
use std::sync::{Arc, RwLock};
use tracing::debug;

type HandlerSlot = Arc<RwLock<Option<Arc<dyn InboundHandler>>>>;

/// Shared routing table for [`MemoryGateway`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    routes: Arc<DashMap<String, HandlerSlot>>,
    dropping: Arc<DashSet<String>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a gateway reachable on `addresses`.
    ///
    /// A gateway without addresses still gets a private `memory://` return
    /// address so peers can reply to the transport source.
    pub fn gateway<I, S>(&self, addresses: I) -> MemoryGateway
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut addresses: Vec<String> = addresses.into_iter().map(Into::into).collect();
        if addresses.is_empty() {
            addresses.push(format!("memory://{}", uuid::Uuid::new_v4()));
        }
        let slot: HandlerSlot = Arc::new(RwLock::new(None));
        for address in &addresses {
            self.routes.insert(address.clone(), slot.clone());
        }
        MemoryGateway {
            network: self.clone(),
            addresses,
            slot,
        }
    }

    /// Silently discard everything sent to `endpoint` while `drop` is set.
    pub fn set_dropping(&self, endpoint: &str, drop: bool) {
        if drop {
            self.dropping.insert(endpoint.to_string());
        } else {
            self.dropping.remove(endpoint);
        }
    }

    /// Remove `endpoint` from the network. Later sends to it fail.
    pub fn disconnect(&self, endpoint: &str) {
        self.routes.remove(endpoint);
    }

    fn deliver(&self, endpoint: &str, message: Vec<u8>, source: String) -> Result<(), TransportError> {
        if self.dropping.contains(endpoint) {
            debug!(endpoint, "memory transport dropping message");
            return Ok(());
        }
        let slot = self
            .routes
            .get(endpoint)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Unreachable(endpoint.to_string()))?;
        let handler = slot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| TransportError::Rejected {
                endpoint: endpoint.to_string(),
                reason: "no inbound handler registered".to_string(),
            })?;
        tokio::spawn(async move {
            handler.on_message(message, source).await;
        });
        Ok(())
    }
}

/// One agent's attachment point on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryGateway {
    network: MemoryNetwork,
    addresses: Vec<String>,
    slot: HandlerSlot,
}

impl MemoryGateway {
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }
}

#[async_trait]
impl TransportGateway for MemoryGateway {
    async fn send(&self, endpoint: &str, message: Vec<u8>) -> Result<(), TransportError> {
        let source = self.addresses[0].clone();
        debug!(endpoint, %source, bytes = message.len(), "memory send");
        self.network.deliver(endpoint, message, source)
    }

    fn register_inbound(&self, handler: Arc<dyn InboundHandler>) {
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn local_address(&self) -> Option<String> {
        self.addresses.first().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Collector(mpsc::UnboundedSender<(Vec<u8>, String)>);

    #[async_trait]
    impl InboundHandler for Collector {
        async fn on_message(&self, message: Vec<u8>, source: String) {
            let _ = self.0.send((message, source));
        }
    }

    #[tokio::test]
    async fn test_delivers_with_source_address() {
        let network = MemoryNetwork::new();
        let acme = network.gateway(["http://localhost:3001"]);
        let bob = network.gateway(Vec::<String>::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        acme.register_inbound(Arc::new(Collector(tx)));

        bob.send("http://localhost:3001", b"hello".to_vec()).await.unwrap();
        let (message, source) = rx.recv().await.unwrap();
        assert_eq!(message, b"hello");
        assert!(source.starts_with("memory://"));
        assert_eq!(Some(source), bob.local_address());
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_unreachable() {
        let network = MemoryNetwork::new();
        let bob = network.gateway(Vec::<String>::new());
        let err = bob.send("http://nowhere", vec![]).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_missing_handler_is_rejected() {
        let network = MemoryNetwork::new();
        let _acme = network.gateway(["memory://acme"]);
        let bob = network.gateway(["memory://bob"]);
        let err = bob.send("memory://acme", vec![]).await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_dropping_discards_silently() {
        let network = MemoryNetwork::new();
        let acme = network.gateway(["memory://acme"]);
        let bob = network.gateway(["memory://bob"]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        acme.register_inbound(Arc::new(Collector(tx)));

        network.set_dropping("memory://acme", true);
        bob.send("memory://acme", b"lost".to_vec()).await.unwrap();
        network.set_dropping("memory://acme", false);
        bob.send("memory://acme", b"kept".to_vec()).await.unwrap();

        let (message, _) = rx.recv().await.unwrap();
        assert_eq!(message, b"kept");
    }

    #[tokio::test]
    async fn test_disconnect() {
        let network = MemoryNetwork::new();
        let _acme = network.gateway(["memory://acme"]);
        let bob = network.gateway(["memory://bob"]);
        network.disconnect("memory://acme");
        assert!(bob.send("memory://acme", vec![]).await.is_err());
    }
}
