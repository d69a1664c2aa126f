//! Transport seam between the connection kernel and the network.

use async_trait::async_trait;
use didlink_types::error::TransportError;
use std::sync::Arc;

/// Receives raw inbound messages from a gateway.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle one message. `source` is the sender's address as seen by the
    /// transport and is used as the reply address when the message names none.
    async fn on_message(&self, message: Vec<u8>, source: String);
}

/// Delivers handshake messages to peer endpoints.
#[async_trait]
pub trait TransportGateway: Send + Sync {
    /// Send `message` to `endpoint`. Returns once the transport has accepted
    /// the message, not when the peer has processed it.
    async fn send(&self, endpoint: &str, message: Vec<u8>) -> Result<(), TransportError>;

    /// Install the handler for inbound messages. Replaces any previous one.
    fn register_inbound(&self, handler: Arc<dyn InboundHandler>);

    /// Address peers can reach this gateway on, if any.
    fn local_address(&self) -> Option<String>;
}
