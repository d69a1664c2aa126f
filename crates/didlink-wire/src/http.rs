//! HTTP transport.
//!
//! Inbound messages arrive as `POST /` with a JSON body; the server answers
//! `202 Accepted` and processes the message on a spawned task. Outbound
//! messages are posted with `reqwest`, carrying the sender's advertised
//! endpoint in [`REPLY_TO_HEADER`].

use crate::transport::{InboundHandler, TransportGateway};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use didlink_types::error::TransportError;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Header naming the endpoint replies should be posted to.
pub const REPLY_TO_HEADER: &str = "x-didlink-reply-to";

const CONTENT_TYPE: &str = "application/json";

type HandlerSlot = Arc<RwLock<Option<Arc<dyn InboundHandler>>>>;

/// Gateway serving one HTTP listener and posting to peers.
pub struct HttpGateway {
    client: reqwest::Client,
    local_addr: SocketAddr,
    public_endpoint: String,
    handler: HandlerSlot,
    shutdown_tx: watch::Sender<bool>,
}

impl HttpGateway {
    /// Bind `addr` and start serving.
    ///
    /// `public_endpoint` is what peers are told to reply to; it defaults to
    /// `http://<bound address>`. Binding port 0 picks a free port.
    pub async fn bind(
        addr: SocketAddr,
        public_endpoint: Option<String>,
    ) -> Result<Self, TransportError> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let public_endpoint = public_endpoint.unwrap_or_else(|| format!("http://{local_addr}"));
        let handler: HandlerSlot = Arc::new(RwLock::new(None));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let app = axum::Router::new()
            .route("/", axum::routing::post(receive))
            .with_state(handler.clone());

        info!("didlink HTTP transport listening on {local_addr}");
        tokio::spawn(async move {
            let server = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            );
            tokio::select! {
                result = server => {
                    if let Err(e) = result {
                        warn!("HTTP transport server error: {e}");
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("HTTP transport shutting down");
                }
            }
        });

        Ok(Self {
            client: reqwest::Client::new(),
            local_addr,
            public_endpoint,
            handler,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn public_endpoint(&self) -> &str {
        &self.public_endpoint
    }

    /// Stop accepting inbound messages.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for HttpGateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn receive(
    State(slot): State<HandlerSlot>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let handler = slot.read().unwrap_or_else(|e| e.into_inner()).clone();
    let Some(handler) = handler else {
        return StatusCode::SERVICE_UNAVAILABLE;
    };
    let source = headers
        .get(REPLY_TO_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("http://{peer}"));
    debug!(%source, bytes = body.len(), "HTTP transport received message");
    tokio::spawn(async move {
        handler.on_message(body.to_vec(), source).await;
    });
    StatusCode::ACCEPTED
}

#[async_trait]
impl TransportGateway for HttpGateway {
    async fn send(&self, endpoint: &str, message: Vec<u8>) -> Result<(), TransportError> {
        let resp = self
            .client
            .post(endpoint)
            .header("Content-Type", CONTENT_TYPE)
            .header(REPLY_TO_HEADER, &self.public_endpoint)
            .body(message)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(format!("{endpoint}: {e}")))?;

        if !resp.status().is_success() {
            return Err(TransportError::Rejected {
                endpoint: endpoint.to_string(),
                reason: resp.status().to_string(),
            });
        }
        Ok(())
    }

    fn register_inbound(&self, handler: Arc<dyn InboundHandler>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn local_address(&self) -> Option<String> {
        Some(self.public_endpoint.clone())
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

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn test_post_reaches_handler_with_reply_address() {
        let acme = HttpGateway::bind(loopback(), None).await.unwrap();
        let bob = HttpGateway::bind(loopback(), None).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        acme.register_inbound(Arc::new(Collector(tx)));

        bob.send(acme.public_endpoint(), br#"{"hello":1}"#.to_vec())
            .await
            .unwrap();
        let (message, source) = rx.recv().await.unwrap();
        assert_eq!(message, br#"{"hello":1}"#);
        assert_eq!(source, bob.public_endpoint());
    }

    #[tokio::test]
    async fn test_without_handler_is_rejected() {
        let acme = HttpGateway::bind(loopback(), None).await.unwrap();
        let bob = HttpGateway::bind(loopback(), None).await.unwrap();
        let err = bob.send(acme.public_endpoint(), vec![]).await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_public_endpoint_override() {
        let gw = HttpGateway::bind(loopback(), Some("https://agent.example.org".into()))
            .await
            .unwrap();
        assert_eq!(gw.local_address().as_deref(), Some("https://agent.example.org"));
        assert_ne!(gw.local_addr().port(), 0);
    }
}
