//! Handshake between two agents over real HTTP on the loopback interface.

mod common;

use common::{config, init_tracing, DOMAIN};
use didlink_kernel::{Agent, Orchestrator};
use didlink_types::connection::{ConnectionRole, ConnectionState};
use didlink_wire::http::HttpGateway;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn boot_http(label: &str) -> (Agent, Arc<HttpGateway>) {
    let gateway = Arc::new(
        HttpGateway::bind(SocketAddr::from(([127, 0, 0, 1], 0)), None)
            .await
            .expect("gateway binds"),
    );
    let config = config(label, Some(gateway.public_endpoint()), true);
    let agent = Agent::boot_in_memory(config, gateway.clone())
        .await
        .expect("agent boots");
    (agent, gateway)
}

#[tokio::test]
async fn test_agents_connect_over_http() {
    init_tracing();
    let (acme, acme_gateway) = boot_http("demo-agent-acme").await;
    let (bob, _bob_gateway) = boot_http("demo-agent-bob").await;

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let pending = Orchestrator::new(DOMAIN)
        .connect(&acme, &bob, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    let out_of_band_id = pending.out_of_band_id.clone();

    let change = pending.wait(Duration::from_secs(10)).await.unwrap();
    assert_eq!(change.new_state, ConnectionState::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let acme_record = acme
        .connections()
        .find(&out_of_band_id, ConnectionRole::Inviter)
        .unwrap();
    assert_eq!(acme_record.their_label.as_deref(), Some("demo-agent-bob"));

    let invitation = acme
        .connections()
        .out_of_band_record(&out_of_band_id, ConnectionRole::Inviter)
        .unwrap()
        .invitation;
    assert_eq!(invitation.primary_endpoint(), Some(acme_gateway.public_endpoint()));
}

#[tokio::test]
async fn test_unreachable_inviter_surfaces_transport_error() {
    init_tracing();
    let (acme, acme_gateway) = boot_http("acme").await;
    let (bob, _bob_gateway) = boot_http("bob").await;

    let invitation = acme.create_invitation().await.unwrap();
    acme_gateway.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = bob.receive_invitation(invitation).await.unwrap_err();
    assert!(err.to_string().contains("Transport error"));
    assert_eq!(bob.connections().all()[0].state, ConnectionState::Invited);
}
