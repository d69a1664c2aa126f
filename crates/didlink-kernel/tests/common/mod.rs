//! Shared helpers for the kernel integration tests.

#![allow(dead_code)]

use didlink_kernel::Agent;
use didlink_types::config::AgentConfig;
use didlink_types::connection::{ConnectionId, ConnectionRecord, ConnectionState};
use didlink_wire::memory::MemoryNetwork;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const ACME_ENDPOINT: &str = "http://localhost:3001";
pub const DOMAIN: &str = "https://example.org";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub fn config(label: &str, endpoint: Option<&str>, auto_accept: bool) -> AgentConfig {
    let mut config = AgentConfig {
        label: label.to_string(),
        endpoints: endpoint.map(|e| vec![e.to_string()]).unwrap_or_default(),
        ..AgentConfig::default()
    };
    config.connections.auto_accept = auto_accept;
    config.timeouts.sweep_interval_ms = 20;
    config
}

/// Boot an agent on `network`, reachable on the config's endpoints.
pub async fn boot(network: &MemoryNetwork, config: AgentConfig) -> Agent {
    init_tracing();
    let gateway = network.gateway(config.endpoints.clone());
    Agent::boot_in_memory(config, Arc::new(gateway))
        .await
        .expect("agent boots")
}

/// Poll until the record reaches `state`, panicking after five seconds.
pub async fn wait_for_state(
    agent: &Agent,
    id: ConnectionId,
    state: ConnectionState,
) -> ConnectionRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(record) = agent.connections().get(id) {
            if record.state == state {
                return record;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "{}: record {id} never reached {state}, last seen {:?}",
                agent.label(),
                agent.connections().get(id).map(|r| r.state)
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
