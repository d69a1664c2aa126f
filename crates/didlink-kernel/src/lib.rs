//! didlink kernel: the per-agent runtime.
//!
//! ## Architecture
//!
//! - **Agent**: wires an identity, key service and transport gateway together
//! - **ConnectionManager**: the handshake state machine, one record per invitation and role
//! - **EventBus**: typed pub/sub of state changes and timeouts
//! - **AcceptPolicy**: whether local handshake steps run without approval
//! - **Orchestrator**: connects two agents and reports completion once

pub mod accept;
pub mod agent;
pub mod config;
pub mod connections;
pub mod error;
pub mod event_bus;
pub mod keystore;
pub mod orchestrator;
pub mod timeout;

pub use accept::{AcceptPolicy, AutoAccept, ManualApproval, PendingStep};
pub use agent::Agent;
pub use connections::{ConnectionManager, OutOfBandRecord};
pub use error::{KernelError, KernelResult};
pub use event_bus::{DiagnosticSink, EventBus, EventHandler, SubscriptionId};
pub use keystore::InMemoryKeyStore;
pub use orchestrator::{CompletionListener, Orchestrator, PendingConnection};
