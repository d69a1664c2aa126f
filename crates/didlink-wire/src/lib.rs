//! didlink wire formats: everything that crosses an agent boundary.
//!
//! ## Architecture
//!
//! - **Invitation**: out-of-band invitation (standard and legacy shapes) and its URL form
//! - **HandshakeMessage**: JSON request / response / acknowledgment messages
//! - **TransportGateway**: trait the kernel sends through and receives from
//! - **MemoryNetwork** / **HttpGateway**: gateway implementations

pub mod http;
pub mod invitation;
pub mod memory;
pub mod message;
pub mod transport;

pub use http::{HttpGateway, REPLY_TO_HEADER};
pub use invitation::{
    create_invitation, create_legacy_invitation, Invitation, InvitationBuilder,
    InvitationService, LegacyInvitation, OutOfBandInvitation,
};
pub use memory::{MemoryGateway, MemoryNetwork};
pub use message::{
    ConnectionInfo, HandshakeMessage, HandshakeStep, SignatureDecorator, Thread,
};
pub use transport::{InboundHandler, TransportGateway};
