//! Core types and traits for didlink out-of-band connections.
//!
//! This crate defines the data structures shared by the wire codec and the
//! agent kernel: identities, connection records, events, errors and
//! configuration. It contains no business logic.

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod identity;
pub mod keys;
