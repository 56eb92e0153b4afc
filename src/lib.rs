//! Presence Server Library
//!
//! Real-time presence and chat relay over WebTransport: a session registry
//! owned by a single actor task, a text protocol dispatcher, and party
//! coordination against a persistence store.

pub mod config;
pub mod metrics;
pub mod net;
pub mod party;
pub mod session;
pub mod store;
