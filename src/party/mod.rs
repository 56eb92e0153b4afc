//! Party coordination
//!
//! Parties are persisted groups of players with a single owner. The
//! coordinator runs every transition against the store and uses the session
//! registry for online status.

pub mod api;
pub mod coordinator;
pub mod error;
pub mod model;

pub use coordinator::{PartyCoordinator, Presence, Requester};
pub use error::PartyError;
pub use model::{PartyId, PartySettings, PartyView};
