//! Connected-session state
//!
//! The registry is owned by a single actor task. Connection units resolve
//! identity, hand admission to the actor, and run the dispatcher on the
//! frames they read.

pub mod actor;
pub mod announcer;
pub mod client;
pub mod dispatch;
pub mod flush;
pub mod identity;
pub mod registry;

pub use actor::{SessionActor, SessionError, SessionHandle};
pub use announcer::spawn_announcer;
pub use client::{ClientView, Payload};
pub use dispatch::{CommandHook, DispatchError, Dispatcher};
pub use flush::FlushLedger;
pub use identity::{AddressReputation, AllowAll, Handshake, IdentityResolver};
pub use registry::{AdmissionError, Registry};
