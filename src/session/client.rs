//! Client record owned by the registry
//!
//! A record exists only while its connection is admitted. Dropping it closes
//! the outbound queue and fires the hang-up signal, which tears down the
//! connection's reader and writer.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::store::{PlayerRecord, Profile, Rank, Standing};

/// Outbound text payload shared between recipients of a fan-out
pub type Payload = Arc<str>;

/// Everything the connecting unit resolved before admission
#[derive(Debug, Clone)]
pub struct Admission {
    pub player: PlayerRecord,
    pub profile: Profile,
    pub addr: IpAddr,
    /// Client asked to appear offline
    pub offline: bool,
    /// Flush ledger mark read before `profile` was loaded
    pub flush_mark: u64,
}

/// Transport side of an admitted record
#[derive(Debug)]
pub struct Channels {
    pub outbound: mpsc::Sender<Payload>,
    pub hangup: oneshot::Sender<()>,
}

#[derive(Debug)]
pub struct ClientRecord {
    pub uuid: String,
    pub session_id: u32,
    pub connection_id: u64,
    pub addr: IpAddr,
    pub account: bool,
    pub name: String,
    pub rank: Rank,
    pub badge: String,
    pub muted: bool,
    pub visible: bool,
    pub system_name: String,
    pub sprite_name: String,
    pub sprite_index: i32,
    pub prev_map_id: String,
    pub prev_locations: String,
    pub connected_at: Instant,
    outbound: mpsc::Sender<Payload>,
    // Held only for its drop
    _hangup: oneshot::Sender<()>,
}

impl ClientRecord {
    pub fn new(session_id: u32, connection_id: u64, admission: Admission, channels: Channels) -> Self {
        let Admission {
            player,
            profile,
            addr,
            offline,
            ..
        } = admission;

        // Accounts always display their user name
        let name = if player.account {
            player.name
        } else {
            profile.name
        };

        Self {
            uuid: player.uuid,
            session_id,
            connection_id,
            addr,
            account: player.account,
            name,
            rank: player.rank,
            badge: if player.badge.is_empty() {
                "null".to_string()
            } else {
                player.badge
            },
            muted: player.muted,
            visible: !offline && player.standing == Standing::Good,
            system_name: profile.system_name,
            sprite_name: profile.sprite_name,
            sprite_index: profile.sprite_index,
            prev_map_id: String::new(),
            prev_locations: String::new(),
            connected_at: Instant::now(),
            outbound: channels.outbound,
            _hangup: channels.hangup,
        }
    }

    /// Non-blocking enqueue; an error means the record must be evicted
    pub fn try_send(&self, payload: Payload) -> Result<(), mpsc::error::TrySendError<Payload>> {
        self.outbound.try_send(payload)
    }

    /// Display state flushed to the store when the record goes away
    pub fn profile(&self) -> Profile {
        Profile {
            name: self.name.clone(),
            system_name: self.system_name.clone(),
            sprite_name: self.sprite_name.clone(),
            sprite_index: self.sprite_index,
        }
    }

    pub fn view(&self) -> ClientView {
        ClientView {
            uuid: self.uuid.clone(),
            session_id: self.session_id,
            connection_id: self.connection_id,
            account: self.account,
            name: self.name.clone(),
            rank: self.rank,
            badge: self.badge.clone(),
            muted: self.muted,
            visible: self.visible,
            system_name: self.system_name.clone(),
            sprite_name: self.sprite_name.clone(),
            sprite_index: self.sprite_index,
            prev_map_id: self.prev_map_id.clone(),
            prev_locations: self.prev_locations.clone(),
        }
    }

    pub fn live_profile(&self) -> LiveProfile {
        LiveProfile {
            name: self.name.clone(),
            system_name: self.system_name.clone(),
            sprite_name: self.sprite_name.clone(),
            sprite_index: self.sprite_index,
        }
    }
}

/// Read-only snapshot of a record handed out by the actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientView {
    pub uuid: String,
    pub session_id: u32,
    pub connection_id: u64,
    pub account: bool,
    pub name: String,
    pub rank: Rank,
    pub badge: String,
    pub muted: bool,
    pub visible: bool,
    pub system_name: String,
    pub sprite_name: String,
    pub sprite_index: i32,
    pub prev_map_id: String,
    pub prev_locations: String,
}

/// Live display state of an online player
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LiveProfile {
    pub name: String,
    pub system_name: String,
    pub sprite_name: String,
    pub sprite_index: i32,
}

/// Mutation applied to a record through the actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileChange {
    Name(String),
    Badge(String),
    Sprite { name: String, index: i32 },
    System(String),
    PrevLocation { map_id: String, locations: String },
}
