//! Persistence boundary
//!
//! The relational store that owns player, display-state and party rows is an
//! external collaborator. The server only consumes the narrow operation set
//! of [`Store`]. [`MemoryStore`] is the in-process implementation used by the
//! binary and by tests.

pub mod memory;
pub mod ranking;

use std::cmp::Reverse;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::party::model::{PartyId, PartySettings};

pub use memory::MemoryStore;
pub use ranking::RecomputeGate;

/// Player rank (0 = player, 1 = moderator, 2+ = admin)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Rank(pub u8);

impl Rank {
    pub const PLAYER: Rank = Rank(0);
    pub const MODERATOR: Rank = Rank(1);
    pub const ADMIN: Rank = Rank(2);

    /// Moderators and admins
    pub fn is_staff(self) -> bool {
        self >= Self::MODERATOR
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Moderation standing of a player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Standing {
    #[default]
    Good,
    /// Connects normally but stays invisible to everyone except staff
    ShadowBanned,
    /// Refused at the handshake
    Banned,
}

/// Display state cached on the client record and flushed on disconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub system_name: String,
    pub sprite_name: String,
    /// -1 while no sprite has been chosen
    pub sprite_index: i32,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: String::new(),
            system_name: String::new(),
            sprite_name: String::new(),
            sprite_index: -1,
        }
    }
}

/// Player row as resolved at the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub uuid: String,
    /// Account user name; empty for guests
    pub name: String,
    pub rank: Rank,
    pub badge: String,
    pub account: bool,
    pub standing: Standing,
    pub muted: bool,
}

/// Party row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyRecord {
    pub id: PartyId,
    pub owner: String,
    pub settings: PartySettings,
}

/// Membership row joined with the member's player data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    pub uuid: String,
    pub name: String,
    pub rank: Rank,
    pub account: bool,
    pub badge: String,
    pub profile: Profile,
    /// Monotonic join sequence, lower joined earlier
    pub joined: u64,
}

/// Outcome of removing one membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub party_id: PartyId,
    pub remaining: usize,
    /// The party became empty and was deleted in the same operation
    pub party_deleted: bool,
    /// Successor, when the removed member owned the party
    pub new_owner: Option<String>,
}

/// Store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(&'static str),
    #[error("not the party owner")]
    NotOwner,
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Ownership successor: online members before offline, then rank
/// descending, then join order
pub fn next_owner<F>(members: &[MemberRecord], is_online: F) -> Option<&MemberRecord>
where
    F: Fn(&str) -> bool,
{
    members
        .iter()
        .min_by_key(|m| (!is_online(&m.uuid), Reverse(m.rank), m.joined))
}

/// Persistence operations consumed by the session and party layers.
///
/// Every party mutation is a single atomic step that re-checks its own
/// preconditions:
/// - membership removals are scoped to one party and fail with
///   `NotFound("party member")` when the player is not in it
/// - a removal that empties a party deletes it, and one that removes the
///   owner passes ownership by [`next_owner`], in the same step
/// - owner-gated operations fail with [`StoreError::NotOwner`] when the
///   expected owner no longer owns the party
/// - `add_member` against a deleted party reports `NotFound("party")`
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    // Players
    async fn player_by_token(&self, token: &str) -> Result<Option<PlayerRecord>, StoreError>;
    async fn guest_by_address(&self, addr: IpAddr) -> Result<PlayerRecord, StoreError>;
    async fn load_profile(&self, uuid: &str) -> Result<Profile, StoreError>;
    async fn save_profile(&self, uuid: &str, profile: &Profile) -> Result<(), StoreError>;
    async fn set_badge(&self, uuid: &str, badge: &str) -> Result<(), StoreError>;

    // Parties
    async fn party_id_of(&self, uuid: &str) -> Result<Option<PartyId>, StoreError>;
    async fn party(&self, id: PartyId) -> Result<Option<PartyRecord>, StoreError>;
    async fn parties(&self) -> Result<Vec<PartyRecord>, StoreError>;
    /// Members in join order
    async fn members(&self, id: PartyId) -> Result<Vec<MemberRecord>, StoreError>;
    async fn create_party(
        &self,
        owner: &str,
        settings: &PartySettings,
    ) -> Result<PartyId, StoreError>;
    async fn update_party(
        &self,
        id: PartyId,
        owner: &str,
        settings: &PartySettings,
    ) -> Result<(), StoreError>;
    async fn add_member(&self, id: PartyId, uuid: &str) -> Result<(), StoreError>;
    /// Remove `uuid` from party `id`; `online` ranks ownership candidates
    async fn remove_member(
        &self,
        id: PartyId,
        uuid: &str,
        online: &HashSet<String>,
    ) -> Result<Removal, StoreError>;
    /// Remove `target` from party `id` on behalf of its owner
    async fn kick_member(
        &self,
        id: PartyId,
        owner: &str,
        target: &str,
    ) -> Result<Removal, StoreError>;
    async fn set_owner(&self, id: PartyId, owner: &str, uuid: &str) -> Result<(), StoreError>;
    async fn delete_party(&self, id: PartyId, owner: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_staff() {
        assert!(!Rank::PLAYER.is_staff());
        assert!(Rank::MODERATOR.is_staff());
        assert!(Rank(5).is_staff());
    }

    #[test]
    fn test_profile_default_has_no_sprite() {
        assert_eq!(Profile::default().sprite_index, -1);
    }

    fn member(uuid: &str, rank: u8, joined: u64) -> MemberRecord {
        MemberRecord {
            uuid: uuid.to_string(),
            name: uuid.to_string(),
            rank: Rank(rank),
            account: false,
            badge: String::new(),
            profile: Profile::default(),
            joined,
        }
    }

    #[test]
    fn test_next_owner_tie_breaks_on_join_order() {
        let members = vec![member("late", 1, 9), member("early", 1, 2), member("low", 0, 1)];
        let next = next_owner(&members, |_| true).unwrap();
        assert_eq!(next.uuid, "early");

        let next = next_owner(&members, |uuid| uuid == "low").unwrap();
        assert_eq!(next.uuid, "low");
        assert!(next_owner(&[], |_| true).is_none());
    }
}
