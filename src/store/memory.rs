use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

use crate::party::model::{PartyId, PartySettings};
use crate::store::{
    next_owner, MemberRecord, PartyRecord, PlayerRecord, Profile, Rank, Removal, Standing, Store,
    StoreError,
};

/// Length of issued session tokens
pub const TOKEN_LEN: usize = 32;

#[derive(Debug, Clone)]
struct PlayerRow {
    user: String,
    rank: Rank,
    badge: String,
    account: bool,
    standing: Standing,
    muted: bool,
}

#[derive(Debug, Clone, Copy)]
struct Membership {
    party_id: PartyId,
    joined: u64,
}

#[derive(Debug, Default)]
struct Tables {
    players: HashMap<String, PlayerRow>,
    tokens: HashMap<String, String>,
    guests: HashMap<IpAddr, String>,
    profiles: HashMap<String, Profile>,
    parties: BTreeMap<PartyId, PartyRecord>,
    memberships: HashMap<String, Membership>,
    next_party_id: PartyId,
    next_join: u64,
}

impl Tables {
    fn member_records(&self, party_id: PartyId) -> Vec<MemberRecord> {
        let mut members: Vec<MemberRecord> = self
            .memberships
            .iter()
            .filter(|(_, m)| m.party_id == party_id)
            .map(|(uuid, m)| {
                let row = self.players.get(uuid);
                let profile = self.profiles.get(uuid).cloned().unwrap_or_default();
                let account = row.map(|r| r.account).unwrap_or(false);
                let name = match row {
                    Some(r) if r.account => r.user.clone(),
                    _ => profile.name.clone(),
                };
                MemberRecord {
                    uuid: uuid.clone(),
                    name,
                    rank: row.map(|r| r.rank).unwrap_or_default(),
                    account,
                    badge: row
                        .filter(|r| r.account)
                        .map(|r| r.badge.clone())
                        .unwrap_or_default(),
                    profile,
                    joined: m.joined,
                }
            })
            .collect();
        members.sort_by_key(|m| m.joined);
        members
    }

    fn is_member(&self, party_id: PartyId, uuid: &str) -> bool {
        self.memberships
            .get(uuid)
            .is_some_and(|m| m.party_id == party_id)
    }

    /// Party `id`, provided `owner` still owns it
    fn owned_party(&mut self, id: PartyId, owner: &str) -> Result<&mut PartyRecord, StoreError> {
        let party = self
            .parties
            .get_mut(&id)
            .ok_or(StoreError::NotFound("party"))?;
        if party.owner != owner {
            return Err(StoreError::NotOwner);
        }
        Ok(party)
    }

    /// Drop one membership, then delete or re-own the party as needed
    fn remove_from(
        &mut self,
        id: PartyId,
        uuid: &str,
        online: &HashSet<String>,
    ) -> Result<Removal, StoreError> {
        if !self.parties.contains_key(&id) {
            return Err(StoreError::NotFound("party"));
        }
        if !self.is_member(id, uuid) {
            return Err(StoreError::NotFound("party member"));
        }
        self.memberships.remove(uuid);

        let remaining = self.member_records(id);
        if remaining.is_empty() {
            self.parties.remove(&id);
            return Ok(Removal {
                party_id: id,
                remaining: 0,
                party_deleted: true,
                new_owner: None,
            });
        }

        let mut new_owner = None;
        if let Some(party) = self.parties.get_mut(&id) {
            if party.owner == uuid {
                if let Some(next) = next_owner(&remaining, |m| online.contains(m)) {
                    party.owner = next.uuid.clone();
                    new_owner = Some(next.uuid.clone());
                }
            }
        }
        Ok(Removal {
            party_id: id,
            remaining: remaining.len(),
            party_deleted: false,
            new_owner,
        })
    }

    fn player_record(&self, uuid: &str) -> Option<PlayerRecord> {
        self.players.get(uuid).map(|row| PlayerRecord {
            uuid: uuid.to_string(),
            name: row.user.clone(),
            rank: row.rank,
            badge: row.badge.clone(),
            account: row.account,
            standing: row.standing,
            muted: row.muted,
        })
    }
}

/// In-process store for one server instance.
///
/// Every trait operation runs under one lock, which gives the atomicity the
/// party layer relies on.
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                next_party_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Create an account and issue a session token for it
    pub fn register_account(&self, user: &str, rank: Rank) -> (String, String) {
        let uuid = new_player_uuid();
        let token = generate_token();
        let mut tables = self.tables.lock();
        tables.players.insert(
            uuid.clone(),
            PlayerRow {
                user: user.to_string(),
                rank,
                badge: "null".to_string(),
                account: true,
                standing: Standing::Good,
                muted: false,
            },
        );
        tables.tokens.insert(token.clone(), uuid.clone());
        (uuid, token)
    }

    pub fn set_standing(&self, uuid: &str, standing: Standing) -> bool {
        match self.tables.lock().players.get_mut(uuid) {
            Some(row) => {
                row.standing = standing;
                true
            }
            None => false,
        }
    }

    pub fn set_muted(&self, uuid: &str, muted: bool) -> bool {
        match self.tables.lock().players.get_mut(uuid) {
            Some(row) => {
                row.muted = muted;
                true
            }
            None => false,
        }
    }

    pub fn set_rank(&self, uuid: &str, rank: Rank) -> bool {
        match self.tables.lock().players.get_mut(uuid) {
            Some(row) => {
                row.rank = rank;
                true
            }
            None => false,
        }
    }

    /// Create a guest row directly (guests are normally created on first connect)
    pub fn register_guest(&self, addr: IpAddr) -> String {
        let mut tables = self.tables.lock();
        guest_for(&mut tables, addr)
    }
}

fn new_player_uuid() -> String {
    Uuid::new_v4().simple().to_string()
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn guest_for(tables: &mut Tables, addr: IpAddr) -> String {
    if let Some(uuid) = tables.guests.get(&addr) {
        return uuid.clone();
    }
    let uuid = new_player_uuid();
    tables.players.insert(
        uuid.clone(),
        PlayerRow {
            user: String::new(),
            rank: Rank::PLAYER,
            badge: "null".to_string(),
            account: false,
            standing: Standing::Good,
            muted: false,
        },
    );
    tables.guests.insert(addr, uuid.clone());
    uuid
}

#[async_trait]
impl Store for MemoryStore {
    async fn player_by_token(&self, token: &str) -> Result<Option<PlayerRecord>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables
            .tokens
            .get(token)
            .and_then(|uuid| tables.player_record(uuid)))
    }

    async fn guest_by_address(&self, addr: IpAddr) -> Result<PlayerRecord, StoreError> {
        let mut tables = self.tables.lock();
        let uuid = guest_for(&mut tables, addr);
        tables
            .player_record(&uuid)
            .ok_or(StoreError::NotFound("player"))
    }

    async fn load_profile(&self, uuid: &str) -> Result<Profile, StoreError> {
        Ok(self
            .tables
            .lock()
            .profiles
            .get(uuid)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_profile(&self, uuid: &str, profile: &Profile) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        if !tables.players.contains_key(uuid) {
            return Err(StoreError::NotFound("player"));
        }
        tables.profiles.insert(uuid.to_string(), profile.clone());
        Ok(())
    }

    async fn set_badge(&self, uuid: &str, badge: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let row = tables
            .players
            .get_mut(uuid)
            .ok_or(StoreError::NotFound("player"))?;
        if !row.account {
            return Err(StoreError::Conflict("guests cannot equip badges"));
        }
        row.badge = badge.to_string();
        Ok(())
    }

    async fn party_id_of(&self, uuid: &str) -> Result<Option<PartyId>, StoreError> {
        Ok(self
            .tables
            .lock()
            .memberships
            .get(uuid)
            .map(|m| m.party_id))
    }

    async fn party(&self, id: PartyId) -> Result<Option<PartyRecord>, StoreError> {
        Ok(self.tables.lock().parties.get(&id).cloned())
    }

    async fn parties(&self) -> Result<Vec<PartyRecord>, StoreError> {
        Ok(self.tables.lock().parties.values().cloned().collect())
    }

    async fn members(&self, id: PartyId) -> Result<Vec<MemberRecord>, StoreError> {
        Ok(self.tables.lock().member_records(id))
    }

    async fn create_party(
        &self,
        owner: &str,
        settings: &PartySettings,
    ) -> Result<PartyId, StoreError> {
        let mut tables = self.tables.lock();
        if tables.memberships.contains_key(owner) {
            return Err(StoreError::Conflict("player already in a party"));
        }

        let id = tables.next_party_id;
        tables.next_party_id += 1;
        let joined = tables.next_join;
        tables.next_join += 1;

        tables.parties.insert(
            id,
            PartyRecord {
                id,
                owner: owner.to_string(),
                settings: settings.clone(),
            },
        );
        tables.memberships.insert(
            owner.to_string(),
            Membership {
                party_id: id,
                joined,
            },
        );
        Ok(id)
    }

    async fn update_party(
        &self,
        id: PartyId,
        owner: &str,
        settings: &PartySettings,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        tables.owned_party(id, owner)?.settings = settings.clone();
        Ok(())
    }

    async fn add_member(&self, id: PartyId, uuid: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        if !tables.parties.contains_key(&id) {
            return Err(StoreError::NotFound("party"));
        }
        if tables.memberships.contains_key(uuid) {
            return Err(StoreError::Conflict("player already in a party"));
        }
        let joined = tables.next_join;
        tables.next_join += 1;
        tables.memberships.insert(
            uuid.to_string(),
            Membership {
                party_id: id,
                joined,
            },
        );
        Ok(())
    }

    async fn remove_member(
        &self,
        id: PartyId,
        uuid: &str,
        online: &HashSet<String>,
    ) -> Result<Removal, StoreError> {
        self.tables.lock().remove_from(id, uuid, online)
    }

    async fn kick_member(
        &self,
        id: PartyId,
        owner: &str,
        target: &str,
    ) -> Result<Removal, StoreError> {
        let mut tables = self.tables.lock();
        tables.owned_party(id, owner)?;
        if target == owner {
            return Err(StoreError::Conflict("owner cannot be kicked"));
        }
        // The owner stays, so nothing is deleted or re-owned
        tables.remove_from(id, target, &HashSet::new())
    }

    async fn set_owner(&self, id: PartyId, owner: &str, uuid: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let is_member = tables.is_member(id, uuid);
        let party = tables.owned_party(id, owner)?;
        if !is_member {
            return Err(StoreError::NotFound("party member"));
        }
        party.owner = uuid.to_string();
        Ok(())
    }

    async fn delete_party(&self, id: PartyId, owner: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        tables.owned_party(id, owner)?;
        tables.parties.remove(&id);
        tables.memberships.retain(|_, m| m.party_id != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn settings(name: &str) -> PartySettings {
        PartySettings {
            name: name.to_string(),
            public: true,
            theme: "0000".to_string(),
            ..Default::default()
        }
    }

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test]
    async fn test_token_resolves_account() {
        let store = MemoryStore::new();
        let (uuid, token) = store.register_account("alice", Rank::MODERATOR);
        assert_eq!(token.len(), TOKEN_LEN);

        let player = store.player_by_token(&token).await.unwrap().unwrap();
        assert_eq!(player.uuid, uuid);
        assert_eq!(player.name, "alice");
        assert!(player.account);
        assert_eq!(player.rank, Rank::MODERATOR);

        assert!(store.player_by_token("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_guest_is_stable_per_address() {
        let store = MemoryStore::new();
        let first = store.guest_by_address(addr(1)).await.unwrap();
        let again = store.guest_by_address(addr(1)).await.unwrap();
        let other = store.guest_by_address(addr(2)).await.unwrap();

        assert_eq!(first.uuid, again.uuid);
        assert_ne!(first.uuid, other.uuid);
        assert!(!first.account);
    }

    #[tokio::test]
    async fn test_profile_round_trip() {
        let store = MemoryStore::new();
        let uuid = store.register_guest(addr(1));
        assert_eq!(store.load_profile(&uuid).await.unwrap(), Profile::default());

        let profile = Profile {
            name: "Wanderer".to_string(),
            system_name: "blue".to_string(),
            sprite_name: "kid".to_string(),
            sprite_index: 3,
        };
        store.save_profile(&uuid, &profile).await.unwrap();
        assert_eq!(store.load_profile(&uuid).await.unwrap(), profile);

        let missing = store.save_profile("ghost", &profile).await;
        assert_eq!(missing, Err(StoreError::NotFound("player")));
    }

    #[tokio::test]
    async fn test_party_ids_start_at_one() {
        let store = MemoryStore::new();
        let a = store.register_guest(addr(1));
        let b = store.register_guest(addr(2));

        assert_eq!(store.create_party(&a, &settings("A")).await.unwrap(), 1);
        assert_eq!(store.create_party(&b, &settings("B")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_create_rejects_existing_member() {
        let store = MemoryStore::new();
        let a = store.register_guest(addr(1));
        store.create_party(&a, &settings("A")).await.unwrap();

        let result = store.create_party(&a, &settings("again")).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_remove_last_member_deletes_party() {
        let store = MemoryStore::new();
        let a = store.register_guest(addr(1));
        let b = store.register_guest(addr(2));
        let id = store.create_party(&a, &settings("A")).await.unwrap();
        store.add_member(id, &b).await.unwrap();

        let removal = store.remove_member(id, &a, &HashSet::new()).await.unwrap();
        assert_eq!(removal.remaining, 1);
        assert!(!removal.party_deleted);
        assert_eq!(removal.new_owner.as_deref(), Some(b.as_str()));

        let removal = store.remove_member(id, &b, &HashSet::new()).await.unwrap();
        assert!(removal.party_deleted);
        assert!(store.party(id).await.unwrap().is_none());
        assert_eq!(
            store.remove_member(id, &b, &HashSet::new()).await,
            Err(StoreError::NotFound("party"))
        );
    }

    #[tokio::test]
    async fn test_remove_is_scoped_to_party() {
        let store = MemoryStore::new();
        let a = store.register_guest(addr(1));
        let b = store.register_guest(addr(2));
        let first = store.create_party(&a, &settings("A")).await.unwrap();
        let second = store.create_party(&b, &settings("B")).await.unwrap();

        assert_eq!(
            store.remove_member(first, &b, &HashSet::new()).await,
            Err(StoreError::NotFound("party member"))
        );
        assert_eq!(
            store.kick_member(first, &a, &b).await,
            Err(StoreError::NotFound("party member"))
        );
        assert_eq!(store.party_id_of(&b).await.unwrap(), Some(second));
        assert_eq!(store.party(second).await.unwrap().unwrap().owner, b);
    }

    #[tokio::test]
    async fn test_owner_removal_passes_ownership_in_one_step() {
        let store = MemoryStore::new();
        let owner = store.register_guest(addr(1));
        let offline_admin = store.register_guest(addr(2));
        let online = store.register_guest(addr(3));
        store.set_rank(&offline_admin, Rank::ADMIN);
        let id = store.create_party(&owner, &settings("A")).await.unwrap();
        store.add_member(id, &offline_admin).await.unwrap();
        store.add_member(id, &online).await.unwrap();

        let online_set = HashSet::from([owner.clone(), online.clone()]);
        let removal = store.remove_member(id, &owner, &online_set).await.unwrap();
        assert_eq!(removal.new_owner.as_deref(), Some(online.as_str()));
        assert_eq!(store.party(id).await.unwrap().unwrap().owner, online);

        // Non-owner removal leaves ownership alone
        let removal = store.remove_member(id, &offline_admin, &online_set).await.unwrap();
        assert_eq!(removal.new_owner, None);
        assert_eq!(store.party(id).await.unwrap().unwrap().owner, online);
    }

    #[tokio::test]
    async fn test_owner_gated_operations() {
        let store = MemoryStore::new();
        let a = store.register_guest(addr(1));
        let b = store.register_guest(addr(2));
        let id = store.create_party(&a, &settings("A")).await.unwrap();
        store.add_member(id, &b).await.unwrap();

        assert_eq!(store.kick_member(id, &b, &a).await, Err(StoreError::NotOwner));
        assert!(matches!(
            store.kick_member(id, &a, &a).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(
            store.update_party(id, &b, &settings("B")).await,
            Err(StoreError::NotOwner)
        );
        assert_eq!(store.delete_party(id, &b).await, Err(StoreError::NotOwner));
        assert_eq!(store.party(id).await.unwrap().unwrap().settings.name, "A");

        let removal = store.kick_member(id, &a, &b).await.unwrap();
        assert_eq!(removal.remaining, 1);
        assert!(store.party_id_of(&b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_member_to_deleted_party() {
        let store = MemoryStore::new();
        let a = store.register_guest(addr(1));
        let b = store.register_guest(addr(2));
        let id = store.create_party(&a, &settings("A")).await.unwrap();

        store.delete_party(id, &a).await.unwrap();

        assert_eq!(
            store.add_member(id, &b).await,
            Err(StoreError::NotFound("party"))
        );
        assert!(store.party_id_of(&a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_members_in_join_order() {
        let store = MemoryStore::new();
        let a = store.register_guest(addr(1));
        let b = store.register_guest(addr(2));
        let c = store.register_guest(addr(3));
        let id = store.create_party(&a, &settings("A")).await.unwrap();
        store.add_member(id, &c).await.unwrap();
        store.add_member(id, &b).await.unwrap();

        let order: Vec<String> = store
            .members(id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.uuid)
            .collect();
        assert_eq!(order, vec![a, c, b]);
    }

    #[tokio::test]
    async fn test_set_owner_requires_membership() {
        let store = MemoryStore::new();
        let a = store.register_guest(addr(1));
        let b = store.register_guest(addr(2));
        let id = store.create_party(&a, &settings("A")).await.unwrap();

        assert_eq!(
            store.set_owner(id, &a, &b).await,
            Err(StoreError::NotFound("party member"))
        );
        store.add_member(id, &b).await.unwrap();
        store.set_owner(id, &a, &b).await.unwrap();
        assert_eq!(store.party(id).await.unwrap().unwrap().owner, b);

        // Ownership already moved on
        assert_eq!(store.set_owner(id, &a, &a).await, Err(StoreError::NotOwner));
    }

    #[tokio::test]
    async fn test_guest_cannot_set_badge() {
        let store = MemoryStore::new();
        let guest = store.register_guest(addr(1));
        let (account, _) = store.register_account("bob", Rank::PLAYER);

        assert!(store.set_badge(&guest, "star").await.is_err());
        store.set_badge(&account, "star").await.unwrap();
    }
}
