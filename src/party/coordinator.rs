use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::metrics::Metrics;
use crate::party::error::PartyError;
use crate::party::model::{PartyId, PartyMemberView, PartySettings, PartySummary, PartyView};
use crate::session::client::LiveProfile;
use crate::store::{MemberRecord, PartyRecord, Rank, Removal, Store, StoreError};

/// Attempts at leaving while the player's membership keeps moving
const LEAVE_ATTEMPTS: usize = 3;

/// Online-status source for party views and owner reassignment
#[async_trait]
pub trait Presence: Send + Sync {
    /// Visible online players and their live display state
    async fn roster(&self) -> HashMap<String, LiveProfile>;
}

/// Identity of the player issuing a party operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub uuid: String,
    pub rank: Rank,
}

impl Requester {
    pub fn new(uuid: impl Into<String>, rank: Rank) -> Self {
        Self {
            uuid: uuid.into(),
            rank,
        }
    }
}

/// Party state machine over the store.
///
/// Holds no party rows of its own; every operation reads what it needs from
/// the store and writes back through single atomic store calls.
pub struct PartyCoordinator {
    store: Arc<dyn Store>,
    presence: Arc<dyn Presence>,
    metrics: Arc<Metrics>,
}

impl PartyCoordinator {
    pub fn new(store: Arc<dyn Store>, presence: Arc<dyn Presence>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            presence,
            metrics,
        }
    }

    /// Create a party owned by the requester
    pub async fn create(
        &self,
        requester: &Requester,
        settings: PartySettings,
    ) -> Result<PartyId, PartyError> {
        settings.validate()?;
        if self.store.party_id_of(&requester.uuid).await?.is_some() {
            return Err(PartyError::Conflict("already in a party"));
        }

        let id = self
            .store
            .create_party(&requester.uuid, &settings.normalized())
            .await?;

        Metrics::incr(&self.metrics.parties_created);
        tracing::info!("Party {} created by {}", id, requester.uuid);
        Ok(id)
    }

    /// Replace the settings of the requester's party
    pub async fn update(
        &self,
        requester: &Requester,
        settings: PartySettings,
    ) -> Result<PartyId, PartyError> {
        settings.validate()?;
        let party = self.owned_party(requester).await?;
        self.store
            .update_party(party.id, &requester.uuid, &settings.normalized())
            .await?;
        tracing::debug!("Party {} updated by {}", party.id, requester.uuid);
        Ok(party.id)
    }

    pub async fn join(
        &self,
        requester: &Requester,
        party_id: PartyId,
        pass: Option<&str>,
    ) -> Result<(), PartyError> {
        if self.store.party_id_of(&requester.uuid).await?.is_some() {
            return Err(PartyError::Conflict("already in a party"));
        }

        let party = self
            .store
            .party(party_id)
            .await?
            .ok_or(PartyError::NotFound("party"))?;

        let settings = &party.settings;
        let checked = !settings.public && !settings.pass.is_empty() && !requester.rank.is_staff();
        if checked && pass.unwrap_or_default() != settings.pass {
            tracing::warn!(
                "Wrong password from {} for party {}",
                requester.uuid,
                party_id
            );
            return Err(PartyError::WrongPassword);
        }

        self.store.add_member(party_id, &requester.uuid).await?;

        Metrics::incr(&self.metrics.party_joins);
        tracing::debug!("{} joined party {}", requester.uuid, party_id);
        Ok(())
    }

    pub async fn leave(&self, requester: &Requester) -> Result<(), PartyError> {
        let online: HashSet<String> = self.presence.roster().await.into_keys().collect();

        for _ in 0..LEAVE_ATTEMPTS {
            let party_id = self
                .store
                .party_id_of(&requester.uuid)
                .await?
                .ok_or(PartyError::NotFound("party membership"))?;

            match self
                .store
                .remove_member(party_id, &requester.uuid, &online)
                .await
            {
                Ok(removal) => {
                    self.record_removal(&removal);
                    tracing::debug!("{} left party {}", requester.uuid, party_id);
                    return Ok(());
                }
                // Membership moved between the read and the removal
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(PartyError::Conflict("party membership kept changing"))
    }

    pub async fn kick(&self, requester: &Requester, target: &str) -> Result<(), PartyError> {
        let party = self.owned_party(requester).await?;
        if target == requester.uuid {
            return Err(PartyError::Invalid("cannot kick yourself"));
        }

        let removal = self
            .store
            .kick_member(party.id, &requester.uuid, target)
            .await?;
        self.record_removal(&removal);
        tracing::info!("{} kicked {} from party {}", requester.uuid, target, party.id);
        Ok(())
    }

    pub async fn transfer(&self, requester: &Requester, target: &str) -> Result<(), PartyError> {
        let party = self.owned_party(requester).await?;
        self.store
            .set_owner(party.id, &requester.uuid, target)
            .await?;
        tracing::info!(
            "Party {} ownership transferred from {} to {}",
            party.id,
            requester.uuid,
            target
        );
        Ok(())
    }

    pub async fn disband(&self, requester: &Requester) -> Result<(), PartyError> {
        let party = self.owned_party(requester).await?;
        self.store.delete_party(party.id, &requester.uuid).await?;

        Metrics::incr(&self.metrics.parties_deleted);
        tracing::info!("Party {} disbanded by {}", party.id, requester.uuid);
        Ok(())
    }

    fn record_removal(&self, removal: &Removal) {
        Metrics::incr(&self.metrics.party_leaves);
        if removal.party_deleted {
            Metrics::incr(&self.metrics.parties_deleted);
            tracing::info!("Party {} deleted after last member left", removal.party_id);
        }
        if let Some(owner) = &removal.new_owner {
            tracing::info!("Party {} ownership passed to {}", removal.party_id, owner);
        }
    }

    // Queries

    pub async fn party_id(&self, uuid: &str) -> Result<Option<PartyId>, PartyError> {
        Ok(self.store.party_id_of(uuid).await?)
    }

    pub async fn description(&self, party_id: PartyId) -> Result<String, PartyError> {
        let party = self
            .store
            .party(party_id)
            .await?
            .ok_or(PartyError::NotFound("party"))?;
        Ok(party.settings.description)
    }

    /// The requester's party; the password is only included for its owner
    pub async fn party_for(&self, uuid: &str) -> Result<PartyView, PartyError> {
        let party = self.current_party(uuid).await?;
        let roster = self.presence.roster().await;
        let view = self.build_view(party, &roster).await?;
        Ok(if view.owner_uuid == uuid {
            view
        } else {
            view.redacted()
        })
    }

    /// Uuids of every member of the player's party, including the player
    pub async fn member_uuids(&self, uuid: &str) -> Result<Vec<String>, PartyError> {
        let party_id = self
            .store
            .party_id_of(uuid)
            .await?
            .ok_or(PartyError::NotFound("party membership"))?;
        Ok(self
            .store
            .members(party_id)
            .await?
            .into_iter()
            .map(|m| m.uuid)
            .collect())
    }

    /// Parties with at least one online member, passwords stripped
    pub async fn list(&self) -> Result<Vec<PartyView>, PartyError> {
        Ok(self
            .snapshots()
            .await?
            .into_iter()
            .map(|view| view.redacted())
            .collect())
    }

    pub async fn list_summaries(&self) -> Result<Vec<PartySummary>, PartyError> {
        Ok(self.list().await?.iter().map(PartySummary::from).collect())
    }

    /// Unredacted views of every party with an online member
    pub async fn snapshots(&self) -> Result<Vec<PartyView>, PartyError> {
        let roster = self.presence.roster().await;
        let mut views = Vec::new();
        for party in self.store.parties().await? {
            let id = party.id;
            match self.build_view(party, &roster).await {
                Ok(view) if view.has_online_member() => views.push(view),
                Ok(_) => {}
                // Deleted between the listing and the member read
                Err(PartyError::NotFound(_)) => {
                    tracing::debug!("Party {} vanished during snapshot", id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(views)
    }

    async fn current_party(&self, uuid: &str) -> Result<PartyRecord, PartyError> {
        let party_id = self
            .store
            .party_id_of(uuid)
            .await?
            .ok_or(PartyError::NotFound("party membership"))?;
        self.store
            .party(party_id)
            .await?
            .ok_or(PartyError::NotFound("party"))
    }

    async fn owned_party(&self, requester: &Requester) -> Result<PartyRecord, PartyError> {
        let party = self.current_party(&requester.uuid).await?;
        if party.owner != requester.uuid {
            return Err(PartyError::Forbidden("only the party owner can do that"));
        }
        Ok(party)
    }

    async fn build_view(
        &self,
        party: PartyRecord,
        roster: &HashMap<String, LiveProfile>,
    ) -> Result<PartyView, PartyError> {
        let mut members = self.store.members(party.id).await?;
        if members.is_empty() {
            return Err(PartyError::NotFound("party"));
        }
        sort_members(&mut members, &party.owner);

        let members = members
            .into_iter()
            .map(|m| member_view(m, roster))
            .collect();

        let settings = party.settings;
        Ok(PartyView {
            id: party.id,
            name: settings.name,
            public: settings.public,
            pass: (!settings.public).then_some(settings.pass),
            theme: settings.theme,
            description: settings.description,
            owner_uuid: party.owner,
            members,
        })
    }
}

/// Owner first, then rank descending, then join order
pub fn sort_members(members: &mut [MemberRecord], owner: &str) {
    members.sort_by_key(|m| (m.uuid != owner, Reverse(m.rank), m.joined));
}

fn member_view(member: MemberRecord, roster: &HashMap<String, LiveProfile>) -> PartyMemberView {
    let live = roster.get(&member.uuid);
    let (name, system_name, sprite_name, sprite_index) = match live {
        Some(live) => (
            live.name.clone(),
            live.system_name.clone(),
            live.sprite_name.clone(),
            live.sprite_index,
        ),
        None => (
            member.name,
            member.profile.system_name,
            member.profile.sprite_name,
            member.profile.sprite_index,
        ),
    };

    PartyMemberView {
        uuid: member.uuid,
        name,
        rank: member.rank,
        account: member.account,
        badge: if member.account {
            member.badge
        } else {
            "null".to_string()
        },
        system_name,
        sprite_name,
        sprite_index,
        online: live.is_some(),
    }
}
