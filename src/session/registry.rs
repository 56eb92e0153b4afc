//! Connection registry state
//!
//! Owned by the session actor; nothing else mutates it. All delivery is a
//! non-blocking enqueue, and a recipient whose queue is full or closed is
//! evicted on the spot.

use std::collections::HashMap;
use std::net::IpAddr;

use bitvec::prelude::*;
use tokio::sync::mpsc::error::TrySendError;

use crate::net::protocol::ServerMessage;
use crate::session::client::{
    Admission, Channels, ClientRecord, ClientView, LiveProfile, Payload, ProfileChange,
};
use crate::store::{Standing, StoreError};

/// Reasons a connection is refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("player is banned")]
    Banned,
    #[error("address is flagged")]
    AddressFlagged,
    #[error("too many connections from {0}")]
    TooManyFromAddress(IpAddr),
    #[error("server full")]
    ServerFull,
    #[error("identity lookup failed: {0}")]
    Store(#[from] StoreError),
    #[error("session actor stopped")]
    Closed,
}

/// Record mutation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    #[error("client not connected")]
    NotConnected,
    #[error("name already set")]
    NameLocked,
}

/// Result of a successful admission
#[derive(Debug)]
pub struct Admitted {
    pub view: ClientView,
    /// Previous record for the same identity, already removed
    pub evicted: Option<ClientRecord>,
}

pub struct Registry {
    clients: HashMap<String, ClientRecord>,
    /// Bit `n` set while session id `n` is in use; bit 0 is reserved
    ids: BitVec,
    max_per_address: usize,
    next_connection: u64,
}

impl Registry {
    pub fn new(max_session_id: u32, max_per_address: usize) -> Self {
        let mut ids = bitvec![0; max_session_id as usize + 1];
        ids.set(0, true);
        Self {
            clients: HashMap::new(),
            ids,
            max_per_address,
            next_connection: 1,
        }
    }

    /// Admit a resolved identity, evicting any live record with the same uuid
    pub fn admit(
        &mut self,
        mut admission: Admission,
        channels: Channels,
    ) -> Result<Admitted, AdmissionError> {
        if admission.player.standing == Standing::Banned {
            return Err(AdmissionError::Banned);
        }

        let uuid = admission.player.uuid.clone();
        let same_address = self
            .clients
            .values()
            .filter(|c| c.addr == admission.addr && c.uuid != uuid)
            .count();
        if same_address >= self.max_per_address {
            return Err(AdmissionError::TooManyFromAddress(admission.addr));
        }

        if !self.clients.contains_key(&uuid) && self.ids.first_zero().is_none() {
            return Err(AdmissionError::ServerFull);
        }

        let evicted = self.remove(&uuid);
        // The superseded record holds the newest display state
        if let Some(old) = &evicted {
            admission.profile = old.profile();
        }

        let session_id = self
            .ids
            .first_zero()
            .ok_or(AdmissionError::ServerFull)?;
        self.ids.set(session_id, true);

        let connection_id = self.next_connection;
        self.next_connection += 1;

        let mut record = ClientRecord::new(session_id as u32, connection_id, admission, channels);
        if let Some(old) = &evicted {
            record.prev_map_id = old.prev_map_id.clone();
            record.prev_locations = old.prev_locations.clone();
        }
        let greeting = ServerMessage::Greeting {
            session_id: record.session_id,
            uuid: &record.uuid,
            rank: record.rank.0,
            account: record.account,
            badge: &record.badge,
        }
        .encode();
        // Fresh queue always has room
        let _ = record.try_send(greeting.into());

        let view = record.view();
        self.clients.insert(uuid, record);
        Ok(Admitted { view, evicted })
    }

    /// Remove a record and free its session id
    pub fn remove(&mut self, uuid: &str) -> Option<ClientRecord> {
        let record = self.clients.remove(uuid)?;
        self.ids.set(record.session_id as usize, false);
        Some(record)
    }

    /// Remove a record only if it still belongs to the given connection
    pub fn remove_connection(&mut self, uuid: &str, connection_id: u64) -> Option<ClientRecord> {
        match self.clients.get(uuid) {
            Some(record) if record.connection_id == connection_id => self.remove(uuid),
            _ => None,
        }
    }

    /// Deliver to every record; returns evicted records
    pub fn broadcast(&mut self, payload: &Payload, origin: Option<&str>) -> Vec<ClientRecord> {
        let recipients: Vec<String> = self.clients.keys().cloned().collect();
        self.deliver(recipients.iter().map(String::as_str), payload, origin)
    }

    /// Deliver to one record; no-op if absent
    pub fn send(&mut self, uuid: &str, payload: &Payload) -> Vec<ClientRecord> {
        self.deliver(std::iter::once(uuid), payload, None)
    }

    /// Deliver to a set of records, skipping absent ones
    pub fn send_many<'a, I>(
        &mut self,
        uuids: I,
        payload: &Payload,
        origin: Option<&str>,
    ) -> Vec<ClientRecord>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.deliver(uuids, payload, origin)
    }

    fn deliver<'a, I>(&mut self, uuids: I, payload: &Payload, origin: Option<&str>) -> Vec<ClientRecord>
    where
        I: IntoIterator<Item = &'a str>,
    {
        // Invisible origins only reach themselves and staff
        let hidden_origin = origin
            .and_then(|o| self.clients.get(o))
            .filter(|o| !o.visible)
            .map(|o| o.uuid.clone());

        let mut failed = Vec::new();
        for uuid in uuids {
            let Some(record) = self.clients.get(uuid) else {
                continue;
            };
            if let Some(hidden) = &hidden_origin {
                if record.uuid != *hidden && !record.rank.is_staff() {
                    continue;
                }
            }
            match record.try_send(payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("Outbound queue full for {}, evicting", uuid);
                    failed.push(uuid.to_string());
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("Outbound queue closed for {}, evicting", uuid);
                    failed.push(uuid.to_string());
                }
            }
        }

        failed.iter().filter_map(|uuid| self.remove(uuid)).collect()
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn lookup(&self, uuid: &str) -> Option<ClientView> {
        self.clients.get(uuid).map(ClientRecord::view)
    }

    /// Visible records and their live display state
    pub fn roster(&self) -> HashMap<String, LiveProfile> {
        self.clients
            .values()
            .filter(|c| c.visible)
            .map(|c| (c.uuid.clone(), c.live_profile()))
            .collect()
    }

    /// Apply a change to the record of an admitted connection
    pub fn apply(
        &mut self,
        uuid: &str,
        connection_id: u64,
        change: ProfileChange,
    ) -> Result<ClientView, UpdateError> {
        let record = self
            .clients
            .get_mut(uuid)
            .filter(|r| r.connection_id == connection_id)
            .ok_or(UpdateError::NotConnected)?;

        match change {
            ProfileChange::Name(name) => {
                // Accounts keep their user name; guests may name themselves once
                if record.account || !record.name.is_empty() {
                    return Err(UpdateError::NameLocked);
                }
                record.name = name;
            }
            ProfileChange::Badge(badge) => record.badge = badge,
            ProfileChange::Sprite { name, index } => {
                record.sprite_name = name;
                record.sprite_index = index;
            }
            ProfileChange::System(name) => record.system_name = name,
            ProfileChange::PrevLocation { map_id, locations } => {
                record.prev_map_id = map_id;
                record.prev_locations = locations;
            }
        }
        Ok(record.view())
    }

    /// Remove every record
    pub fn drain(&mut self) -> Vec<ClientRecord> {
        let uuids: Vec<String> = self.clients.keys().cloned().collect();
        uuids.iter().filter_map(|uuid| self.remove(uuid)).collect()
    }

    /// Session ids currently in use, for invariant checks
    pub fn session_ids(&self) -> Vec<u32> {
        self.clients.values().map(|c| c.session_id).collect()
    }
}
