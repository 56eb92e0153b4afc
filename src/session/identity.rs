//! Identity resolution at handshake
//!
//! Runs on the connecting unit before anything reaches the session actor.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::metrics::Metrics;
use crate::session::client::Admission;
use crate::session::flush::FlushLedger;
use crate::session::registry::AdmissionError;
use crate::store::memory::TOKEN_LEN;
use crate::store::{PlayerRecord, Standing, Store};

/// VPN/ban reputation lookup for source addresses
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AddressReputation: Send + Sync {
    async fn is_flagged(&self, addr: IpAddr) -> bool;
}

/// Reputation source that flags nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl AddressReputation for AllowAll {
    async fn is_flagged(&self, _addr: IpAddr) -> bool {
        false
    }
}

/// Connection parameters taken from the session request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    pub token: Option<String>,
    pub offline: bool,
}

impl Handshake {
    /// Parse `token=` and `offline=1` from a request path's query.
    /// Tokens of the wrong length are ignored.
    pub fn from_path(path: &str) -> Self {
        let mut handshake = Self::default();
        let Some((_, query)) = path.split_once('?') else {
            return handshake;
        };

        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("token", value)) if value.len() == TOKEN_LEN => {
                    handshake.token = Some(value.to_string());
                }
                Some(("offline", "1")) => handshake.offline = true,
                _ => {}
            }
        }
        handshake
    }
}

pub struct IdentityResolver {
    store: Arc<dyn Store>,
    ledger: Arc<FlushLedger>,
    reputation: Arc<dyn AddressReputation>,
    metrics: Arc<Metrics>,
}

impl IdentityResolver {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<FlushLedger>,
        reputation: Arc<dyn AddressReputation>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            ledger,
            reputation,
            metrics,
        }
    }

    /// Resolve who is connecting and load their display state
    pub async fn resolve(
        &self,
        handshake: &Handshake,
        addr: IpAddr,
    ) -> Result<Admission, AdmissionError> {
        let result = self.lookup(handshake, addr).await;
        if let Err(e) = &result {
            Metrics::incr(&self.metrics.connections_rejected);
            tracing::warn!("Refused connection from {}: {}", addr, e);
        }
        result
    }

    async fn lookup(&self, handshake: &Handshake, addr: IpAddr) -> Result<Admission, AdmissionError> {
        let account = match &handshake.token {
            Some(token) => self.store.player_by_token(token).await?,
            None => None,
        };

        let player = match account {
            Some(player) => player,
            None => self.guest(addr).await?,
        };

        if player.standing == Standing::Banned {
            return Err(AdmissionError::Banned);
        }
        if player.standing == Standing::ShadowBanned {
            tracing::info!("Shadow-banned player {} connecting invisibly", player.uuid);
        }

        // Released state not yet written wins over the store copy
        let flush_mark = self.ledger.mark();
        let profile = match self.ledger.latest(&player.uuid) {
            Some(profile) => profile,
            None => self.store.load_profile(&player.uuid).await?,
        };
        Ok(Admission {
            player,
            profile,
            addr,
            offline: handshake.offline,
            flush_mark,
        })
    }

    async fn guest(&self, addr: IpAddr) -> Result<PlayerRecord, AdmissionError> {
        if self.reputation.is_flagged(addr).await {
            return Err(AdmissionError::AddressFlagged);
        }
        Ok(self.store.guest_by_address(addr).await?)
    }
}
