//! Session actor
//!
//! One task owns the [`Registry`] and applies intents from a bounded inbox in
//! arrival order. Everything else talks to it through a cloneable
//! [`SessionHandle`].

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::metrics::Metrics;
use crate::party::coordinator::Presence;
use crate::session::client::{
    Admission, Channels, ClientRecord, ClientView, LiveProfile, Payload, ProfileChange,
};
use crate::session::flush::{FlushLedger, Flusher};
use crate::session::registry::{AdmissionError, Registry, UpdateError};
use crate::store::Store;

/// Depth of the actor's intent queue
pub const INBOX_CAPACITY: usize = 1024;

/// Errors talking to the session actor
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session actor stopped")]
    Closed,
    #[error(transparent)]
    Update(#[from] UpdateError),
}

/// Intents consumed by the actor
#[derive(Debug)]
pub enum SessionCommand {
    Connect {
        admission: Admission,
        channels: Channels,
        reply: oneshot::Sender<Result<ClientView, AdmissionError>>,
    },
    Disconnect {
        uuid: String,
        reply: oneshot::Sender<bool>,
    },
    /// Disconnect issued by a connection unit on its way out
    DisconnectConnection { uuid: String, connection_id: u64 },
    Broadcast {
        payload: Payload,
        origin: Option<String>,
    },
    Send { uuid: String, payload: Payload },
    SendMany {
        uuids: Vec<String>,
        payload: Payload,
        origin: Option<String>,
    },
    Count { reply: oneshot::Sender<usize> },
    Roster {
        reply: oneshot::Sender<HashMap<String, LiveProfile>>,
    },
    Lookup {
        uuid: String,
        reply: oneshot::Sender<Option<ClientView>>,
    },
    Update {
        uuid: String,
        connection_id: u64,
        change: ProfileChange,
        reply: oneshot::Sender<Result<ClientView, UpdateError>>,
    },
    Shutdown { reply: oneshot::Sender<()> },
}

pub struct SessionActor {
    registry: Registry,
    inbox: mpsc::Receiver<SessionCommand>,
    ledger: Arc<FlushLedger>,
    flusher: Flusher,
    metrics: Arc<Metrics>,
}

impl SessionActor {
    /// Start the actor task
    pub fn spawn(
        registry: Registry,
        store: Arc<dyn Store>,
        ledger: Arc<FlushLedger>,
        metrics: Arc<Metrics>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let flusher = Flusher::spawn(store, ledger.clone(), metrics.clone());
        let actor = Self {
            registry,
            inbox,
            ledger,
            flusher,
            metrics,
        };
        let task = tokio::spawn(actor.run());
        (SessionHandle { tx }, task)
    }

    async fn run(mut self) {
        tracing::debug!("Session actor started");
        let mut stopped = None;
        while let Some(command) = self.inbox.recv().await {
            if let SessionCommand::Shutdown { reply } = command {
                let remaining = self.registry.drain();
                tracing::info!("Session actor stopping, releasing {} clients", remaining.len());
                for record in remaining {
                    self.release(record, "shutdown");
                }
                self.update_gauge();
                stopped = Some(reply);
                break;
            }
            self.handle(command);
            self.update_gauge();
        }

        // Pending writes land before anyone hears we stopped
        self.flusher.finish().await;
        match stopped {
            Some(reply) => {
                let _ = reply.send(());
            }
            None => tracing::debug!("Session actor inbox closed"),
        }
    }

    fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect {
                mut admission,
                channels,
                reply,
            } => {
                let uuid = admission.player.uuid.clone();
                // Released after the identity lookup read the store
                if let Some(profile) = self.ledger.released_since(&uuid, admission.flush_mark) {
                    admission.profile = profile;
                }
                let addr = admission.addr;
                let result = match self.registry.admit(admission, channels) {
                    Ok(admitted) => {
                        if let Some(old) = admitted.evicted {
                            tracing::info!("Evicting previous connection for {}", old.uuid);
                            Metrics::incr(&self.metrics.clients_evicted);
                            self.release(old, "replaced");
                        }
                        Metrics::incr(&self.metrics.connections_admitted);
                        tracing::info!(
                            "Client {} connected from {} as session {}",
                            uuid,
                            addr,
                            admitted.view.session_id
                        );
                        Ok(admitted.view)
                    }
                    Err(e) => {
                        Metrics::incr(&self.metrics.connections_rejected);
                        tracing::warn!("Rejected {} from {}: {}", uuid, addr, e);
                        Err(e)
                    }
                };
                // A dropped reply means the connection unit is gone; its record
                // is cleaned up by its own disconnect or by the next broadcast
                let _ = reply.send(result);
            }
            SessionCommand::Disconnect { uuid, reply } => {
                let removed = match self.registry.remove(&uuid) {
                    Some(record) => {
                        self.release(record, "disconnect");
                        true
                    }
                    None => {
                        tracing::warn!("Disconnect for unknown client {}", uuid);
                        false
                    }
                };
                let _ = reply.send(removed);
            }
            SessionCommand::DisconnectConnection {
                uuid,
                connection_id,
            } => match self.registry.remove_connection(&uuid, connection_id) {
                Some(record) => self.release(record, "disconnect"),
                None => tracing::debug!(
                    "Connection {} of {} already superseded or removed",
                    connection_id,
                    uuid
                ),
            },
            SessionCommand::Broadcast { payload, origin } => {
                let evicted = self.registry.broadcast(&payload, origin.as_deref());
                self.release_evicted(evicted);
            }
            SessionCommand::Send { uuid, payload } => {
                let evicted = self.registry.send(&uuid, &payload);
                self.release_evicted(evicted);
            }
            SessionCommand::SendMany {
                uuids,
                payload,
                origin,
            } => {
                let evicted = self.registry.send_many(
                    uuids.iter().map(String::as_str),
                    &payload,
                    origin.as_deref(),
                );
                self.release_evicted(evicted);
            }
            SessionCommand::Count { reply } => {
                let _ = reply.send(self.registry.count());
            }
            SessionCommand::Roster { reply } => {
                let _ = reply.send(self.registry.roster());
            }
            SessionCommand::Lookup { uuid, reply } => {
                let _ = reply.send(self.registry.lookup(&uuid));
            }
            SessionCommand::Update {
                uuid,
                connection_id,
                change,
                reply,
            } => {
                let _ = reply.send(self.registry.apply(&uuid, connection_id, change));
            }
            SessionCommand::Shutdown { .. } => {}
        }
    }

    fn release_evicted(&self, evicted: Vec<ClientRecord>) {
        for record in evicted {
            Metrics::incr(&self.metrics.clients_evicted);
            self.release(record, "backpressure");
        }
    }

    /// Queue a removed record's display state for write-back, then drop it
    fn release(&self, record: ClientRecord, reason: &'static str) {
        self.flusher.release(record.uuid.clone(), record.profile());
        tracing::info!(
            "Client {} released ({}) after {:?}, session {} freed",
            record.uuid,
            reason,
            record.connected_at.elapsed(),
            record.session_id
        );
    }

    fn update_gauge(&self) {
        self.metrics
            .connections_active
            .store(self.registry.count() as u64, Ordering::Relaxed);
    }
}

/// Cloneable front of the session actor
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    async fn submit(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.tx.send(command).await.map_err(|_| SessionError::Closed)
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.submit(build(reply)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn connect(
        &self,
        admission: Admission,
        channels: Channels,
    ) -> Result<ClientView, AdmissionError> {
        self.ask(|reply| SessionCommand::Connect {
            admission,
            channels,
            reply,
        })
        .await
        .map_err(|_| AdmissionError::Closed)?
    }

    /// Remove a client by identity; false if it was not registered
    pub async fn disconnect(&self, uuid: &str) -> Result<bool, SessionError> {
        let uuid = uuid.to_string();
        self.ask(|reply| SessionCommand::Disconnect { uuid, reply })
            .await
    }

    pub async fn disconnect_connection(&self, uuid: &str, connection_id: u64) -> Result<(), SessionError> {
        self.submit(SessionCommand::DisconnectConnection {
            uuid: uuid.to_string(),
            connection_id,
        })
        .await
    }

    pub async fn broadcast(&self, payload: Payload, origin: Option<&str>) -> Result<(), SessionError> {
        self.submit(SessionCommand::Broadcast {
            payload,
            origin: origin.map(str::to_string),
        })
        .await
    }

    pub async fn send(&self, uuid: &str, payload: Payload) -> Result<(), SessionError> {
        self.submit(SessionCommand::Send {
            uuid: uuid.to_string(),
            payload,
        })
        .await
    }

    pub async fn send_many(
        &self,
        uuids: Vec<String>,
        payload: Payload,
        origin: Option<&str>,
    ) -> Result<(), SessionError> {
        self.submit(SessionCommand::SendMany {
            uuids,
            payload,
            origin: origin.map(str::to_string),
        })
        .await
    }

    pub async fn count(&self) -> Result<usize, SessionError> {
        self.ask(|reply| SessionCommand::Count { reply }).await
    }

    pub async fn roster(&self) -> Result<HashMap<String, LiveProfile>, SessionError> {
        self.ask(|reply| SessionCommand::Roster { reply }).await
    }

    pub async fn lookup(&self, uuid: &str) -> Result<Option<ClientView>, SessionError> {
        let uuid = uuid.to_string();
        self.ask(|reply| SessionCommand::Lookup { uuid, reply }).await
    }

    pub async fn update(
        &self,
        uuid: &str,
        connection_id: u64,
        change: ProfileChange,
    ) -> Result<ClientView, SessionError> {
        let uuid = uuid.to_string();
        Ok(self
            .ask(|reply| SessionCommand::Update {
                uuid,
                connection_id,
                change,
                reply,
            })
            .await??)
    }

    /// Release every client and stop the actor
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.ask(|reply| SessionCommand::Shutdown { reply }).await
    }
}

#[async_trait]
impl Presence for SessionHandle {
    async fn roster(&self) -> HashMap<String, LiveProfile> {
        match SessionHandle::roster(self).await {
            Ok(roster) => roster,
            Err(e) => {
                tracing::warn!("Roster unavailable: {}", e);
                HashMap::new()
            }
        }
    }
}
