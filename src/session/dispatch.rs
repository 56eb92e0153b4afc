//! Protocol dispatcher
//!
//! Runs on the connection unit that received the frame. Each sub-message is
//! handled independently; a failure is collected and logged, and the rest of
//! the batch still runs.

use std::sync::Arc;

use async_trait::async_trait;

use crate::metrics::Metrics;
use crate::net::protocol::{self, ClientMessage, ProtocolError, ServerMessage};
use crate::party::{PartyCoordinator, PartyError};
use crate::session::actor::{SessionError, SessionHandle};
use crate::session::client::{ClientView, Payload, ProfileChange};
use crate::store::ranking::RecomputeGate;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("sender is no longer connected")]
    Disconnected,
    #[error("sender is muted")]
    Muted,
    #[error("only accounts can equip badges")]
    NotAccount,
    #[error(transparent)]
    Party(#[from] PartyError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("command hook failed: {0}")]
    Hook(String),
    #[error("encode failed: {0}")]
    Encode(String),
}

/// External handler for commands outside the core table (event reports)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandHook: Send + Sync {
    fn handles(&self, command: &str) -> bool;

    /// Returns an optional reply for the sender
    async fn handle(
        &self,
        sender: &ClientView,
        command: &str,
        args: &[String],
    ) -> Result<Option<String>, String>;
}

#[derive(Clone)]
pub struct Dispatcher {
    session: SessionHandle,
    parties: Arc<PartyCoordinator>,
    store: Arc<dyn Store>,
    hook: Option<Arc<dyn CommandHook>>,
    gate: RecomputeGate,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(
        session: SessionHandle,
        parties: Arc<PartyCoordinator>,
        store: Arc<dyn Store>,
        gate: RecomputeGate,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            session,
            parties,
            store,
            hook: None,
            gate,
            metrics,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn CommandHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Validate a frame and handle each sub-message in order
    pub async fn process_frame(
        &self,
        uuid: &str,
        connection_id: u64,
        bytes: &[u8],
    ) -> Vec<DispatchError> {
        Metrics::incr(&self.metrics.frames_received);

        let frame = match protocol::validate_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                Metrics::incr(&self.metrics.protocol_errors);
                tracing::warn!("Dropped frame from {}: {}", uuid, e);
                return vec![e.into()];
            }
        };

        let mut errors = Vec::new();
        for message in protocol::split_messages(frame) {
            match self.process_message(uuid, connection_id, message).await {
                Ok(()) => Metrics::incr(&self.metrics.messages_dispatched),
                // Nothing more to do for a client that is gone
                Err(DispatchError::Disconnected) => {
                    errors.push(DispatchError::Disconnected);
                    break;
                }
                Err(e) => {
                    if matches!(e, DispatchError::Protocol(_)) {
                        Metrics::incr(&self.metrics.protocol_errors);
                    }
                    tracing::warn!("Message from {} failed: {}", uuid, e);
                    errors.push(e);
                }
            }
        }
        errors
    }

    async fn process_message(
        &self,
        uuid: &str,
        connection_id: u64,
        message: &str,
    ) -> Result<(), DispatchError> {
        let sender = self
            .session
            .lookup(uuid)
            .await?
            .filter(|view| view.connection_id == connection_id)
            .ok_or(DispatchError::Disconnected)?;

        let msg = protocol::decode(message)?;
        let command = msg.command();
        self.handle(&sender, msg).await?;
        tracing::debug!("{} <- {}", uuid, command);
        Ok(())
    }

    async fn handle(&self, sender: &ClientView, msg: ClientMessage<'_>) -> Result<(), DispatchError> {
        match msg {
            ClientMessage::Info => {
                let reply = ServerMessage::Info {
                    uuid: &sender.uuid,
                    rank: sender.rank.0,
                    account: sender.account,
                    badge: &sender.badge,
                    name: &sender.name,
                };
                self.reply(sender, reply).await
            }
            ClientMessage::Name(name) => {
                self.update(sender, ProfileChange::Name(name.to_string()))
                    .await?;
                self.reply(sender, ServerMessage::NameAck(name)).await
            }
            ClientMessage::PrevLocation { map_id, locations } => {
                self.update(
                    sender,
                    ProfileChange::PrevLocation {
                        map_id: map_id.to_string(),
                        locations: locations.to_string(),
                    },
                )
                .await?;

                if self.parties.party_id(&sender.uuid).await?.is_none() {
                    return Ok(());
                }
                let members: Vec<String> = self
                    .parties
                    .member_uuids(&sender.uuid)
                    .await?
                    .into_iter()
                    .filter(|m| *m != sender.uuid)
                    .collect();
                let payload = ServerMessage::PrevLocation {
                    uuid: &sender.uuid,
                    map_id,
                    locations,
                }
                .encode();
                self.session
                    .send_many(members, Payload::from(payload), Some(&sender.uuid))
                    .await?;
                Ok(())
            }
            ClientMessage::GlobalSay { map_id, x, y, msg } => {
                if sender.muted {
                    return Err(DispatchError::Muted);
                }
                let payload = ServerMessage::GlobalSay {
                    uuid: &sender.uuid,
                    map_id,
                    x,
                    y,
                    msg,
                }
                .encode();
                self.session
                    .broadcast(Payload::from(payload), Some(&sender.uuid))
                    .await?;
                Ok(())
            }
            ClientMessage::PartySay(msg) => {
                if sender.muted {
                    return Err(DispatchError::Muted);
                }
                let members = self.parties.member_uuids(&sender.uuid).await?;
                let payload = ServerMessage::PartySay {
                    uuid: &sender.uuid,
                    msg,
                }
                .encode();
                self.session
                    .send_many(members, Payload::from(payload), Some(&sender.uuid))
                    .await?;
                Ok(())
            }
            ClientMessage::PartyStatus => self.party_status(sender).await,
            ClientMessage::Badge(badge) => {
                if !sender.account {
                    return Err(DispatchError::NotAccount);
                }
                self.store.set_badge(&sender.uuid, badge).await?;
                self.update(sender, ProfileChange::Badge(badge.to_string()))
                    .await?;
                self.reply(sender, ServerMessage::BadgeAck(badge)).await
            }
            ClientMessage::Sprite { name, index } => {
                self.update(
                    sender,
                    ProfileChange::Sprite {
                        name: name.to_string(),
                        index,
                    },
                )
                .await?;
                self.reply(sender, ServerMessage::SpriteAck { name, index })
                    .await
            }
            ClientMessage::System(name) => {
                self.update(sender, ProfileChange::System(name.to_string()))
                    .await?;
                self.reply(sender, ServerMessage::SystemAck(name)).await
            }
            ClientMessage::Other { command, args } => {
                let hook = self
                    .hook
                    .as_ref()
                    .filter(|hook| hook.handles(command))
                    .ok_or_else(|| ProtocolError::UnknownCommand(command.to_string()))?;

                self.gate.wait_idle().await;
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                let reply = hook
                    .handle(sender, command, &args)
                    .await
                    .map_err(DispatchError::Hook)?;
                if let Some(reply) = reply {
                    self.session
                        .send(&sender.uuid, Payload::from(reply))
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// `pt` always gets an answer; `pt␟null` covers every failure
    async fn party_status(&self, sender: &ClientView) -> Result<(), DispatchError> {
        let result = match self.parties.party_for(&sender.uuid).await {
            Ok(view) => serde_json::to_string(&view).map_err(|e| DispatchError::Encode(e.to_string())),
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(json) => self.reply(sender, ServerMessage::Party(&json)).await,
            Err(e) => {
                self.reply(sender, ServerMessage::PartyNull).await?;
                match e {
                    DispatchError::Party(PartyError::NotFound(_)) => Ok(()),
                    e => Err(e),
                }
            }
        }
    }

    async fn update(&self, sender: &ClientView, change: ProfileChange) -> Result<ClientView, DispatchError> {
        Ok(self
            .session
            .update(&sender.uuid, sender.connection_id, change)
            .await?)
    }

    async fn reply(&self, sender: &ClientView, msg: ServerMessage<'_>) -> Result<(), DispatchError> {
        self.session
            .send(&sender.uuid, Payload::from(msg.encode()))
            .await?;
        Ok(())
    }
}
