//! Periodic population and party pushes

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::net::protocol::ServerMessage;
use crate::party::PartyCoordinator;
use crate::session::actor::{SessionError, SessionHandle};
use crate::session::client::Payload;

/// Spawn the announcer loop; it stops once the session actor is gone
pub fn spawn_announcer(
    session: SessionHandle,
    parties: Arc<PartyCoordinator>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if let Err(SessionError::Closed) = announce_once(&session, &parties).await {
                tracing::info!("Session actor stopped, announcer exiting");
                break;
            }
        }
    })
}

/// One tick: population to everyone, then each online member's party view
pub async fn announce_once(
    session: &SessionHandle,
    parties: &PartyCoordinator,
) -> Result<(), SessionError> {
    let count = session.count().await?;
    let population = ServerMessage::Population(count).encode();
    session.broadcast(Payload::from(population), None).await?;

    let views = match parties.snapshots().await {
        Ok(views) => views,
        Err(e) => {
            tracing::warn!("Party push skipped: {}", e);
            return Ok(());
        }
    };

    for view in views {
        let owner = view.owner_uuid.clone();
        let online: Vec<String> = view
            .online_members()
            .map(|m| m.uuid.clone())
            .collect();

        let full = serde_json::to_string(&view);
        let redacted = serde_json::to_string(&view.redacted());
        let (full, redacted) = match (full, redacted) {
            (Ok(full), Ok(redacted)) => (full, redacted),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Party {} push skipped: {}", view.id, e);
                continue;
            }
        };

        let owner_payload = Payload::from(ServerMessage::Party(&full).encode());
        let member_payload = Payload::from(ServerMessage::Party(&redacted).encode());
        for uuid in online {
            let payload = if uuid == owner {
                owner_payload.clone()
            } else {
                member_payload.clone()
            };
            session.send(&uuid, payload).await?;
        }
    }
    Ok(())
}
