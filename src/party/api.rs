//! Party control surface for the HTTP layer
//!
//! The HTTP layer authenticates the caller, then hands the command name and
//! its query parameters here and writes back the returned status and body.

use std::collections::HashMap;

use crate::party::coordinator::{PartyCoordinator, Requester};
use crate::party::error::PartyError;
use crate::party::model::{PartyId, PartySettings};

/// Status and body to write back to the HTTP client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyReply {
    pub status: u16,
    pub body: String,
}

impl PartyReply {
    fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    fn bad_request(reason: impl Into<String>) -> Self {
        Self {
            status: 400,
            body: reason.into(),
        }
    }
}

impl From<PartyError> for PartyReply {
    fn from(err: PartyError) -> Self {
        let status = err.status_code();
        let body = match status {
            401 => "401 - Unauthorized".to_string(),
            500 => "internal server error".to_string(),
            _ => err.to_string(),
        };
        Self { status, body }
    }
}

/// Run one party command on behalf of an authenticated requester
pub async fn handle_party_command(
    parties: &PartyCoordinator,
    requester: &Requester,
    command: &str,
    params: &HashMap<String, String>,
) -> PartyReply {
    match run(parties, requester, command, params).await {
        Ok(reply) => reply,
        Err(e) => {
            if e.status_code() == 500 {
                tracing::error!("Party command '{}' failed: {}", command, e);
            } else {
                tracing::debug!("Party command '{}' rejected: {}", command, e);
            }
            e.into()
        }
    }
}

async fn run(
    parties: &PartyCoordinator,
    requester: &Requester,
    command: &str,
    params: &HashMap<String, String>,
) -> Result<PartyReply, PartyError> {
    let reply = match command {
        "id" => {
            let id = parties.party_id(&requester.uuid).await?.unwrap_or(0);
            PartyReply::ok(id.to_string())
        }
        "list" => {
            let body = if params.contains_key("simple") {
                to_json(&parties.list_summaries().await?)?
            } else {
                to_json(&parties.list().await?)?
            };
            PartyReply::ok(body)
        }
        "description" => {
            let id = party_id_param(params)?;
            PartyReply::ok(parties.description(id).await?)
        }
        "create" => {
            let id = parties.create(requester, settings_params(params)?).await?;
            PartyReply::ok(id.to_string())
        }
        "update" => {
            parties.update(requester, settings_params(params)?).await?;
            PartyReply::ok("ok")
        }
        "join" => {
            let id = party_id_param(params)?;
            let pass = params.get("pass").map(String::as_str);
            parties.join(requester, id, pass).await?;
            PartyReply::ok("ok")
        }
        "leave" => {
            parties.leave(requester).await?;
            PartyReply::ok("ok")
        }
        "kick" => {
            parties.kick(requester, required(params, "player")?).await?;
            PartyReply::ok("ok")
        }
        "transfer" => {
            parties.transfer(requester, required(params, "player")?).await?;
            PartyReply::ok("ok")
        }
        "disband" => {
            parties.disband(requester).await?;
            PartyReply::ok("ok")
        }
        "" => return Ok(PartyReply::bad_request("command not specified")),
        _ => return Ok(PartyReply::bad_request("unknown command")),
    };
    Ok(reply)
}

fn required<'a>(params: &'a HashMap<String, String>, key: &'static str) -> Result<&'a str, PartyError> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or(PartyError::Invalid(match key {
            "player" => "player not specified",
            "partyId" => "partyId not specified",
            "name" => "name not specified",
            "theme" => "theme not specified",
            _ => "missing parameter",
        }))
}

fn party_id_param(params: &HashMap<String, String>) -> Result<PartyId, PartyError> {
    required(params, "partyId")?
        .parse()
        .map_err(|_| PartyError::Invalid("invalid partyId value"))
}

fn settings_params(params: &HashMap<String, String>) -> Result<PartySettings, PartyError> {
    Ok(PartySettings {
        name: required(params, "name")?.to_string(),
        // Presence of the key marks the party public
        public: params.contains_key("public"),
        pass: params.get("pass").cloned().unwrap_or_default(),
        theme: required(params, "theme")?.to_string(),
        description: params.get("description").cloned().unwrap_or_default(),
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, PartyError> {
    serde_json::to_string(value).map_err(|e| PartyError::Store(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::party::coordinator::tests::FixedPresence;
    use crate::store::{MemoryStore, Rank};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn setup() -> (PartyCoordinator, Requester, Requester) {
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(FixedPresence::default());
        let a = store.register_guest(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let b = store.register_guest(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        presence.set_online(&a, true);
        presence.set_online(&b, true);
        let parties = PartyCoordinator::new(store, presence, Arc::new(Metrics::new()));
        (
            parties,
            Requester::new(a, Rank::PLAYER),
            Requester::new(b, Rank::PLAYER),
        )
    }

    #[tokio::test]
    async fn test_create_join_flow() {
        let (parties, a, b) = setup();

        let reply = handle_party_command(&parties, &a, "id", &params(&[])).await;
        assert_eq!(reply, PartyReply::ok("0"));

        let create = params(&[("name", "Explorers"), ("public", ""), ("theme", "0000")]);
        let reply = handle_party_command(&parties, &a, "create", &create).await;
        assert_eq!(reply, PartyReply::ok("1"));

        let join = params(&[("partyId", "1")]);
        assert_eq!(
            handle_party_command(&parties, &b, "join", &join).await,
            PartyReply::ok("ok")
        );

        let reply = handle_party_command(&parties, &b, "list", &params(&[])).await;
        let listed: serde_json::Value = serde_json::from_str(&reply.body).unwrap();
        assert_eq!(listed[0]["members"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_wrong_password_is_401() {
        let (parties, a, b) = setup();

        let create = params(&[("name", "Secret"), ("pass", "xyz"), ("theme", "0000")]);
        handle_party_command(&parties, &a, "create", &create).await;

        let reply = handle_party_command(
            &parties,
            &b,
            "join",
            &params(&[("partyId", "1"), ("pass", "wrong")]),
        )
        .await;
        assert_eq!(reply.status, 401);
        assert_eq!(reply.body, "401 - Unauthorized");

        let reply = handle_party_command(
            &parties,
            &b,
            "join",
            &params(&[("partyId", "1"), ("pass", "xyz")]),
        )
        .await;
        assert_eq!(reply.status, 200);
    }

    #[tokio::test]
    async fn test_validation_failures_are_400() {
        let (parties, a, b) = setup();

        let reply = handle_party_command(&parties, &a, "description", &params(&[("partyId", "x")])).await;
        assert_eq!(reply, PartyReply::bad_request("invalid partyId value"));

        let reply = handle_party_command(&parties, &a, "create", &params(&[("name", "P")])).await;
        assert_eq!(reply, PartyReply::bad_request("theme not specified"));

        let create = params(&[("name", "P"), ("public", ""), ("theme", "0000")]);
        handle_party_command(&parties, &a, "create", &create).await;
        handle_party_command(&parties, &b, "join", &params(&[("partyId", "1")])).await;

        let reply = handle_party_command(&parties, &b, "disband", &params(&[])).await;
        assert_eq!(reply.status, 400);

        let reply = handle_party_command(&parties, &a, "bogus", &params(&[])).await;
        assert_eq!(reply, PartyReply::bad_request("unknown command"));
    }

    #[tokio::test]
    async fn test_description_of_missing_party() {
        let (parties, a, _) = setup();
        let reply =
            handle_party_command(&parties, &a, "description", &params(&[("partyId", "42")])).await;
        assert_eq!(reply, PartyReply::bad_request("party not found"));
    }
}
