//! Party data model and wire views

use serde::Serialize;

use crate::party::error::PartyError;
use crate::store::Rank;

pub type PartyId = u32;

/// Maximum byte length of a party name
pub const MAX_NAME_LEN: usize = 255;
/// Maximum byte length of a party password
pub const MAX_PASS_LEN: usize = 255;

/// Owner-editable party settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartySettings {
    pub name: String,
    pub public: bool,
    /// Empty means no password
    pub pass: String,
    pub theme: String,
    pub description: String,
}

impl PartySettings {
    pub fn validate(&self) -> Result<(), PartyError> {
        if self.name.is_empty() {
            return Err(PartyError::Invalid("party name is required"));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(PartyError::Invalid("party name too long"));
        }
        if !self.public && self.pass.len() > MAX_PASS_LEN {
            return Err(PartyError::Invalid("party password too long"));
        }
        if self.theme.is_empty() {
            return Err(PartyError::Invalid("party theme is required"));
        }
        Ok(())
    }

    /// Settings as stored: public parties carry no password
    pub fn normalized(mut self) -> Self {
        if self.public {
            self.pass.clear();
        }
        self
    }
}

/// Party as pushed over `pt` and returned by the control surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyView {
    pub id: PartyId,
    pub name: String,
    pub public: bool,
    /// Only sent to the owner
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(rename = "systemName")]
    pub theme: String,
    pub description: String,
    pub owner_uuid: String,
    /// Owner first, then rank descending, then join order
    pub members: Vec<PartyMemberView>,
}

impl PartyView {
    pub fn online_members(&self) -> impl Iterator<Item = &PartyMemberView> {
        self.members.iter().filter(|m| m.online)
    }

    pub fn has_online_member(&self) -> bool {
        self.members.iter().any(|m| m.online)
    }

    /// Clone of this view without the password, for anyone but the owner
    pub fn redacted(&self) -> Self {
        Self {
            pass: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyMemberView {
    pub uuid: String,
    pub name: String,
    pub rank: Rank,
    pub account: bool,
    pub badge: String,
    pub system_name: String,
    pub sprite_name: String,
    pub sprite_index: i32,
    pub online: bool,
}

/// Party listing entry without member detail, used by `list` in simple mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartySummary {
    pub id: PartyId,
    pub name: String,
    pub public: bool,
    #[serde(rename = "systemName")]
    pub theme: String,
    pub description: String,
    pub owner_uuid: String,
    pub online_count: usize,
    pub member_count: usize,
}

impl From<&PartyView> for PartySummary {
    fn from(view: &PartyView) -> Self {
        Self {
            id: view.id,
            name: view.name.clone(),
            public: view.public,
            theme: view.theme.clone(),
            description: view.description.clone(),
            owner_uuid: view.owner_uuid.clone(),
            online_count: view.online_members().count(),
            member_count: view.members.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> PartySettings {
        PartySettings {
            name: "Explorers".to_string(),
            public: false,
            pass: "xyz".to_string(),
            theme: "0000".to_string(),
            description: String::new(),
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(settings().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_long_name() {
        let mut s = settings();
        s.name = "a".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(s.validate(), Err(PartyError::Invalid(_))));

        s.name = "a".repeat(MAX_NAME_LEN);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_theme() {
        let mut s = settings();
        s.theme.clear();
        assert!(matches!(s.validate(), Err(PartyError::Invalid(_))));
    }

    #[test]
    fn test_long_pass_ignored_for_public() {
        let mut s = settings();
        s.pass = "p".repeat(MAX_PASS_LEN + 1);
        assert!(s.validate().is_err());

        s.public = true;
        assert!(s.validate().is_ok());
        assert!(s.normalized().pass.is_empty());
    }

    #[test]
    fn test_view_json_shape() {
        let view = PartyView {
            id: 1,
            name: "Explorers".to_string(),
            public: true,
            pass: Some("xyz".to_string()),
            theme: "0000".to_string(),
            description: String::new(),
            owner_uuid: "u1".to_string(),
            members: vec![],
        };

        let owner_copy = serde_json::to_value(&view).unwrap();
        assert_eq!(owner_copy["systemName"], "0000");
        assert_eq!(owner_copy["ownerUuid"], "u1");
        assert_eq!(owner_copy["pass"], "xyz");

        let public_copy = serde_json::to_value(view.redacted()).unwrap();
        assert!(public_copy.get("pass").is_none());
    }
}
