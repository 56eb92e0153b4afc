use crate::store::StoreError;

/// Party operation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartyError {
    #[error("{0}")]
    Invalid(&'static str),
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("wrong party password")]
    WrongPassword,
    #[error("{0}")]
    Conflict(&'static str),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("store error: {0}")]
    Store(String),
}

/// Coarse error class, as reported by the control surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyErrorKind {
    Validation,
    Authorization,
    WrongPassword,
    Conflict,
    NotFound,
    Collaborator,
}

impl PartyError {
    pub fn kind(&self) -> PartyErrorKind {
        match self {
            PartyError::Invalid(_) => PartyErrorKind::Validation,
            PartyError::Forbidden(_) => PartyErrorKind::Authorization,
            PartyError::WrongPassword => PartyErrorKind::WrongPassword,
            PartyError::Conflict(_) => PartyErrorKind::Conflict,
            PartyError::NotFound(_) => PartyErrorKind::NotFound,
            PartyError::Store(_) => PartyErrorKind::Collaborator,
        }
    }

    /// HTTP status used by the control surface
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            PartyErrorKind::WrongPassword => 401,
            PartyErrorKind::Collaborator => 500,
            _ => 400,
        }
    }
}

impl From<StoreError> for PartyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => PartyError::NotFound(what),
            StoreError::Conflict(what) => PartyError::Conflict(what),
            StoreError::NotOwner => PartyError::Forbidden("only the party owner can do that"),
            StoreError::Backend(msg) => PartyError::Store(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(PartyError::Invalid("x").status_code(), 400);
        assert_eq!(PartyError::Forbidden("x").status_code(), 400);
        assert_eq!(PartyError::NotFound("party").status_code(), 400);
        assert_eq!(PartyError::WrongPassword.status_code(), 401);
        assert_eq!(PartyError::Store("down".into()).status_code(), 500);
    }

    #[test]
    fn test_from_store_error() {
        assert_eq!(
            PartyError::from(StoreError::NotFound("party")),
            PartyError::NotFound("party")
        );
        assert_eq!(
            PartyError::from(StoreError::NotOwner).kind(),
            PartyErrorKind::Authorization
        );
        assert_eq!(
            PartyError::from(StoreError::Backend("timeout".into())).kind(),
            PartyErrorKind::Collaborator
        );
    }
}
