use serde::{Deserialize, Serialize};

/// A client identifier, recorded in lock bodies and placeholder reader lists.
///
/// Identifiers end up as single lines inside marker blobs, so anything that
/// could break the line-oriented formats (control characters) or be mistaken
/// for a path component (`/`) is rejected.
#[derive(Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ClientId(String);

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl From<ClientId> for String {
    fn from(value: ClientId) -> Self {
        value.0
    }
}

impl TryFrom<String> for ClientId {
    type Error = InvalidClientId;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        if name.is_empty() {
            return Err(InvalidClientId::Empty);
        }
        if name.chars().any(|ch| ch.is_control()) {
            return Err(InvalidClientId::ControlChar);
        }
        if name.contains('/') {
            return Err(InvalidClientId::PathSeparator);
        }
        Ok(Self(name))
    }
}

impl std::str::FromStr for ClientId {
    type Err = InvalidClientId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.to_owned().try_into()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidClientId {
    #[error("client names may not be empty")]
    Empty,
    #[error("client names may not contain control characters")]
    ControlChar,
    #[error("client names may not contain '/'")]
    PathSeparator,
}
