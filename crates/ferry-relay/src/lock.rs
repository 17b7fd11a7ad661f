//! Lock blobs: advisory exclusive access to one relay file.

use ferry_common::ClientId;

/// The declared intent of a lock holder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Held for a pull.
    Read,
    /// Held for a push.
    Write,
}

impl LockMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Write => "w",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "r" => Some(Self::Read),
            "w" => Some(Self::Write),
            _ => None,
        }
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Contents of a lock blob, plus the file it guards.
///
/// Only `owner` and `mode` are stored in the blob body; `target` is
/// reconstructed from the blob's path by whoever reads it. A missing `mode`
/// marks a legacy or unreadable lock and is handled specially by repair.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockInfo {
    pub owner: Option<ClientId>,
    pub mode: Option<LockMode>,
    pub target: String,
}

impl LockInfo {
    pub fn new(owner: ClientId, mode: LockMode, target: impl Into<String>) -> Self {
        Self {
            owner: Some(owner),
            mode: Some(mode),
            target: target.into(),
        }
    }

    /// Parses a lock body.
    ///
    /// The format is line-oriented `key: value` with `owner` and `mode`
    /// keys. Anything malformed degrades to the zero value: such a lock
    /// reads as ownerless and is eventually reclaimed through the stale-lock
    /// timeout rather than blocking peers forever.
    pub fn parse(body: &str, target: impl Into<String>) -> Self {
        let mut info = Self {
            target: target.into(),
            ..Self::default()
        };
        for line in body.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim() {
                "owner" => info.owner = value.trim().parse().ok(),
                "mode" => info.mode = LockMode::parse(value.trim()),
                _ => {}
            }
        }
        info
    }

    /// Renders the blob body. The inverse of [`LockInfo::parse`] up to the
    /// `target` field.
    pub fn render(&self) -> String {
        let mut body = String::new();
        if let Some(owner) = &self.owner {
            body.push_str(&format!("owner: {owner}\n"));
        }
        if let Some(mode) = &self.mode {
            body.push_str(&format!("mode: {mode}\n"));
        }
        body
    }
}
