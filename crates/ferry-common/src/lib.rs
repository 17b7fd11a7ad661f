use std::path::PathBuf;

pub mod client;
pub mod config;
pub mod marker;

pub use client::ClientId;
pub use config::{AccessMode, Config, RelayAddress, RepositoryConfig};
pub use marker::MarkerCodec;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error reading config file: {0}")]
    ConfigFileIo(#[source] std::io::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("invalid client name: {0}")]
    InvalidClient(#[from] client::InvalidClientId),
    #[error("invalid relay address: {0}")]
    InvalidAddress(String),
    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),
    #[error("invalid marker name: {0}")]
    InvalidMarker(String),
    #[error("'{0}' is reserved for relay bookkeeping")]
    ReservedName(String),
    #[error("'{0}' not found on the relay")]
    NotFound(String),
    #[error("cannot find file '{0}' in the repository")]
    NotInRepository(PathBuf),
    #[error("permission denied for '{0}'")]
    Denied(PathBuf),
    #[error("no access store configured for repository '{0}'")]
    NoAccessStore(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unrecoverable transport failure: {0}")]
    Unrecoverable(#[source] std::io::Error),
}

impl Error {
    pub fn invalid_config(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::InvalidConfig(Box::new(err))
    }

    /// Escalates file-table exhaustion (`EMFILE`) to the unrecoverable class
    /// that terminates a worker. Every relay transport call goes through this
    /// seam; other errors pass through untouched.
    pub fn promote(self) -> Self {
        match self {
            Self::Io(e) if is_file_table_overflow(&e) => Self::Unrecoverable(e),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable(_))
    }
}

#[cfg(unix)]
fn is_file_table_overflow(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EMFILE)
}

#[cfg(not(unix))]
fn is_file_table_overflow(_err: &std::io::Error) -> bool {
    false
}
