//! Content transformation seam.
//!
//! Transports carry whatever bytes they are given; when a cipher is
//! configured the engine routes regular-file content through it on the way
//! to and from the relay. Marker blobs are never ciphered. Only the plain
//! passthrough ships today; the name lookup exists so that a configured but
//! unknown cipher fails before any loop starts.

use std::path::{Path, PathBuf};

use ferry_common::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Cipher {
    /// Identity transform.
    #[default]
    Plain,
}

impl Cipher {
    /// Resolves a configured cipher name.
    pub fn by_name(name: &str) -> Result<Self, Error> {
        match name.to_ascii_lowercase().as_str() {
            "plain" | "none" | "clear" => Ok(Self::Plain),
            other => Err(Error::UnsupportedCipher(other.to_owned())),
        }
    }

    /// Stages `local` for upload, returning the sealed copy's path when a
    /// transformation took place.
    pub(crate) async fn seal(
        &self,
        _local: &Path,
        _scratch: &Path,
    ) -> Result<Option<PathBuf>, Error> {
        match self {
            Self::Plain => Ok(None),
        }
    }

    /// Undoes [`Cipher::seal`] on a downloaded file, in place when `None` is
    /// returned.
    pub(crate) async fn open(
        &self,
        _fetched: &Path,
        _scratch: &Path,
    ) -> Result<Option<PathBuf>, Error> {
        match self {
            Self::Plain => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_resolve() {
        assert_eq!(Cipher::by_name("plain").unwrap(), Cipher::Plain);
        assert_eq!(Cipher::by_name("None").unwrap(), Cipher::Plain);
    }

    #[test]
    fn unknown_names_are_config_errors() {
        assert!(matches!(
            Cipher::by_name("blowfish"),
            Err(Error::UnsupportedCipher(_))
        ));
    }
}
