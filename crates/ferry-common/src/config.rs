//! Ferry configuration.
//!
//! A configuration file is TOML with a top-level client name and one table
//! per synchronized repository:
//!
//! ```toml
//! client = "alice"
//!
//! [repositories.music]
//! path = "/home/alice/Music"
//! address = "file:///mnt/relay/music"
//! mode = "shared"
//! pullers = 2
//! ```

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{client::ClientId, Error};

pub const CONFIG_DIR: &str = "ferry";
pub const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration: this client's identity plus one entry per
/// synchronized repository.
#[derive(Clone, Debug)]
pub struct Config {
    pub client: ClientId,
    pub repositories: BTreeMap<String, RepositoryConfig>,
}

impl Config {
    /// Returns the per-user config file path, if a config directory exists.
    pub fn global_config_path() -> Option<PathBuf> {
        Some(dirs::config_dir()?.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Loads the per-user config file.
    pub fn global_defaults() -> Result<Self, Error> {
        let path = Self::global_config_path().ok_or_else(|| {
            Error::InvalidConfig("no configuration directory available".into())
        })?;
        Self::from_file(path)
    }

    /// Reads config from a TOML file at the given path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(Error::ConfigFileIo)?;
        Self::from_toml(&contents)
    }

    /// Parses config from the given TOML contents.
    pub fn from_toml(contents: &str) -> Result<Self, Error> {
        let toml_cfg: TomlConfig = toml::from_str(contents).map_err(Error::invalid_config)?;
        toml_cfg.try_into()
    }

    /// Serializes the config back to TOML.
    pub fn to_toml(&self) -> Result<String, Error> {
        let toml_cfg = TomlConfig {
            client: self.client.to_string(),
            repositories: self.repositories.clone(),
        };
        toml::to_string_pretty(&toml_cfg).map_err(Error::invalid_config)
    }

    /// Writes the config to the given path, creating parent directories.
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::ConfigFileIo)?;
        }
        std::fs::write(path, self.to_toml()?).map_err(Error::ConfigFileIo)
    }

    pub fn repository(&self, name: &str) -> Result<&RepositoryConfig, Error> {
        self.repositories.get(name).ok_or_else(|| {
            Error::InvalidConfig(format!("repository '{name}' is not configured").into())
        })
    }
}

#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct TomlConfig {
    client: String,
    #[serde(default)]
    repositories: BTreeMap<String, RepositoryConfig>,
}

impl TryFrom<TomlConfig> for Config {
    type Error = Error;

    fn try_from(value: TomlConfig) -> Result<Self, Self::Error> {
        let TomlConfig {
            client,
            repositories,
        } = value;
        Ok(Self {
            client: client.parse()?,
            repositories,
        })
    }
}

/// Settings for one synchronized repository.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RepositoryConfig {
    /// Local repository root.
    pub path: PathBuf,
    /// Relay endpoint holding this repository's remote side.
    pub address: RelayAddress,
    #[serde(default)]
    pub mode: AccessMode,
    /// Number of clients expected to download each pushed file.
    #[serde(default = "default_pullers")]
    pub pullers: u32,
    /// Age in seconds past which an ownerless lock is reclaimable; 0 disables
    /// timeout-based reclaim.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: u64,
    /// Seconds between polls while waiting on a held lock.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Seconds between synchronization ticks.
    #[serde(default = "default_refresh")]
    pub refresh: u64,
    /// Cipher name; absent means plain transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase_file: Option<PathBuf>,
    /// Restart delay in seconds after a worker dies; absent means no restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<u64>,
    /// Override for the access-attribute store location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_store: Option<PathBuf>,
}

fn default_pullers() -> u32 {
    1
}

fn default_lock_timeout() -> u64 {
    3600
}

fn default_poll_interval() -> u64 {
    60
}

fn default_refresh() -> u64 {
    30
}

impl RepositoryConfig {
    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_timeout != 0).then(|| Duration::from_secs(self.lock_timeout))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn refresh(&self) -> Duration {
        Duration::from_secs(self.refresh)
    }

    /// Location of the access-attribute store for this repository.
    pub fn access_store_path(&self, name: &str) -> Option<PathBuf> {
        if let Some(path) = &self.access_store {
            return Some(path.clone());
        }
        Some(
            dirs::data_local_dir()?
                .join(CONFIG_DIR)
                .join("access")
                .join(format!("{name}.tab")),
        )
    }
}

/// A relay endpoint address.
///
/// Currently only directory-backed relays are supported, written either as a
/// bare path or with a `file://` scheme. Other schemes are configuration
/// errors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RelayAddress {
    Local(PathBuf),
}

impl std::fmt::Display for RelayAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(path) => write!(f, "file://{}", path.display()),
        }
    }
}

impl From<RelayAddress> for String {
    fn from(value: RelayAddress) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for RelayAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.as_str().parse()
    }
}

impl std::str::FromStr for RelayAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::InvalidAddress("no address defined".into()));
        }
        if let Some(path) = s.strip_prefix("file://") {
            return Ok(Self::Local(PathBuf::from(path)));
        }
        if s.contains("://") {
            return Err(Error::InvalidAddress(format!(
                "unsupported relay scheme in '{s}'"
            )));
        }
        Ok(Self::Local(PathBuf::from(s)))
    }
}

/// Transfer policy for a repository.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum AccessMode {
    /// Push only; nothing is ever downloaded.
    Upload,
    /// Pull only; nothing is ever uploaded.
    Download,
    /// Both directions, permissions from the attribute table.
    #[default]
    Shared,
    /// Like shared, but transfers are recorded so a file moves at most once
    /// per edit.
    Conservative,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Shared => "shared",
            Self::Conservative => "conservative",
        };
        write!(f, "{name}")
    }
}

impl From<AccessMode> for String {
    fn from(value: AccessMode) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for AccessMode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.as_str().parse()
    }
}

impl std::str::FromStr for AccessMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "upload" => Ok(Self::Upload),
            "download" => Ok(Self::Download),
            "conservative" | "protective" => Ok(Self::Conservative),
            // "share", "shared", "sharing", ...
            _ if lower.starts_with("shar") => Ok(Self::Shared),
            _ => Err(Error::InvalidConfig(
                format!("'{s}' mode not supported").into(),
            )),
        }
    }
}

/// Default pidfile location for the daemon.
pub fn default_pidfile() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(CONFIG_DIR)
        .join("ferry.pid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoke_test() {
        let contents = r#"
            client = "alice"

            [repositories.music]
            path = "/home/alice/Music"
            address = "file:///mnt/relay/music"
            mode = "conservative"
            pullers = 2
            lock-timeout = 600
        "#;
        let cfg = Config::from_toml(contents).unwrap();
        assert_eq!(cfg.client.as_ref(), "alice");
        let repo = cfg.repository("music").unwrap();
        assert_eq!(
            repo.address,
            RelayAddress::Local(PathBuf::from("/mnt/relay/music"))
        );
        assert_eq!(repo.mode, AccessMode::Conservative);
        assert_eq!(repo.pullers, 2);
        assert_eq!(repo.lock_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(repo.poll_interval(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(matches!(
            "ftp://relay.example.org/repo".parse::<RelayAddress>(),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn bare_paths_are_local_addresses() {
        assert_eq!(
            "/mnt/relay".parse::<RelayAddress>().unwrap(),
            RelayAddress::Local(PathBuf::from("/mnt/relay"))
        );
    }

    #[test]
    fn mode_spellings() {
        assert_eq!("sharing".parse::<AccessMode>().unwrap(), AccessMode::Shared);
        assert_eq!(
            "protective".parse::<AccessMode>().unwrap(),
            AccessMode::Conservative
        );
        assert!("broadcast".parse::<AccessMode>().is_err());
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let contents = r#"
            client = "box-2"

            [repositories.docs]
            path = "/srv/docs"
            address = "file:///srv/relay"
        "#;
        let cfg = Config::from_toml(contents).unwrap();
        let rendered = cfg.to_toml().unwrap();
        let reparsed = Config::from_toml(&rendered).unwrap();
        assert_eq!(reparsed.client.as_ref(), "box-2");
        assert_eq!(
            reparsed.repository("docs").unwrap().address,
            cfg.repository("docs").unwrap().address
        );
    }

    #[test]
    fn zero_lock_timeout_disables_reclaim() {
        let contents = r#"
            client = "c"

            [repositories.r]
            path = "/r"
            address = "/relay"
            lock-timeout = 0
        "#;
        let cfg = Config::from_toml(contents).unwrap();
        assert_eq!(cfg.repository("r").unwrap().lock_timeout(), None);
    }
}
