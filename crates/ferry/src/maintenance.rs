//! Offline maintenance of a repository's remote side: moving it to another
//! relay, and snapshotting it to or from a local archive directory.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Args;

use ferry_common::{Config, MarkerCodec, RelayAddress};
use ferry_relay::{local::LocalStore, store::BlobStore};

use crate::Common;

/// Picks the repository to operate on: the one named, or the only one
/// configured.
fn select_repository(config: &Config, name: &Option<String>) -> anyhow::Result<String> {
    match name {
        Some(name) => {
            config.repository(name)?;
            Ok(name.clone())
        }
        None => {
            let mut names = config.repositories.keys();
            let first = names.next().context("no repositories configured")?.clone();
            if names.next().is_some() {
                anyhow::bail!("several repositories defined; please specify with '--repository'");
            }
            Ok(first)
        }
    }
}

async fn open_store(address: &RelayAddress) -> anyhow::Result<LocalStore> {
    match address {
        RelayAddress::Local(path) => Ok(LocalStore::new(path).await?),
    }
}

/// Copies every blob from one store to another, optionally leaving the
/// marker blobs behind. Returns how many blobs moved.
async fn copy_blobs(
    src: &dyn BlobStore,
    dst: &dyn BlobStore,
    skip_markers: bool,
) -> anyhow::Result<usize> {
    let codec = MarkerCodec::default();
    let mut copied = 0;
    for entry in src.list("", true).await? {
        if skip_markers && codec.is_marker(&entry.name) {
            tracing::debug!(blob = entry.name.as_str(), "marker left behind");
            continue;
        }
        let scratch = tempfile::NamedTempFile::new()?;
        src.get(&entry.name, scratch.path(), false)
            .await
            .with_context(|| format!("failed to fetch '{}'", entry.name))?;
        dst.put(scratch.path(), &entry.name)
            .await
            .with_context(|| format!("failed to store '{}'", entry.name))?;
        copied += 1;
    }
    Ok(copied)
}

#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Address of the new relay, e.g. `file:///mnt/new-relay`.
    #[arg(value_name = "DESTINATION")]
    destination: String,

    /// Restrict the command to one repository.
    #[arg(long, short, value_name = "REPOSITORY")]
    repository: Option<String>,

    /// Move only regular file content, leaving markers behind.
    #[arg(long)]
    fast: bool,

    #[command(flatten)]
    common: Common,
}

impl MigrateArgs {
    pub async fn run(self) -> anyhow::Result<ExitCode> {
        let mut config = self.common.load_config()?;
        let name = select_repository(&config, &self.repository)?;
        let destination: RelayAddress = self.destination.parse::<RelayAddress>()?;

        let repo_cfg = config.repository(&name)?;
        let src = open_store(&repo_cfg.address).await?;
        let dst = open_store(&destination).await?;
        let copied = copy_blobs(&src, &dst, self.fast).await?;
        tracing::info!(repository = name.as_str(), copied, "relay contents moved");

        let repo_cfg = config
            .repositories
            .get_mut(&name)
            .expect("repository just selected");
        repo_cfg.address = destination;
        let path = self.common.config_path()?;
        config.to_file(&path)?;
        println!("'{name}' now points at {}", config.repository(&name)?.address);
        Ok(ExitCode::SUCCESS)
    }
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Directory the relay contents are snapshotted into.
    #[arg(value_name = "ARCHIVE")]
    archive: PathBuf,

    /// Restrict the command to one repository.
    #[arg(long, short, value_name = "REPOSITORY")]
    repository: Option<String>,

    /// Copy only regular file content, not markers.
    #[arg(long)]
    fast: bool,

    #[command(flatten)]
    common: Common,
}

impl BackupArgs {
    pub async fn run(self) -> anyhow::Result<ExitCode> {
        let config = self.common.load_config()?;
        let name = select_repository(&config, &self.repository)?;
        let src = open_store(&config.repository(&name)?.address).await?;
        let dst = LocalStore::new(&self.archive).await?;
        let copied = copy_blobs(&src, &dst, self.fast).await?;
        println!(
            "{copied} blobs from '{name}' archived to '{}'",
            self.archive.display()
        );
        Ok(ExitCode::SUCCESS)
    }
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Directory a previous backup was written to.
    #[arg(value_name = "ARCHIVE")]
    archive: PathBuf,

    /// Restrict the command to one repository.
    #[arg(long, short, value_name = "REPOSITORY")]
    repository: Option<String>,

    /// Copy only regular file content, not markers.
    #[arg(long)]
    fast: bool,

    #[command(flatten)]
    common: Common,
}

impl RestoreArgs {
    pub async fn run(self) -> anyhow::Result<ExitCode> {
        if !self.archive.is_dir() {
            anyhow::bail!("archive '{}' does not exist", self.archive.display());
        }
        let config = self.common.load_config()?;
        let name = select_repository(&config, &self.repository)?;
        let src = LocalStore::new(&self.archive).await?;
        let dst = open_store(&config.repository(&name)?.address).await?;
        let copied = copy_blobs(&src, &dst, self.fast).await?;
        println!(
            "{copied} blobs restored to '{name}' from '{}'",
            self.archive.display()
        );
        Ok(ExitCode::SUCCESS)
    }
}
