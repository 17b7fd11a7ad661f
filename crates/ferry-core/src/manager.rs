//! The per-repository synchronization loop.
//!
//! One [`Manager`] drives one repository: every tick it repairs crashed
//! transfers, pulls whatever peers made ready, and pushes local changes.
//! Transfers within a repository never overlap; parallelism comes from
//! running independent managers.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use tokio::sync::watch;

use ferry_common::{ClientId, Error, RelayAddress, RepositoryConfig};
use ferry_relay::{local::LocalStore, Cipher, Relay};

use crate::access::AccessController;

pub struct Manager {
    relay: Relay,
    access: AccessController,
    pullers: u32,
    refresh: Duration,
    // Last mtime known to match the relay, per relative path. Once a file is
    // fully delivered the relay keeps no trace of it, so this is what stops
    // an unchanged file from being sent again within this worker's lifetime.
    synced: HashMap<String, u64>,
}

impl Manager {
    /// Builds the worker for one configured repository. Configuration
    /// problems (bad address, unknown cipher, missing repository root)
    /// surface here, before any loop starts.
    pub async fn from_config(
        client: ClientId,
        name: &str,
        cfg: &RepositoryConfig,
    ) -> Result<Self, Error> {
        let cipher = match &cfg.encryption {
            Some(cipher) => Cipher::by_name(cipher)?,
            None => Cipher::default(),
        };
        if cfg.passphrase_file.is_some() && cipher == Cipher::Plain {
            tracing::debug!(repository = name, "passphrase ignored for plain transfers");
        }
        let store = match &cfg.address {
            RelayAddress::Local(path) => LocalStore::new(path).await?,
        };
        let relay = Relay::new(Box::new(store), client)?
            .with_cipher(cipher)
            .with_lock_timeout(cfg.lock_timeout())
            .with_poll_interval(cfg.poll_interval());
        let access = AccessController::new(
            name,
            &cfg.path,
            cfg.mode,
            cfg.access_store_path(name),
            false,
        )?;
        Ok(Self {
            relay,
            access,
            pullers: cfg.pullers,
            refresh: cfg.refresh(),
            synced: HashMap::new(),
        })
    }

    pub fn repository(&self) -> &str {
        self.access.name()
    }

    /// Runs ticks until the stop signal flips or an unrecoverable error
    /// ends the worker. Ordinary tick failures are logged and retried on
    /// the next round.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> Result<(), Error> {
        loop {
            if *stop.borrow() {
                return Ok(());
            }
            match self.tick().await {
                Ok(()) => {}
                Err(err) if err.is_unrecoverable() => {
                    tracing::error!(
                        repository = self.access.name(),
                        error = %err,
                        "worker giving up"
                    );
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        repository = self.access.name(),
                        error = %err,
                        "synchronization tick failed; will retry"
                    );
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.refresh) => {}
                _ = stop.changed() => return Ok(()),
            }
        }
    }

    /// One synchronization round: repair, pull, push.
    pub async fn tick(&mut self) -> Result<(), Error> {
        self.repair_pass().await?;
        self.pull_pass().await?;
        self.push_pass().await?;
        Ok(())
    }

    async fn repair_pass(&self) -> Result<(), Error> {
        for lock in self.relay.list_corrupted("", true).await? {
            tracing::warn!(file = lock.target.as_str(), "repairing a crashed transfer");
            let accessor = self.access.accessor(&lock.target);
            if let Err(err) = self.relay.repair(&lock, &accessor).await {
                tolerate(err, &lock.target, "repair")?;
            }
        }
        Ok(())
    }

    async fn pull_pass(&mut self) -> Result<(), Error> {
        for name in self.relay.list_ready("", true).await? {
            let local = match self.access.writable(&name)? {
                Some(path) => path,
                None => continue,
            };
            let meta = match self.relay.meta_info(&name).await {
                Ok(meta) => meta,
                Err(err) => {
                    tolerate(err, &name, "placeholder inspection")?;
                    continue;
                }
            };
            if let Some(meta) = &meta {
                if meta.has_reader(self.relay.client().as_ref()) {
                    continue;
                }
                if let (Some(remote_ts), Some(local_ts)) =
                    (meta.last_modified_secs(), mtime_secs(&local))
                {
                    if remote_ts <= local_ts {
                        continue;
                    }
                }
            }
            match self.relay.pop(&name, &local, self.pullers, false).await {
                Ok(true) => {
                    let ts = meta.as_ref().and_then(|m| m.last_modified_secs());
                    if let Some(ts) = ts {
                        restore_mtime(&local, ts);
                    }
                    self.synced
                        .insert(name.clone(), ts.or_else(|| mtime_secs(&local)).unwrap_or(0));
                    if let Err(err) = self.access.confirm_pull(&name) {
                        tolerate(err, &name, "pull confirmation")?;
                    }
                    tracing::info!(file = name.as_str(), "downloaded");
                }
                Ok(false) => {
                    tracing::debug!(file = name.as_str(), "locked by a peer; skipping");
                }
                Err(err) => tolerate(err, &name, "download")?,
            }
        }
        Ok(())
    }

    async fn push_pass(&mut self) -> Result<(), Error> {
        let mut candidates = Vec::new();
        for path in self.access.list_files()? {
            match self.access.relativize(&path) {
                Some(rel) => candidates.push(rel),
                None => {
                    tracing::warn!(path = %path.display(), "file escapes the repository; skipping")
                }
            }
        }
        for rel in self.access.readable(candidates)? {
            if self.relay.codec().check_regular(&rel).is_err() {
                tracing::warn!(
                    file = rel.as_str(),
                    "filename is reserved for relay bookkeeping; not synchronized"
                );
                continue;
            }
            let abs = self.access.absolute(&rel);
            let Some(local_ts) = mtime_secs(&abs) else {
                continue;
            };
            if self.synced.get(&rel).is_some_and(|ts| local_ts <= *ts) {
                continue;
            }
            match self.relay.meta_info(&rel).await {
                Ok(Some(meta)) => {
                    if meta
                        .last_modified_secs()
                        .is_some_and(|remote_ts| local_ts <= remote_ts)
                    {
                        // The relay already carries this state of the file.
                        self.synced.insert(rel.clone(), local_ts);
                        continue;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tolerate(err, &rel, "placeholder inspection")?;
                    continue;
                }
            }
            match self
                .relay
                .push(&abs, &rel, Some(&local_ts.to_string()), false)
                .await
            {
                Ok(true) => {
                    self.synced.insert(rel.clone(), local_ts);
                    if let Err(err) = self.access.confirm_push(&rel) {
                        tolerate(err, &rel, "push confirmation")?;
                    }
                    tracing::info!(file = rel.as_str(), "uploaded");
                }
                Ok(false) => {
                    tracing::debug!(file = rel.as_str(), "locked by a peer; skipping");
                }
                Err(err) => tolerate(err, &rel, "upload")?,
            }
        }
        Ok(())
    }
}

/// Lets a tick survive ordinary per-file failures while still ending the
/// worker on the unrecoverable class.
fn tolerate(err: Error, file: &str, what: &str) -> Result<(), Error> {
    if err.is_unrecoverable() {
        Err(err)
    } else {
        tracing::warn!(file, error = %err, "{what} failed");
        Ok(())
    }
}

fn mtime_secs(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_secs())
}

/// Gives a downloaded file the mtime its pusher recorded, so both sides
/// agree on whether the file changed since.
fn restore_mtime(path: &Path, epoch_secs: u64) {
    let Ok(file) = std::fs::File::options().write(true).open(path) else {
        return;
    };
    let stamp = UNIX_EPOCH + Duration::from_secs(epoch_secs);
    if let Err(err) = file.set_modified(stamp) {
        tracing::debug!(path = %path.display(), error = %err, "could not restore mtime");
    }
}

