//! Composite relay operations.
//!
//! [`Relay`] layers the coordination protocol over a passive [`BlobStore`]:
//! locks serialize writers, placeholders record delivery, and the repair
//! path cleans up after crashed transfers. The store offers nothing beyond
//! list/put/get/delete, so every guarantee here comes from the marker
//! discipline, not the transport.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tempfile::TempDir;

use ferry_common::{ClientId, Error, MarkerCodec};

use crate::{
    cipher::Cipher,
    lock::{LockInfo, LockMode},
    placeholder::PlaceholderMeta,
    store::BlobStore,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(3600);

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{dir}/{name}")
    }
}

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Capability handle on one local file, handed to [`Relay::repair`].
///
/// Repair may need to discard a half-written local copy; whether it is
/// allowed to is the caller's policy, not the engine's.
pub struct Accessor {
    path: PathBuf,
    removable: bool,
}

impl Accessor {
    pub fn new(path: impl Into<PathBuf>, removable: bool) -> Self {
        Self {
            path: path.into(),
            removable,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn remove(&self) -> Result<(), Error> {
        if !self.removable {
            return Err(Error::Denied(self.path.clone()));
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Exchanges files with peers through a shared relay store.
pub struct Relay {
    store: Box<dyn BlobStore>,
    codec: MarkerCodec,
    client: ClientId,
    cipher: Cipher,
    lock_timeout: Option<Duration>,
    poll_interval: Duration,
    // Scratch space for staged and inspected blobs; dropped with the worker.
    scratch: TempDir,
}

impl Relay {
    pub fn new(store: Box<dyn BlobStore>, client: ClientId) -> Result<Self, Error> {
        Ok(Self {
            store,
            codec: MarkerCodec::default(),
            client,
            cipher: Cipher::default(),
            lock_timeout: Some(DEFAULT_LOCK_TIMEOUT),
            poll_interval: DEFAULT_POLL_INTERVAL,
            scratch: TempDir::new()?,
        })
    }

    pub fn with_codec(mut self, codec: MarkerCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_cipher(mut self, cipher: Cipher) -> Self {
        self.cipher = cipher;
        self
    }

    /// `None` disables timeout-based reclaim of ownerless locks.
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn client(&self) -> &ClientId {
        &self.client
    }

    pub fn codec(&self) -> &MarkerCodec {
        &self.codec
    }

    // ---- locks ----------------------------------------------------------

    pub async fn has_lock(&self, remote: &str) -> Result<bool, Error> {
        let name = self.codec.lock_name(remote);
        self.store.exists(&name).await.map_err(Error::promote)
    }

    /// Claims the lock on `remote`.
    ///
    /// Non-blocking acquisition reports `false` when the slot is taken.
    /// Blocking acquisition polls until the slot frees up. The claim write
    /// itself is unguarded; the protocol stays safe because pushers finish
    /// the whole file before unlocking (last writer wins cleanly), pullers
    /// are idempotent, and leftover claims fall to [`Relay::repair`].
    pub async fn acquire_lock(
        &self,
        remote: &str,
        mode: LockMode,
        blocking: bool,
    ) -> Result<bool, Error> {
        if blocking {
            while self.has_lock(remote).await? {
                tracing::debug!(
                    file = remote,
                    "lock not available; waiting {}s",
                    self.poll_interval.as_secs()
                );
                tokio::time::sleep(self.poll_interval).await;
            }
        } else if self.has_lock(remote).await? {
            return Ok(false);
        }
        let info = LockInfo::new(self.client.clone(), mode, remote);
        let name = self.codec.lock_name(remote);
        self.store
            .put_bytes(&name, info.render().as_bytes())
            .await
            .map_err(Error::promote)?;
        Ok(true)
    }

    /// Releases the lock on `remote`. An already-gone lock is not an error.
    pub async fn release_lock(&self, remote: &str) -> Result<(), Error> {
        let name = self.codec.lock_name(remote);
        match self.store.delete(&name).await.map_err(Error::promote) {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => {
                tracing::debug!(file = remote, "lock already released");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Reads and parses the lock blob for `remote`.
    ///
    /// Read failures and malformed bodies yield zero-value info, so a broken
    /// lock is reclaimed through the stale-lock path instead of wedging its
    /// file forever.
    pub async fn lock_info(&self, remote: &str) -> Result<LockInfo, Error> {
        let name = self.codec.lock_name(remote);
        match self.store.get_bytes(&name).await.map_err(Error::promote) {
            Ok(body) => Ok(LockInfo::parse(&String::from_utf8_lossy(&body), remote)),
            Err(err) if err.is_unrecoverable() => Err(err),
            Err(_) => Ok(LockInfo {
                target: remote.to_owned(),
                ..LockInfo::default()
            }),
        }
    }

    // ---- placeholders ---------------------------------------------------

    pub async fn has_placeholder(&self, remote: &str) -> Result<bool, Error> {
        let name = self.codec.placeholder_name(remote);
        self.store.exists(&name).await.map_err(Error::promote)
    }

    /// Writes (or overwrites) the placeholder for `remote`; the body is the
    /// pushed file's last-modified time, when known.
    pub async fn update_placeholder(
        &self,
        remote: &str,
        last_modified: Option<&str>,
    ) -> Result<(), Error> {
        let name = self.codec.placeholder_name(remote);
        self.store
            .put_bytes(&name, last_modified.unwrap_or_default().as_bytes())
            .await
            .map_err(Error::promote)
    }

    /// Appends this client to the placeholder's reader list.
    ///
    /// Must only be called under the file's lock; the read-modify-write
    /// would otherwise lose concurrent appends.
    pub async fn mark_as_read(&self, remote: &str) -> Result<(), Error> {
        self.mark_as_read_inner(remote, None).await
    }

    async fn mark_as_read_inner(&self, remote: &str, cached: Option<Vec<u8>>) -> Result<(), Error> {
        let name = self.codec.placeholder_name(remote);
        let mut body = match cached {
            Some(body) => body,
            None => self.store.get_bytes(&name).await.map_err(Error::promote)?,
        };
        body.push(b'\n');
        body.extend_from_slice(self.client.as_ref().as_bytes());
        self.store
            .put_bytes(&name, &body)
            .await
            .map_err(Error::promote)
    }

    /// Deletes the placeholder for `remote`.
    pub async fn release_place(&self, remote: &str, handle_missing: bool) -> Result<(), Error> {
        let name = self.codec.placeholder_name(remote);
        match self.store.delete(&name).await.map_err(Error::promote) {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => {
                if handle_missing {
                    tracing::debug!(file = remote, "cannot find placeholder");
                    Ok(())
                } else {
                    tracing::warn!(file = remote, "cannot find placeholder");
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Decoded placeholder contents for `remote`, or `None` when the file
    /// has no placeholder.
    pub async fn meta_info(&self, remote: &str) -> Result<Option<PlaceholderMeta>, Error> {
        let name = self.codec.placeholder_name(remote);
        match self.store.get_bytes(&name).await.map_err(Error::promote) {
            Ok(body) => Ok(Some(PlaceholderMeta::parse(&String::from_utf8_lossy(
                &body,
            )))),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    // ---- transfers ------------------------------------------------------

    /// Uploads a file.
    ///
    /// Returns `false` when non-blocking and the file is locked by a peer.
    /// The placeholder is refreshed before the bytes move, so a crash in
    /// between leaves a state the next tick resolves by re-sending.
    pub async fn push(
        &self,
        local: &Path,
        remote: &str,
        last_modified: Option<&str>,
        blocking: bool,
    ) -> Result<bool, Error> {
        self.codec.check_regular(remote)?;
        if !self.acquire_lock(remote, LockMode::Write, blocking).await? {
            return Ok(false);
        }
        if let Some(last_modified) = last_modified {
            self.update_placeholder(remote, Some(last_modified)).await?;
        }
        let staged = self.cipher.seal(local, self.scratch.path()).await?;
        let source = staged.as_deref().unwrap_or(local);
        self.store.put(source, remote).await.map_err(Error::promote)?;
        self.release_lock(remote).await?;
        Ok(true)
    }

    /// Downloads a file, deleting the remote copy once every expected puller
    /// has it.
    ///
    /// With a placeholder present and `pullers > 1`, the recorded reader
    /// count decides between a non-destructive `get` and the final,
    /// destructive `pop`; the final puller removes the placeholder together
    /// with the file.
    pub async fn pop(
        &self,
        remote: &str,
        local: &Path,
        pullers: u32,
        blocking: bool,
    ) -> Result<bool, Error> {
        if !self.acquire_lock(remote, LockMode::Read, blocking).await? {
            return Ok(false);
        }
        let has_placeholder = self.has_placeholder(remote).await?;
        let mut cached = None;
        let mut keep_remote = false;
        if has_placeholder && pullers > 1 {
            let name = self.codec.placeholder_name(remote);
            let body = self.store.get_bytes(&name).await.map_err(Error::promote)?;
            let reads = String::from_utf8_lossy(&body).lines().count() as i64 - 1;
            keep_remote = reads < i64::from(pullers) - 1;
            cached = Some(body);
        }
        if keep_remote {
            self.store
                .get(remote, local, true)
                .await
                .map_err(Error::promote)?;
        } else {
            self.store
                .pop(remote, local, true)
                .await
                .map_err(Error::promote)?;
        }
        self.unseal(local).await?;
        if keep_remote {
            self.mark_as_read_inner(remote, cached).await?;
        } else if has_placeholder {
            // Delivery complete: the bookkeeping leaves with the file.
            self.release_place(remote, true).await?;
        } else {
            self.update_placeholder(remote, None).await?;
        }
        self.release_lock(remote).await?;
        Ok(true)
    }

    /// Downloads a file without ever deleting the remote copy; still records
    /// the read.
    pub async fn get(&self, remote: &str, local: &Path, blocking: bool) -> Result<bool, Error> {
        if !self.acquire_lock(remote, LockMode::Read, blocking).await? {
            return Ok(false);
        }
        self.store
            .get(remote, local, true)
            .await
            .map_err(Error::promote)?;
        self.unseal(local).await?;
        if self.has_placeholder(remote).await? {
            self.mark_as_read_inner(remote, None).await?;
        }
        self.release_lock(remote).await?;
        Ok(true)
    }

    async fn unseal(&self, local: &Path) -> Result<(), Error> {
        if let Some(clear) = self.cipher.open(local, self.scratch.path()).await? {
            tokio::fs::copy(&clear, local).await?;
        }
        Ok(())
    }

    /// Deletes a remote file as if it had been downloaded: the read is still
    /// recorded (best effort) so peers see the delivery.
    pub async fn delete(&self, remote: &str, blocking: bool) -> Result<bool, Error> {
        if !self.acquire_lock(remote, LockMode::Read, blocking).await? {
            return Ok(false);
        }
        self.unlink(remote).await?;
        match self.mark_as_read_inner(remote, None).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        self.release_lock(remote).await?;
        Ok(true)
    }

    /// Deletes a remote blob; missing blobs are an error.
    pub async fn unlink(&self, remote: &str) -> Result<(), Error> {
        self.store.delete(remote).await.map_err(Error::promote)
    }

    /// Deletes a remote directory and its contents.
    pub async fn purge(&self, dir: &str) -> Result<(), Error> {
        self.store.purge(dir).await.map_err(Error::promote)
    }

    // ---- recovery -------------------------------------------------------

    /// Clears the remains of a crashed transfer.
    ///
    /// A dead push leaves indeterminate remote content: drop it, and drop
    /// the placeholder so the file is sent again. A dead pop leaves
    /// indeterminate local content: drop that, and if the remote copy is
    /// gone as well, drop the placeholder to force a re-request. Locks with
    /// no readable mode are treated like dead pushes. The lock itself is
    /// always released.
    pub async fn repair(&self, lock: &LockInfo, local: &Accessor) -> Result<(), Error> {
        let remote = lock.target.as_str();
        match lock.mode {
            Some(LockMode::Write) => {
                if !local.exists() {
                    tracing::error!(file = remote, "could not find the local file");
                    tracing::debug!(file = remote, "clearing related remote state anyway");
                }
                if self.store.exists(remote).await.map_err(Error::promote)? {
                    // content is indeterminate; size is not a reliable check
                    self.unlink(remote).await?;
                }
                self.release_place(remote, true).await?;
            }
            Some(LockMode::Read) => {
                if local.exists() {
                    local.remove()?;
                }
                if !self.store.exists(remote).await.map_err(Error::promote)? {
                    self.release_place(remote, true).await?;
                }
            }
            None => {
                if self.store.exists(remote).await.map_err(Error::promote)? {
                    self.unlink(remote).await?;
                }
                self.release_place(remote, true).await?;
            }
        }
        self.release_lock(remote).await
    }

    // ---- listings -------------------------------------------------------

    /// Files available for download: regular names with no lock in the same
    /// listing.
    pub async fn list_ready(&self, dir: &str, recursive: bool) -> Result<Vec<String>, Error> {
        let entries = self.store.list(dir, recursive).await.map_err(Error::promote)?;
        let names: HashSet<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        let mut ready = Vec::new();
        for entry in &entries {
            let name = entry.name.as_str();
            if self.codec.is_marker(name) {
                continue;
            }
            if !names.contains(self.codec.lock_name(name).as_str()) {
                ready.push(name.to_owned());
            }
        }
        Ok(ready)
    }

    /// Files some peer already transferred.
    ///
    /// With `end2end`, only files whose content left the relay (placeholder
    /// present); otherwise regular, placeheld and locked names together.
    pub async fn list_transfered(
        &self,
        dir: &str,
        end2end: bool,
        recursive: bool,
    ) -> Result<Vec<String>, Error> {
        let entries = self.store.list(dir, recursive).await.map_err(Error::promote)?;
        let mut placeholders = Vec::new();
        let mut locks = Vec::new();
        let mut others = Vec::new();
        for entry in entries {
            if self.codec.is_placeholder(&entry.name) {
                placeholders.push(self.codec.from_placeholder(&entry.name)?);
            } else if self.codec.is_lock(&entry.name) {
                locks.push(self.codec.from_lock(&entry.name)?);
            } else {
                others.push(entry.name);
            }
        }
        if end2end {
            Ok(placeholders)
        } else {
            others.extend(placeholders);
            others.extend(locks);
            Ok(others)
        }
    }

    /// Locks left behind by crashed transfers.
    ///
    /// A lock owned by this client means this client crashed while holding
    /// it and is reported regardless of age. An ownerless lock is reported
    /// once older than the configured timeout, measured against the listing
    /// mtime.
    pub async fn list_corrupted(&self, dir: &str, recursive: bool) -> Result<Vec<LockInfo>, Error> {
        let entries = self.store.list(dir, recursive).await.map_err(Error::promote)?;
        let now = epoch_now();
        let mut corrupted = Vec::new();
        for entry in entries {
            if !self.codec.is_lock(&entry.name) {
                continue;
            }
            let target = join(dir, &self.codec.from_lock(&entry.name)?);
            let info = self.lock_info(&target).await?;
            match &info.owner {
                Some(owner) if *owner == self.client => corrupted.push(info),
                Some(_) => {}
                None => {
                    if let (Some(timeout), Some(mtime)) = (self.lock_timeout, entry.mtime) {
                        if now.saturating_sub(mtime) > timeout.as_secs() {
                            corrupted.push(info);
                        }
                    }
                }
            }
        }
        Ok(corrupted)
    }
}
