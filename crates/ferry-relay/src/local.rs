//! Directory-backed relay store.
//!
//! The relay is a plain directory tree, typically a mounted network share.
//! Blob names map one-to-one onto paths below the root.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use ferry_common::Error;

use crate::store::{BlobStore, Entry};

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Opens (and creates if needed) a directory-backed store.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a relay path onto the backing directory, refusing traversal.
    fn resolve(&self, remote: &str) -> Result<PathBuf, Error> {
        let mut path = self.root.clone();
        for part in remote.split('/') {
            match part {
                "" | "." => continue,
                ".." => {
                    return Err(Error::InvalidAddress(format!(
                        "relay path '{remote}' escapes the store root"
                    )))
                }
                part => path.push(part),
            }
        }
        Ok(path)
    }

    fn not_found(remote: &str, err: std::io::Error) -> Error {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(remote.to_owned())
        } else {
            Error::Io(err)
        }
    }
}

fn mtime_secs(meta: &std::fs::Metadata) -> Option<u64> {
    let modified = meta.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_secs())
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn list(&self, dir: &str, recursive: bool) -> Result<Vec<Entry>, Error> {
        let base = self.resolve(dir)?;
        let mut entries = Vec::new();
        // (absolute dir, relative prefix) pairs still to walk
        let mut pending = vec![(base, String::new())];
        while let Some((abs, prefix)) = pending.pop() {
            let mut dir_entries = match tokio::fs::read_dir(&abs).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = dir_entries.next_entry().await? {
                let Ok(name) = entry.file_name().into_string() else {
                    tracing::warn!(entry = ?entry.path(), "skipping non-UTF-8 relay entry");
                    continue;
                };
                let name = if prefix.is_empty() {
                    name
                } else {
                    format!("{prefix}/{name}")
                };
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if recursive {
                        pending.push((entry.path(), name));
                    }
                } else {
                    let mtime = entry.metadata().await.ok().and_then(|m| mtime_secs(&m));
                    entries.push(Entry { name, mtime });
                }
            }
        }
        Ok(entries)
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<(), Error> {
        let dest = self.resolve(remote)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, &dest).await?;
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path, makedirs: bool) -> Result<(), Error> {
        let src = self.resolve(remote)?;
        if makedirs {
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::copy(&src, local)
            .await
            .map_err(|err| Self::not_found(remote, err))?;
        Ok(())
    }

    async fn delete(&self, remote: &str) -> Result<(), Error> {
        let path = self.resolve(remote)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|err| Self::not_found(remote, err))
    }

    async fn size(&self, remote: &str) -> Result<Option<u64>, Error> {
        let path = self.resolve(remote)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn purge(&self, dir: &str) -> Result<(), Error> {
        let path = self.resolve(dir)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    // Direct checks are cheaper than a listing on a filesystem store.

    async fn exists(&self, remote: &str) -> Result<bool, Error> {
        Ok(tokio::fs::try_exists(self.resolve(remote)?).await?)
    }

    async fn put_bytes(&self, remote: &str, content: &[u8]) -> Result<(), Error> {
        let dest = self.resolve(remote)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::write(&dest, content).await?)
    }

    async fn get_bytes(&self, remote: &str) -> Result<Vec<u8>, Error> {
        tokio::fs::read(self.resolve(remote)?)
            .await
            .map_err(|err| Self::not_found(remote, err))
    }
}
