//! The blob-store contract the relay engine is written against.

use std::path::Path;

use async_trait::async_trait;
use ferry_common::{marker::split_path, Error};

/// One blob in a listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Path relative to the listed directory, `/`-separated.
    pub name: String,
    /// Last-modified time in UTC epoch seconds, when the transport has it.
    pub mtime: Option<u64>,
}

/// A passive remote blob store.
///
/// This is everything the relay protocol needs from a transport: no
/// server-side logic, no transactions, no native locking. Implementations
/// must preserve blob names verbatim (no case folding, no normalization) and
/// fail with [`Error::NotFound`] when asked to get or delete a missing blob.
///
/// Listings may be stale on eventually-consistent transports; the engine
/// requalifies through [`BlobStore::exists`] at commit points.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Lists all blobs under `dir`, hidden names included.
    async fn list(&self, dir: &str, recursive: bool) -> Result<Vec<Entry>, Error>;

    /// Uploads a local file, overwriting any existing blob.
    async fn put(&self, local: &Path, remote: &str) -> Result<(), Error>;

    /// Downloads a blob, leaving the remote copy in place.
    async fn get(&self, remote: &str, local: &Path, makedirs: bool) -> Result<(), Error>;

    /// Deletes a blob.
    async fn delete(&self, remote: &str) -> Result<(), Error>;

    /// Size of a blob in bytes, or `None` if it does not exist.
    async fn size(&self, remote: &str) -> Result<Option<u64>, Error>;

    /// Deletes a directory and everything under it.
    async fn purge(&self, dir: &str) -> Result<(), Error>;

    /// Downloads a blob and deletes the remote copy.
    async fn pop(&self, remote: &str, local: &Path, makedirs: bool) -> Result<(), Error> {
        self.get(remote, local, makedirs).await?;
        self.delete(remote).await
    }

    /// Whether a blob exists right now.
    ///
    /// The default implementation requalifies through a fresh non-recursive
    /// listing of the parent directory. Transports with a cheaper direct
    /// check should override it; both must agree.
    async fn exists(&self, remote: &str) -> Result<bool, Error> {
        let (dir, base) = split_path(remote);
        let entries = self.list(dir, false).await?;
        Ok(entries.iter().any(|entry| entry.name == base))
    }

    /// Writes a small blob from memory, via a scratch file by default.
    async fn put_bytes(&self, remote: &str, content: &[u8]) -> Result<(), Error> {
        let scratch = tempfile::NamedTempFile::new()?;
        tokio::fs::write(scratch.path(), content).await?;
        self.put(scratch.path(), remote).await
    }

    /// Reads a small blob into memory, via a scratch file by default.
    async fn get_bytes(&self, remote: &str) -> Result<Vec<u8>, Error> {
        let scratch = tempfile::NamedTempFile::new()?;
        self.get(remote, scratch.path(), false).await?;
        Ok(tokio::fs::read(scratch.path()).await?)
    }
}
