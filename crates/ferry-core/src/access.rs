//! Per-file transfer permissions.
//!
//! Each repository carries a small persistent table mapping relative paths
//! to a pair of permissions: may this file be uploaded (read from disk), may
//! it be overwritten by a download (written to disk). The table is consulted
//! on every tick and mutated from the CLI and by conservative-mode
//! confirmations.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use ferry_common::{AccessMode, Error};
use ferry_relay::Accessor;
use walkdir::WalkDir;

const UNDEFINED: u8 = b' ';
const ALLOWED: u8 = b'+';
const DENIED: u8 = b'-';

/// One record of the attribute table: upload and download permission, each
/// possibly undefined.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Attributes {
    pub read: Option<bool>,
    pub write: Option<bool>,
}

impl Attributes {
    pub fn is_undefined(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    fn encode_one(value: Option<bool>) -> u8 {
        match value {
            None => UNDEFINED,
            Some(true) => ALLOWED,
            Some(false) => DENIED,
        }
    }

    fn decode_one(sym: u8) -> Result<Option<bool>, Error> {
        match sym {
            UNDEFINED => Ok(None),
            ALLOWED => Ok(Some(true)),
            DENIED => Ok(Some(false)),
            other => Err(Error::InvalidConfig(
                format!("unrecognized permission symbol '{}'", other as char).into(),
            )),
        }
    }

    fn encode(&self) -> [u8; 2] {
        [Self::encode_one(self.read), Self::encode_one(self.write)]
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != 2 {
            return Err(Error::InvalidConfig(
                "permission records are exactly two symbols".into(),
            ));
        }
        Ok(Self {
            read: Self::decode_one(bytes[0])?,
            write: Self::decode_one(bytes[1])?,
        })
    }
}

/// The persistent attribute table backing one repository.
///
/// The table is a single text file of `<r><w>\t<relative path>` lines. Every
/// operation opens it under an exclusive lock, mutates, rewrites and
/// releases, so the CLI and a running worker never see torn state.
#[derive(Clone, Debug)]
pub struct AttributeStore {
    path: PathBuf,
}

impl AttributeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the table, taking the exclusive lock. The lock is held until
    /// the returned guard drops.
    pub fn open(&self) -> Result<StoreGuard, Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        sys::lock_exclusive(&file)?;
        let mut guard = StoreGuard {
            file,
            entries: BTreeMap::new(),
        };
        let mut contents = String::new();
        guard.file.read_to_string(&mut contents)?;
        for line in contents.lines() {
            if line.is_empty() {
                continue;
            }
            let Some((attrs, key)) = line.split_once('\t') else {
                return Err(Error::InvalidConfig(
                    format!("malformed access record: {line:?}").into(),
                ));
            };
            guard
                .entries
                .insert(key.to_owned(), Attributes::decode(attrs.as_bytes())?);
        }
        Ok(guard)
    }
}

/// Locked view of the attribute table.
pub struct StoreGuard {
    file: File,
    entries: BTreeMap<String, Attributes>,
}

impl StoreGuard {
    pub fn get(&self, key: &str) -> Attributes {
        self.entries.get(key).copied().unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records `attrs` under `key`; a fully undefined record is removed
    /// instead, so the table never accumulates dead entries.
    pub fn set(&mut self, key: &str, attrs: Attributes) {
        if attrs.is_undefined() {
            self.entries.remove(key);
        } else {
            self.entries.insert(key.to_owned(), attrs);
        }
    }

    /// Rewrites the table in place and syncs it, keeping the lock held
    /// through the write.
    pub fn commit(mut self) -> Result<(), Error> {
        self.file.rewind()?;
        self.file.set_len(0)?;
        for (key, attrs) in &self.entries {
            let sym = attrs.encode();
            self.file.write_all(&sym)?;
            self.file.write_all(b"\t")?;
            self.file.write_all(key.as_bytes())?;
            self.file.write_all(b"\n")?;
        }
        Ok(self.file.sync_all()?)
    }
}

impl Drop for StoreGuard {
    fn drop(&mut self) {
        let _ = sys::unlock(&self.file);
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io::{Error, Result};
    use std::os::unix::io::AsRawFd;

    pub(super) fn lock_exclusive(file: &File) -> Result<()> {
        flock(file, libc::LOCK_EX)
    }

    pub(super) fn unlock(file: &File) -> Result<()> {
        flock(file, libc::LOCK_UN)
    }

    fn flock(file: &File, flag: libc::c_int) -> Result<()> {
        let ret = unsafe { libc::flock(file.as_raw_fd(), flag) };
        if ret < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use std::fs::File;
    use std::io::Result;

    // The table is exclusive to its worker by ownership; the flock is a
    // same-host safeguard against a concurrent CLI, which other platforms
    // go without.
    pub(super) fn lock_exclusive(_file: &File) -> Result<()> {
        Ok(())
    }

    pub(super) fn unlock(_file: &File) -> Result<()> {
        Ok(())
    }
}

/// Answers, for one repository, which local files may move in which
/// direction.
pub struct AccessController {
    name: String,
    root: PathBuf,
    mode: AccessMode,
    store: Option<AttributeStore>,
}

impl AccessController {
    /// `store_path` enables the persistent table; it is actually used when
    /// it already exists, when `create` is set, or always in conservative
    /// mode (which cannot work without it).
    pub fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        mode: AccessMode,
        store_path: Option<PathBuf>,
        create: bool,
    ) -> Result<Self, Error> {
        let name = name.into();
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::InvalidConfig(
                format!("no local repository at '{}'", root.display()).into(),
            ));
        }
        let store = store_path
            .filter(|path| create || mode == AccessMode::Conservative || path.exists())
            .map(AttributeStore::new);
        Ok(Self {
            name,
            root,
            mode,
            store,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// All visible files in the repository, as absolute paths. Dotfiles and
    /// dot-directories are ignored.
    pub fn list_files(&self) -> Result<Vec<PathBuf>, Error> {
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root).min_depth(1).into_iter();
        for entry in walker.filter_entry(|e| !is_hidden(e)) {
            let entry = entry.map_err(|err| Error::Io(err.into()))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }

    /// Repository-relative, `/`-separated form of a path inside the
    /// repository.
    pub fn relativize(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Option<Vec<&str>> = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect();
        Some(parts?.join("/"))
    }

    pub fn absolute(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Filters the files that may be uploaded.
    pub fn readable(&self, files: Vec<String>) -> Result<Vec<String>, Error> {
        if self.mode == AccessMode::Download {
            return Ok(Vec::new());
        }
        let Some(store) = &self.store else {
            return Ok(files);
        };
        let guard = store.open()?;
        Ok(files
            .into_iter()
            .filter(|file| guard.get(file).read != Some(false))
            .collect())
    }

    /// Local path a remote file may be downloaded to, or `None` when the
    /// download is not permitted.
    ///
    /// In conservative mode an existing local file with no recorded
    /// permission is implicitly denied; a confirmed pull or push records the
    /// explicit permission afterwards.
    pub fn writable(&self, rel: &str) -> Result<Option<PathBuf>, Error> {
        if self.mode == AccessMode::Upload {
            return Ok(None);
        }
        let abs = self.absolute(rel);
        let recorded = match &self.store {
            Some(store) => store.open()?.get(rel).write,
            None => None,
        };
        Ok(match recorded {
            Some(true) => Some(abs),
            Some(false) => None,
            None => {
                if self.mode == AccessMode::Conservative && abs.exists() {
                    None
                } else {
                    Some(abs)
                }
            }
        })
    }

    pub fn get_readability(&self, path: impl AsRef<Path>) -> Result<Option<bool>, Error> {
        let rel = self.rel_of(path.as_ref())?;
        match &self.store {
            Some(store) => Ok(store.open()?.get(&rel).read),
            None => Ok(None),
        }
    }

    pub fn get_writability(&self, path: impl AsRef<Path>) -> Result<Option<bool>, Error> {
        let rel = self.rel_of(path.as_ref())?;
        match &self.store {
            Some(store) => Ok(store.open()?.get(&rel).write),
            None => Ok(None),
        }
    }

    pub fn set_readability(&self, path: impl AsRef<Path>, value: Option<bool>) -> Result<(), Error> {
        let rel = self.checked_rel(path.as_ref())?;
        self.update(&rel, |attrs| attrs.read = value)
    }

    pub fn set_writability(&self, path: impl AsRef<Path>, value: Option<bool>) -> Result<(), Error> {
        let rel = self.checked_rel(path.as_ref())?;
        self.update(&rel, |attrs| attrs.write = value)
    }

    /// Conservative-mode bookkeeping after a successful download: the local
    /// copy is ours to overwrite next time.
    pub fn confirm_pull(&self, rel: &str) -> Result<(), Error> {
        if self.mode != AccessMode::Conservative {
            return Ok(());
        }
        self.update(rel, |attrs| attrs.write = Some(true))
    }

    /// Conservative-mode bookkeeping after a successful upload: do not send
    /// the file again until it changes hands.
    pub fn confirm_push(&self, rel: &str) -> Result<(), Error> {
        if self.mode != AccessMode::Conservative {
            return Ok(());
        }
        self.update(rel, |attrs| attrs.write = Some(false))
    }

    /// Capability handle on the local counterpart of a relay file, for
    /// crash repair. Pull-capable modes may discard indeterminate local
    /// copies; an upload-only client never deletes local files.
    pub fn accessor(&self, rel: &str) -> Accessor {
        Accessor::new(self.absolute(rel), self.mode != AccessMode::Upload)
    }

    fn update(&self, rel: &str, mutate: impl FnOnce(&mut Attributes)) -> Result<(), Error> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| Error::NoAccessStore(self.name.clone()))?;
        let mut guard = store.open()?;
        let mut attrs = guard.get(rel);
        mutate(&mut attrs);
        guard.set(rel, attrs);
        guard.commit()
    }

    /// Relative form of `path` without requiring the file to exist.
    fn rel_of(&self, path: &Path) -> Result<String, Error> {
        if path.is_absolute() {
            self.relativize(path)
                .ok_or_else(|| Error::NotInRepository(path.to_owned()))
        } else {
            path.to_str()
                .map(|s| s.replace(std::path::MAIN_SEPARATOR, "/"))
                .ok_or_else(|| Error::NotInRepository(path.to_owned()))
        }
    }

    /// Relative form of `path`, requiring it to exist in the repository or
    /// to be recorded in the table already.
    fn checked_rel(&self, path: &Path) -> Result<String, Error> {
        let rel = self.rel_of(path)?;
        let abs = self.absolute(&rel);
        if abs.exists() {
            return Ok(rel);
        }
        if let Some(store) = &self.store {
            let guard = store.open()?;
            if guard.contains(&rel) {
                tracing::debug!(path = %abs.display(), "recorded file is missing from the filesystem");
                return Ok(rel);
            }
        }
        Err(Error::NotInRepository(path.to_owned()))
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}
