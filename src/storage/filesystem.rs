//! Filesystem gateway
//!
//! The only way the server touches the directory tree. Every operation takes
//! a logical path, resolves it through the jail, and maps I/O failures onto
//! `StorageError`.

use log::{error, info, warn};
use std::fs::Metadata;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::fs::{self, File, ReadDir};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::error::StorageError;
use crate::storage::flags::OpenFlags;
use crate::storage::jail;
use crate::storage::locks::{PathLockGuard, PathLockTable};

/// Stat fields exposed over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_dir: bool,
    pub size: i64,
    pub modified: i64,
}

impl From<&Metadata> for FileStat {
    fn from(metadata: &Metadata) -> Self {
        let modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|dur| dur.as_secs() as i64)
            .unwrap_or(0);

        Self {
            is_dir: metadata.is_dir(),
            size: i64::try_from(metadata.len()).unwrap_or(i64::MAX),
            modified,
        }
    }
}

/// Jailed view of the root directory.
pub struct Filesystem {
    root: PathBuf,
    file_mode: u32,
    locks: Arc<PathLockTable>,
}

impl Filesystem {
    /// Opens the gateway over `root`, which must be an existing directory.
    pub fn new(root: impl AsRef<Path>, file_mode: u32) -> Result<Self, StorageError> {
        let root = root.as_ref();
        let display = root.display().to_string();
        let metadata = std::fs::metadata(root).map_err(|e| StorageError::from_io(&display, e))?;
        if !metadata.is_dir() {
            return Err(StorageError::NotADirectory(display));
        }

        let root = root
            .canonicalize()
            .map_err(|e| StorageError::from_io(&display, e))?;
        info!("Filesystem root: {}", root.display());

        Ok(Self {
            root,
            file_mode,
            locks: Arc::new(PathLockTable::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locks(&self) -> &Arc<PathLockTable> {
        &self.locks
    }

    pub fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        jail::resolve(&self.root, path)
    }

    /// Opens a file read-only.
    pub async fn open(&self, path: &str) -> Result<FileHandle, StorageError> {
        self.open_file(path, OpenFlags::RDONLY).await
    }

    /// Opens a file with client-supplied flags.
    ///
    /// CREATE without write access creates the file first and then opens it
    /// read-only, as open(2) does. TRUNC without write access is rejected.
    pub async fn open_file(&self, path: &str, flags: OpenFlags) -> Result<FileHandle, StorageError> {
        let resolved = self.resolve(path)?;
        if !flags.writable() {
            if flags.contains(OpenFlags::TRUNC) {
                return Err(StorageError::InvalidFlags {
                    path: path.to_string(),
                    reason: "TRUNC requires write access",
                });
            }
            if flags.contains(OpenFlags::CREATE) {
                let create = OpenFlags::WRONLY | (flags & (OpenFlags::CREATE | OpenFlags::EXCL));
                create
                    .to_open_options(self.file_mode)
                    .open(&resolved)
                    .await
                    .map_err(|e| StorageError::from_io(path, e))?;
            }
        }

        let file = flags
            .to_open_options(self.file_mode)
            .open(&resolved)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;

        Ok(FileHandle {
            file,
            path: resolved,
            logical: path.to_string(),
            created: flags.creates_new(),
            ghost: false,
            lock: None,
        })
    }

    pub async fn open_dir(&self, path: &str) -> Result<DirHandle, StorageError> {
        let resolved = if jail::clean(path)? == "/" {
            self.root.clone()
        } else {
            self.resolve(path)?
        };
        let entries = fs::read_dir(&resolved)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;

        Ok(DirHandle {
            entries,
            path: resolved,
            exhausted: false,
        })
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> Result<(), StorageError> {
        let resolved = self.resolve(path)?;
        dir_builder(mode, false)
            .create(&resolved)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    pub async fn mkdir_all(&self, path: &str, mode: u32) -> Result<(), StorageError> {
        let resolved = self.resolve(path)?;
        dir_builder(mode, true)
            .create(&resolved)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    /// Removes a file or an empty directory.
    pub async fn remove(&self, path: &str) -> Result<(), StorageError> {
        let resolved = self.resolve(path)?;
        let metadata = fs::symlink_metadata(&resolved)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;

        let result = if metadata.is_dir() {
            fs::remove_dir(&resolved).await
        } else {
            fs::remove_file(&resolved).await
        };
        result.map_err(|e| StorageError::from_io(path, e))
    }

    /// Removes a path and everything beneath it. Missing paths are not an error.
    pub async fn remove_all(&self, path: &str) -> Result<(), StorageError> {
        let resolved = self.resolve(path)?;
        let metadata = match fs::symlink_metadata(&resolved).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::from_io(path, e)),
        };

        let result = if metadata.is_dir() {
            fs::remove_dir_all(&resolved).await
        } else {
            fs::remove_file(&resolved).await
        };
        result.map_err(|e| StorageError::from_io(path, e))
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        fs::rename(&source, &target)
            .await
            .map_err(|e| StorageError::from_io(from, e))
    }

    pub async fn stat(&self, path: &str) -> Result<FileStat, StorageError> {
        let resolved = self.resolve(path)?;
        let metadata = fs::metadata(&resolved)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        Ok(FileStat::from(&metadata))
    }

    pub async fn lstat(&self, path: &str) -> Result<FileStat, StorageError> {
        let resolved = self.resolve(path)?;
        let metadata = fs::symlink_metadata(&resolved)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        Ok(FileStat::from(&metadata))
    }

    /// Takes the exclusive path lock for `path`.
    pub async fn lock(&self, path: &str) -> Result<PathLockGuard, StorageError> {
        let resolved = self.resolve(path)?;
        Ok(self.locks.lock(&resolved).await)
    }

    /// Takes the shared path lock for `path`.
    pub async fn rlock(&self, path: &str) -> Result<PathLockGuard, StorageError> {
        let resolved = self.resolve(path)?;
        Ok(self.locks.rlock(&resolved).await)
    }
}

fn dir_builder(mode: u32, recursive: bool) -> fs::DirBuilder {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(recursive);
    #[cfg(unix)]
    builder.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;
    builder
}

/// An open file owned by one connection.
#[derive(Debug)]
pub struct FileHandle {
    file: File,
    path: PathBuf,
    logical: String,
    created: bool,
    ghost: bool,
    lock: Option<PathLockGuard>,
}

impl FileHandle {
    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn logical(&self) -> &str {
        &self.logical
    }

    /// Whether this open session created the file.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn is_ghost(&self) -> bool {
        self.ghost
    }

    /// Marks the file for deletion on close.
    pub fn mark_ghost(&mut self) {
        self.ghost = true;
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64, StorageError> {
        self.file
            .seek(pos)
            .await
            .map_err(|e| StorageError::from_io(&self.logical, e))
    }

    pub async fn stat(&self) -> Result<FileStat, StorageError> {
        let metadata = self
            .file
            .metadata()
            .await
            .map_err(|e| StorageError::from_io(&self.logical, e))?;
        Ok(FileStat::from(&metadata))
    }

    pub async fn truncate(&mut self, size: u64) -> Result<(), StorageError> {
        self.file
            .set_len(size)
            .await
            .map_err(|e| StorageError::from_io(&self.logical, e))
    }

    /// Flushes buffered writes and syncs them to disk.
    pub async fn sync(&mut self) -> Result<(), StorageError> {
        self.file
            .flush()
            .await
            .map_err(|e| StorageError::from_io(&self.logical, e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| StorageError::from_io(&self.logical, e))
    }

    pub fn has_lock(&self) -> bool {
        self.lock.is_some()
    }

    /// Stores a path lock on the handle; it is released on unlock or close.
    pub fn hold_lock(&mut self, guard: PathLockGuard) {
        self.lock = Some(guard);
    }

    pub fn release_lock(&mut self) -> bool {
        self.lock.take().is_some()
    }

    /// Closes the file. A ghost file is deleted; failing to delete it is a
    /// rollback failure.
    pub async fn close(mut self) -> Result<(), StorageError> {
        let flushed = self.file.flush().await;
        drop(self.file);
        self.lock.take();

        if !self.ghost {
            return flushed.map_err(|e| StorageError::from_io(&self.logical, e));
        }

        if let Err(e) = flushed {
            warn!("Flush of ghost file {} failed: {}", self.logical, e);
        }

        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Rolled back ghost file {}", self.logical);
                Ok(())
            }
            Err(e) => {
                error!("Failed to roll back ghost file {}: {}", self.logical, e);
                Err(StorageError::RollbackFailed {
                    path: self.logical,
                    source: e,
                })
            }
        }
    }
}

/// An open directory listing owned by one connection.
#[derive(Debug)]
pub struct DirHandle {
    entries: ReadDir,
    path: PathBuf,
    exhausted: bool,
}

impl DirHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns up to `max` further entry names; fewer means the listing ended.
    pub async fn read_names(&mut self, max: usize) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        while !self.exhausted && names.len() < max {
            match self.entries.next_entry().await {
                Ok(Some(entry)) => names.push(entry.file_name().to_string_lossy().into_owned()),
                Ok(None) => self.exhausted = true,
                Err(e) => {
                    return Err(StorageError::from_io(&self.path.display().to_string(), e));
                }
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn gateway() -> (tempfile::TempDir, Filesystem) {
        let dir = tempfile::tempdir().unwrap();
        let fs = Filesystem::new(dir.path(), 0o644).unwrap();
        (dir, fs)
    }

    fn create_new() -> OpenFlags {
        OpenFlags::WRONLY | OpenFlags::CREATE | OpenFlags::EXCL
    }

    #[tokio::test]
    async fn test_rejects_non_directory_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            Filesystem::new(&file, 0o644),
            Err(StorageError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_create_write_and_read_back() {
        let (dir, fs) = gateway();
        let mut handle = fs.open_file("/note.txt", create_new()).await.unwrap();
        assert!(handle.created());
        handle.file().write_all(b"hello").await.unwrap();
        handle.close().await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("note.txt")).unwrap(), b"hello");

        let mut handle = fs.open("/note.txt").await.unwrap();
        let mut buf = String::new();
        handle.file().read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "hello");
        assert_eq!(handle.stat().await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn test_exclusive_create_fails_when_present() {
        let (dir, fs) = gateway();
        std::fs::write(dir.path().join("taken"), b"x").unwrap();
        assert!(matches!(
            fs.open_file("/taken", create_new()).await,
            Err(StorageError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_open_missing_is_not_found() {
        let (_dir, fs) = gateway();
        assert!(matches!(
            fs.open("/missing").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ghost_close_deletes_partial_file() {
        let (dir, fs) = gateway();
        let mut handle = fs.open_file("/partial.bin", create_new()).await.unwrap();
        handle.file().write_all(b"half of it").await.unwrap();
        assert!(!handle.is_ghost());
        handle.mark_ghost();
        assert!(handle.is_ghost());
        handle.close().await.unwrap();
        assert!(!dir.path().join("partial.bin").exists());
    }

    #[tokio::test]
    async fn test_ghost_rollback_failure_is_surfaced() {
        let (dir, fs) = gateway();
        let mut handle = fs.open_file("/gone.bin", create_new()).await.unwrap();
        handle.mark_ghost();
        std::fs::remove_file(dir.path().join("gone.bin")).unwrap();
        assert!(matches!(
            handle.close().await,
            Err(StorageError::RollbackFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_namespace_operations() {
        let (dir, fs) = gateway();
        fs.mkdir_all("/a/b/c", 0o755).await.unwrap();
        assert!(dir.path().join("a/b/c").is_dir());
        assert!(fs.stat("/a/b").await.unwrap().is_dir);

        fs.mkdir("/a/d", 0o755).await.unwrap();
        assert!(matches!(
            fs.mkdir("/a/d", 0o755).await,
            Err(StorageError::AlreadyExists(_))
        ));

        fs.rename("/a/d", "/a/e").await.unwrap();
        assert!(dir.path().join("a/e").is_dir());

        fs.remove("/a/e").await.unwrap();
        assert!(!dir.path().join("a/e").exists());

        fs.remove_all("/a").await.unwrap();
        assert!(!dir.path().join("a").exists());
        fs.remove_all("/a").await.unwrap();
    }

    #[tokio::test]
    async fn test_paths_outside_jail_rejected() {
        let (_dir, fs) = gateway();
        assert!(matches!(
            fs.rename("/ok", "/../escape").await,
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            fs.stat("/").await,
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            fs.open("/../../etc/passwd").await,
            Err(StorageError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_directory_listing_in_batches() {
        let (dir, fs) = gateway();
        for name in ["one", "two", "three"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let mut listing = fs.open_dir("/").await.unwrap();
        let mut names = listing.read_names(2).await.unwrap();
        assert_eq!(names.len(), 2);
        names.extend(listing.read_names(2).await.unwrap());
        assert_eq!(names.len(), 3);
        assert!(listing.read_names(2).await.unwrap().is_empty());

        names.sort();
        assert_eq!(names, vec!["one", "three", "two"]);
    }

    #[tokio::test]
    async fn test_handle_lock_released_on_close() {
        let (_dir, fs) = gateway();
        let mut handle = fs.open_file("/locked", create_new()).await.unwrap();
        assert!(!handle.has_lock());
        let guard = fs.lock("/locked").await.unwrap();
        handle.hold_lock(guard);
        assert!(handle.has_lock());
        assert_eq!(fs.locks().len(), 1);
        handle.close().await.unwrap();
        assert!(fs.locks().is_empty());
    }

    #[tokio::test]
    async fn test_read_only_create_makes_file_but_denies_writes() {
        let (dir, fs) = gateway();
        let flags = OpenFlags::RDONLY | OpenFlags::CREATE | OpenFlags::EXCL;
        let mut handle = fs.open_file("/ro.bin", flags).await.unwrap();
        assert!(handle.created());
        assert!(dir.path().join("ro.bin").exists());

        let written = async {
            handle.file().write_all(b"nope").await?;
            handle.file().flush().await
        };
        assert!(written.await.is_err());

        assert!(matches!(
            fs.open_file("/ro.bin", flags).await,
            Err(StorageError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_read_only_truncate_is_rejected() {
        let (dir, fs) = gateway();
        std::fs::write(dir.path().join("keep"), b"contents").unwrap();
        assert!(matches!(
            fs.open_file("/keep", OpenFlags::RDONLY | OpenFlags::TRUNC).await,
            Err(StorageError::InvalidFlags { .. })
        ));
        assert_eq!(std::fs::read(dir.path().join("keep")).unwrap(), b"contents");
    }
}
