//! Filesystem operation layer
//!
//! [`RemoteFs`] is what a kernel-facing dispatcher calls into. Every operation
//! is path- or handle-addressed and composes the metadata cache, the handle
//! table and the upload engine. It owns all three; nothing else mutates them.
//!
//! Callers may invoke any operation concurrently. Remote calls are never made
//! while holding a lock that covers other paths or other handles.

mod attributes;

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info};

use crate::cache::{CacheEntry, MetadataCache};
use crate::config::{ConfigError, FsConfig};
use crate::error::{FsError, Result};
use crate::handle::{HandleMode, HandleTable, ReadStream, TransferState};
use crate::path;
use crate::remote::{Metadata, RemoteError, RemoteStore};
use crate::transfer::UploadSession;

pub use attributes::{format_timestamp, parse_timestamp, FileAttributes};

/// Block size reported by [`RemoteFs::statfs`]
pub const BLOCK_SIZE: u64 = 1024;
/// Longest file name the remote accepts
pub const NAME_MAX: u32 = 255;

/// Filesystem statistics in block units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub block_size: u64,
    pub fragment_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub name_max: u32,
}

/// POSIX-style operations over a remote store
#[derive(Debug)]
pub struct RemoteFs {
    remote: Arc<dyn RemoteStore>,
    cache: MetadataCache,
    handles: HandleTable,
    config: FsConfig,
}

impl RemoteFs {
    pub fn new(remote: Arc<dyn RemoteStore>, config: FsConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        info!(
            cache_ttl_secs = config.cache_ttl_secs,
            write_cache_bytes = config.write_cache_bytes,
            max_handles = config.max_handles,
            "initializing remote filesystem"
        );
        Ok(Self {
            cache: MetadataCache::new(&config),
            handles: HandleTable::new(config.max_handles),
            remote,
            config,
        })
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    async fn entry(&self, path: &str) -> Result<CacheEntry> {
        self.cache
            .lookup(self.remote.as_ref(), path)
            .await?
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    /// Attributes of `path`, refreshing stale metadata first
    pub async fn attributes(&self, path: &str) -> Result<FileAttributes> {
        let path = path::normalize(path);
        debug!(path = %path, "attributes");
        let entry = self.entry(&path).await?;
        Ok(FileAttributes::from_metadata(&entry.metadata))
    }

    /// Names in a folder: `.` and `..` first, then children in remote order
    pub async fn list(&self, path: &str) -> Result<Vec<String>> {
        let path = path::normalize(path);
        debug!(path = %path, "list");
        let entry = self
            .cache
            .lookup_deep(self.remote.as_ref(), &path)
            .await?
            .ok_or_else(|| FsError::NotFound(path.clone()))?;

        if !entry.metadata.is_folder() {
            return Err(FsError::NotADirectory(path));
        }
        // A stale shallow entry was served because the remote is unreachable
        let Some(children) = entry.children else {
            return Err(FsError::Remote {
                op: "list_folder",
                source: RemoteError::Transport(format!("listing of {} unavailable", path)),
            });
        };

        let mut names = Vec::with_capacity(children.len() + 2);
        names.push(".".to_string());
        names.push("..".to_string());
        names.extend(children.iter().map(|child| path::file_name(child).to_string()));
        Ok(names)
    }

    pub async fn create_folder(&self, path: &str) -> Result<()> {
        let path = path::normalize(path);
        debug!(path = %path, "create folder");
        self.remote
            .create_folder(&path)
            .await
            .map_err(|e| self.fatal("create_folder", &path, e))?;

        self.cache.invalidate(&path);
        self.cache.unlist(&path::parent(&path));
        Ok(())
    }

    pub async fn delete_folder(&self, path: &str) -> Result<()> {
        self.delete(path, "delete folder").await
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        self.delete(path, "delete file").await
    }

    async fn delete(&self, path: &str, what: &'static str) -> Result<()> {
        let path = path::normalize(path);
        debug!(path = %path, "{}", what);
        self.remote
            .delete(&path)
            .await
            .map_err(|e| self.fatal("delete", &path, e))?;

        self.cache.invalidate(&path);
        self.cache.unlist(&path::parent(&path));
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = path::normalize(from);
        let to = path::normalize(to);
        debug!(from = %from, to = %to, "rename");
        self.remote
            .move_path(&from, &to)
            .await
            .map_err(|e| self.fatal("move", &from, e))?;

        for stale in [&from, &to] {
            self.cache.invalidate(stale);
            self.cache.unlist(&path::parent(stale));
        }
        Ok(())
    }

    /// Open an existing file. Append mode is rejected; any write access gives
    /// a write-only handle.
    pub async fn open(&self, path: &str, flags: i32) -> Result<u64> {
        let path = path::normalize(path);
        debug!(path = %path, flags, "open");
        if flags & libc::O_APPEND != 0 {
            return Err(FsError::Unsupported("append mode"));
        }

        let entry = self.entry(&path).await?;
        if entry.metadata.is_folder() {
            return Err(FsError::IsADirectory(path));
        }

        let state = match access_mode(flags) {
            HandleMode::ReadOnly => TransferState::Read(ReadStream::new()),
            HandleMode::WriteOnly => {
                TransferState::Write(UploadSession::new(self.config.write_cache_bytes, false))
            }
        };
        self.handles.allocate(path, state)
    }

    /// Create a file for writing; it is visible as an empty file right away
    pub async fn create(&self, path: &str) -> Result<u64> {
        let path = path::normalize(path);
        debug!(path = %path, "create");
        let upload = UploadSession::new(self.config.write_cache_bytes, true);
        let id = self
            .handles
            .allocate(path.clone(), TransferState::Write(upload))?;

        // Held until release so expiry or a relisting cannot hide it
        self.cache.pin(Metadata::file(path, 0));
        Ok(id)
    }

    pub async fn read(&self, fh: u64, length: usize, offset: u64) -> Result<Bytes> {
        let handle = self.handles.get(fh)?;
        let mut handle = handle.lock().await;
        if handle.closed {
            return Err(FsError::BadHandle(fh));
        }

        let handle = &mut *handle;
        match &mut handle.state {
            TransferState::Read(stream) => {
                stream
                    .read(self.remote.as_ref(), &handle.path, length, offset)
                    .await
            }
            TransferState::Write(_) => Err(FsError::Unsupported("read on write-only handle")),
        }
    }

    /// Accept bytes at `offset`; returns how many were taken
    pub async fn write(&self, fh: u64, data: &[u8], offset: u64) -> Result<usize> {
        let handle = self.handles.get(fh)?;
        let mut handle = handle.lock().await;
        if handle.closed {
            return Err(FsError::BadHandle(fh));
        }

        match &mut handle.state {
            TransferState::Write(upload) => {
                upload.write(self.remote.as_ref(), data, offset).await?;
                Ok(data.len())
            }
            TransferState::Read(_) => Err(FsError::Unsupported("write on read-only handle")),
        }
    }

    /// Close a handle, committing any upload. The id is freed last, even when
    /// the commit fails.
    pub async fn release(&self, fh: u64) -> Result<()> {
        let handle = self.handles.get(fh)?;
        let mut guard = handle.lock().await;
        if guard.closed {
            return Err(FsError::BadHandle(fh));
        }
        guard.closed = true;

        let path = guard.path.clone();
        let result = match &mut guard.state {
            TransferState::Write(upload) => {
                let committed = upload.finalize(self.remote.as_ref(), &path).await;
                if upload.is_created() {
                    self.cache.unpin(&path);
                }
                // Drop the placeholder so the committed size is fetched
                self.cache.invalidate(&path);
                self.cache.unlist(&path::parent(&path));
                committed.map(|_| ())
            }
            TransferState::Read(_) => Ok(()),
        };
        drop(guard);

        self.handles.release(fh)?;
        debug!(fh, path = %path, ok = result.is_ok(), "released");
        result
    }

    /// Accepted for existing paths; the remote replaces files wholesale
    pub async fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let path = path::normalize(path);
        debug!(path = %path, size, "truncate ignored");
        self.entry(&path).await.map(|_| ())
    }

    pub async fn flush(&self, fh: u64) -> Result<()> {
        self.handles.get(fh).map(|_| ())
    }

    pub async fn fsync(&self, fh: u64) -> Result<()> {
        self.handles.get(fh).map(|_| ())
    }

    /// Permission bits are fixed; only existence is checked
    pub async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let path = path::normalize(path);
        debug!(path = %path, mode, "chmod ignored");
        self.entry(&path).await.map(|_| ())
    }

    /// Ownership is fixed; only existence is checked
    pub async fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let path = path::normalize(path);
        debug!(path = %path, ?uid, ?gid, "chown ignored");
        self.entry(&path).await.map(|_| ())
    }

    pub async fn statfs(&self) -> Result<FsStats> {
        let usage = self
            .remote
            .space_usage()
            .await
            .map_err(|e| self.fatal("space_usage", path::ROOT, e))?;

        let free = usage.allocated.saturating_sub(usage.used) / BLOCK_SIZE;
        Ok(FsStats {
            block_size: BLOCK_SIZE,
            fragment_size: BLOCK_SIZE,
            blocks: usage.allocated / BLOCK_SIZE,
            blocks_free: free,
            blocks_available: free,
            files: 0,
            name_max: NAME_MAX,
        })
    }

    fn fatal(&self, op: &'static str, path: &str, e: RemoteError) -> FsError {
        error!(op, path = %path, error = %e, "remote operation failed");
        FsError::remote(op)(e)
    }
}

fn access_mode(flags: i32) -> HandleMode {
    match flags & libc::O_ACCMODE {
        libc::O_RDONLY => HandleMode::ReadOnly,
        _ => HandleMode::WriteOnly,
    }
}
