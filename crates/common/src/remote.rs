//! Remote store client interface
//!
//! The filesystem core never talks to a network client directly. Everything it
//! needs from the remote side goes through [`RemoteStore`], which returns typed
//! metadata records and tagged errors so callers can tell "not found" apart from
//! a transport failure without inspecting messages.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Stream of file contents returned by [`RemoteStore::download`]
pub type ByteStream = BoxStream<'static, Result<Bytes, RemoteError>>;

/// Kind of a remote entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

/// Metadata record for one remote path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub kind: EntryKind,
    /// Canonical absolute path
    pub path: String,
    /// Size in bytes, always 0 for folders
    pub size: u64,
    /// Modification timestamp in one of the two remote textual formats
    pub modified: Option<String>,
    /// Opaque change token (content hash, version id)
    pub revision: Option<String>,
}

impl Metadata {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            kind: EntryKind::File,
            path: path.into(),
            size,
            modified: None,
            revision: None,
        }
    }

    pub fn folder(path: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Folder,
            path: path.into(),
            size: 0,
            modified: None,
            revision: None,
        }
    }

    pub fn with_modified(mut self, modified: impl Into<String>) -> Self {
        self.modified = Some(modified.into());
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }
}

/// A complete listing of one folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderListing {
    pub folder: Metadata,
    /// Children in the order the remote returned them
    pub entries: Vec<Metadata>,
    /// Change token for the listing as a whole
    pub revision: String,
}

/// Result of asking the remote whether a folder changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderChange {
    /// The revision passed in is still current
    Unchanged,
    Changed(FolderListing),
}

/// Account space usage in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpaceUsage {
    pub used: u64,
    pub allocated: u64,
}

/// Identifier of an open chunked upload session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("Path not found: {0}")]
    NotFound(String),
    #[error("Not a folder: {0}")]
    NotFolder(String),
    #[error("Upload cursor mismatch: expected offset {expected}, got {actual}")]
    InvalidCursor { expected: u64, actual: u64 },
    #[error("Unknown upload session: {0}")]
    UnknownSession(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

/// Capability set the filesystem core requires from a remote object store.
///
/// All paths are canonical (see [`crate::path::normalize`]). Implementations
/// enforce their own timeouts; the core never cancels a call.
#[async_trait]
pub trait RemoteStore: fmt::Debug + Send + Sync {
    /// List a folder. When `since` matches the current listing revision the
    /// implementation may answer [`FolderChange::Unchanged`].
    async fn list_folder(&self, path: &str, since: Option<&str>)
        -> Result<FolderChange, RemoteError>;

    async fn get_metadata(&self, path: &str) -> Result<Metadata, RemoteError>;

    async fn create_folder(&self, path: &str) -> Result<(), RemoteError>;

    async fn delete(&self, path: &str) -> Result<(), RemoteError>;

    async fn move_path(&self, from: &str, to: &str) -> Result<(), RemoteError>;

    /// Open a byte stream over a whole object, positioned at `offset`
    async fn download(&self, path: &str, offset: u64) -> Result<ByteStream, RemoteError>;

    async fn start_upload_session(&self, data: Bytes) -> Result<SessionId, RemoteError>;

    /// Append `data` to a session. `offset` is the number of bytes the session
    /// already holds.
    async fn append_upload_session(
        &self,
        session: &SessionId,
        offset: u64,
        data: Bytes,
    ) -> Result<(), RemoteError>;

    /// Finish a session, materializing its bytes at `path`
    async fn commit_upload_session(
        &self,
        path: &str,
        session: &SessionId,
        offset: u64,
    ) -> Result<Metadata, RemoteError>;

    async fn space_usage(&self) -> Result<SpaceUsage, RemoteError>;
}
