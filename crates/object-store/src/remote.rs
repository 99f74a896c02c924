//! [`RemoteStore`] over a flat object namespace
//!
//! Object stores have no folders. A folder exists when an object lives under
//! its prefix; empty folders are kept alive by a zero-byte marker object.
//! Upload sessions are multipart uploads staged under a hidden prefix and
//! renamed into place on commit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::{GetOptions, GetRange, ObjectMeta, ObjectStore, PutPayload, WriteMultipart};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use common::fs::format_timestamp;
use common::path;
use common::remote::{
    ByteStream, FolderChange, FolderListing, Metadata, RemoteError, RemoteStore, SessionId,
    SpaceUsage,
};

use crate::config::{BuildError, ObjectStoreConfig};

/// Marker object that keeps an otherwise empty folder visible
pub const FOLDER_MARKER: &str = ".remotefs-folder";
/// Prefix holding in-flight upload sessions
pub const STAGING_PREFIX: &str = ".remotefs-uploads";

/// Parts uploaded concurrently per session
const MAX_CONCURRENT_PARTS: usize = 8;

struct StagedUpload {
    writer: Option<WriteMultipart>,
    location: Path,
    size: u64,
}

/// Remote store backed by any `object_store` implementation
pub struct ObjectRemote {
    store: Arc<dyn ObjectStore>,
    sessions: Mutex<HashMap<String, Arc<AsyncMutex<StagedUpload>>>>,
    quota: u64,
}

impl ObjectRemote {
    pub fn new(store: Arc<dyn ObjectStore>, quota: u64) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
            quota,
        }
    }

    pub fn from_config(config: &ObjectStoreConfig, quota: u64) -> Result<Self, BuildError> {
        Ok(Self::new(config.build()?, quota))
    }

    /// Underlying store, for inspection
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>, RemoteError> {
        if path == path::ROOT {
            return Ok(None);
        }
        match self.store.head(&location(path)).await {
            Ok(meta) => Ok(Some(meta)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(transport(e)),
        }
    }

    /// Immediate children: (sub folders, files)
    async fn children(&self, path: &str) -> Result<(Vec<String>, Vec<ObjectMeta>), RemoteError> {
        let prefix = location(path);
        let prefix = (path != path::ROOT).then_some(&prefix);
        let listing = self
            .store
            .list_with_delimiter(prefix)
            .await
            .map_err(transport)?;

        let folders = listing
            .common_prefixes
            .iter()
            .map(remote_path)
            .filter(|folder| !is_hidden(folder))
            .collect();
        Ok((folders, listing.objects))
    }

    /// Every object at or below `path`
    async fn subtree(&self, path: &str) -> Result<Vec<ObjectMeta>, RemoteError> {
        let prefix = location(path);
        self.store
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(transport)
    }

    async fn is_folder(&self, path: &str) -> Result<bool, RemoteError> {
        if path == path::ROOT {
            return Ok(true);
        }
        let (folders, objects) = self.children(path).await?;
        Ok(!folders.is_empty() || !objects.is_empty())
    }

    /// Forget a session after a transport failure and release what it staged
    async fn discard(&self, session: &SessionId, staged: &mut StagedUpload) {
        self.sessions.lock().remove(session.as_str());
        if let Some(writer) = staged.writer.take() {
            if let Err(e) = writer.abort().await {
                warn!(session = %session, error = %e, "failed to abort upload");
            }
        }
        debug!(session = %session, "discarded upload session");
    }

    fn session(&self, session: &SessionId) -> Result<Arc<AsyncMutex<StagedUpload>>, RemoteError> {
        self.sessions
            .lock()
            .get(session.as_str())
            .cloned()
            .ok_or_else(|| RemoteError::UnknownSession(session.to_string()))
    }
}

impl std::fmt::Debug for ObjectRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRemote")
            .field("store", &self.store.to_string())
            .field("sessions", &self.sessions.lock().len())
            .field("quota", &self.quota)
            .finish()
    }
}

fn location(path: &str) -> Path {
    Path::from(path::normalize(path).trim_start_matches('/'))
}

fn remote_path(location: &Path) -> String {
    path::normalize(&format!("/{}", location))
}

fn is_hidden(path: &str) -> bool {
    let name = path::file_name(path);
    name == FOLDER_MARKER || path == format!("/{}", STAGING_PREFIX)
}

fn transport(e: object_store::Error) -> RemoteError {
    RemoteError::Transport(e.to_string())
}

fn not_found_or(path: &str) -> impl Fn(object_store::Error) -> RemoteError + '_ {
    move |e| match e {
        object_store::Error::NotFound { .. } => RemoteError::NotFound(path.to_string()),
        e => transport(e),
    }
}

fn file_metadata(meta: &ObjectMeta) -> Metadata {
    let revision = meta
        .e_tag
        .clone()
        .or_else(|| meta.version.clone())
        .unwrap_or_else(|| meta.last_modified.timestamp_nanos_opt().unwrap_or_default().to_string());
    Metadata::file(remote_path(&meta.location), meta.size as u64)
        .with_modified(format_timestamp(meta.last_modified))
        .with_revision(revision)
}

/// Digest over everything a listing reports
fn listing_revision(entries: &[Metadata]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.path.as_bytes());
        hasher.update([0]);
        hasher.update(entry.size.to_le_bytes());
        hasher.update(entry.revision.as_deref().unwrap_or_default().as_bytes());
        hasher.update([b'\n']);
    }
    hex::encode(hasher.finalize())
}

#[async_trait]
impl RemoteStore for ObjectRemote {
    async fn list_folder(
        &self,
        path: &str,
        since: Option<&str>,
    ) -> Result<FolderChange, RemoteError> {
        let path = path::normalize(path);
        let (folders, objects) = self.children(&path).await?;

        if path != path::ROOT && folders.is_empty() && objects.is_empty() {
            return match self.head(&path).await? {
                Some(_) => Err(RemoteError::NotFolder(path)),
                None => Err(RemoteError::NotFound(path)),
            };
        }

        let mut entries: Vec<Metadata> = folders.into_iter().map(Metadata::folder).collect();
        entries.extend(
            objects
                .iter()
                .map(file_metadata)
                .filter(|entry| !is_hidden(&entry.path)),
        );
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let revision = listing_revision(&entries);
        if since == Some(revision.as_str()) {
            debug!(path = %path, "listing unchanged");
            return Ok(FolderChange::Unchanged);
        }

        Ok(FolderChange::Changed(FolderListing {
            folder: Metadata::folder(path),
            entries,
            revision,
        }))
    }

    async fn get_metadata(&self, path: &str) -> Result<Metadata, RemoteError> {
        let path = path::normalize(path);
        if let Some(meta) = self.head(&path).await? {
            return Ok(file_metadata(&meta));
        }
        if self.is_folder(&path).await? {
            return Ok(Metadata::folder(path));
        }
        Err(RemoteError::NotFound(path))
    }

    async fn create_folder(&self, path: &str) -> Result<(), RemoteError> {
        let path = path::normalize(path);
        if self.head(&path).await?.is_some() || self.is_folder(&path).await? {
            return Err(RemoteError::Transport(format!("path conflict: {}", path)));
        }

        let marker = location(&path::join(&path, FOLDER_MARKER));
        self.store
            .put(&marker, PutPayload::new())
            .await
            .map_err(transport)?;
        debug!(path = %path, "created folder marker");
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        let path = path::normalize(path);
        if self.head(&path).await?.is_some() {
            return self
                .store
                .delete(&location(&path))
                .await
                .map_err(not_found_or(&path));
        }

        let objects = self.subtree(&path).await?;
        if objects.is_empty() {
            return Err(RemoteError::NotFound(path));
        }
        for object in &objects {
            self.store
                .delete(&object.location)
                .await
                .map_err(transport)?;
        }
        debug!(path = %path, objects = objects.len(), "deleted folder");
        Ok(())
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        let from = path::normalize(from);
        let to = path::normalize(to);
        if self.head(&from).await?.is_some() {
            return self
                .store
                .rename(&location(&from), &location(&to))
                .await
                .map_err(not_found_or(&from));
        }

        let objects = self.subtree(&from).await?;
        if objects.is_empty() {
            return Err(RemoteError::NotFound(from));
        }
        for object in &objects {
            let old = remote_path(&object.location);
            let new = format!("{}{}", to, &old[from.len()..]);
            self.store
                .rename(&object.location, &location(&new))
                .await
                .map_err(transport)?;
        }
        debug!(from = %from, to = %to, objects = objects.len(), "moved folder");
        Ok(())
    }

    async fn download(&self, path: &str, offset: u64) -> Result<ByteStream, RemoteError> {
        let path = path::normalize(path);
        let meta = self
            .head(&path)
            .await?
            .ok_or_else(|| RemoteError::NotFound(path.clone()))?;

        if offset >= meta.size as u64 {
            return Ok(futures::stream::empty().boxed());
        }
        let options = GetOptions {
            range: Some(GetRange::Offset(offset as usize)),
            ..GetOptions::default()
        };
        let result = self
            .store
            .get_opts(&meta.location, options)
            .await
            .map_err(not_found_or(&path))?;
        Ok(result.into_stream().map_err(transport).boxed())
    }

    async fn start_upload_session(&self, data: Bytes) -> Result<SessionId, RemoteError> {
        let id = uuid::Uuid::new_v4().to_string();
        let staging = Path::from(STAGING_PREFIX).child(id.as_str());
        let upload = self
            .store
            .put_multipart(&staging)
            .await
            .map_err(transport)?;

        let mut writer = WriteMultipart::new(upload);
        writer.write(&data);
        let staged = StagedUpload {
            writer: Some(writer),
            location: staging,
            size: data.len() as u64,
        };
        self.sessions
            .lock()
            .insert(id.clone(), Arc::new(AsyncMutex::new(staged)));

        debug!(session = %id, len = data.len(), "started upload session");
        Ok(SessionId::new(id))
    }

    async fn append_upload_session(
        &self,
        session: &SessionId,
        offset: u64,
        data: Bytes,
    ) -> Result<(), RemoteError> {
        let staged = self.session(session)?;
        let mut staged = staged.lock().await;
        if staged.size != offset {
            return Err(RemoteError::InvalidCursor {
                expected: staged.size,
                actual: offset,
            });
        }

        let writer = staged
            .writer
            .as_mut()
            .ok_or_else(|| RemoteError::UnknownSession(session.to_string()))?;
        if let Err(e) = writer.wait_for_capacity(MAX_CONCURRENT_PARTS).await {
            // A failed part poisons the multipart upload
            self.discard(session, &mut staged).await;
            return Err(transport(e));
        }
        let Some(writer) = staged.writer.as_mut() else {
            return Err(RemoteError::UnknownSession(session.to_string()));
        };
        writer.write(&data);
        staged.size += data.len() as u64;
        Ok(())
    }

    async fn commit_upload_session(
        &self,
        path: &str,
        session: &SessionId,
        offset: u64,
    ) -> Result<Metadata, RemoteError> {
        let path = path::normalize(path);
        let staged = self.session(session)?;
        let mut staged = staged.lock().await;
        if staged.size != offset {
            return Err(RemoteError::InvalidCursor {
                expected: staged.size,
                actual: offset,
            });
        }
        let mut writer = staged
            .writer
            .take()
            .ok_or_else(|| RemoteError::UnknownSession(session.to_string()))?;
        self.sessions.lock().remove(session.as_str());

        let target = location(&path);
        if staged.size == 0 {
            // Multipart uploads need at least one part
            if let Err(e) = writer.abort().await {
                warn!(session = %session, error = %e, "failed to abort empty upload");
            }
            self.store
                .put(&target, PutPayload::new())
                .await
                .map_err(transport)?;
        } else {
            // Surface failed parts while the upload can still be aborted
            if let Err(e) = writer.wait_for_capacity(0).await {
                if let Err(abort) = writer.abort().await {
                    warn!(session = %session, error = %abort, "failed to abort upload");
                }
                return Err(transport(e));
            }
            if let Err(e) = writer.finish().await {
                warn!(session = %session, error = %e, "could not complete staged upload");
                return Err(transport(e));
            }
            if let Err(e) = self.store.rename(&staged.location, &target).await {
                if let Err(cleanup) = self.store.delete(&staged.location).await {
                    warn!(session = %session, error = %cleanup, "failed to remove staged upload");
                }
                return Err(transport(e));
            }
        }

        let meta = self.store.head(&target).await.map_err(not_found_or(&path))?;
        info!(path = %path, size = staged.size, "committed upload session");
        Ok(file_metadata(&meta))
    }

    async fn space_usage(&self) -> Result<SpaceUsage, RemoteError> {
        let used = self
            .store
            .list(None)
            .try_fold(0u64, |used, meta| async move { Ok(used + meta.size as u64) })
            .await
            .map_err(transport)?;
        Ok(SpaceUsage {
            used,
            allocated: self.quota,
        })
    }
}
