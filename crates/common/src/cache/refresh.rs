//! Remote-backed lookups: miss handling and revalidation of stale entries

use tracing::{debug, error, warn};

use super::{CacheEntry, Lookup, MetadataCache};
use crate::error::{FsError, Result};
use crate::path;
use crate::remote::{FolderChange, Metadata, RemoteError, RemoteStore};

/// Outcome of asking the remote about a path we already know
enum Revalidation {
    Unchanged,
    Listing(crate::remote::FolderListing),
    Metadata(Metadata),
}

impl MetadataCache {
    /// Resolve a path, contacting the remote on a miss or a stale entry.
    ///
    /// Returns `Ok(None)` when the path does not exist.
    pub async fn lookup(&self, remote: &dyn RemoteStore, path: &str) -> Result<Option<CacheEntry>> {
        self.resolve(remote, path, false).await
    }

    /// Like [`lookup`](Self::lookup) but folders come back with their children
    pub async fn lookup_deep(
        &self,
        remote: &dyn RemoteStore,
        path: &str,
    ) -> Result<Option<CacheEntry>> {
        self.resolve(remote, path, true).await
    }

    async fn resolve(
        &self,
        remote: &dyn RemoteStore,
        path: &str,
        deep: bool,
    ) -> Result<Option<CacheEntry>> {
        let path = path::normalize(path);
        if let Some(entry) = self.pinned_entry(&path) {
            return Ok(Some(entry));
        }

        if let Lookup::Fresh(entry) = self.get(&path) {
            if satisfies(&entry, deep) {
                debug!(path = %path, "metadata cache hit");
                return Ok(Some(entry));
            }
        }

        // Another task may have refreshed while we waited for the lock
        let _guard = self.lock_path(&path).await;
        match self.get(&path) {
            Lookup::Fresh(entry) if satisfies(&entry, deep) => Ok(Some(entry)),
            Lookup::Fresh(entry) | Lookup::Stale(entry) => {
                debug!(path = %path, deep, "revalidating cached metadata");
                self.refresh(remote, &path, &entry, deep).await
            }
            Lookup::Miss => {
                debug!(path = %path, "metadata cache miss");
                self.fetch(remote, &path).await
            }
        }
    }

    /// Revalidate a known entry against the remote using its revision tag.
    ///
    /// Transient failures serve the known entry unchanged.
    pub async fn refresh(
        &self,
        remote: &dyn RemoteStore,
        path: &str,
        known: &CacheEntry,
        deep: bool,
    ) -> Result<Option<CacheEntry>> {
        // Open local creations are not on the remote yet
        if let Some(entry) = self.pinned_entry(path) {
            return Ok(Some(entry));
        }

        let outcome = if known.metadata.is_folder() {
            // A revision only describes a listing we actually hold
            let since = known.children.as_ref().and(known.revision.as_deref());
            remote
                .list_folder(path, since)
                .await
                .map(|change| match change {
                    FolderChange::Unchanged => Revalidation::Unchanged,
                    FolderChange::Changed(listing) => Revalidation::Listing(listing),
                })
        } else {
            remote.get_metadata(path).await.map(|metadata| {
                let same = metadata.kind == known.metadata.kind
                    && metadata.revision.is_some()
                    && metadata.revision == known.metadata.revision;
                if same {
                    Revalidation::Unchanged
                } else {
                    Revalidation::Metadata(metadata)
                }
            })
        };

        match outcome {
            Ok(Revalidation::Unchanged) => {
                debug!(path = %path, "no remote changes");
                Ok(self.renew(path).or_else(|| Some(known.clone())))
            }
            Ok(Revalidation::Listing(listing)) => {
                debug!(path = %path, "remote listing changed");
                Ok(Some(self.insert_listing(listing)))
            }
            Ok(Revalidation::Metadata(metadata)) if metadata.is_folder() && deep => {
                self.invalidate(path);
                self.fetch(remote, path).await
            }
            Ok(Revalidation::Metadata(metadata)) => {
                debug!(path = %path, "remote metadata changed");
                Ok(Some(self.insert(metadata)))
            }
            Err(RemoteError::NotFound(_)) => {
                debug!(path = %path, "path vanished remotely");
                self.invalidate(path);
                self.mark_missing(path);
                Ok(None)
            }
            Err(RemoteError::NotFolder(_)) => {
                // Folder was replaced by a file
                self.invalidate(path);
                self.fetch(remote, path).await
            }
            Err(e) => {
                warn!(path = %path, error = %e, "refresh failed, serving stale metadata");
                Ok(Some(known.clone()))
            }
        }
    }

    /// Fetch an uncached path: list it as a folder, fall back to plain metadata
    async fn fetch(&self, remote: &dyn RemoteStore, path: &str) -> Result<Option<CacheEntry>> {
        if self.is_negative(path) {
            debug!(path = %path, "negative cache hit");
            return Ok(None);
        }
        if self.known_absent(path) {
            debug!(path = %path, "absent from cached parent listing");
            return Ok(None);
        }

        match remote.list_folder(path, None).await {
            Ok(FolderChange::Changed(listing)) => Ok(Some(self.insert_listing(listing))),
            Ok(FolderChange::Unchanged) | Err(RemoteError::NotFolder(_)) => {
                self.fetch_metadata(remote, path).await
            }
            Err(RemoteError::NotFound(_)) => {
                self.mark_missing(path);
                Ok(None)
            }
            Err(e) => {
                error!(path = %path, error = %e, "could not fetch metadata");
                Err(FsError::remote("list_folder")(e))
            }
        }
    }

    async fn fetch_metadata(
        &self,
        remote: &dyn RemoteStore,
        path: &str,
    ) -> Result<Option<CacheEntry>> {
        match remote.get_metadata(path).await {
            Ok(metadata) => Ok(Some(self.insert(metadata))),
            Err(RemoteError::NotFound(_)) => {
                self.mark_missing(path);
                Ok(None)
            }
            Err(e) => {
                error!(path = %path, error = %e, "could not fetch metadata");
                Err(FsError::remote("get_metadata")(e))
            }
        }
    }
}

fn satisfies(entry: &CacheEntry, deep: bool) -> bool {
    !deep || !entry.metadata.is_folder() || entry.is_listed()
}
