//! Metadata cache with TTL expiry and mutation-triggered invalidation
//!
//! Stands in for a directory/inode table: maps canonical paths to the last
//! known remote metadata. Entries go stale after the configured TTL; stale
//! entries are revalidated against the remote with their revision tag (see
//! [`refresh`]) and served as-is when that revalidation fails transiently.
//!
//! Folder entries optionally carry their children. A listing and every child
//! it produced share a single expiry stamp.

mod refresh;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::FsConfig;
use crate::path;
use crate::remote::{FolderListing, Metadata};

/// Cached knowledge of one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub metadata: Metadata,
    /// Child paths, present only once the folder has been listed
    pub children: Option<Vec<String>>,
    /// Listing revision for listed folders, object revision otherwise
    pub revision: Option<String>,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn path(&self) -> &str {
        &self.metadata.path
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    /// True when a folder's children are known
    pub fn is_listed(&self) -> bool {
        self.children.is_some()
    }
}

/// Local-only lookup result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Fresh(CacheEntry),
    Stale(CacheEntry),
    Miss,
}

/// Process-wide metadata cache
pub struct MetadataCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    /// Paths confirmed not to exist
    negative: Option<Cache<String, ()>>,
    /// Serializes remote refreshes of the same path
    path_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// Files created locally and still open; the remote does not know them yet
    pinned: Mutex<HashMap<String, Pin>>,
    ttl: Duration,
}

#[derive(Debug)]
struct Pin {
    metadata: Metadata,
    holders: usize,
}

impl MetadataCache {
    pub fn new(config: &FsConfig) -> Self {
        let negative_ttl = config.negative_ttl();
        let negative = (!negative_ttl.is_zero()).then(|| {
            Cache::builder()
                .time_to_live(negative_ttl)
                .max_capacity(10_000)
                .support_invalidation_closures()
                .build()
        });

        Self {
            entries: Mutex::new(HashMap::new()),
            negative,
            path_locks: Mutex::new(HashMap::new()),
            pinned: Mutex::new(HashMap::new()),
            ttl: config.cache_ttl(),
        }
    }

    /// Look a path up locally, without contacting the remote
    pub fn get(&self, path: &str) -> Lookup {
        let path = path::normalize(path);
        match self.entries.lock().get(&path) {
            Some(entry) if entry.is_stale(Instant::now()) => Lookup::Stale(entry.clone()),
            Some(entry) => Lookup::Fresh(entry.clone()),
            None => Lookup::Miss,
        }
    }

    /// Insert or overwrite a single entry.
    ///
    /// A cached listing of the parent learns about the new child so it shows
    /// up in directory listings before the remote knows about it.
    pub fn insert(&self, metadata: Metadata) -> CacheEntry {
        let mut metadata = metadata;
        metadata.path = path::normalize(&metadata.path);
        let path = metadata.path.clone();
        self.clear_negative(&path);

        let entry = CacheEntry {
            revision: metadata.revision.clone(),
            metadata,
            children: None,
            expires_at: Instant::now() + self.ttl,
        };

        let mut entries = self.entries.lock();
        if path != path::ROOT {
            if let Some(parent) = entries.get_mut(&path::parent(&path)) {
                if let Some(children) = parent.children.as_mut() {
                    if !children.contains(&path) {
                        children.push(path.clone());
                    }
                }
            }
        }
        entries.insert(path, entry.clone());
        entry
    }

    /// Replace a folder and all of its children with a fresh listing
    pub fn insert_listing(&self, listing: FolderListing) -> CacheEntry {
        let FolderListing {
            mut folder,
            entries: children,
            revision,
        } = listing;
        folder.path = path::normalize(&folder.path);
        let expires_at = Instant::now() + self.ttl;

        let mut children = children;
        for pinned in self.pinned_children(&folder.path) {
            if !children.iter().any(|c| path::normalize(&c.path) == pinned.path) {
                children.push(pinned);
            }
        }
        let child_paths: Vec<String> = children
            .iter()
            .map(|child| path::normalize(&child.path))
            .collect();

        let mut entries = self.entries.lock();

        // Children that disappeared remotely must not linger
        if let Some(old_children) = entries
            .get(&folder.path)
            .and_then(|old| old.children.clone())
        {
            let current: HashSet<&String> = child_paths.iter().collect();
            for old_child in old_children.iter().filter(|c| !current.contains(c)) {
                entries.remove(old_child);
            }
        }

        for (mut child, child_path) in children.into_iter().zip(child_paths.iter()) {
            child.path = child_path.clone();
            self.clear_negative(child_path);
            entries.insert(
                child_path.clone(),
                CacheEntry {
                    revision: child.revision.clone(),
                    metadata: child,
                    children: None,
                    expires_at,
                },
            );
        }

        self.clear_negative(&folder.path);
        let entry = CacheEntry {
            metadata: folder,
            children: Some(child_paths),
            revision: Some(revision),
            expires_at,
        };
        entries.insert(entry.metadata.path.clone(), entry.clone());

        debug!(
            path = %entry.path(),
            children = entry.children.as_ref().map_or(0, Vec::len),
            "cached folder listing"
        );
        entry
    }

    /// Push an entry's expiry out by one TTL
    pub fn renew(&self, path: &str) -> Option<CacheEntry> {
        let path = path::normalize(path);
        let expires_at = Instant::now() + self.ttl;
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&path)?;
        entry.expires_at = expires_at;
        if let Some(children) = entry.children.clone() {
            for child in children {
                if let Some(child) = entries.get_mut(&child) {
                    child.expires_at = expires_at;
                }
            }
        }
        entries.get(&path).cloned()
    }

    /// Remove a path from the cache.
    ///
    /// A file evicts its parent's listing so the parent is re-listed on next
    /// access. A folder takes everything cached below it and leaves the parent
    /// cached but unlisted. Returns whether anything was removed.
    pub fn invalidate(&self, path: &str) -> bool {
        let path = path::normalize(path);
        self.clear_negative(&path);

        let mut entries = self.entries.lock();
        let removed = entries.remove(&path);
        if removed.as_ref().is_some_and(|entry| !entry.metadata.is_folder()) {
            let parent = path::parent(&path);
            if path != path::ROOT && entries.get(&parent).is_some_and(CacheEntry::is_listed) {
                entries.remove(&parent);
                debug!(path = %path, parent = %parent, "invalidated entry and parent listing");
            } else {
                debug!(path = %path, "invalidated entry");
            }
            return true;
        }

        // Unknown paths may still have descendants cached from earlier listings
        let before = entries.len();
        entries.retain(|candidate, _| !is_below(candidate, &path));
        let descendants = before - entries.len();
        if removed.is_some() && path != path::ROOT {
            if let Some(parent) = entries.get_mut(&path::parent(&path)) {
                if parent.children.take().is_some() {
                    parent.revision = parent.metadata.revision.clone();
                }
            }
        }
        drop(entries);
        self.clear_negative_below(&path);

        if removed.is_some() || descendants > 0 {
            debug!(path = %path, descendants, "invalidated subtree");
        }
        removed.is_some() || descendants > 0
    }

    /// Forget a folder's listing but keep the folder and its children cached.
    ///
    /// The next deep lookup re-lists it. Unlisted or uncached folders are left
    /// alone.
    pub fn unlist(&self, path: &str) {
        let path = path::normalize(path);
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&path) {
            if entry.children.take().is_some() {
                entry.revision = entry.metadata.revision.clone();
                debug!(path = %path, "dropped folder listing");
            }
        }
    }

    /// Keep a locally created file visible, whatever the remote says, until
    /// every handle that created it has called [`unpin`](Self::unpin)
    pub fn pin(&self, metadata: Metadata) -> CacheEntry {
        let mut metadata = metadata;
        metadata.path = path::normalize(&metadata.path);
        self.pinned
            .lock()
            .entry(metadata.path.clone())
            .and_modify(|pin| pin.holders += 1)
            .or_insert_with(|| Pin {
                metadata: metadata.clone(),
                holders: 1,
            });
        self.insert(metadata)
    }

    pub fn unpin(&self, path: &str) {
        let path = path::normalize(path);
        let mut pinned = self.pinned.lock();
        if let Some(pin) = pinned.get_mut(&path) {
            pin.holders -= 1;
            if pin.holders == 0 {
                pinned.remove(&path);
            }
        }
    }

    pub fn is_pinned(&self, path: &str) -> bool {
        self.pinned.lock().contains_key(&path::normalize(path))
    }

    /// A pinned path as an always-fresh entry
    pub fn pinned_entry(&self, path: &str) -> Option<CacheEntry> {
        let metadata = self
            .pinned
            .lock()
            .get(&path::normalize(path))?
            .metadata
            .clone();
        Some(CacheEntry {
            revision: None,
            metadata,
            children: None,
            expires_at: Instant::now() + self.ttl,
        })
    }

    fn pinned_children(&self, folder: &str) -> Vec<Metadata> {
        self.pinned
            .lock()
            .values()
            .filter(|pin| pin.metadata.path != folder)
            .filter(|pin| path::parent(&pin.metadata.path) == folder)
            .map(|pin| pin.metadata.clone())
            .collect()
    }

    /// Remember that the remote reported `path` as missing
    pub fn mark_missing(&self, path: &str) {
        if let Some(negative) = &self.negative {
            negative.insert(path::normalize(path), ());
        }
    }

    pub fn is_negative(&self, path: &str) -> bool {
        self.negative
            .as_ref()
            .is_some_and(|negative| negative.contains_key(&path::normalize(path)))
    }

    /// True when a fresh listing of the parent proves `path` does not exist
    pub fn known_absent(&self, path: &str) -> bool {
        let path = path::normalize(path);
        if path == path::ROOT || self.is_pinned(&path) {
            return false;
        }

        let entries = self.entries.lock();
        match entries.get(&path::parent(&path)) {
            Some(parent) if !parent.is_stale(Instant::now()) => parent
                .children
                .as_ref()
                .is_some_and(|children| !children.contains(&path)),
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        let now = Instant::now();
        CacheStats {
            entry_count: entries.len() as u64,
            listed_folders: entries.values().filter(|e| e.is_listed()).count() as u64,
            stale_count: entries.values().filter(|e| e.is_stale(now)).count() as u64,
            negative_count: self.negative.as_ref().map_or(0, Cache::entry_count),
            ttl_secs: self.ttl.as_secs(),
        }
    }

    fn clear_negative(&self, path: &str) {
        if let Some(negative) = &self.negative {
            negative.invalidate(path);
        }
    }

    fn clear_negative_below(&self, path: &str) {
        let Some(negative) = &self.negative else {
            return;
        };
        let root = path.to_string();
        let cleared = negative.invalidate_entries_if(move |candidate, _| is_below(candidate, &root));
        if let Err(e) = cleared {
            warn!(path = %path, error = %e, "could not clear negative lookups below path");
        }
    }

    /// Take the refresh lock for one path
    async fn lock_path(&self, path: &str) -> PathGuard<'_> {
        let lock = self
            .path_locks
            .lock()
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let guard = lock.clone().lock_owned().await;

        PathGuard {
            locks: &self.path_locks,
            path: path.to_string(),
            lock,
            guard: Some(guard),
        }
    }
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("ttl", &self.ttl)
            .field("entry_count", &self.entries.lock().len())
            .finish()
    }
}

/// Holds a per-path refresh lock; drops the map slot when nobody else waits
struct PathGuard<'a> {
    locks: &'a Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    path: String,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // map slot + self.lock + the owned guard
        if Arc::strong_count(&self.lock) <= 3 {
            locks.remove(&self.path);
        }
        self.guard.take();
    }
}

/// `candidate` lies strictly below `root`
fn is_below(candidate: &str, root: &str) -> bool {
    if root == path::ROOT {
        return candidate != path::ROOT;
    }
    candidate
        .strip_prefix(root)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entry_count: u64,
    pub listed_folders: u64,
    pub stale_count: u64,
    pub negative_count: u64,
    pub ttl_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> MetadataCache {
        MetadataCache::new(&FsConfig::default())
    }

    fn listing(folder: &str, children: &[Metadata], revision: &str) -> FolderListing {
        FolderListing {
            folder: Metadata::folder(folder),
            entries: children.to_vec(),
            revision: revision.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_then_get_until_expiry() {
        let cache = cache();
        cache.insert(Metadata::file("/foo.txt", 3));

        match cache.get("/foo.txt") {
            Lookup::Fresh(entry) => assert_eq!(entry.metadata.size, 3),
            other => panic!("expected fresh entry, got {:?}", other),
        }

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(matches!(cache.get("/foo.txt"), Lookup::Stale(_)));
    }

    #[test]
    fn test_get_normalizes_key() {
        let cache = cache();
        cache.insert(Metadata::folder("/docs/"));
        assert!(matches!(cache.get("docs"), Lookup::Fresh(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_shares_expiry() {
        let cache = cache();
        let entry = cache.insert_listing(listing(
            "/",
            &[Metadata::file("/a.txt", 1), Metadata::folder("/sub")],
            "rev-1",
        ));

        assert_eq!(
            entry.children,
            Some(vec!["/a.txt".to_string(), "/sub".to_string()])
        );
        let Lookup::Fresh(child) = cache.get("/a.txt") else {
            panic!("child not cached");
        };
        assert_eq!(child.expires_at, entry.expires_at);

        tokio::time::advance(Duration::from_secs(30)).await;
        let renewed = cache.renew("/").unwrap();
        let Lookup::Fresh(child) = cache.get("/sub") else {
            panic!("child not cached");
        };
        assert_eq!(child.expires_at, renewed.expires_at);
    }

    #[test]
    fn test_invalidate_folder_removes_children() {
        let cache = cache();
        cache.insert_listing(listing(
            "/docs",
            &[Metadata::file("/docs/a", 1), Metadata::file("/docs/b", 2)],
            "rev",
        ));

        assert!(cache.invalidate("/docs"));
        assert_eq!(cache.get("/docs"), Lookup::Miss);
        assert_eq!(cache.get("/docs/a"), Lookup::Miss);
        assert_eq!(cache.get("/docs/b"), Lookup::Miss);
    }

    #[test]
    fn test_invalidate_file_evicts_parent_listing() {
        let cache = cache();
        cache.insert_listing(listing(
            "/docs",
            &[Metadata::file("/docs/a", 1), Metadata::file("/docs/b", 2)],
            "rev",
        ));

        assert!(cache.invalidate("/docs/a"));
        assert_eq!(cache.get("/docs/a"), Lookup::Miss);
        assert_eq!(cache.get("/docs"), Lookup::Miss);
        // Siblings are not referenced by any listing anymore but stay valid
        assert!(matches!(cache.get("/docs/b"), Lookup::Fresh(_)));
    }

    #[test]
    fn test_invalidate_folder_drops_whole_subtree() {
        let cache = cache();
        cache.insert_listing(listing("/", &[Metadata::folder("/d")], "rev-root"));
        cache.insert_listing(listing("/d", &[Metadata::folder("/d/sub")], "rev-d"));
        cache.insert_listing(listing("/d/sub", &[Metadata::file("/d/sub/x", 1)], "rev-sub"));
        cache.mark_missing("/d/sub/gone");
        cache.insert(Metadata::file("/dx", 1));

        assert!(cache.invalidate("/d"));
        assert_eq!(cache.get("/d/sub"), Lookup::Miss);
        assert_eq!(cache.get("/d/sub/x"), Lookup::Miss);
        assert!(!cache.is_negative("/d/sub/gone"));
        // Prefix match stops at the separator
        assert!(matches!(cache.get("/dx"), Lookup::Fresh(_)));
        // Parent stays cached but has to be re-listed
        let Lookup::Fresh(root) = cache.get("/") else {
            panic!("root dropped");
        };
        assert!(!root.is_listed());
    }

    #[test]
    fn test_invalidate_uncached_folder_still_drops_descendants() {
        let cache = cache();
        cache.insert(Metadata::file("/a/b/c", 1));
        assert!(cache.invalidate("/a"));
        assert_eq!(cache.get("/a/b/c"), Lookup::Miss);
    }

    #[test]
    fn test_unlist_keeps_folder_and_children() {
        let cache = cache();
        cache.insert_listing(listing("/", &[Metadata::folder("/docs")], "rev-root"));
        cache.insert_listing(listing("/docs", &[Metadata::file("/docs/a", 1)], "rev"));

        cache.unlist("/docs");
        let Lookup::Fresh(docs) = cache.get("/docs") else {
            panic!("docs dropped");
        };
        assert!(!docs.is_listed());
        assert_eq!(docs.revision, None);
        assert!(matches!(cache.get("/docs/a"), Lookup::Fresh(_)));
        let Lookup::Fresh(root) = cache.get("/") else {
            panic!("root dropped");
        };
        assert!(root.is_listed());

        // Nothing to forget
        cache.unlist("/docs");
        cache.unlist("/missing");
    }

    #[test]
    fn test_pins_are_counted() {
        let cache = cache();
        cache.pin(Metadata::file("/p", 0));
        cache.pin(Metadata::file("/p", 0));
        cache.unpin("/p");
        assert!(cache.is_pinned("/p"));
        cache.unpin("/p");
        assert!(!cache.is_pinned("/p"));
        assert!(cache.pinned_entry("/p").is_none());
    }

    #[test]
    fn test_relisting_keeps_pinned_children() {
        let cache = cache();
        cache.insert_listing(listing("/", &[Metadata::file("/a", 1)], "rev-1"));
        cache.pin(Metadata::file("/local", 0));

        let root = cache.insert_listing(listing("/", &[Metadata::file("/a", 1)], "rev-2"));
        assert_eq!(
            root.children,
            Some(vec!["/a".to_string(), "/local".to_string()])
        );
        assert!(matches!(cache.get("/local"), Lookup::Fresh(_)));
        assert!(!cache.known_absent("/local"));
    }

    #[test]
    fn test_invalidate_absent_is_noop() {
        let cache = cache();
        assert!(!cache.invalidate("/nothing"));
        cache.insert(Metadata::file("/x", 0));
        assert!(cache.invalidate("/x"));
        assert!(!cache.invalidate("/x"));
    }

    #[test]
    fn test_relisting_drops_vanished_children() {
        let cache = cache();
        cache.insert_listing(listing(
            "/",
            &[Metadata::file("/a", 1), Metadata::file("/b", 1)],
            "rev-1",
        ));
        cache.insert_listing(listing("/", &[Metadata::file("/b", 5)], "rev-2"));

        assert_eq!(cache.get("/a"), Lookup::Miss);
        let Lookup::Fresh(b) = cache.get("/b") else {
            panic!("b not cached");
        };
        assert_eq!(b.metadata.size, 5);
    }

    #[test]
    fn test_insert_joins_cached_parent_listing() {
        let cache = cache();
        cache.insert_listing(listing("/", &[Metadata::file("/a", 1)], "rev"));
        cache.insert(Metadata::file("/new", 0));

        let Lookup::Fresh(root) = cache.get("/") else {
            panic!("root not cached");
        };
        assert_eq!(
            root.children,
            Some(vec!["/a".to_string(), "/new".to_string()])
        );
    }

    #[test]
    fn test_known_absent_from_parent_listing() {
        let cache = cache();
        assert!(!cache.known_absent("/ghost"));

        cache.insert_listing(listing("/", &[Metadata::file("/a", 1)], "rev"));
        assert!(cache.known_absent("/ghost"));
        assert!(!cache.known_absent("/a"));
        assert!(!cache.known_absent("/"));
    }

    #[test]
    fn test_negative_cache() {
        let cache = cache();
        assert!(!cache.is_negative("/nonexistent"));

        cache.mark_missing("/nonexistent");
        assert!(cache.is_negative("/nonexistent"));

        // Invalidate should clear negative cache too
        cache.invalidate("/nonexistent");
        assert!(!cache.is_negative("/nonexistent"));

        cache.mark_missing("/later");
        cache.insert(Metadata::file("/later", 0));
        assert!(!cache.is_negative("/later"));
    }

    #[test]
    fn test_stats() {
        let cache = cache();
        cache.insert_listing(listing("/", &[Metadata::file("/a", 1)], "rev"));
        let stats = cache.stats();
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.listed_folders, 1);
        assert_eq!(stats.ttl_secs, 120);
    }
}
