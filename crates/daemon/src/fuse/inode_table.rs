//! Bidirectional inode ↔ path mapping
//!
//! The kernel addresses entries by 64-bit inode number while [`common::RemoteFs`]
//! is path-addressed. Numbers are handed out on first lookup and never reused
//! within a mount; renames and deletes rewrite or drop whole subtrees so that
//! a stale inode never resolves to a path it no longer names.

use std::collections::HashMap;

use common::path;

#[derive(Debug)]
pub struct InodeTable {
    path_to_inode: HashMap<String, u64>,
    inode_to_path: HashMap<u64, String>,
    next_inode: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Root inode number (always 1 in FUSE)
    pub const ROOT_INODE: u64 = 1;

    pub fn new() -> Self {
        let mut table = Self {
            path_to_inode: HashMap::new(),
            inode_to_path: HashMap::new(),
            next_inode: Self::ROOT_INODE + 1,
        };
        table.bind(path::ROOT.to_string(), Self::ROOT_INODE);
        table
    }

    fn bind(&mut self, path: String, inode: u64) {
        self.inode_to_path.insert(inode, path.clone());
        self.path_to_inode.insert(path, inode);
    }

    pub fn get_or_create(&mut self, path: &str) -> u64 {
        let normalized = path::normalize(path);
        if let Some(&inode) = self.path_to_inode.get(&normalized) {
            return inode;
        }

        let inode = self.next_inode;
        self.next_inode += 1;
        self.bind(normalized, inode);
        inode
    }

    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.path_to_inode.get(&path::normalize(path)).copied()
    }

    pub fn get_path(&self, inode: u64) -> Option<&str> {
        self.inode_to_path.get(&inode).map(String::as_str)
    }

    /// Path of `name` inside the folder with inode `parent`
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        self.get_path(parent).map(|folder| path::join(folder, name))
    }

    /// Drop `path` and everything below it. Returns how many inodes went away.
    pub fn remove_by_path(&mut self, path: &str) -> usize {
        let normalized = path::normalize(path);
        if normalized == path::ROOT {
            return 0;
        }

        let doomed: Vec<String> = self
            .path_to_inode
            .keys()
            .filter(|candidate| is_within(candidate, &normalized))
            .cloned()
            .collect();
        for stale in &doomed {
            if let Some(inode) = self.path_to_inode.remove(stale) {
                self.inode_to_path.remove(&inode);
            }
        }
        doomed.len()
    }

    /// Move `old_path` and its subtree under `new_path`, keeping inode numbers.
    /// Whatever `new_path` named before is dropped first.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Option<u64> {
        let old_normalized = path::normalize(old_path);
        let new_normalized = path::normalize(new_path);
        if old_normalized == new_normalized {
            return self.get_inode(&old_normalized);
        }

        let moved: Vec<(String, u64)> = self
            .path_to_inode
            .iter()
            .filter(|(candidate, _)| is_within(candidate, &old_normalized))
            .map(|(candidate, &inode)| (candidate.clone(), inode))
            .collect();
        if moved.is_empty() {
            return None;
        }

        self.remove_by_path(&new_normalized);
        for (old, inode) in moved {
            self.path_to_inode.remove(&old);
            let renamed = format!("{}{}", new_normalized, &old[old_normalized.len()..]);
            self.bind(renamed, inode);
        }
        self.get_inode(&new_normalized)
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }
}

/// `candidate` is `root` or lies below it
fn is_within(candidate: &str, root: &str) -> bool {
    match candidate.strip_prefix(root) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
