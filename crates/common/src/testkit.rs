//! In-memory [`RemoteStore`] for tests
//!
//! Records every call, answers `Unchanged` for matching listing revisions,
//! supports one-shot failure injection per operation and can hold downloads
//! at a barrier to prove that independent reads run concurrently.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::Barrier;

use crate::path;
use crate::remote::{
    ByteStream, FolderChange, FolderListing, Metadata, RemoteError, RemoteStore, SessionId,
    SpaceUsage,
};

const MODIFIED: &str = "2024-01-02T03:04:05Z";

/// A call received by [`MemoryRemote`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    ListFolder(String),
    GetMetadata(String),
    CreateFolder(String),
    Delete(String),
    Move(String, String),
    Download { path: String, offset: u64 },
    StartSession { len: usize },
    AppendSession { offset: u64, len: usize },
    CommitSession { path: String, offset: u64 },
    SpaceUsage,
}

#[derive(Debug, Clone)]
enum Node {
    Folder,
    File { data: Bytes, revision: String },
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<String, Vec<u8>>,
    calls: Vec<RemoteCall>,
    failures: HashMap<&'static str, VecDeque<RemoteError>>,
    unchanged: u64,
    next_revision: u64,
}

#[derive(Debug)]
pub struct MemoryRemote {
    state: Mutex<State>,
    download_gate: Mutex<Option<Arc<Barrier>>>,
    chunk_size: Mutex<usize>,
    quota: u64,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            download_gate: Mutex::new(None),
            chunk_size: Mutex::new(4096),
            quota: 1024 * 1024 * 1024,
        }
    }

    pub fn seed_folder(&self, path: &str) {
        let mut state = self.state.lock();
        state.create_parents(path);
        state.nodes.insert(path::normalize(path), Node::Folder);
    }

    pub fn seed_file(&self, path: &str, data: &[u8]) {
        let mut state = self.state.lock();
        state.put_file(path, Bytes::copy_from_slice(data));
    }

    /// Remove a path behind the cache's back
    pub fn remove(&self, path: &str) {
        self.state.lock().remove_tree(&path::normalize(path));
    }

    pub fn file_contents(&self, path: &str) -> Option<Bytes> {
        match self.state.lock().nodes.get(&path::normalize(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        let path = path::normalize(path);
        path == path::ROOT || self.state.lock().nodes.contains_key(&path)
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of listings answered with `Unchanged`
    pub fn unchanged_answers(&self) -> u64 {
        self.state.lock().unchanged
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Fail the next call of `op` (trait method name) with `error`
    pub fn fail_next(&self, op: &'static str, error: RemoteError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Make every download wait at `barrier` before returning its stream
    pub fn gate_downloads(&self, barrier: Arc<Barrier>) {
        *self.download_gate.lock() = Some(barrier);
    }

    /// Size of the chunks download streams are cut into
    pub fn set_chunk_size(&self, size: usize) {
        *self.chunk_size.lock() = size.max(1);
    }

    fn begin(&self, op: &'static str, call: RemoteCall) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        match state.failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl State {
    fn create_parents(&mut self, path: &str) {
        let mut parent = path::parent(path);
        while parent != path::ROOT {
            self.nodes.entry(parent.clone()).or_insert(Node::Folder);
            parent = path::parent(&parent);
        }
    }

    fn put_file(&mut self, path: &str, data: Bytes) -> Metadata {
        let path = path::normalize(path);
        self.create_parents(&path);
        self.next_revision += 1;
        let revision = format!("rev-{}", self.next_revision);
        let metadata = file_metadata(&path, &data, &revision);
        self.nodes.insert(path, Node::File { data, revision });
        metadata
    }

    fn remove_tree(&mut self, path: &str) -> bool {
        let prefix = format!("{}/", path);
        let before = self.nodes.len();
        self.nodes
            .retain(|candidate, _| candidate != path && !candidate.starts_with(&prefix));
        self.nodes.len() != before
    }

    fn metadata(&self, path: &str) -> Option<Metadata> {
        if path == path::ROOT {
            return Some(Metadata::folder(path::ROOT));
        }
        self.nodes.get(path).map(|node| match node {
            Node::Folder => Metadata::folder(path),
            Node::File { data, revision } => file_metadata(path, data, revision),
        })
    }

    fn children(&self, folder: &str) -> Vec<Metadata> {
        self.nodes
            .keys()
            .filter(|candidate| candidate.as_str() != path::ROOT && path::parent(candidate) == folder)
            .filter_map(|child| self.metadata(child))
            .collect()
    }
}

fn file_metadata(path: &str, data: &Bytes, revision: &str) -> Metadata {
    Metadata::file(path, data.len() as u64)
        .with_modified(MODIFIED)
        .with_revision(revision)
}

fn listing_revision(entries: &[Metadata]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(format!(
            "{:?}:{}:{}:{}\n",
            entry.kind,
            entry.path,
            entry.size,
            entry.revision.as_deref().unwrap_or("")
        ));
    }
    hex::encode(hasher.finalize())
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn list_folder(
        &self,
        path: &str,
        since: Option<&str>,
    ) -> Result<FolderChange, RemoteError> {
        let path = path::normalize(path);
        self.begin("list_folder", RemoteCall::ListFolder(path.clone()))?;

        let mut state = self.state.lock();
        let folder = match state.metadata(&path) {
            Some(metadata) if metadata.is_folder() => metadata,
            Some(_) => return Err(RemoteError::NotFolder(path)),
            None => return Err(RemoteError::NotFound(path)),
        };
        let entries = state.children(&path);
        let revision = listing_revision(&entries);

        if since == Some(revision.as_str()) {
            state.unchanged += 1;
            return Ok(FolderChange::Unchanged);
        }
        Ok(FolderChange::Changed(FolderListing {
            folder,
            entries,
            revision,
        }))
    }

    async fn get_metadata(&self, path: &str) -> Result<Metadata, RemoteError> {
        let path = path::normalize(path);
        self.begin("get_metadata", RemoteCall::GetMetadata(path.clone()))?;
        self.state
            .lock()
            .metadata(&path)
            .ok_or(RemoteError::NotFound(path))
    }

    async fn create_folder(&self, path: &str) -> Result<(), RemoteError> {
        let path = path::normalize(path);
        self.begin("create_folder", RemoteCall::CreateFolder(path.clone()))?;

        let mut state = self.state.lock();
        if state.metadata(&path).is_some() {
            return Err(RemoteError::Transport(format!("path conflict: {}", path)));
        }
        state.create_parents(&path);
        state.nodes.insert(path, Node::Folder);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        let path = path::normalize(path);
        self.begin("delete", RemoteCall::Delete(path.clone()))?;

        if self.state.lock().remove_tree(&path) {
            Ok(())
        } else {
            Err(RemoteError::NotFound(path))
        }
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        let from = path::normalize(from);
        let to = path::normalize(to);
        self.begin("move", RemoteCall::Move(from.clone(), to.clone()))?;

        let mut state = self.state.lock();
        let prefix = format!("{}/", from);
        let moved: Vec<(String, Node)> = state
            .nodes
            .iter()
            .filter(|(candidate, _)| **candidate == from || candidate.starts_with(&prefix))
            .map(|(candidate, node)| (candidate.clone(), node.clone()))
            .collect();
        if moved.is_empty() {
            return Err(RemoteError::NotFound(from));
        }

        state.remove_tree(&from);
        state.create_parents(&to);
        for (old, node) in moved {
            let new = format!("{}{}", to, &old[from.len()..]);
            state.nodes.insert(new, node);
        }
        Ok(())
    }

    async fn download(&self, path: &str, offset: u64) -> Result<ByteStream, RemoteError> {
        let path = path::normalize(path);
        self.begin(
            "download",
            RemoteCall::Download {
                path: path.clone(),
                offset,
            },
        )?;

        let gate = self.download_gate.lock().clone();
        if let Some(barrier) = gate {
            barrier.wait().await;
        }

        let data = match self.state.lock().nodes.get(&path) {
            Some(Node::File { data, .. }) => data.clone(),
            Some(Node::Folder) => return Err(RemoteError::Transport(format!("not a file: {}", path))),
            None => return Err(RemoteError::NotFound(path)),
        };

        let start = (offset as usize).min(data.len());
        let chunk_size = *self.chunk_size.lock();
        let chunks: Vec<Result<Bytes, RemoteError>> = (start..data.len())
            .step_by(chunk_size)
            .map(|at| Ok(data.slice(at..(at + chunk_size).min(data.len()))))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn start_upload_session(&self, data: Bytes) -> Result<SessionId, RemoteError> {
        self.begin(
            "start_upload_session",
            RemoteCall::StartSession { len: data.len() },
        )?;

        let id = uuid::Uuid::new_v4().to_string();
        self.state.lock().sessions.insert(id.clone(), data.to_vec());
        Ok(SessionId::new(id))
    }

    async fn append_upload_session(
        &self,
        session: &SessionId,
        offset: u64,
        data: Bytes,
    ) -> Result<(), RemoteError> {
        self.begin(
            "append_upload_session",
            RemoteCall::AppendSession {
                offset,
                len: data.len(),
            },
        )?;

        let mut state = self.state.lock();
        let buffer = state
            .sessions
            .get_mut(session.as_str())
            .ok_or_else(|| RemoteError::UnknownSession(session.to_string()))?;
        if buffer.len() as u64 != offset {
            return Err(RemoteError::InvalidCursor {
                expected: buffer.len() as u64,
                actual: offset,
            });
        }
        buffer.extend_from_slice(&data);
        Ok(())
    }

    async fn commit_upload_session(
        &self,
        path: &str,
        session: &SessionId,
        offset: u64,
    ) -> Result<Metadata, RemoteError> {
        let path = path::normalize(path);
        self.begin(
            "commit_upload_session",
            RemoteCall::CommitSession {
                path: path.clone(),
                offset,
            },
        )?;

        let mut state = self.state.lock();
        let buffer = state
            .sessions
            .remove(session.as_str())
            .ok_or_else(|| RemoteError::UnknownSession(session.to_string()))?;
        if buffer.len() as u64 != offset {
            let expected = buffer.len() as u64;
            state.sessions.insert(session.as_str().to_string(), buffer);
            return Err(RemoteError::InvalidCursor {
                expected,
                actual: offset,
            });
        }
        Ok(state.put_file(&path, Bytes::from(buffer)))
    }

    async fn space_usage(&self) -> Result<SpaceUsage, RemoteError> {
        self.begin("space_usage", RemoteCall::SpaceUsage)?;

        let used = self
            .state
            .lock()
            .nodes
            .values()
            .map(|node| match node {
                Node::File { data, .. } => data.len() as u64,
                Node::Folder => 0,
            })
            .sum();
        Ok(SpaceUsage {
            used,
            allocated: self.quota,
        })
    }
}
