//! Chunked upload engine
//!
//! Small writes are coalesced locally and shipped to the remote through its
//! start/append/commit session protocol. A write flushes the pending buffer
//! when the buffer has reached the write cache threshold or when the write
//! itself is shorter than [`MIN_CHUNK`]. The first flush starts the session,
//! later flushes append to it and [`UploadSession::finalize`] commits at the
//! final cursor.

use bytes::BytesMut;
use tracing::{debug, error, info};

use crate::config::MIN_CHUNK;
use crate::error::{FsError, Result};
use crate::remote::{Metadata, RemoteError, RemoteStore, SessionId};

/// Where an upload stands in the session protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Empty,
    Buffering,
    SessionOpen,
}

#[derive(Debug)]
enum State {
    Empty,
    Buffering,
    Open(SessionId),
}

/// Write side of a handle
#[derive(Debug)]
pub struct UploadSession {
    state: State,
    /// Bytes the remote has acknowledged
    committed_offset: u64,
    pending: BytesMut,
    threshold: usize,
    /// Commit an empty object when released without data
    created: bool,
    failed: bool,
}

impl UploadSession {
    pub fn new(threshold: usize, created: bool) -> Self {
        Self {
            state: State::Empty,
            committed_offset: 0,
            pending: BytesMut::new(),
            threshold: threshold.max(MIN_CHUNK),
            created,
            failed: false,
        }
    }

    pub fn phase(&self) -> UploadPhase {
        match self.state {
            State::Empty => UploadPhase::Empty,
            State::Buffering => UploadPhase::Buffering,
            State::Open(_) => UploadPhase::SessionOpen,
        }
    }

    pub fn committed_offset(&self) -> u64 {
        self.committed_offset
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Offset the next write must start at
    pub fn accepted_offset(&self) -> u64 {
        self.committed_offset + self.pending.len() as u64
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// True when the file did not exist remotely before this upload
    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Accept `data` at `offset`, flushing to the remote when the policy says so
    pub async fn write(
        &mut self,
        remote: &dyn RemoteStore,
        data: &[u8],
        offset: u64,
    ) -> Result<()> {
        self.check_usable()?;
        if offset != self.accepted_offset() {
            debug!(
                expected = self.accepted_offset(),
                requested = offset,
                "rejecting non-sequential write"
            );
            return Err(FsError::Unsupported("non-sequential write"));
        }
        if data.is_empty() {
            return Ok(());
        }

        self.pending.extend_from_slice(data);
        let flush = self.pending.len() >= self.threshold || data.len() < MIN_CHUNK;

        match (self.phase(), flush) {
            (UploadPhase::Empty, false) => {
                self.state = State::Buffering;
                Ok(())
            }
            (_, false) => Ok(()),
            (UploadPhase::SessionOpen, true) => self.append(remote).await,
            (_, true) => self.start(remote).await,
        }
    }

    /// Ship whatever is still pending and commit the object at `path`.
    ///
    /// Returns the committed metadata, or `None` if nothing had to be uploaded.
    pub async fn finalize(
        &mut self,
        remote: &dyn RemoteStore,
        path: &str,
    ) -> Result<Option<Metadata>> {
        self.check_usable()?;

        match self.state {
            State::Empty if !self.created => {
                debug!(path = %path, "nothing written, skipping upload");
                return Ok(None);
            }
            State::Empty | State::Buffering => self.start(remote).await?,
            State::Open(_) if !self.pending.is_empty() => self.append(remote).await?,
            State::Open(_) => {}
        }

        let State::Open(session) = &self.state else {
            return Err(FsError::Unsupported("upload session was never started"));
        };
        let committed = remote
            .commit_upload_session(path, session, self.committed_offset)
            .await;
        match committed {
            Ok(metadata) => {
                info!(path = %path, size = self.committed_offset, "committed upload");
                Ok(Some(metadata))
            }
            Err(e) => Err(self.fail("commit_upload_session", e)),
        }
    }

    /// Open the session with the pending buffer as its first chunk
    async fn start(&mut self, remote: &dyn RemoteStore) -> Result<()> {
        let chunk = self.pending.split().freeze();
        let len = chunk.len() as u64;
        match remote.start_upload_session(chunk.clone()).await {
            Ok(session) => {
                debug!(session = %session, len, "started upload session");
                self.state = State::Open(session);
                self.committed_offset = len;
                Ok(())
            }
            Err(e) => {
                self.pending.extend_from_slice(&chunk);
                Err(self.fail("start_upload_session", e))
            }
        }
    }

    async fn append(&mut self, remote: &dyn RemoteStore) -> Result<()> {
        let State::Open(session) = &self.state else {
            return self.start(remote).await;
        };
        let chunk = self.pending.split().freeze();
        let len = chunk.len() as u64;
        match remote
            .append_upload_session(session, self.committed_offset, chunk.clone())
            .await
        {
            Ok(()) => {
                debug!(session = %session, offset = self.committed_offset, len, "appended to upload session");
                self.committed_offset += len;
                Ok(())
            }
            Err(e) => {
                self.pending.extend_from_slice(&chunk);
                Err(self.fail("append_upload_session", e))
            }
        }
    }

    fn check_usable(&self) -> Result<()> {
        if self.failed {
            return Err(FsError::Remote {
                op: "upload",
                source: RemoteError::Transport("upload session failed earlier".into()),
            });
        }
        Ok(())
    }

    fn fail(&mut self, op: &'static str, e: RemoteError) -> FsError {
        error!(op, error = %e, "upload failed");
        self.failed = true;
        FsError::remote(op)(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{MemoryRemote, RemoteCall};

    const THRESHOLD: usize = 4096;

    fn block(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_large_first_write_opens_session() {
        let remote = MemoryRemote::new();
        let mut upload = UploadSession::new(THRESHOLD, true);

        upload.write(&remote, &block(5000), 0).await.unwrap();

        assert_eq!(upload.phase(), UploadPhase::SessionOpen);
        assert_eq!(upload.committed_offset(), 5000);
        assert_eq!(upload.pending_len(), 0);
        assert_eq!(remote.calls(), vec![RemoteCall::StartSession { len: 5000 }]);
    }

    #[tokio::test]
    async fn test_small_write_flushes_immediately() {
        let remote = MemoryRemote::new();
        let mut upload = UploadSession::new(16 * 1024, true);

        upload.write(&remote, &block(10), 0).await.unwrap();
        assert_eq!(upload.phase(), UploadPhase::SessionOpen);
        assert_eq!(upload.committed_offset(), 10);

        upload.write(&remote, &block(5), 10).await.unwrap();
        assert_eq!(upload.committed_offset(), 15);
        assert_eq!(
            remote.calls(),
            vec![
                RemoteCall::StartSession { len: 10 },
                RemoteCall::AppendSession { offset: 10, len: 5 },
            ]
        );
    }

    #[tokio::test]
    async fn test_mid_sized_writes_buffer_until_threshold() {
        let remote = MemoryRemote::new();
        let mut upload = UploadSession::new(3 * MIN_CHUNK, true);

        upload.write(&remote, &block(MIN_CHUNK), 0).await.unwrap();
        assert_eq!(upload.phase(), UploadPhase::Buffering);
        upload.write(&remote, &block(MIN_CHUNK), 4096).await.unwrap();
        assert_eq!(upload.phase(), UploadPhase::Buffering);
        assert_eq!(upload.pending_len(), 2 * MIN_CHUNK);
        assert!(remote.calls().is_empty());

        upload.write(&remote, &block(MIN_CHUNK), 8192).await.unwrap();
        assert_eq!(upload.phase(), UploadPhase::SessionOpen);
        assert_eq!(upload.committed_offset(), 3 * MIN_CHUNK as u64);
        assert_eq!(upload.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_buffered_upload_commits_in_one_step() {
        let remote = MemoryRemote::new();
        let mut upload = UploadSession::new(4 * MIN_CHUNK, true);

        upload.write(&remote, &block(MIN_CHUNK), 0).await.unwrap();
        let metadata = upload.finalize(&remote, "/f.bin").await.unwrap().unwrap();

        assert_eq!(metadata.size, MIN_CHUNK as u64);
        assert_eq!(
            remote.calls(),
            vec![
                RemoteCall::StartSession { len: MIN_CHUNK },
                RemoteCall::CommitSession {
                    path: "/f.bin".into(),
                    offset: MIN_CHUNK as u64
                },
            ]
        );
        assert_eq!(remote.file_contents("/f.bin").unwrap(), block(MIN_CHUNK));
    }

    #[tokio::test]
    async fn test_open_session_flushes_pending_before_commit() {
        let remote = MemoryRemote::new();
        let mut upload = UploadSession::new(2 * MIN_CHUNK, true);

        upload.write(&remote, &block(2 * MIN_CHUNK), 0).await.unwrap();
        upload
            .write(&remote, &block(MIN_CHUNK), 2 * MIN_CHUNK as u64)
            .await
            .unwrap();
        assert_eq!(upload.pending_len(), MIN_CHUNK);

        upload.finalize(&remote, "/big.bin").await.unwrap();
        assert_eq!(
            remote.calls(),
            vec![
                RemoteCall::StartSession { len: 2 * MIN_CHUNK },
                RemoteCall::AppendSession {
                    offset: 2 * MIN_CHUNK as u64,
                    len: MIN_CHUNK
                },
                RemoteCall::CommitSession {
                    path: "/big.bin".into(),
                    offset: 3 * MIN_CHUNK as u64
                },
            ]
        );
        assert_eq!(remote.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_empty_upload() {
        let remote = MemoryRemote::new();

        let mut opened = UploadSession::new(THRESHOLD, false);
        assert!(opened.finalize(&remote, "/existing").await.unwrap().is_none());
        assert!(remote.calls().is_empty());

        let mut created = UploadSession::new(THRESHOLD, true);
        let metadata = created.finalize(&remote, "/new").await.unwrap().unwrap();
        assert_eq!(metadata.size, 0);
        assert_eq!(remote.file_contents("/new").unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_non_sequential_write_rejected() {
        let remote = MemoryRemote::new();
        let mut upload = UploadSession::new(THRESHOLD, true);
        upload.write(&remote, &block(10), 0).await.unwrap();

        let err = upload.write(&remote, &block(10), 50).await.unwrap_err();
        assert!(matches!(err, FsError::Unsupported(_)));
        assert!(!upload.is_failed());
        assert_eq!(upload.accepted_offset(), 10);
    }

    #[tokio::test]
    async fn test_remote_failure_is_fatal() {
        let remote = MemoryRemote::new();
        remote.fail_next(
            "start_upload_session",
            RemoteError::Transport("quota".into()),
        );
        let mut upload = UploadSession::new(THRESHOLD, true);

        let err = upload.write(&remote, &block(10), 0).await.unwrap_err();
        assert!(matches!(
            err,
            FsError::Remote {
                op: "start_upload_session",
                ..
            }
        ));
        assert!(upload.is_failed());
        assert_eq!(upload.pending_len(), 10);
        assert_eq!(upload.phase(), UploadPhase::Empty);

        assert!(upload.write(&remote, &block(5), 10).await.is_err());
        assert!(upload.finalize(&remote, "/f").await.is_err());
    }
}
