//! File handle table
//!
//! Hands out small dense ids (1..=capacity), always the smallest free one,
//! and stores the per-open-file transfer state behind a per-handle async
//! mutex. Holding that mutex serializes read/write/release on one handle
//! without blocking any other handle.

mod read;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::{FsError, Result};
use crate::transfer::UploadSession;

pub use read::ReadStream;

/// Access mode a handle was opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleMode {
    ReadOnly,
    WriteOnly,
}

/// Transfer state of one open file
#[derive(Debug)]
pub enum TransferState {
    Read(ReadStream),
    Write(UploadSession),
}

/// One open file descriptor
#[derive(Debug)]
pub struct FileHandle {
    pub id: u64,
    pub path: String,
    pub state: TransferState,
    /// Set once released; late callers that already held the Arc see it
    pub(crate) closed: bool,
}

impl FileHandle {
    pub fn mode(&self) -> HandleMode {
        match self.state {
            TransferState::Read(_) => HandleMode::ReadOnly,
            TransferState::Write(_) => HandleMode::WriteOnly,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

pub type SharedHandle = Arc<AsyncMutex<FileHandle>>;

#[derive(Debug, Default)]
struct Slots {
    open: HashMap<u64, SharedHandle>,
    /// Released ids below `next`
    free: BTreeSet<u64>,
    /// Smallest id never handed out
    next: u64,
}

/// Allocator and store for open file handles
#[derive(Debug)]
pub struct HandleTable {
    slots: Mutex<Slots>,
    capacity: u64,
}

impl HandleTable {
    pub fn new(capacity: u64) -> Self {
        Self {
            slots: Mutex::new(Slots {
                next: 1,
                ..Slots::default()
            }),
            capacity,
        }
    }

    /// Allocate the smallest unused id for a new handle
    pub fn allocate(&self, path: impl Into<String>, state: TransferState) -> Result<u64> {
        let mut slots = self.slots.lock();

        let id = match slots.free.pop_first() {
            Some(id) => id,
            None if slots.next <= self.capacity => {
                let id = slots.next;
                slots.next += 1;
                id
            }
            None => {
                return Err(FsError::Exhausted {
                    capacity: self.capacity,
                })
            }
        };

        let handle = FileHandle {
            id,
            path: path.into(),
            state,
            closed: false,
        };
        debug!(fh = id, path = %handle.path, mode = ?handle.mode(), "allocated file handle");
        slots.open.insert(id, Arc::new(AsyncMutex::new(handle)));
        Ok(id)
    }

    pub fn get(&self, id: u64) -> Result<SharedHandle> {
        self.slots
            .lock()
            .open
            .get(&id)
            .cloned()
            .ok_or(FsError::BadHandle(id))
    }

    /// Remove a handle, making its id available again
    pub fn release(&self, id: u64) -> Result<SharedHandle> {
        let mut slots = self.slots.lock();
        let handle = slots.open.remove(&id).ok_or(FsError::BadHandle(id))?;
        slots.free.insert(id);
        debug!(fh = id, "released file handle");
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().open.is_empty()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}
