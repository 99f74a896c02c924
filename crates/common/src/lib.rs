// Core of a POSIX-like view over a remote object store
pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod handle;
pub mod path;
pub mod remote;
pub mod transfer;

// In-memory remote used by tests here and in downstream crates
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use cache::{CacheEntry, CacheStats, Lookup, MetadataCache};
pub use config::{ConfigError, FsConfig, MIN_CHUNK};
pub use error::{FsError, Result};
pub use fs::{FileAttributes, FsStats, RemoteFs};
pub use handle::{HandleMode, HandleTable};
pub use remote::{
    ByteStream, EntryKind, FolderChange, FolderListing, Metadata, RemoteError, RemoteStore,
    SessionId, SpaceUsage,
};
pub use transfer::{UploadPhase, UploadSession};
