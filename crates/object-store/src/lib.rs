//! Remote store backed by object storage (S3, MinIO, local disk, memory)

mod config;
mod remote;

pub use config::{BuildError, ObjectStoreConfig};
pub use remote::{ObjectRemote, FOLDER_MARKER, STAGING_PREFIX};
