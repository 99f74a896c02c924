//! Daemon configuration
//!
//! Loaded from a TOML file with three tables:
//!
//! ```toml
//! [cache]
//! cache_ttl_secs = 120
//! write_cache_bytes = 4194304
//!
//! [backend]
//! quota_bytes = 10737418240
//!
//! [backend.store]
//! type = "local"
//! path = "/var/lib/remotefs"
//!
//! [mount]
//! allow_other = false
//! read_only = false
//! ```
//!
//! Every table and field is optional. CLI flags override the file.

use std::path::{Path, PathBuf};

use common::FsConfig;
use object_store::ObjectStoreConfig;
use serde::{Deserialize, Serialize};

/// Quota reported by `statfs` when none is configured (1 TiB)
pub const DEFAULT_QUOTA_BYTES: u64 = 1 << 40;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub cache: FsConfig,
    pub backend: BackendConfig,
    pub mount: MountConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub store: ObjectStoreConfig,
    pub quota_bytes: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            store: ObjectStoreConfig::default(),
            quota_bytes: DEFAULT_QUOTA_BYTES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub allow_other: bool,
    pub allow_root: bool,
    pub read_only: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid cache settings: {0}")]
    Cache(#[from] common::ConfigError),
    #[error("allow_other and allow_root are mutually exclusive")]
    ConflictingAccess,
    #[error("Mount point {0} is not a directory")]
    MountPoint(PathBuf),
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, DaemonConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| DaemonConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| DaemonConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The file at `path` if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, DaemonConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), DaemonConfigError> {
        self.cache.validate()?;
        // libfuse rejects the combination
        if self.mount.allow_other && self.mount.allow_root {
            return Err(DaemonConfigError::ConflictingAccess);
        }
        Ok(())
    }
}

pub fn check_mount_point(path: &Path) -> Result<(), DaemonConfigError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(DaemonConfigError::MountPoint(path.to_path_buf()))
    }
}
