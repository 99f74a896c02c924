use std::path::PathBuf;

use clap::Parser;

use crate::config::{DaemonConfig, DaemonConfigError};

/// Mount a remote object store as a local filesystem
#[derive(Parser, Debug, Clone)]
#[command(name = "remotefs", version, about)]
pub struct Cli {
    /// Existing directory to mount on
    pub mountpoint: PathBuf,

    /// TOML configuration file
    #[arg(long, short, env = "REMOTEFS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Seconds metadata stays fresh
    #[arg(long, env = "REMOTEFS_CACHE_TIME")]
    pub cache_time: Option<u64>,

    /// Bytes buffered per open file before an upload chunk is sent
    #[arg(long, env = "REMOTEFS_WRITE_CACHE")]
    pub write_cache: Option<usize>,

    /// Let other users access the mount
    #[arg(long)]
    pub allow_other: bool,

    /// Let root access the mount
    #[arg(long)]
    pub allow_root: bool,

    /// Reject every modification
    #[arg(long)]
    pub read_only: bool,

    /// Log at debug level
    #[arg(long, short)]
    pub debug: bool,
}

impl Cli {
    /// Load the configuration file and apply flags on top of it
    pub fn resolve(&self) -> Result<DaemonConfig, DaemonConfigError> {
        let mut config = DaemonConfig::load_or_default(self.config.as_deref())?;
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&self, config: &mut DaemonConfig) {
        if let Some(secs) = self.cache_time {
            config.cache.cache_ttl_secs = secs;
        }
        if let Some(bytes) = self.write_cache {
            config.cache.write_cache_bytes = bytes;
        }
        config.mount.allow_other |= self.allow_other;
        config.mount.allow_root |= self.allow_root;
        config.mount.read_only |= self.read_only;
    }

    /// Filter directive for the log subscriber
    pub fn log_level(&self) -> tracing::Level {
        if self.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
