pub mod cli;
pub mod config;
#[cfg(feature = "fuse")]
pub mod fuse;

pub use cli::Cli;
pub use config::{BackendConfig, DaemonConfig, DaemonConfigError, MountConfig};
