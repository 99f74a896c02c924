//! FUSE integration
//!
//! - `RemoteFuse`: `fuser::Filesystem` implementation that dispatches to `RemoteFs`
//! - `InodeTable`: bidirectional inode ↔ path mapping

mod inode_table;
mod remote_fuse;

use std::path::Path;
use std::sync::Arc;

use fuser::MountOption;
use tokio::runtime::Handle;

use common::RemoteFs;

use crate::config::MountConfig;

pub use inode_table::InodeTable;
pub use remote_fuse::RemoteFuse;

/// Name shown in the mount table
pub const FS_NAME: &str = "remotefs";

pub fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(FS_NAME.to_owned()),
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
    ];
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    if config.allow_root {
        options.push(MountOption::AllowRoot);
    }
    options.push(if config.read_only {
        MountOption::RO
    } else {
        MountOption::RW
    });
    options
}

/// Serve `fs` at `mountpoint` until it is unmounted
pub fn mount(
    rt: Handle,
    fs: Arc<RemoteFs>,
    mountpoint: &Path,
    config: &MountConfig,
) -> std::io::Result<()> {
    let filesystem = RemoteFuse::new(rt, fs, config.read_only);
    let options = mount_options(config);
    tracing::info!(mountpoint = %mountpoint.display(), ?options, "mounting");
    fuser::mount2(filesystem, mountpoint, &options)?;
    tracing::info!(mountpoint = %mountpoint.display(), "unmounted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_options() {
        let options = mount_options(&MountConfig::default());
        assert!(options.contains(&MountOption::FSName(FS_NAME.to_owned())));
        assert!(options.contains(&MountOption::RW));
        assert!(!options.contains(&MountOption::AllowOther));

        let options = mount_options(&MountConfig {
            allow_other: true,
            allow_root: false,
            read_only: true,
        });
        assert!(options.contains(&MountOption::AllowOther));
        assert!(options.contains(&MountOption::RO));
        assert!(!options.contains(&MountOption::RW));
    }
}
