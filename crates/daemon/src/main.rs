use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use common::RemoteFs;
use object_store::ObjectRemote;
use remotefs_daemon::config::check_mount_point;
use remotefs_daemon::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(cli.log_level().into()),
        )
        .init();

    let config = cli.resolve()?;
    check_mount_point(&cli.mountpoint)?;

    // Filesystem callbacks arrive on the FUSE session thread and block on this runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    let remote = {
        let _guard = runtime.enter();
        ObjectRemote::from_config(&config.backend.store, config.backend.quota_bytes)
            .context("open object store")?
    };
    let fs = Arc::new(RemoteFs::new(Arc::new(remote), config.cache.clone())?);

    mount(runtime.handle().clone(), fs, &cli, &config)
}

#[cfg(feature = "fuse")]
fn mount(
    rt: tokio::runtime::Handle,
    fs: Arc<RemoteFs>,
    cli: &Cli,
    config: &remotefs_daemon::DaemonConfig,
) -> anyhow::Result<()> {
    remotefs_daemon::fuse::mount(rt, fs, &cli.mountpoint, &config.mount)
        .with_context(|| format!("mount {}", cli.mountpoint.display()))
}

#[cfg(not(feature = "fuse"))]
fn mount(
    _rt: tokio::runtime::Handle,
    _fs: Arc<RemoteFs>,
    _cli: &Cli,
    _config: &remotefs_daemon::DaemonConfig,
) -> anyhow::Result<()> {
    Err(anyhow::anyhow!(
        "fuse support disabled; rebuild remotefs with --features fuse"
    ))
}
