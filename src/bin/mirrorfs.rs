//! Binary entry point: parse the CLI, resolve settings, open the mirror, and hand control to
//! the FUSE kernel loop until the mount is unmounted.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use fuser::MountOption;

use mirrorfs::config::{Cli, Settings};
use mirrorfs::controller::Controller;
use mirrorfs::fs::MirrorFilesystem;
use mirrorfs::metadata::MetadataStore;
use mirrorfs::pool::ControllerPool;
use mirrorfs::source::{SftpSource, SourceUri};
use mirrorfs::target::Target;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::resolve(cli).context("resolving configuration")?;
    mirrorfs::logging::init(settings.debug);

    let target = Target::open(&settings.target).context("opening local mirror directory")?;
    let mut metadata = MetadataStore::open(&target.db_path()).context("opening metadata store")?;

    let uri_str = settings
        .source
        .clone()
        .or(metadata.get_config_string("sourceURI")?)
        .ok_or_else(|| anyhow!("no source URI given and none recorded for this mirror"))?;
    let uri = SourceUri::parse(&uri_str).context("parsing source URI")?;

    let first_source = SftpSource::connect(&uri, &settings.credentials).context("connecting to remote host")?;
    let mut first_controller = Controller::new(first_source, target, metadata, settings.source.as_deref())
        .context("bootstrapping mirror")?;
    let root_path_id = first_controller
        .get_path("/")?
        .ok_or_else(|| anyhow!("remote root vanished during bootstrap"))?
        .path_id;

    let pool_capacity = if settings.multithreaded { settings.pool_size } else { 1 };
    let pool: ControllerPool<SftpSource> = ControllerPool::new(pool_capacity);
    pool.seed(first_controller);

    let reconnect_uri = uri.clone();
    let reconnect_credentials = settings.credentials.clone();
    let reconnect_target_dir = settings.target.clone();
    let connect = move || -> mirrorfs::Result<Controller<SftpSource>> {
        let source = SftpSource::connect(&reconnect_uri, &reconnect_credentials)?;
        let target = Target::open(&reconnect_target_dir)?;
        let metadata = MetadataStore::open(&target.db_path())?;
        Controller::new(source, target, metadata, None)
    };

    let filesystem = MirrorFilesystem::new(pool, root_path_id, connect);

    let mount_options = vec![
        MountOption::RO,
        MountOption::FSName("mirrorfs".to_string()),
        MountOption::Subtype("mirrorfs".to_string()),
    ];

    tracing::info!(mountpoint = %settings.mountpoint.display(), "mounting");
    fuser::mount2(filesystem, &settings.mountpoint, &mount_options).context("mounting filesystem")?;
    Ok(())
}
