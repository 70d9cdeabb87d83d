//! Command-line parsing, on-disk config file, and credential prompting.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::pool::DEFAULT_POOL_SIZE;
use crate::source::Credentials;

/// Mounts a remote directory using SFTP while also downloading it to another target directory.
#[derive(Parser, Debug)]
#[command(name = "mirrorfs", version)]
pub struct Cli {
    /// Raise logging verbosity to debug.
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// Run FUSE in multithreaded mode.
    #[arg(long, default_value_t = false)]
    pub multithreaded: bool,

    /// Ask for an SSH password instead of relying on agent/key authentication.
    #[arg(long, default_value_t = false)]
    pub password: bool,

    /// Path to a TOML config file overriding defaults (CLI flags still take precedence).
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// The SFTP source URI, e.g. `sftp://user@example.org/path/to/remote/dir`. May be omitted
    /// when reopening a mirror that already has one recorded.
    pub source: Option<String>,

    /// The directory in which all the files should be stored.
    pub target: PathBuf,

    /// Path to the mountpoint.
    pub mountpoint: PathBuf,
}

/// On-disk, optional settings merged underneath whatever the CLI supplies. Lets a fleet of
/// mounts share connection settings instead of repeating flags on every invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub multithreaded: bool,
    pub pool_size: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| crate::error::Error::target_io(path, e))?;
        toml::from_str(&text)
            .map_err(|e| crate::error::Error::MetadataCorruption(format!("invalid config file {path:?}: {e}")))
    }
}

/// Fully resolved settings: CLI flags layered over an optional config file, with sensible
/// defaults filled in.
#[derive(Debug, Clone)]
pub struct Settings {
    pub source: Option<String>,
    pub target: PathBuf,
    pub mountpoint: PathBuf,
    pub debug: bool,
    pub multithreaded: bool,
    pub pool_size: usize,
    pub credentials: Credentials,
}

impl Settings {
    pub fn resolve(cli: Cli) -> crate::error::Result<Self> {
        let file_config = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let debug = cli.debug || file_config.debug;
        let multithreaded = cli.multithreaded || file_config.multithreaded;
        let pool_size = file_config.pool_size.unwrap_or(DEFAULT_POOL_SIZE);

        let credentials = if cli.password {
            let password = rpassword::prompt_password("Enter SSH password: ")
                .map_err(|e| crate::error::Error::target_io(PathBuf::from("<tty>"), e))?;
            Credentials { password: Some(password) }
        } else {
            Credentials::default()
        };

        Ok(Settings {
            source: cli.source,
            target: cli.target,
            mountpoint: cli.mountpoint,
            debug,
            multithreaded,
            pool_size,
            credentials,
        })
    }
}
