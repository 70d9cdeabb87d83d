//! Remote access over SFTP: connecting, stat'ing, listing, reading byte ranges and symlink
//! targets against the directory tree named by a [`SourceUri`].

use std::io::{Read, Seek, SeekFrom};
use std::net::TcpStream;
use std::path::PathBuf;

use ssh2::{Session, Sftp};

use crate::error::{Error, Result};

const DEFAULT_PORT: u16 = 22;
const DEFAULT_USER: &str = "anonymous";

/// A parsed `scheme://[user@]host[:port]/abs/remote/path` source URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUri {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub remote_path: String,
}

impl SourceUri {
    /// Parse and normalise a source URI, failing unless the remote path is absolute.
    pub fn parse(raw: &str) -> Result<Self> {
        let without_scheme = raw
            .split_once("://")
            .map(|(_, rest)| rest)
            .ok_or_else(|| Error::InvalidSourceUri(raw.to_string(), "missing scheme".into()))?;

        let (authority, path) = without_scheme
            .split_once('/')
            .map(|(a, p)| (a, format!("/{p}")))
            .ok_or_else(|| Error::InvalidSourceUri(raw.to_string(), "missing remote path".into()))?;

        let (user, host_port) = match authority.split_once('@') {
            Some((user, rest)) => (user.to_string(), rest),
            None => (DEFAULT_USER.to_string(), authority),
        };

        let (host, port) = match host_port.split_once(':') {
            Some((host, port_str)) => {
                let port = port_str.parse::<u16>().map_err(|_| {
                    Error::InvalidSourceUri(raw.to_string(), format!("invalid port {port_str:?}"))
                })?;
                (host.to_string(), port)
            }
            None => (host_port.to_string(), DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(Error::InvalidSourceUri(raw.to_string(), "missing host".into()));
        }

        let remote_path = normalize_path(&path);
        if !remote_path.starts_with('/') {
            return Err(Error::InvalidSourceUri(
                raw.to_string(),
                format!("remote path {remote_path:?} is not absolute"),
            ));
        }

        Ok(SourceUri { user, host, port, remote_path })
    }
}

fn normalize_path(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    format!("/{}", out.join("/"))
}

/// A remote node's attributes as reported by `stat`/`lstat`.
#[derive(Debug, Clone, Copy)]
pub struct RemoteEntry {
    pub mode: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
}

/// A single row of a remote directory listing.
#[derive(Debug, Clone)]
pub struct RemoteDirEntry {
    pub filename: String,
    pub entry: RemoteEntry,
}

/// Credentials offered to the SSH layer, tried in order until one succeeds.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub password: Option<String>,
}

/// The remote-access contract the [`crate::controller::Controller`] depends on. Kept as a
/// trait so tests can substitute an in-memory fake instead of talking to a real SSH server.
pub trait Source: Send {
    fn get_entry(&mut self, path: &str) -> Result<Option<RemoteEntry>>;
    fn get_directory_entries(&mut self, path: &str) -> Result<Vec<RemoteDirEntry>>;
    fn get_link_target(&mut self, path: &str) -> Result<String>;
    fn read_data(&mut self, path: &str, offset: u64, size: usize) -> Result<Vec<u8>>;
    fn close(&mut self) -> Result<()>;
}

/// One "last opened" remote file handle, reused across consecutive reads of the same path.
struct CachedHandle {
    path: String,
    file: ssh2::File,
}

/// `Source` implementation backed by one SSH connection and one SFTP channel.
pub struct SftpSource {
    session: Session,
    sftp: Sftp,
    remote_base: String,
    cached: Option<CachedHandle>,
}

impl SftpSource {
    /// Connect and authenticate against `uri`, trying agent auth, then a default key pair,
    /// then (if supplied) a password.
    #[tracing::instrument(skip(credentials), fields(host = %uri.host, port = uri.port, user = %uri.user))]
    pub fn connect(uri: &SourceUri, credentials: &Credentials) -> Result<Self> {
        let tcp = TcpStream::connect((uri.host.as_str(), uri.port))?;
        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;

        Self::verify_host_key(&session, &uri.host, uri.port)?;
        Self::authenticate(&mut session, &uri.user, credentials)?;

        let sftp = session.sftp()?;
        tracing::info!("connected");

        Ok(SftpSource { session, sftp, remote_base: uri.remote_path.clone(), cached: None })
    }

    /// Check the presented host key against `~/.ssh/known_hosts`. An unreadable (i.e. absent)
    /// known_hosts file is treated as "nothing known yet", not an error; an unknown or
    /// mismatched key is fatal.
    fn verify_host_key(session: &Session, host: &str, port: u16) -> Result<()> {
        let mut known_hosts = session.known_hosts()?;
        if let Some(home) = std::env::var_os("HOME") {
            let known_hosts_path = PathBuf::from(home).join(".ssh").join("known_hosts");
            if known_hosts_path.is_file() {
                let _ = known_hosts.read_file(&known_hosts_path, ssh2::KnownHostFileKind::OpenSSH);
            }
        }

        let (key, _key_type) = session
            .host_key()
            .ok_or_else(|| Error::HostKeyRejected(host.to_string(), "remote presented no host key".into()))?;

        match known_hosts.check_port(host, port, key) {
            ssh2::CheckResult::Match => Ok(()),
            ssh2::CheckResult::NotFound => {
                Err(Error::HostKeyRejected(host.to_string(), "host key not present in known_hosts".into()))
            }
            ssh2::CheckResult::Mismatch => {
                Err(Error::HostKeyRejected(host.to_string(), "host key does not match known_hosts entry".into()))
            }
            ssh2::CheckResult::Failure => {
                Err(Error::HostKeyRejected(host.to_string(), "failed to check host key".into()))
            }
        }
    }

    fn authenticate(session: &mut Session, user: &str, credentials: &Credentials) -> Result<()> {
        if session.userauth_agent(user).is_ok() && session.authenticated() {
            return Ok(());
        }

        if let Some(home) = std::env::var_os("HOME") {
            let home = PathBuf::from(home);
            for key_name in ["id_ed25519", "id_rsa"] {
                let private_key = home.join(".ssh").join(key_name);
                if private_key.is_file()
                    && session.userauth_pubkey_file(user, None, &private_key, None).is_ok()
                    && session.authenticated()
                {
                    return Ok(());
                }
            }
        }

        if let Some(password) = &credentials.password {
            session.userauth_password(user, password)?;
            if session.authenticated() {
                return Ok(());
            }
        }

        Err(Error::AuthenticationFailed(user.to_string()))
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let trimmed = path.trim_start_matches('/');
        let mut full = PathBuf::from(&self.remote_base);
        if !trimmed.is_empty() {
            full.push(trimmed);
        }
        full
    }

    fn stat_to_entry(stat: &ssh2::FileStat) -> RemoteEntry {
        RemoteEntry {
            mode: stat.perm.unwrap_or(0),
            size: stat.size.unwrap_or(0),
            atime: stat.atime.unwrap_or(0) as i64,
            mtime: stat.mtime.unwrap_or(0) as i64,
        }
    }

    fn drop_cached_if(&mut self, path: &str) {
        if self.cached.as_ref().map(|c| c.path != path).unwrap_or(false) {
            self.cached = None;
        }
    }
}

impl Source for SftpSource {
    #[tracing::instrument(skip(self))]
    fn get_entry(&mut self, path: &str) -> Result<Option<RemoteEntry>> {
        match self.sftp.stat(&self.full_path(path)) {
            Ok(stat) => Ok(Some(Self::stat_to_entry(&stat))),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(Error::from(err)),
        }
    }

    #[tracing::instrument(skip(self))]
    fn get_directory_entries(&mut self, path: &str) -> Result<Vec<RemoteDirEntry>> {
        let entries = self.sftp.readdir(&self.full_path(path))?;
        Ok(entries
            .into_iter()
            .filter_map(|(path, stat)| {
                let filename = path.file_name()?.to_string_lossy().into_owned();
                Some(RemoteDirEntry { filename, entry: Self::stat_to_entry(&stat) })
            })
            .collect())
    }

    #[tracing::instrument(skip(self))]
    fn get_link_target(&mut self, path: &str) -> Result<String> {
        let target = self.sftp.readlink(&self.full_path(path))?;
        Ok(target.to_string_lossy().into_owned())
    }

    #[tracing::instrument(skip(self))]
    fn read_data(&mut self, path: &str, offset: u64, size: usize) -> Result<Vec<u8>> {
        self.drop_cached_if(path);

        let mut file = match self.cached.take() {
            Some(cached) if cached.path == path => cached.file,
            _ => self.sftp.open(&self.full_path(path))?,
        };

        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size];
        let mut read_total = 0usize;
        while read_total < size {
            let n = file.read(&mut buf[read_total..])?;
            if n == 0 {
                break;
            }
            read_total += n;
        }
        buf.truncate(read_total);

        self.cached = Some(CachedHandle { path: path.to_string(), file });
        Ok(buf)
    }

    fn close(&mut self) -> Result<()> {
        self.cached = None;
        Ok(())
    }
}

/// SFTP protocol status code `SSH_FX_NO_SUCH_FILE` (draft-ietf-secsh-filexfer-02 §7).
const SFTP_NO_SUCH_FILE: i32 = 2;

fn is_not_found(err: &ssh2::Error) -> bool {
    err.code() == ssh2::ErrorCode::SFTP(SFTP_NO_SUCH_FILE)
}
