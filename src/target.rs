//! The local mirror directory: owns on-disk bytes, hidden metadata subdirectory, and the
//! redirection that keeps a remote path named `.mountload` from colliding with it.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const METADATA_DIR_NAME: &str = ".mountload";
const REDIRECT_DIR_NAME: &str = "redirect";
const DB_FILE_NAME: &str = "metadata.sqlite";

/// The materialised local copy of the remote tree.
pub struct Target {
    root: PathBuf,
    metadata_dir: PathBuf,
    redirect_dir: PathBuf,
}

impl Target {
    /// Open (creating if necessary) the mirror rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let metadata_dir = root.join(METADATA_DIR_NAME);
        let redirect_dir = metadata_dir.join(REDIRECT_DIR_NAME);

        for dir in [&root, &metadata_dir, &redirect_dir] {
            if !dir.is_dir() {
                fs::create_dir_all(dir).map_err(|e| Error::target_io(dir, e))?;
            }
        }

        Ok(Target { root, metadata_dir, redirect_dir })
    }

    /// Path to the SQLite database file backing the metadata store.
    pub fn db_path(&self) -> PathBuf {
        self.metadata_dir.join(DB_FILE_NAME)
    }

    /// Translate a user-visible path (always starting with `/`) into the physical location on
    /// disk, redirecting anything under the hidden metadata subdirectory so it can never
    /// collide with mountload's own bookkeeping.
    fn physical_path(&self, path: &str) -> PathBuf {
        let candidate = join_relative(&self.root, path);
        if candidate == self.metadata_dir || candidate.starts_with(&self.metadata_dir) {
            return join_relative(&self.redirect_dir, path);
        }
        candidate
    }

    pub fn create_directory(&self, path: &str, mode: u32) -> Result<()> {
        let dir = self.physical_path(path);
        if dir.is_dir() {
            fs::set_permissions(&dir, fs::Permissions::from_mode(mode))
                .map_err(|e| Error::target_io(&dir, e))?;
        } else {
            fs::create_dir(&dir).map_err(|e| Error::target_io(&dir, e))?;
            fs::set_permissions(&dir, fs::Permissions::from_mode(mode))
                .map_err(|e| Error::target_io(&dir, e))?;
        }
        Ok(())
    }

    pub fn create_file(&self, path: &str, mode: u32) -> Result<()> {
        let file_path = self.physical_path(path);
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&file_path)
            .map_err(|e| Error::target_io(&file_path, e))?;
        fs::set_permissions(&file_path, fs::Permissions::from_mode(mode))
            .map_err(|e| Error::target_io(&file_path, e))?;
        Ok(())
    }

    pub fn create_symlink(&self, path: &str, target: &str) -> Result<()> {
        let link_path = self.physical_path(path);
        std::os::unix::fs::symlink(target, &link_path).map_err(|e| Error::target_io(&link_path, e))
    }

    pub fn get_symlink(&self, path: &str) -> Result<String> {
        let link_path = self.physical_path(path);
        let target = fs::read_link(&link_path).map_err(|e| Error::target_io(&link_path, e))?;
        Ok(target.to_string_lossy().into_owned())
    }

    /// Read exactly `size` bytes starting at `offset`. Callers are responsible for only
    /// requesting ranges known to be locally present.
    pub fn read_data(&self, path: &str, offset: u64, size: usize) -> Result<Vec<u8>> {
        let file_path = self.physical_path(path);
        let mut file = fs::File::open(&file_path).map_err(|e| Error::target_io(&file_path, e))?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| Error::target_io(&file_path, e))?;
        let mut buf = vec![0u8; size];
        file.read_exact(&mut buf).map_err(|e| Error::target_io(&file_path, e))?;
        Ok(buf)
    }

    /// `pwrite`-style write: does not truncate, extends the file as needed.
    pub fn write_data(&self, path: &str, offset: u64, data: &[u8]) -> Result<()> {
        let file_path = self.physical_path(path);
        let mut file =
            OpenOptions::new().write(true).open(&file_path).map_err(|e| Error::target_io(&file_path, e))?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| Error::target_io(&file_path, e))?;
        file.write_all(data).map_err(|e| Error::target_io(&file_path, e))?;
        Ok(())
    }
}

/// Join a leading-`/` user path onto a base directory without letting `Path::join` treat it
/// as an absolute replacement.
fn join_relative(base: &Path, path: &str) -> PathBuf {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        base.to_path_buf()
    } else {
        base.join(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn target() -> (TempDir, Target) {
        let dir = TempDir::new().unwrap();
        let target = Target::open(dir.path()).unwrap();
        (dir, target)
    }

    #[test]
    fn open_creates_hidden_metadata_and_redirect_dirs() {
        let (dir, _target) = target();
        assert!(dir.path().join(".mountload").is_dir());
        assert!(dir.path().join(".mountload/redirect").is_dir());
    }

    #[test]
    fn create_file_then_write_then_read_roundtrips() {
        let (_dir, target) = target();
        target.create_file("/a.bin", 0o600).unwrap();
        target.write_data("/a.bin", 0, b"hello").unwrap();
        let data = target.read_data("/a.bin", 0, 5).unwrap();
        assert_eq!(data, b"hello");
    }

    #[test]
    fn write_data_extends_file_without_truncating_tail() {
        let (_dir, target) = target();
        target.create_file("/a.bin", 0o600).unwrap();
        target.write_data("/a.bin", 0, b"0123456789").unwrap();
        target.write_data("/a.bin", 2, b"XY").unwrap();
        let data = target.read_data("/a.bin", 0, 10).unwrap();
        assert_eq!(&data, b"01XY456789");
    }

    #[test]
    fn paths_under_metadata_dir_are_redirected() {
        let (dir, target) = target();
        target.create_directory("/.mountload", 0o755).ok();
        target.create_file("/.mountload/notes", 0o600).unwrap();
        target.write_data("/.mountload/notes", 0, b"secret").unwrap();

        // not written into the real metadata directory's top level
        assert!(!dir.path().join(".mountload/notes").exists());
        // but reachable again through the same redirected path
        assert_eq!(target.read_data("/.mountload/notes", 0, 6).unwrap(), b"secret");
        assert!(dir.path().join(".mountload/redirect/.mountload/notes").exists());
    }

    #[test]
    fn create_symlink_and_get_symlink_roundtrip() {
        let (_dir, target) = target();
        target.create_symlink("/link", "/some/target").unwrap();
        assert_eq!(target.get_symlink("/link").unwrap(), "/some/target");
    }
}
