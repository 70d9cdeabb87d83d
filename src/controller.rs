//! The sync engine: resolves paths against the metadata store, lazily registers new ones from
//! the remote, and stitches local/remote bytes together to answer arbitrary reads.

use crate::error::{Error, Result};
use crate::metadata::{MetadataStore, PathEntry, PathType};
use crate::source::{RemoteEntry, Source};
use crate::target::Target;

const MODE_FILE_BITS: u32 = 0o600;
const MODE_DIR_BITS: u32 = 0o700;

/// `stat`-shaped information the facade needs, assembled from a [`PathEntry`] plus the process
/// identity (SFTP doesn't give us real uid/gid).
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub path_id: i64,
    pub path_type: PathType,
    pub size: u64,
    pub mode: u32,
    pub atime: i64,
    pub mtime: i64,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub blocks: u64,
}

/// A directory entry as returned by [`Controller::get_entries_in_directory`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub path_id: i64,
    pub basename: String,
    pub path_type: PathType,
}

/// Binds one [`Source`], one [`Target`] and one [`MetadataStore`] into the sync engine
/// described by the core spec. Never re-entered: the owning [`crate::pool::ControllerPool`]
/// guarantees exclusive use from a single thread at a time.
pub struct Controller<S: Source> {
    source: S,
    target: Target,
    metadata: MetadataStore,
    uid: u32,
    gid: u32,
}

impl<S: Source> Controller<S> {
    /// Wire the three collaborators together, verify or record `source_uri`, and make sure
    /// the remote root is registered.
    pub fn new(
        mut source: S,
        target: Target,
        mut metadata: MetadataStore,
        source_uri: Option<&str>,
    ) -> Result<Self> {
        let known_uri = metadata.get_config_string("sourceURI")?;
        match (source_uri, known_uri) {
            (Some(given), None) => metadata.set_config("sourceURI", given)?,
            (Some(given), Some(known)) if given != known => {
                return Err(Error::SourceUriMismatch { supplied: given.to_string(), known })
            }
            _ => {}
        }

        let mut controller = Controller {
            source,
            target,
            metadata,
            uid: current_uid(),
            gid: current_gid(),
        };
        controller.bootstrap()?;
        Ok(controller)
    }

    fn bootstrap(&mut self) -> Result<()> {
        if self.get_path("/")?.is_none() {
            let entry = self
                .source
                .get_entry("/")?
                .ok_or_else(|| Error::NotFound("/ (remote root)".to_string()))?;
            self.register_path("/", entry)?;
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.source.close()
    }

    // -- path resolution -------------------------------------------------------------------

    /// `_getPath`: resolve `path`, lazily registering it from the remote if its parent is not
    /// yet known to be fully synced.
    pub fn get_path(&mut self, path: &str) -> Result<Option<PathEntry>> {
        let normalized = normalize_path(path);
        let (dirname, basename) = split_path(&normalized);

        if let Some(entry) = self.metadata.get_path(&dirname, &basename)? {
            return Ok(Some(entry));
        }

        if normalized == "/" {
            return Ok(None);
        }

        let parent_path = parent_of(&normalized);
        let parent = match self.get_path(&parent_path)? {
            Some(parent) => parent,
            None => return Ok(None),
        };
        if parent.is_synced {
            return Ok(None);
        }

        let remote_entry = match self.source.get_entry(&normalized)? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        self.register_path(&normalized, remote_entry)?;
        self.metadata.get_path(&dirname, &basename)
    }

    /// `getEntriesInDirectory`: synchronise and return every child of `dirpath`.
    pub fn get_entries_in_directory(&mut self, dirpath: &str) -> Result<Vec<DirEntry>> {
        let normalized = normalize_path(dirpath);
        let dir_entry = self
            .get_path(&normalized)?
            .ok_or_else(|| Error::NotFound(normalized.clone()))?;

        let listing_dir = if normalized == "/" { normalized.clone() } else { format!("{normalized}/") };

        if !dir_entry.is_synced {
            self.metadata.begin()?;
            let sync_result = self.sync_directory_entries(&listing_dir, dir_entry.path_id);
            match sync_result {
                Ok(()) => self.metadata.commit()?,
                Err(err) => {
                    let _ = self.metadata.rollback();
                    return Err(err);
                }
            }
        }

        let subs = self.metadata.get_sub_paths(&listing_dir)?;
        Ok(subs
            .into_iter()
            .map(|entry| DirEntry { path_id: entry.path_id, basename: entry.basename, path_type: entry.path_type })
            .collect())
    }

    fn sync_directory_entries(&mut self, listing_dir: &str, dir_path_id: i64) -> Result<()> {
        for remote in self.source.get_directory_entries(listing_dir)? {
            if self.metadata.get_path(listing_dir, &remote.filename)?.is_none() {
                let entry_path = format!("{listing_dir}{}", remote.filename);
                self.register_path(&entry_path, remote.entry)?;
            }
        }
        self.metadata.set_path_synced(dir_path_id)?;
        Ok(())
    }

    // -- registration ------------------------------------------------------------------------

    fn register_path(&mut self, path: &str, entry: RemoteEntry) -> Result<()> {
        let file_type = entry.mode & libc::S_IFMT;
        match file_type {
            libc::S_IFDIR => self.register_directory(path, entry),
            libc::S_IFREG => self.register_file(path, entry),
            libc::S_IFLNK => self.register_symlink(path, entry),
            _ => Err(Error::UnsupportedEntryType(path.to_string())),
        }
    }

    fn register_directory(&mut self, path: &str, entry: RemoteEntry) -> Result<()> {
        let (dirname, basename) = split_path(path);
        self.metadata.add_path(&dirname, &basename, PathType::Directory, entry.size, entry.mode, entry.atime, entry.mtime, false)?;
        self.target.create_directory(path, entry.mode | MODE_DIR_BITS)?;
        Ok(())
    }

    fn register_file(&mut self, path: &str, entry: RemoteEntry) -> Result<()> {
        let (dirname, basename) = split_path(path);
        let is_synced = entry.size == 0;

        self.metadata.begin()?;
        let result = (|| -> Result<i64> {
            let path_id = self.metadata.add_path(
                &dirname,
                &basename,
                PathType::File,
                entry.size,
                entry.mode,
                entry.atime,
                entry.mtime,
                is_synced,
            )?;
            if !is_synced {
                self.metadata.add_remote_segment(path_id, 0, entry.size - 1)?;
            }
            Ok(path_id)
        })();
        match result {
            Ok(_) => self.metadata.commit()?,
            Err(err) => {
                let _ = self.metadata.rollback();
                return Err(err);
            }
        }

        self.target.create_file(path, entry.mode | MODE_FILE_BITS)?;
        Ok(())
    }

    fn register_symlink(&mut self, path: &str, entry: RemoteEntry) -> Result<()> {
        let link_target = self.source.get_link_target(path)?;
        self.target.create_symlink(path, &link_target)?;

        let (dirname, basename) = split_path(path);
        self.metadata.add_path(&dirname, &basename, PathType::Symlink, entry.size, entry.mode, entry.atime, entry.mtime, true)?;
        Ok(())
    }

    // -- stitched read -------------------------------------------------------------------------

    /// `readData`: return exactly `min(size, max(0, fileSize - offset))` bytes, fetching any
    /// still-remote portion of the requested window and writing it into the mirror.
    pub fn read_data(&mut self, path: &str, offset: u64, size: usize) -> Result<Vec<u8>> {
        let normalized = normalize_path(path);
        let entry = self.get_path(&normalized)?.ok_or_else(|| Error::NotFound(normalized.clone()))?;
        if entry.path_type != PathType::File {
            return Err(Error::WrongType(normalized));
        }

        let effective_size = if offset >= entry.size {
            0
        } else {
            size.min((entry.size - offset) as usize)
        };
        if effective_size == 0 {
            return Ok(Vec::new());
        }

        if entry.is_synced {
            return self.target.read_data(&normalized, offset, effective_size);
        }

        let req_end = offset + effective_size as u64 - 1;
        let segments = self.metadata.get_remote_segments_range(entry.path_id, offset, req_end)?;

        let mut data = Vec::with_capacity(effective_size);
        let mut current_pos: u64 = 0;
        let mut segment_idx = 0usize;

        while current_pos < effective_size as u64 {
            let (seg_begin, seg_end) = match segments.get(segment_idx) {
                Some(seg) => (seg.begin.saturating_sub(offset), seg.end.saturating_sub(offset)),
                None => (effective_size as u64, effective_size as u64 - 1),
            };

            if current_pos < seg_begin {
                let run = (seg_begin - current_pos) as usize;
                let mut local = self.target.read_data(&normalized, offset + current_pos, run)?;
                data.append(&mut local);
                current_pos = seg_begin;
            }

            let remote_read_size =
                (effective_size as u64 - current_pos).min(seg_end.saturating_sub(seg_begin).saturating_add(1));
            if remote_read_size > 0 {
                let begin_abs = offset + current_pos;
                let end_abs = begin_abs + remote_read_size - 1;
                let mut fetched = self.download_segment(&normalized, entry.path_id, begin_abs, end_abs)?;
                data.append(&mut fetched);
                current_pos += remote_read_size;
                segment_idx += 1;
            }
        }

        Ok(data)
    }

    /// Fetch `[begin, end]` (inclusive) from the remote, write it into the mirror, and shrink
    /// the segment set accordingly.
    fn download_segment(&mut self, path: &str, path_id: i64, begin: u64, end: u64) -> Result<Vec<u8>> {
        let expected = (end - begin + 1) as usize;
        let data = self.source.read_data(path, begin, expected)?;

        let entry = self.metadata.get_path(&split_path(path).0, &split_path(path).1)?;
        let at_eof = entry.map(|e| begin + data.len() as u64 >= e.size).unwrap_or(false);
        if data.len() < expected && !at_eof {
            return Err(Error::ShortRead { path: path.to_string(), offset: begin, expected, got: data.len() });
        }

        self.target.write_data(path, begin, &data)?;
        self.metadata.remove_remote_segments(path_id, begin, begin + data.len() as u64 - 1)?;
        Ok(data)
    }

    // -- stat / symlink ------------------------------------------------------------------------

    pub fn get_stat_for_path(&mut self, path: &str) -> Result<Option<Stat>> {
        let entry = match self.get_path(path)? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let nlink = match entry.path_type {
            PathType::Directory => 2,
            _ => 1,
        };
        let blocks = div_ceil(entry.size, 4096) * 8;
        Ok(Some(Stat {
            path_id: entry.path_id,
            path_type: entry.path_type,
            size: entry.size,
            mode: entry.mode,
            atime: entry.atime,
            mtime: entry.mtime,
            uid: self.uid,
            gid: self.gid,
            nlink,
            blocks,
        }))
    }

    pub fn get_symlink_target(&mut self, path: &str) -> Result<String> {
        let normalized = normalize_path(path);
        let entry = self.get_path(&normalized)?.ok_or_else(|| Error::NotFound(normalized.clone()))?;
        if entry.path_type != PathType::Symlink || !entry.is_synced {
            return Err(Error::WrongType(normalized));
        }
        self.target.get_symlink(&normalized)
    }
}

fn div_ceil(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

fn current_uid() -> u32 {
    unsafe { libc::getuid() }
}

fn current_gid() -> u32 {
    unsafe { libc::getgid() }
}

/// Collapse `.`/`..`/repeated slashes the way `os.path.normpath` does, keeping a leading `/`.
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

/// Split a normalised path into `(dirname, basename)`, with `dirname` suffixed by `/` unless
/// it is exactly `/`.
fn split_path(path: &str) -> (String, String) {
    if path == "/" {
        return ("/".to_string(), String::new());
    }
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(idx) => (format!("{}/", &path[..idx]), path[idx + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

fn parent_of(path: &str) -> String {
    if path == "/" {
        return "/".to_string();
    }
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[derive(Clone)]
    struct FakeFile {
        data: Vec<u8>,
        mode: u32,
        is_dir: bool,
        children: Vec<String>,
        link_target: Option<String>,
    }

    /// An in-memory [`Source`] fake: a fixed tree of files/dirs/symlinks, with an optional
    /// per-path cap on how many bytes a single `read_data` call will return (to exercise the
    /// short-read error path).
    struct FakeSource {
        files: HashMap<String, FakeFile>,
        max_read: Option<usize>,
    }

    impl FakeSource {
        fn new() -> Self {
            let mut files = HashMap::new();
            files.insert(
                "/".to_string(),
                FakeFile { data: vec![], mode: libc::S_IFDIR | 0o755, is_dir: true, children: vec![], link_target: None },
            );
            FakeSource { files, max_read: None }
        }

        fn add_dir(&mut self, path: &str, children: Vec<&str>) {
            self.files.insert(
                path.to_string(),
                FakeFile {
                    data: vec![],
                    mode: libc::S_IFDIR | 0o755,
                    is_dir: true,
                    children: children.into_iter().map(String::from).collect(),
                    link_target: None,
                },
            );
        }

        fn add_file(&mut self, path: &str, data: &[u8]) {
            self.files.insert(
                path.to_string(),
                FakeFile { data: data.to_vec(), mode: libc::S_IFREG | 0o644, is_dir: false, children: vec![], link_target: None },
            );
        }
    }

    impl Source for FakeSource {
        fn get_entry(&mut self, path: &str) -> Result<Option<RemoteEntry>> {
            Ok(self.files.get(path).map(|f| RemoteEntry { mode: f.mode, size: f.data.len() as u64, atime: 0, mtime: 0 }))
        }

        fn get_directory_entries(&mut self, path: &str) -> Result<Vec<crate::source::RemoteDirEntry>> {
            let dir_key = path.trim_end_matches('/');
            let dir_key = if dir_key.is_empty() { "/" } else { dir_key };
            let file = self.files.get(dir_key).cloned().ok_or_else(|| Error::NotFound(path.to_string()))?;
            let mut out = Vec::new();
            for child in &file.children {
                let child_path = if dir_key == "/" { format!("/{child}") } else { format!("{dir_key}/{child}") };
                let child_file = self.files.get(&child_path).unwrap();
                out.push(crate::source::RemoteDirEntry {
                    filename: child.clone(),
                    entry: RemoteEntry { mode: child_file.mode, size: child_file.data.len() as u64, atime: 0, mtime: 0 },
                });
            }
            Ok(out)
        }

        fn get_link_target(&mut self, path: &str) -> Result<String> {
            self.files.get(path).and_then(|f| f.link_target.clone()).ok_or_else(|| Error::NotFound(path.to_string()))
        }

        fn read_data(&mut self, path: &str, offset: u64, size: usize) -> Result<Vec<u8>> {
            let file = self.files.get(path).ok_or_else(|| Error::NotFound(path.to_string()))?;
            let offset = offset as usize;
            let available = file.data.len().saturating_sub(offset);
            let mut want = size.min(available);
            if let Some(cap) = self.max_read {
                want = want.min(cap);
            }
            Ok(file.data[offset..offset + want].to_vec())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn fixture(source: FakeSource) -> (TempDir, Controller<FakeSource>) {
        let dir = TempDir::new().unwrap();
        let target = Target::open(dir.path()).unwrap();
        let metadata = MetadataStore::open(&target.db_path()).unwrap();
        let controller = Controller::new(source, target, metadata, Some("fake://test/")).unwrap();
        (dir, controller)
    }

    // S1: single-byte read materialises exactly one byte and leaves the rest remote.
    #[test]
    fn single_byte_read_materialises_one_byte() {
        let mut source = FakeSource::new();
        source.add_dir("/", vec!["a.bin"]);
        source.add_file("/a.bin", &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let (_dir, mut controller) = fixture(source);

        let data = controller.read_data("/a.bin", 3, 1).unwrap();
        assert_eq!(data, vec![3]);

        let entry = controller.get_path("/a.bin").unwrap().unwrap();
        assert!(!entry.is_synced);
        let mut segs = controller.metadata.get_remote_segments(entry.path_id).unwrap();
        segs.sort_by_key(|s| s.begin);
        assert_eq!(segs.iter().map(|s| (s.begin, s.end)).collect::<Vec<_>>(), vec![(0, 2), (4, 9)]);
    }

    // S2: sequential full read ends with the file fully synced.
    #[test]
    fn sequential_full_read_ends_synced() {
        let mut source = FakeSource::new();
        source.add_dir("/", vec!["a.bin"]);
        source.add_file("/a.bin", b"0123456789");
        let (_dir, mut controller) = fixture(source);

        assert_eq!(controller.read_data("/a.bin", 0, 4).unwrap(), b"0123");
        assert_eq!(controller.read_data("/a.bin", 4, 4).unwrap(), b"4567");
        assert_eq!(controller.read_data("/a.bin", 8, 2).unwrap(), b"89");

        let entry = controller.get_path("/a.bin").unwrap().unwrap();
        assert!(entry.is_synced);
        assert!(controller.metadata.get_remote_segments(entry.path_id).unwrap().is_empty());
    }

    // S4: getattr-before-readdir registers only the queried entry, leaving the dir unsynced.
    #[test]
    fn lazy_lookup_before_readdir_leaves_directory_unsynced() {
        let mut source = FakeSource::new();
        source.add_dir("/", vec!["d"]);
        source.add_dir("/d", vec!["x", "y"]);
        source.add_file("/d/x", b"hi");
        source.add_file("/d/y", b"there");
        let (_dir, mut controller) = fixture(source);

        let stat = controller.get_stat_for_path("/d/x").unwrap().unwrap();
        assert_eq!(stat.size, 2);

        let d_entry = controller.get_path("/d").unwrap().unwrap();
        assert!(!d_entry.is_synced);

        let entries = controller.get_entries_in_directory("/d").unwrap();
        let mut names: Vec<_> = entries.iter().map(|e| e.basename.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["x", "y"]);

        let d_entry = controller.get_path("/d").unwrap().unwrap();
        assert!(d_entry.is_synced);
    }

    // Absence propagation: once a directory is synced, nonexistence is authoritative.
    #[test]
    fn absence_is_authoritative_once_parent_synced() {
        let mut source = FakeSource::new();
        source.add_dir("/", vec!["d"]);
        source.add_dir("/d", vec![]);
        let (_dir, mut controller) = fixture(source);

        controller.get_entries_in_directory("/d").unwrap();
        let result = controller.get_path("/d/nonexistent").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn uri_mismatch_on_reopen_is_fatal() {
        let dir = TempDir::new().unwrap();
        let target = Target::open(dir.path()).unwrap();
        let metadata = MetadataStore::open(&target.db_path()).unwrap();
        let mut source = FakeSource::new();
        source.add_dir("/", vec![]);
        Controller::new(source, target, metadata, Some("sftp://u@h/p")).unwrap();

        let target2 = Target::open(dir.path()).unwrap();
        let metadata2 = MetadataStore::open(&target2.db_path()).unwrap();
        let mut source2 = FakeSource::new();
        source2.add_dir("/", vec![]);
        let err = Controller::new(source2, target2, metadata2, Some("sftp://u@h/p2")).unwrap_err();
        assert!(matches!(err, Error::SourceUriMismatch { .. }));
    }

    #[test]
    fn short_read_not_at_eof_is_an_error() {
        let mut source = FakeSource::new();
        source.add_dir("/", vec!["a.bin"]);
        source.add_file("/a.bin", &[0u8; 100]);
        source.max_read = Some(10);
        let (_dir, mut controller) = fixture(source);

        let err = controller.read_data("/a.bin", 0, 50).unwrap_err();
        assert!(matches!(err, Error::ShortRead { .. }));
    }
}
