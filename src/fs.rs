//! The `fuser::Filesystem` facade: translates kernel inode-oriented calls into the
//! path-oriented [`crate::controller::Controller`] API, mapping [`crate::error::Error`] down to
//! POSIX errno on the way out. Read-only: every mutating `fuser::Filesystem` method is left at
//! its default (`ENOSYS`) implementation.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry, Request};
use libc::ENOENT;

use crate::controller::Stat;
use crate::error::Result;
use crate::metadata::PathType;
use crate::pool::ControllerPool;
use crate::source::Source;

const ROOT_INODE: u64 = 1;
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Lazily-populated, never-evicted bridge between `fuser`'s inode numbers and the metadata
/// store's `pathId`s. Grown on demand (`lookup`/`readdir`) and never shrunk: the mirror is
/// read-only and never deletes a `pathId`, so there's nothing to evict.
#[derive(Default)]
struct InodeTable {
    ino_to_path_id: HashMap<u64, i64>,
    path_id_to_ino: HashMap<i64, u64>,
    next_ino: u64,
}

impl InodeTable {
    fn new(root_path_id: i64) -> Self {
        let mut table =
            InodeTable { ino_to_path_id: HashMap::new(), path_id_to_ino: HashMap::new(), next_ino: ROOT_INODE + 1 };
        table.ino_to_path_id.insert(ROOT_INODE, root_path_id);
        table.path_id_to_ino.insert(root_path_id, ROOT_INODE);
        table
    }

    fn ino_for(&mut self, path_id: i64) -> u64 {
        if let Some(&ino) = self.path_id_to_ino.get(&path_id) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.ino_to_path_id.insert(ino, path_id);
        self.path_id_to_ino.insert(path_id, ino);
        ino
    }
}

/// Read-only FUSE view over a [`ControllerPool`].
///
/// Every call acquires a controller for its duration (`fuser` always dispatches one request at
/// a time per mount thread, so this never contends with itself on a single-threaded mount, and
/// is bounded by the pool's capacity on a `--multithreaded` one).
pub struct MirrorFilesystem<S: Source> {
    pool: ControllerPool<S>,
    connect: Box<dyn Fn() -> Result<crate::controller::Controller<S>> + Send + Sync>,
    inodes: std::sync::Mutex<InodeTable>,
    path_cache: std::sync::Mutex<HashMap<u64, String>>,
}

impl<S: Source> MirrorFilesystem<S> {
    /// `root_path_id` is the `pathId` of the already-bootstrapped remote root; `root_path` is
    /// always `"/"`. `connect` mints a fresh controller for the pool whenever demand exceeds
    /// what's idle.
    pub fn new(
        pool: ControllerPool<S>,
        root_path_id: i64,
        connect: impl Fn() -> Result<crate::controller::Controller<S>> + Send + Sync + 'static,
    ) -> Self {
        let mut path_cache = HashMap::new();
        path_cache.insert(ROOT_INODE, "/".to_string());
        MirrorFilesystem {
            pool,
            connect: Box::new(connect),
            inodes: std::sync::Mutex::new(InodeTable::new(root_path_id)),
            path_cache: std::sync::Mutex::new(path_cache),
        }
    }

    fn path_for_ino(&self, ino: u64) -> Option<String> {
        self.path_cache.lock().unwrap().get(&ino).cloned()
    }

    fn remember_path(&self, ino: u64, path: String) {
        self.path_cache.lock().unwrap().insert(ino, path);
    }

    fn to_file_attr(&self, ino: u64, stat: &Stat) -> FileAttr {
        let kind = match stat.path_type {
            PathType::Directory => FileType::Directory,
            PathType::File => FileType::RegularFile,
            PathType::Symlink => FileType::Symlink,
        };
        let atime = epoch_to_systemtime(stat.atime);
        let mtime = epoch_to_systemtime(stat.mtime);
        FileAttr {
            ino,
            size: stat.size,
            blocks: stat.blocks,
            atime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: (stat.mode & 0o7777) as u16,
            nlink: stat.nlink,
            uid: stat.uid,
            gid: stat.gid,
            rdev: 0,
            flags: 0,
            blksize: 4096,
        }
    }

    fn lookup_stat(&self, path: &str) -> Result<Option<(Stat, u64)>> {
        let mut lease = self.pool.acquire(|| (self.connect)())?;
        let stat = match lease.get_stat_for_path(path)? {
            Some(stat) => stat,
            None => return Ok(None),
        };
        let ino = self.inodes.lock().unwrap().ino_for(stat.path_id);
        self.remember_path(ino, path.to_string());
        Ok(Some((stat, ino)))
    }
}

fn epoch_to_systemtime(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs((-secs) as u64)
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

impl<S: Source> Filesystem for MirrorFilesystem<S> {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            reply.error(ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(ENOENT);
            return;
        };
        let path = child_path(&parent_path, name);

        match self.lookup_stat(&path) {
            Ok(Some((stat, ino))) => reply.entry(&ATTR_TTL, &self.to_file_attr(ino, &stat), 0),
            Ok(None) => reply.error(ENOENT),
            Err(err) => reply.error(err.as_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.lookup_stat(&path) {
            Ok(Some((stat, ino))) => reply.attr(&ATTR_TTL, &self.to_file_attr(ino, &stat)),
            Ok(None) => reply.error(ENOENT),
            Err(err) => reply.error(err.as_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };
        let result = (|| -> Result<String> {
            let mut lease = self.pool.acquire(|| (self.connect)())?;
            lease.get_symlink_target(&path)
        })();
        match result {
            Ok(target) => reply.data(target.as_bytes()),
            Err(err) => reply.error(err.as_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let result = (|| -> Result<Vec<u8>> {
            let mut lease = self.pool.acquire(|| (self.connect)())?;
            lease.read_data(&path, offset as u64, size as usize)
        })();
        match result {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.as_errno()),
        }
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(path) = self.path_for_ino(ino) else {
            reply.error(ENOENT);
            return;
        };

        let entries = (|| -> Result<Vec<crate::controller::DirEntry>> {
            let mut lease = self.pool.acquire(|| (self.connect)())?;
            lease.get_entries_in_directory(&path)
        })();

        let entries = match entries {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(err.as_errno());
                return;
            }
        };

        let mut rows: Vec<(u64, FileType, String)> = Vec::with_capacity(entries.len() + 2);
        rows.push((ino, FileType::Directory, ".".to_string()));
        rows.push((ino, FileType::Directory, "..".to_string()));
        {
            let mut inodes = self.inodes.lock().unwrap();
            for entry in &entries {
                let child_ino = inodes.ino_for(entry.path_id);
                let kind = match entry.path_type {
                    PathType::Directory => FileType::Directory,
                    PathType::File => FileType::RegularFile,
                    PathType::Symlink => FileType::Symlink,
                };
                rows.push((child_ino, kind, entry.basename.clone()));
                self.remember_path(child_ino, child_path(&path, &entry.basename));
            }
        }

        for (i, (entry_ino, kind, name)) in rows.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn destroy(&mut self) {
        self.pool.close();
    }
}
