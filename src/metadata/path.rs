//! The path-entry record and the type of node it describes.

/// Kind of filesystem node a [`PathEntry`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    Directory,
    File,
    Symlink,
}

impl PathType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathType::Directory => "directory",
            PathType::File => "file",
            PathType::Symlink => "symlink",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "directory" => Some(PathType::Directory),
            "file" => Some(PathType::File),
            "symlink" => Some(PathType::Symlink),
            _ => None,
        }
    }
}

/// A single materialised node in the mirrored tree.
///
/// `dirname` always ends in `/`; root's own `dirname` is `"/"` with an empty `basename`.
#[derive(Debug, Clone)]
pub struct PathEntry {
    pub path_id: i64,
    pub dirname: String,
    pub basename: String,
    pub path_type: PathType,
    pub size: u64,
    pub mode: u32,
    pub atime: i64,
    pub mtime: i64,
    pub is_synced: bool,
}

impl PathEntry {
    /// Full path reconstructed from `dirname` + `basename` (root is `"/"`).
    pub fn full_path(&self) -> String {
        if self.basename.is_empty() {
            self.dirname.clone()
        } else {
            format!("{}{}", self.dirname, self.basename)
        }
    }
}
