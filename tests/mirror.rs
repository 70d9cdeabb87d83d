//! End-to-end exercises of the controller/metadata/target stack through the public API, in the
//! style of the fixture-per-module integration tests this crate's FUSE facade sits on top of.

use std::collections::HashMap;

use mirrorfs::controller::Controller;
use mirrorfs::error::{Error, Result};
use mirrorfs::metadata::MetadataStore;
use mirrorfs::source::{RemoteDirEntry, RemoteEntry, Source};
use mirrorfs::target::Target;
use tempfile::TempDir;

#[derive(Clone)]
struct Node {
    data: Vec<u8>,
    mode: u32,
    children: Vec<String>,
    link_target: Option<String>,
}

/// An in-memory remote tree, standing in for a real SFTP server.
struct FakeSource {
    nodes: HashMap<String, Node>,
}

impl FakeSource {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            "/".to_string(),
            Node { data: vec![], mode: libc::S_IFDIR | 0o755, children: vec![], link_target: None },
        );
        FakeSource { nodes }
    }

    fn dir(mut self, path: &str, children: &[&str]) -> Self {
        self.nodes.insert(
            path.to_string(),
            Node {
                data: vec![],
                mode: libc::S_IFDIR | 0o755,
                children: children.iter().map(|s| s.to_string()).collect(),
                link_target: None,
            },
        );
        self
    }

    fn file(mut self, path: &str, data: &[u8]) -> Self {
        self.nodes.insert(
            path.to_string(),
            Node { data: data.to_vec(), mode: libc::S_IFREG | 0o644, children: vec![], link_target: None },
        );
        self
    }

    fn symlink(mut self, path: &str, target: &str) -> Self {
        self.nodes.insert(
            path.to_string(),
            Node { data: vec![], mode: libc::S_IFLNK | 0o777, children: vec![], link_target: Some(target.to_string()) },
        );
        self
    }
}

impl Source for FakeSource {
    fn get_entry(&mut self, path: &str) -> Result<Option<RemoteEntry>> {
        Ok(self
            .nodes
            .get(path)
            .map(|n| RemoteEntry { mode: n.mode, size: n.data.len() as u64, atime: 0, mtime: 0 }))
    }

    fn get_directory_entries(&mut self, path: &str) -> Result<Vec<RemoteDirEntry>> {
        let key = path.trim_end_matches('/');
        let key = if key.is_empty() { "/" } else { key };
        let node = self.nodes.get(key).cloned().ok_or_else(|| Error::NotFound(path.to_string()))?;
        Ok(node
            .children
            .iter()
            .map(|name| {
                let child_path = if key == "/" { format!("/{name}") } else { format!("{key}/{name}") };
                let child = self.nodes.get(&child_path).unwrap();
                RemoteDirEntry {
                    filename: name.clone(),
                    entry: RemoteEntry { mode: child.mode, size: child.data.len() as u64, atime: 0, mtime: 0 },
                }
            })
            .collect())
    }

    fn get_link_target(&mut self, path: &str) -> Result<String> {
        self.nodes.get(path).and_then(|n| n.link_target.clone()).ok_or_else(|| Error::NotFound(path.to_string()))
    }

    fn read_data(&mut self, path: &str, offset: u64, size: usize) -> Result<Vec<u8>> {
        let node = self.nodes.get(path).ok_or_else(|| Error::NotFound(path.to_string()))?;
        let offset = offset as usize;
        let available = node.data.len().saturating_sub(offset);
        let want = size.min(available);
        Ok(node.data[offset..offset + want].to_vec())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct Fixture {
    _dir: TempDir,
    controller: Controller<FakeSource>,
}

impl Fixture {
    fn new(source: FakeSource) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let target = Target::open(dir.path()).expect("open target");
        let metadata = MetadataStore::open(&target.db_path()).expect("open metadata store");
        let controller =
            Controller::new(source, target, metadata, Some("sftp://user@host/srv")).expect("bootstrap controller");
        Fixture { _dir: dir, controller }
    }
}

#[test]
fn reading_a_nested_file_lazily_registers_its_ancestors() {
    let source = FakeSource::new().dir("/", &["a"]).dir("/a", &["b"]).dir("/a/b", &["c.txt"]).file("/a/b/c.txt", b"hello world");
    let mut fixture = Fixture::new(source);

    let data = fixture.controller.read_data("/a/b/c.txt", 0, 11).unwrap();
    assert_eq!(data, b"hello world");

    // every ancestor directory got registered along the way, but only "a/b" itself was listed
    assert!(fixture.controller.get_path("/a").unwrap().is_some());
    assert!(fixture.controller.get_path("/a/b").unwrap().is_some());
    let a = fixture.controller.get_path("/a").unwrap().unwrap();
    assert!(!a.is_synced);
}

#[test]
fn directory_listing_surfaces_mixed_entry_types() {
    let source = FakeSource::new()
        .dir("/", &["dir", "file.txt", "link"])
        .dir("/dir", &[])
        .file("/file.txt", b"contents")
        .symlink("/link", "/file.txt");
    let mut fixture = Fixture::new(source);

    let entries = fixture.controller.get_entries_in_directory("/").unwrap();
    let mut names: Vec<_> = entries.iter().map(|e| e.basename.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["dir", "file.txt", "link"]);

    assert_eq!(fixture.controller.get_symlink_target("/link").unwrap(), "/file.txt");
}

#[test]
fn stat_reflects_remote_size_before_any_bytes_are_fetched() {
    let source = FakeSource::new().dir("/", &["big.bin"]).file("/big.bin", &[7u8; 4096]);
    let mut fixture = Fixture::new(source);

    let stat = fixture.controller.get_stat_for_path("/big.bin").unwrap().unwrap();
    assert_eq!(stat.size, 4096);
    assert_eq!(stat.blocks, 8);

    let entry = fixture.controller.get_path("/big.bin").unwrap().unwrap();
    assert!(!entry.is_synced);
}

#[test]
fn reopening_the_same_mirror_without_a_source_uri_reuses_the_recorded_one() {
    let dir = TempDir::new().unwrap();
    {
        let target = Target::open(dir.path()).unwrap();
        let metadata = MetadataStore::open(&target.db_path()).unwrap();
        let source = FakeSource::new().dir("/", &["x"]).file("/x", b"data");
        let mut controller =
            Controller::new(source, target, metadata, Some("sftp://user@host/srv")).unwrap();
        controller.read_data("/x", 0, 4).unwrap();
    }

    let target = Target::open(dir.path()).unwrap();
    let metadata = MetadataStore::open(&target.db_path()).unwrap();
    let source = FakeSource::new().dir("/", &["x"]).file("/x", b"data");
    let mut controller = Controller::new(source, target, metadata, None).unwrap();

    let entry = controller.get_path("/x").unwrap().unwrap();
    assert!(entry.is_synced);
}
