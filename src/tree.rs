//! Filesystem tree model and scanner
//!
//! A `DirectoryTree` is built whole from a root directory and is read-only
//! afterwards, except for on-demand hash population inside `FileMeta`. A new
//! scan produces a new tree; nothing is refreshed in place.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::protocol::MAX_TREE_DEPTH;

pub const HASH_LEN: usize = 32;

/// SHA-256 digest of a file's contents.
pub type Hash = [u8; HASH_LEN];

/// Wire tag values: 0 = File, 1 = Directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    File = 0,
    Directory = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    pub file_hash: Option<Hash>,
}

impl FileMeta {
    /// Computes and caches the content hash, streaming in 1 MiB reads so the
    /// file never has to fit in memory. A second call is a no-op.
    pub(crate) fn ensure_hash(&mut self, abs_path: &Path) -> Result<()> {
        if self.file_hash.is_some() {
            return Ok(());
        }
        let mut file = fs::File::open(abs_path).map_err(|e| Error::from_open(e, abs_path))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 1024 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        self.file_hash = Some(hasher.finalize().into());
        Ok(())
    }
}

/// The payload distinguishing files from directories. The variant tag is the
/// node type; there is no separate type field to fall out of sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeData {
    File(FileMeta),
    Directory(Vec<Node>),
}

/// One entry in a scanned tree. `path` is relative to the owning tree's root
/// (empty at the root itself); `mtime` is nanoseconds since the UNIX epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub path: PathBuf,
    pub mtime: i64,
    pub data: NodeData,
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        match self.data {
            NodeData::File(_) => NodeType::File,
            NodeData::Directory(_) => NodeType::Directory,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.data, NodeData::Directory(_))
    }

    pub fn file_meta(&self) -> Option<&FileMeta> {
        match &self.data {
            NodeData::File(meta) => Some(meta),
            NodeData::Directory(_) => None,
        }
    }

    pub fn children(&self) -> &[Node] {
        match &self.data {
            NodeData::Directory(children) => children,
            NodeData::File(_) => &[],
        }
    }

    /// Computes the SHA-256 of this file node's contents under `root`,
    /// caching the result. Fails with `NotAFile` on a directory node.
    pub fn generate_hash(&mut self, root: &Path) -> Result<()> {
        match &mut self.data {
            NodeData::File(meta) => meta.ensure_hash(&root.join(&self.path)),
            NodeData::Directory(_) => Err(Error::NotAFile(root.join(&self.path))),
        }
    }
}

fn mtime_nanos(md: &fs::Metadata) -> Result<i64> {
    let modified = md.modified()?;
    Ok(match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    })
}

/// Open directory being assembled during a scan. Children arrive already in
/// canonical order because the walker sorts each directory's entries.
struct DirFrame {
    name: String,
    path: PathBuf,
    mtime: i64,
    children: Vec<Node>,
}

impl DirFrame {
    fn into_node(self) -> Node {
        Node {
            name: self.name,
            path: self.path,
            mtime: self.mtime,
            data: NodeData::Directory(self.children),
        }
    }
}

/// A canonically ordered snapshot of a directory subtree.
///
/// The tree exclusively owns its nodes. The index maps every node's relative
/// path to the child-index trail that reaches it from the root, so lookups
/// stay valid without holding references into the tree.
#[derive(Debug, Clone)]
pub struct DirectoryTree {
    root_path: PathBuf,
    root: Node,
    index: HashMap<PathBuf, Vec<u32>>,
}

impl DirectoryTree {
    /// Scans `root` into a new tree. `root` must exist and be a directory;
    /// anything else is `InvalidPath`. Entries that are neither regular files
    /// nor directories are skipped. Any I/O failure aborts the scan; a
    /// partial tree is never returned.
    pub fn scan(root: impl AsRef<Path>) -> Result<Self> {
        let root_path =
            fs::canonicalize(root.as_ref()).map_err(|_| Error::InvalidPath(root.as_ref().to_path_buf()))?;
        let md = fs::metadata(&root_path).map_err(|_| Error::InvalidPath(root_path.clone()))?;
        if !md.is_dir() {
            return Err(Error::InvalidPath(root_path));
        }

        let walker = WalkDir::new(&root_path)
            .follow_links(false)
            .sort_by(|a, b| {
                let a_dir = a.file_type().is_dir();
                let b_dir = b.file_type().is_dir();
                // Directories first, then byte-wise by name.
                b_dir.cmp(&a_dir).then_with(|| a.file_name().cmp(b.file_name()))
            });

        let mut frames: Vec<DirFrame> = Vec::new();
        let mut completed_root: Option<Node> = None;

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                match e.into_io_error() {
                    Some(io) => Error::Io(io),
                    None => Error::InvalidPath(path),
                }
            })?;

            let file_type = entry.file_type();
            if !file_type.is_dir() && !file_type.is_file() {
                debug!(path = %entry.path().display(), "skipping non-regular entry");
                continue;
            }

            let depth = entry.depth();
            if depth > MAX_TREE_DEPTH {
                return Err(Error::SizeLimit {
                    what: "tree depth",
                    size: depth as u64,
                    max: MAX_TREE_DEPTH as u64,
                });
            }

            while frames.len() > depth {
                if let Some(frame) = frames.pop() {
                    let node = frame.into_node();
                    match frames.last_mut() {
                        Some(parent) => parent.children.push(node),
                        None => completed_root = Some(node),
                    }
                }
            }

            let md = entry.metadata().map_err(|e| match e.into_io_error() {
                Some(io) => Error::Io(io),
                None => Error::InvalidPath(entry.path().to_path_buf()),
            })?;
            let mtime = mtime_nanos(&md)?;
            let name = entry
                .file_name()
                .to_str()
                .ok_or_else(|| Error::InvalidPath(entry.path().to_path_buf()))?
                .to_string();
            let rel = entry
                .path()
                .strip_prefix(&root_path)
                .map_err(|_| Error::InvalidPath(entry.path().to_path_buf()))?
                .to_path_buf();

            if file_type.is_dir() {
                frames.push(DirFrame {
                    name,
                    path: rel,
                    mtime,
                    children: Vec::new(),
                });
            } else {
                let node = Node {
                    name,
                    path: rel,
                    mtime,
                    data: NodeData::File(FileMeta {
                        size: md.len(),
                        file_hash: None,
                    }),
                };
                frames
                    .last_mut()
                    .ok_or_else(|| Error::InvalidPath(entry.path().to_path_buf()))?
                    .children
                    .push(node);
            }
        }

        while let Some(done) = frames.pop().map(DirFrame::into_node) {
            match frames.last_mut() {
                Some(parent) => parent.children.push(done),
                None => completed_root = Some(done),
            }
        }

        let root = completed_root.ok_or(Error::InvalidPath(root_path.clone()))?;
        Ok(Self::assemble(root_path, root))
    }

    /// Rebuilds a tree around a deserialized root node; the caller supplies
    /// the local root path the tree is anchored to.
    pub fn from_parts(root_path: impl Into<PathBuf>, root: Node) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::wire("tree root is not a directory"));
        }
        Ok(Self::assemble(root_path.into(), root))
    }

    fn assemble(root_path: PathBuf, root: Node) -> Self {
        let index = build_index(&root);
        DirectoryTree {
            root_path,
            root,
            index,
        }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub(crate) fn root_mut(&mut self) -> &mut Node {
        &mut self.root
    }

    pub fn node_count(&self) -> usize {
        self.index.len()
    }

    /// Looks up a node by its root-relative path.
    pub fn get(&self, rel: impl AsRef<Path>) -> Option<&Node> {
        let trail = self.index.get(rel.as_ref())?;
        let mut node = &self.root;
        for &i in trail {
            node = node.children().get(i as usize)?;
        }
        Some(node)
    }

    pub fn get_mut(&mut self, rel: impl AsRef<Path>) -> Option<&mut Node> {
        let trail = self.index.get(rel.as_ref())?.clone();
        let mut node = &mut self.root;
        for &i in &trail {
            node = match &mut node.data {
                NodeData::Directory(children) => children.get_mut(i as usize)?,
                NodeData::File(_) => return None,
            };
        }
        Some(node)
    }

    /// Fills the content hash of every file node. Done by a sender before
    /// shipping its tree, so the receiving side can compare same-size files
    /// without access to this side's disk.
    pub fn populate_hashes(&mut self) -> Result<()> {
        fn walk(node: &mut Node, root: &Path) -> Result<()> {
            match &mut node.data {
                NodeData::File(meta) => meta.ensure_hash(&root.join(&node.path))?,
                NodeData::Directory(children) => {
                    for child in children {
                        walk(child, root)?;
                    }
                }
            }
            Ok(())
        }
        let root_path = self.root_path.clone();
        walk(&mut self.root, &root_path)
    }
}

fn build_index(root: &Node) -> HashMap<PathBuf, Vec<u32>> {
    let mut index = HashMap::new();
    let mut stack: Vec<(&Node, Vec<u32>)> = vec![(root, Vec::new())];
    while let Some((node, trail)) = stack.pop() {
        if let NodeData::Directory(children) = &node.data {
            for (i, child) in children.iter().enumerate() {
                let mut t = trail.clone();
                t.push(i as u32);
                stack.push((child, t));
            }
        }
        index.insert(node.path.clone(), trail);
    }
    index
}
