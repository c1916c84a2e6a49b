//! Primitive wire codec and tree serialization
//!
//! Codec-level integers are little-endian; outer frame lengths written by the
//! session layer are big-endian. Strings are a `u32` length followed by UTF-8
//! bytes. Paths travel in forward-slash form regardless of host OS.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::protocol::MAX_TREE_DEPTH;
use crate::tree::{DirectoryTree, FileMeta, Node, NodeData, NodeType, HASH_LEN};

pub fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_string(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

/// Sequential reader over a received payload. Every accessor fails with a
/// `Wire` error instead of panicking on truncated input.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::wire("unexpected end of input"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().expect("4-byte slice")))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("8-byte slice")))
    }

    pub fn i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes(b.try_into().expect("8-byte slice")))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| Error::wire("invalid UTF-8 in string"))
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Rejects trailing bytes after a complete decode.
    pub fn expect_end(&self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::wire(format!(
                "{} trailing bytes after payload",
                self.buf.len()
            )))
        }
    }
}

/// Renders a root-relative path in wire form (`/`-separated).
pub fn path_to_wire(path: &Path) -> Result<String> {
    let mut out = String::new();
    for comp in path.components() {
        let Component::Normal(seg) = comp else {
            return Err(Error::InvalidPath(path.to_path_buf()));
        };
        let seg = seg
            .to_str()
            .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))?;
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(seg);
    }
    Ok(out)
}

/// Parses a wire-form relative path, rejecting anything that could escape the
/// receiver's root: absolute paths, `.`/`..` segments, empty segments.
pub fn wire_to_path(s: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    if s.is_empty() {
        return Ok(out);
    }
    for seg in s.split('/') {
        if seg.is_empty() || seg == "." || seg == ".." {
            return Err(Error::wire(format!("unsafe path on wire: {s:?}")));
        }
        out.push(seg);
    }
    Ok(out)
}

fn serialize_node(out: &mut Vec<u8>, node: &Node) -> Result<()> {
    put_u8(out, node.node_type() as u8);
    put_i64(out, node.mtime);
    put_string(out, &node.name);
    put_string(out, &path_to_wire(&node.path)?);

    match &node.data {
        NodeData::File(meta) => {
            put_u64(out, meta.size);
            match &meta.file_hash {
                Some(hash) => {
                    put_u8(out, 1);
                    out.extend_from_slice(hash);
                }
                None => put_u8(out, 0),
            }
        }
        NodeData::Directory(children) => {
            put_u32(out, children.len() as u32);
            for child in children {
                serialize_node(out, child)?;
            }
        }
    }
    Ok(())
}

fn deserialize_node(r: &mut Reader<'_>, depth: usize) -> Result<Node> {
    if depth > MAX_TREE_DEPTH {
        return Err(Error::SizeLimit {
            what: "tree depth",
            size: depth as u64,
            max: MAX_TREE_DEPTH as u64,
        });
    }

    let node_type = match r.u8()? {
        0 => NodeType::File,
        1 => NodeType::Directory,
        t => return Err(Error::wire(format!("unknown node type tag {t}"))),
    };
    let mtime = r.i64()?;
    let name = r.string()?;
    let path = wire_to_path(&r.string()?)?;

    let data = match node_type {
        NodeType::File => {
            let size = r.u64()?;
            let file_hash = match r.u8()? {
                0 => None,
                1 => {
                    let raw = r.bytes(HASH_LEN)?;
                    Some(raw.try_into().expect("32-byte slice"))
                }
                t => return Err(Error::wire(format!("invalid hash flag {t}"))),
            };
            NodeData::File(FileMeta { size, file_hash })
        }
        NodeType::Directory => {
            let count = r.u32()?;
            let mut children = Vec::new();
            for _ in 0..count {
                children.push(deserialize_node(r, depth + 1)?);
            }
            NodeData::Directory(children)
        }
    };

    Ok(Node {
        name,
        path,
        mtime,
        data,
    })
}

/// Serializes a tree into `out` (cleared first). The tree's `root_path` does
/// not travel; the receiver supplies its own.
pub fn serialize_tree_into(tree: &DirectoryTree, out: &mut Vec<u8>) -> Result<()> {
    out.clear();
    serialize_node(out, tree.root())
}

pub fn serialize_tree(tree: &DirectoryTree) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    serialize_tree_into(tree, &mut out)?;
    Ok(out)
}

/// Decodes a serialized tree payload. Strict: the payload must contain exactly
/// one node, and its root must be a directory.
pub fn deserialize_tree(buf: &[u8]) -> Result<Node> {
    let mut r = Reader::new(buf);
    let root = deserialize_node(&mut r, 0)?;
    r.expect_end()?;
    if root.node_type() != NodeType::Directory {
        return Err(Error::wire("tree root is not a directory"));
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_node(name: &str, path: &str, size: u64, hash: Option<[u8; 32]>) -> Node {
        Node {
            name: name.to_string(),
            path: PathBuf::from(path),
            mtime: 1_700_000_000_000_000_000,
            data: NodeData::File(FileMeta {
                size,
                file_hash: hash,
            }),
        }
    }

    fn dir_node(name: &str, path: &str, children: Vec<Node>) -> Node {
        Node {
            name: name.to_string(),
            path: PathBuf::from(path),
            mtime: 1_700_000_000_000_000_000,
            data: NodeData::Directory(children),
        }
    }

    fn roundtrip(root: Node) -> Node {
        let mut buf = Vec::new();
        serialize_node(&mut buf, &root).unwrap();
        let mut r = Reader::new(&buf);
        let decoded = deserialize_node(&mut r, 0).unwrap();
        r.expect_end().unwrap();
        decoded
    }

    #[test]
    fn primitive_roundtrip() {
        let mut buf = Vec::new();
        put_u8(&mut buf, 7);
        put_u32(&mut buf, 0xDEAD_BEEF);
        put_u64(&mut buf, u64::MAX - 1);
        put_i64(&mut buf, -42);
        put_string(&mut buf, "héllo");

        let mut r = Reader::new(&buf);
        assert_eq!(r.u8().unwrap(), 7);
        assert_eq!(r.u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.u64().unwrap(), u64::MAX - 1);
        assert_eq!(r.i64().unwrap(), -42);
        assert_eq!(r.string().unwrap(), "héllo");
        r.expect_end().unwrap();
    }

    #[test]
    fn truncated_input_is_wire_error() {
        let mut buf = Vec::new();
        put_string(&mut buf, "abcdef");
        buf.truncate(6);
        let mut r = Reader::new(&buf);
        assert!(matches!(r.string(), Err(Error::Wire(_))));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut buf = Vec::new();
        put_u8(&mut buf, 1);
        let mut r = Reader::new(&buf);
        r.u8().unwrap();
        r.expect_end().unwrap();

        let mut r = Reader::new(&buf);
        assert!(matches!(r.expect_end(), Err(Error::Wire(_))));
    }

    #[test]
    fn node_roundtrip_with_and_without_hash() {
        let hashed = file_node("a.txt", "sub/a.txt", 12, Some([0xAB; 32]));
        let plain = file_node("b.txt", "sub/b.txt", 0, None);
        let root = dir_node("root", "", vec![dir_node("sub", "sub", vec![hashed, plain])]);

        let decoded = roundtrip(root.clone());
        assert_eq!(decoded, root);
    }

    #[test]
    fn deserialize_tree_rejects_file_root() {
        let mut buf = Vec::new();
        serialize_node(&mut buf, &file_node("f", "f", 1, None)).unwrap();
        assert!(matches!(deserialize_tree(&buf), Err(Error::Wire(_))));
    }

    #[test]
    fn unknown_type_tag_rejected() {
        let mut buf = Vec::new();
        put_u8(&mut buf, 9);
        let mut r = Reader::new(&buf);
        assert!(matches!(deserialize_node(&mut r, 0), Err(Error::Wire(_))));
    }

    #[test]
    fn over_deep_tree_rejected() {
        let mut node = dir_node("leaf", "leaf", Vec::new());
        for i in 0..(MAX_TREE_DEPTH + 1) {
            node = dir_node(&format!("d{i}"), &format!("d{i}"), vec![node]);
        }
        let mut buf = Vec::new();
        serialize_node(&mut buf, &node).unwrap();
        let mut r = Reader::new(&buf);
        assert!(matches!(
            deserialize_node(&mut r, 0),
            Err(Error::SizeLimit { .. })
        ));
    }

    #[test]
    fn wire_path_rejects_escapes() {
        assert!(wire_to_path("ok/nested/file.txt").is_ok());
        assert!(wire_to_path("").is_ok());
        assert!(wire_to_path("../evil").is_err());
        assert!(wire_to_path("a/../b").is_err());
        assert!(wire_to_path("/abs").is_err());
        assert!(wire_to_path("a//b").is_err());
        assert!(wire_to_path("./x").is_err());
    }

    #[test]
    fn path_wire_form_roundtrip() {
        let p = PathBuf::from("a/b/c.txt");
        let s = path_to_wire(&p).unwrap();
        assert_eq!(s, "a/b/c.txt");
        assert_eq!(wire_to_path(&s).unwrap(), p);

        assert_eq!(path_to_wire(Path::new("")).unwrap(), "");
    }
}
