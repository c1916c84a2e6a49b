//! Deterministic tree diff with lazy content hashing
//!
//! Both inputs must be canonically ordered (the scanner and the deserializer
//! guarantee this). Output follows a pre-order traversal with sibling records
//! in canonical order. Hashing only happens for file pairs whose sizes match,
//! so unequal files never pay for a content read.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::Result;
use crate::tree::{DirectoryTree, Hash, Node, NodeData, NodeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
}

/// Flat point-in-time projection of a node, detached from the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub path: PathBuf,
    pub node_type: NodeType,
    pub mtime: i64,
    pub size: u64,
    pub file_hash: Option<Hash>,
}

impl NodeSnapshot {
    pub fn of(node: &Node) -> Self {
        let (size, file_hash) = match node.file_meta() {
            Some(meta) => (meta.size, meta.file_hash),
            None => (0, None),
        };
        NodeSnapshot {
            path: node.path.clone(),
            node_type: node.node_type(),
            mtime: node.mtime,
            size,
            file_hash,
        }
    }

    pub fn is_file(&self) -> bool {
        self.node_type == NodeType::File
    }
}

/// One reconciliation record. `Added` carries only `new`, `Deleted` only
/// `old`, `Modified` both. A File↔Directory change is a single `Modified`
/// record; the transfer layer treats it as delete + create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDiff {
    pub kind: ChangeKind,
    pub old: Option<NodeSnapshot>,
    pub new: Option<NodeSnapshot>,
}

impl NodeDiff {
    fn added(new: &Node) -> Self {
        NodeDiff {
            kind: ChangeKind::Added,
            old: None,
            new: Some(NodeSnapshot::of(new)),
        }
    }

    fn deleted(old: &Node) -> Self {
        NodeDiff {
            kind: ChangeKind::Deleted,
            old: Some(NodeSnapshot::of(old)),
            new: None,
        }
    }

    fn modified(old: &Node, new: &Node) -> Self {
        NodeDiff {
            kind: ChangeKind::Modified,
            old: Some(NodeSnapshot::of(old)),
            new: Some(NodeSnapshot::of(new)),
        }
    }
}

/// The ordering the scanner installs: directories before files, then
/// byte-wise by name.
fn canonical_cmp(a: &Node, b: &Node) -> Ordering {
    b.is_dir()
        .cmp(&a.is_dir())
        .then_with(|| a.name.as_bytes().cmp(b.name.as_bytes()))
}

/// Computes the records that turn `old` into `new`.
///
/// Trees are taken mutably because same-size file pairs get their hashes
/// populated in place; a hashing failure aborts the diff and no records are
/// returned. `mtime` is deliberately not a criterion.
pub fn diff_trees(old: &mut DirectoryTree, new: &mut DirectoryTree) -> Result<Vec<NodeDiff>> {
    let old_root_path = old.root_path().to_path_buf();
    let new_root_path = new.root_path().to_path_buf();
    let mut records = Vec::new();
    diff_children(
        old.root_mut(),
        new.root_mut(),
        &old_root_path,
        &new_root_path,
        &mut records,
    )?;
    Ok(records)
}

fn diff_children(
    old: &mut Node,
    new: &mut Node,
    old_root: &std::path::Path,
    new_root: &std::path::Path,
    records: &mut Vec<NodeDiff>,
) -> Result<()> {
    let (NodeData::Directory(old_kids), NodeData::Directory(new_kids)) =
        (&mut old.data, &mut new.data)
    else {
        return Ok(());
    };

    // Pairing is by name alone: names are unique within one directory, and a
    // type-changed entry lives in a different canonical bucket than its
    // counterpart, so list position cannot be trusted to line pairs up.
    let old_index: HashMap<String, usize> = old_kids
        .iter()
        .enumerate()
        .map(|(i, kid)| (kid.name.clone(), i))
        .collect();
    let mut old_pair: Vec<Option<usize>> = vec![None; old_kids.len()];
    let mut new_pair: Vec<Option<usize>> = vec![None; new_kids.len()];
    for (j, kid) in new_kids.iter().enumerate() {
        if let Some(&i) = old_index.get(&kid.name) {
            old_pair[i] = Some(j);
            new_pair[j] = Some(i);
        }
    }

    // Walk both sides in canonical order. A pair is handled when its
    // canonically-earlier member comes up; the partner is marked done and
    // skipped when the walk reaches it.
    let mut old_done = vec![false; old_kids.len()];
    let mut new_done = vec![false; new_kids.len()];
    let mut i = 0;
    let mut j = 0;
    loop {
        while i < old_kids.len() && old_done[i] {
            i += 1;
        }
        while j < new_kids.len() && new_done[j] {
            j += 1;
        }
        match (i < old_kids.len(), j < new_kids.len()) {
            (false, false) => break,
            (true, false) => {
                records.push(NodeDiff::deleted(&old_kids[i]));
                i += 1;
            }
            (false, true) => {
                records.push(NodeDiff::added(&new_kids[j]));
                j += 1;
            }
            (true, true) => {
                if old_kids[i].name == new_kids[j].name {
                    diff_pair(&mut old_kids[i], &mut new_kids[j], old_root, new_root, records)?;
                    i += 1;
                    j += 1;
                } else if canonical_cmp(&old_kids[i], &new_kids[j]) == Ordering::Less {
                    match old_pair[i] {
                        Some(pj) => {
                            new_done[pj] = true;
                            diff_pair(
                                &mut old_kids[i],
                                &mut new_kids[pj],
                                old_root,
                                new_root,
                                records,
                            )?;
                        }
                        None => records.push(NodeDiff::deleted(&old_kids[i])),
                    }
                    i += 1;
                } else {
                    match new_pair[j] {
                        Some(pi) => {
                            old_done[pi] = true;
                            diff_pair(
                                &mut old_kids[pi],
                                &mut new_kids[j],
                                old_root,
                                new_root,
                                records,
                            )?;
                        }
                        None => records.push(NodeDiff::added(&new_kids[j])),
                    }
                    j += 1;
                }
            }
        }
    }
    Ok(())
}

fn diff_pair(
    old: &mut Node,
    new: &mut Node,
    old_root: &std::path::Path,
    new_root: &std::path::Path,
    records: &mut Vec<NodeDiff>,
) -> Result<()> {
    if old.node_type() != new.node_type() {
        // File<->Directory change: one Modified record, no recursion.
        records.push(NodeDiff::modified(old, new));
        Ok(())
    } else if old.is_dir() {
        diff_children(old, new, old_root, new_root, records)
    } else {
        diff_file_pair(old, new, old_root, new_root, records)
    }
}

fn diff_file_pair(
    old: &mut Node,
    new: &mut Node,
    old_root: &std::path::Path,
    new_root: &std::path::Path,
    records: &mut Vec<NodeDiff>,
) -> Result<()> {
    let (old_size, new_size) = match (old.file_meta(), new.file_meta()) {
        (Some(a), Some(b)) => (a.size, b.size),
        _ => return Ok(()),
    };

    if old_size != new_size {
        records.push(NodeDiff::modified(old, new));
        return Ok(());
    }

    // Equal sizes: content is the tie-breaker. Hashes already present (e.g.
    // on a tree received from a remote peer) are reused as-is.
    old.generate_hash(old_root)?;
    new.generate_hash(new_root)?;
    let old_hash = old.file_meta().and_then(|m| m.file_hash);
    let new_hash = new.file_meta().and_then(|m| m.file_hash);
    if old_hash != new_hash {
        records.push(NodeDiff::modified(old, new));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn write_file(path: &Path, contents: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    fn scan(path: &Path) -> DirectoryTree {
        DirectoryTree::scan(path).unwrap()
    }

    #[test]
    fn empty_roots_diff_to_nothing() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let mut old = scan(a.path());
        let mut new = scan(b.path());
        assert!(diff_trees(&mut old, &mut new).unwrap().is_empty());
    }

    #[test]
    fn identical_trees_diff_to_nothing() {
        let a = tempfile::tempdir().unwrap();
        write_file(&a.path().join("x/y.txt"), b"same");
        write_file(&a.path().join("z.txt"), b"same too");

        let mut old = scan(a.path());
        let mut new = scan(a.path());
        assert!(diff_trees(&mut old, &mut new).unwrap().is_empty());
    }

    #[test]
    fn single_added_file_with_no_hashing() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_file(&b.path().join("hello.txt"), b"hi\n");

        let mut old = scan(a.path());
        let mut new = scan(b.path());
        let records = diff_trees(&mut old, &mut new).unwrap();

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.kind, ChangeKind::Added);
        assert!(record.old.is_none());
        let snap = record.new.as_ref().unwrap();
        assert_eq!(snap.path, PathBuf::from("hello.txt"));
        assert_eq!(snap.size, 3);
        assert!(snap.file_hash.is_none());
    }

    #[test]
    fn same_size_different_content_is_modified_with_hashes() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_file(&a.path().join("f"), b"aaaaa");
        write_file(&b.path().join("f"), b"bbbbb");

        let mut old = scan(a.path());
        let mut new = scan(b.path());
        let records = diff_trees(&mut old, &mut new).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ChangeKind::Modified);
        // Both sides were hashed to reach the verdict.
        assert!(old.get("f").unwrap().file_meta().unwrap().file_hash.is_some());
        assert!(new.get("f").unwrap().file_meta().unwrap().file_hash.is_some());
        assert_ne!(
            records[0].old.as_ref().unwrap().file_hash,
            records[0].new.as_ref().unwrap().file_hash
        );
    }

    #[test]
    fn same_size_same_content_emits_nothing_but_hashes() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_file(&a.path().join("f"), b"equal");
        write_file(&b.path().join("f"), b"equal");

        let mut old = scan(a.path());
        let mut new = scan(b.path());
        assert!(diff_trees(&mut old, &mut new).unwrap().is_empty());
        assert!(old.get("f").unwrap().file_meta().unwrap().file_hash.is_some());
    }

    #[test]
    fn different_sizes_never_hash() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_file(&a.path().join("f"), b"short");
        write_file(&b.path().join("f"), b"much longer");

        let mut old = scan(a.path());
        let mut new = scan(b.path());
        let records = diff_trees(&mut old, &mut new).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ChangeKind::Modified);
        assert!(old.get("f").unwrap().file_meta().unwrap().file_hash.is_none());
        assert!(new.get("f").unwrap().file_meta().unwrap().file_hash.is_none());
    }

    #[test]
    fn type_change_is_modified_without_recursion() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_file(&a.path().join("x"), b"");
        write_file(&b.path().join("x/y"), b"inside");

        let mut old = scan(a.path());
        let mut new = scan(b.path());
        let records = diff_trees(&mut old, &mut new).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ChangeKind::Modified);
        assert_eq!(records[0].old.as_ref().unwrap().node_type, NodeType::File);
        assert_eq!(
            records[0].new.as_ref().unwrap().node_type,
            NodeType::Directory
        );
        // No record for x/y: the pair did not recurse.
        assert!(!records
            .iter()
            .any(|r| r.new.as_ref().is_some_and(|s| s.path.ends_with("y"))));
    }

    #[test]
    fn type_change_pairs_across_canonical_buckets() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        // "a" changes Directory->File while "z" sorts into the directory
        // bucket ahead of it; the pair must still merge into one Modified.
        fs::create_dir(a.path().join("a")).unwrap();
        write_file(&a.path().join("b"), b"x");
        fs::create_dir(b.path().join("z")).unwrap();
        write_file(&b.path().join("a"), b"y");

        let mut old = scan(a.path());
        let mut new = scan(b.path());
        let records = diff_trees(&mut old, &mut new).unwrap();

        assert_eq!(records.len(), 3);
        let modified: Vec<_> = records
            .iter()
            .filter(|r| r.kind == ChangeKind::Modified)
            .collect();
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].old.as_ref().unwrap().path, PathBuf::from("a"));
        assert_eq!(
            modified[0].old.as_ref().unwrap().node_type,
            NodeType::Directory
        );
        assert_eq!(modified[0].new.as_ref().unwrap().node_type, NodeType::File);
        assert!(records.iter().any(|r| {
            r.kind == ChangeKind::Added
                && r.new.as_ref().unwrap().path == PathBuf::from("z")
        }));
        assert!(records.iter().any(|r| {
            r.kind == ChangeKind::Deleted
                && r.old.as_ref().unwrap().path == PathBuf::from("b")
        }));
    }

    #[test]
    fn added_directory_sorts_before_file_records() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_file(&a.path().join("b"), b"1");
        write_file(&a.path().join("a"), b"2");
        write_file(&b.path().join("b"), b"1");
        write_file(&b.path().join("a"), b"2");
        fs::create_dir(b.path().join("c")).unwrap();

        let mut old = scan(a.path());
        let mut new = scan(b.path());
        let names = |tree: &DirectoryTree| {
            tree.root()
                .children()
                .iter()
                .map(|c| c.name.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&old), ["a", "b"]);
        assert_eq!(names(&new), ["c", "a", "b"]);

        let records = diff_trees(&mut old, &mut new).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ChangeKind::Added);
        assert_eq!(records[0].new.as_ref().unwrap().path, PathBuf::from("c"));
    }

    #[test]
    fn diff_is_symmetric() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_file(&a.path().join("only_old.txt"), b"o");
        write_file(&a.path().join("shared"), b"aaaaa");
        write_file(&b.path().join("only_new.txt"), b"n");
        write_file(&b.path().join("shared"), b"bbbbb");

        let forward = {
            let mut old = scan(a.path());
            let mut new = scan(b.path());
            diff_trees(&mut old, &mut new).unwrap()
        };
        let backward = {
            let mut old = scan(b.path());
            let mut new = scan(a.path());
            diff_trees(&mut old, &mut new).unwrap()
        };

        assert_eq!(forward.len(), backward.len());
        for record in &forward {
            match record.kind {
                ChangeKind::Added => {
                    let snap = record.new.as_ref().unwrap();
                    assert!(backward.iter().any(|r| {
                        r.kind == ChangeKind::Deleted && r.old.as_ref() == Some(snap)
                    }));
                }
                ChangeKind::Deleted => {
                    let snap = record.old.as_ref().unwrap();
                    assert!(backward.iter().any(|r| {
                        r.kind == ChangeKind::Added && r.new.as_ref() == Some(snap)
                    }));
                }
                ChangeKind::Modified => {
                    assert!(backward.iter().any(|r| {
                        r.kind == ChangeKind::Modified
                            && r.old == record.new
                            && r.new == record.old
                    }));
                }
            }
        }
    }

    #[test]
    fn nested_changes_come_out_in_preorder() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_file(&a.path().join("dir/keep"), b"k");
        write_file(&b.path().join("dir/keep"), b"k");
        write_file(&b.path().join("dir/new_inner"), b"ni");
        write_file(&b.path().join("new_top"), b"nt");

        let mut old = scan(a.path());
        let mut new = scan(b.path());
        let records = diff_trees(&mut old, &mut new).unwrap();

        let paths: Vec<_> = records
            .iter()
            .map(|r| r.new.as_ref().unwrap().path.clone())
            .collect();
        assert_eq!(
            paths,
            vec![PathBuf::from("dir/new_inner"), PathBuf::from("new_top")]
        );
    }
}
