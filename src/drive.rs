//! Round-based sync driver
//!
//! Thin policy layer over the session mechanism: one side pushes its tree,
//! the other reconciles. Each round exchanges trees, derives the same record
//! list on both ends, and transfers the files the records call for. A
//! directory added in one round has its contents transferred in the next,
//! so a sync converges after as many rounds as the new subtree is deep.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use filetime::{set_file_mtime, FileTime};
use tracing::{debug, info, warn};

use crate::diff::{diff_trees, ChangeKind, NodeDiff, NodeSnapshot};
use crate::error::{Error, Result};
use crate::protocol::DEFAULT_CHUNK_SIZE;
use crate::session::Session;
use crate::tree::DirectoryTree;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub chunk_size: u32,
    /// Delete receiver-side entries that the pusher no longer has.
    pub mirror: bool,
    pub max_rounds: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            chunk_size: DEFAULT_CHUNK_SIZE,
            mirror: false,
            max_rounds: 32,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub rounds: u32,
    pub files_sent: u64,
    pub files_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub deleted: u64,
}

/// True when the record calls for a file payload on the wire.
fn wants_transfer(record: &NodeDiff) -> bool {
    matches!(record.kind, ChangeKind::Added | ChangeKind::Modified)
        && record.new.as_ref().is_some_and(NodeSnapshot::is_file)
}

/// True when the receiving side still has work to do for this record. Both
/// ends evaluate this over identical records, so they agree on when to stop.
fn is_actionable(record: &NodeDiff) -> bool {
    matches!(record.kind, ChangeKind::Added | ChangeKind::Modified)
}

/// Runs blocking filesystem work (scans, hashing, diffs) off the async
/// workers so concurrently-running sessions keep making progress.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(Error::Io(io::Error::new(io::ErrorKind::Other, e))),
    }
}

/// Pushes `root` to the peer on the other end of `session` until the trees
/// agree. The remote side must be running [`serve_session`].
pub async fn push(session: &Session, root: &Path, opts: &SyncOptions) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    for round in 1..=opts.max_rounds {
        report.rounds = round;

        let scan_root = root.to_path_buf();
        let local = run_blocking(move || {
            let mut tree = DirectoryTree::scan(&scan_root)?;
            // The receiver compares same-size files by hash without access to
            // our disk, so every hash has to travel with the tree.
            // TODO: carry hashes forward from the previous round's tree when
            // size and mtime are unchanged, instead of re-reading every file
            // each round.
            tree.populate_hashes()?;
            Ok(tree)
        })
        .await?;
        session.send_tree(&local).await?;

        let remote = session.receive_tree(root).await?;
        let (records, local) = run_blocking(move || {
            let mut remote = remote;
            let mut local = local;
            let records = diff_trees(&mut remote, &mut local)?;
            Ok((records, local))
        })
        .await?;
        if !records.iter().any(is_actionable) {
            debug!(round, "push converged");
            break;
        }

        for record in records.iter().filter(|r| wants_transfer(r)) {
            let Some(snap) = record.new.as_ref() else {
                continue;
            };
            let node = local
                .get(&snap.path)
                .ok_or_else(|| Error::FileNotFound(root.join(&snap.path)))?;
            session.send_file(&local, node, opts.chunk_size).await?;
            report.files_sent += 1;
            report.bytes_sent += snap.size;
        }

        if round == opts.max_rounds {
            warn!(round, "round limit reached before convergence");
        }
    }
    Ok(report)
}

/// Serves one pushing peer: reconciles the local `root` with whatever the
/// remote sends, round by round, until the trees agree. The session is
/// closed when the sync ends, successfully or not.
pub async fn serve_session(
    session: Arc<Session>,
    root: PathBuf,
    opts: SyncOptions,
) -> Result<SyncReport> {
    let result = serve_rounds(&session, &root, &opts).await;
    session.close().await;
    result
}

async fn serve_rounds(
    session: &Arc<Session>,
    root: &Path,
    opts: &SyncOptions,
) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    for round in 1..=opts.max_rounds {
        report.rounds = round;

        let scan_root = root.to_path_buf();
        let local = run_blocking(move || DirectoryTree::scan(&scan_root)).await?;
        let remote = session.receive_tree(root).await?;
        let (records, local) = run_blocking(move || {
            let mut local = local;
            let mut remote = remote;
            let records = diff_trees(&mut local, &mut remote)?;
            Ok((records, local))
        })
        .await?;
        session.send_tree(&local).await?;

        let actionable = records.iter().any(is_actionable);
        if actionable {
            apply_records(session, &local, &records, &mut report).await?;
        }
        if opts.mirror {
            report.deleted += apply_deletes(root, &records);
        }
        if !actionable {
            debug!(round, "serve converged");
            break;
        }

        if round == opts.max_rounds {
            warn!(round, "round limit reached before convergence");
        }
    }
    info!(
        peer = %session.peer_addr(),
        rounds = report.rounds,
        files = report.files_received,
        bytes = report.bytes_received,
        deleted = report.deleted,
        "sync served"
    );
    Ok(report)
}

/// Walks the records in diff order, creating directories, replacing
/// type-changed entries, and receiving the file payloads the pusher sends in
/// the same order.
async fn apply_records(
    session: &Session,
    local: &DirectoryTree,
    records: &[NodeDiff],
    report: &mut SyncReport,
) -> Result<()> {
    let root = local.root_path();
    for record in records {
        if !is_actionable(record) {
            continue;
        }
        let Some(new) = record.new.as_ref() else {
            continue;
        };
        let abs = root.join(&new.path);

        if new.is_file() {
            // A directory in the way means the entry changed type; clear the
            // old subtree before writing.
            if abs.is_dir() {
                fs::remove_dir_all(&abs)?;
            }
            let written = session.receive_file(local).await?;
            if written != new.path {
                return Err(Error::wire(format!(
                    "peer sent {:?} where {:?} was expected",
                    written, new.path
                )));
            }
            let ft = FileTime::from_unix_time(
                new.mtime.div_euclid(1_000_000_000),
                new.mtime.rem_euclid(1_000_000_000) as u32,
            );
            let _ = set_file_mtime(&abs, ft);
            report.files_received += 1;
            report.bytes_received += new.size;
        } else {
            // Directory replacing a file: drop the file, then create. Its
            // contents arrive on the next round.
            if abs.is_file() {
                fs::remove_file(&abs)?;
            }
            fs::create_dir_all(&abs)?;
        }
    }
    Ok(())
}

/// Removes entries the pusher no longer has: files first, then directories
/// deepest-first. Individual failures are skipped, not fatal.
fn apply_deletes(root: &Path, records: &[NodeDiff]) -> u64 {
    let mut deleted = 0;
    let mut dirs: Vec<&NodeSnapshot> = Vec::new();
    for record in records {
        if record.kind != ChangeKind::Deleted {
            continue;
        }
        let Some(old) = record.old.as_ref() else {
            continue;
        };
        if old.is_file() {
            if fs::remove_file(root.join(&old.path)).is_ok() {
                deleted += 1;
            }
        } else {
            dirs.push(old);
        }
    }
    dirs.sort_by_key(|s| std::cmp::Reverse(s.path.components().count()));
    for dir in dirs {
        if fs::remove_dir_all(root.join(&dir.path)).is_ok() {
            deleted += 1;
        }
    }
    deleted
}
