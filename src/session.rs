//! Per-connection session protocol
//!
//! A `Session` wraps one reliable, ordered byte stream and exposes four
//! operations: tree send/receive and file send/receive. All four serialize on
//! a single async mutex over the session's I/O state, so at most one is ever
//! touching the stream; waiters suspend cooperatively and acquire in queue
//! order, which is exactly the byte order on the wire.
//!
//! Every failure inside an operation is fatal to the session: the socket is
//! dropped, the close callback fires once, and all later operations fail with
//! `SessionClosed`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{MAX_FILE_CHUNK_SIZE, MAX_TREE_SIZE};
use crate::tree::{DirectoryTree, Node};
use crate::wire;

/// Invoked exactly once when the session closes, whether explicitly or from
/// an operation failure.
pub type OnClose = Box<dyn FnOnce(&Session) + Send>;

/// Stream plus the session's reusable receive/send buffer. Present while the
/// session is open; `None` is the terminal closed state.
struct SessionIo {
    stream: TcpStream,
    buf: Vec<u8>,
}

pub struct Session {
    id: u64,
    peer_addr: SocketAddr,
    io: Mutex<Option<SessionIo>>,
    closed: AtomicBool,
    on_close: parking_lot::Mutex<Option<OnClose>>,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        peer_addr: SocketAddr,
        stream: TcpStream,
        on_close: OnClose,
    ) -> Arc<Self> {
        debug!(session = id, peer = %peer_addr, "session open");
        Arc::new(Session {
            id,
            peer_addr,
            io: Mutex::new(Some(SessionIo {
                stream,
                buf: Vec::new(),
            })),
            closed: AtomicBool::new(false),
            on_close: parking_lot::Mutex::new(Some(on_close)),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Serializes the tree and writes it as one length-framed message.
    pub async fn send_tree(&self, tree: &DirectoryTree) -> Result<()> {
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or(Error::SessionClosed)?;
        match send_tree_io(io, tree).await {
            Ok(()) => Ok(()),
            Err(e) => {
                guard.take();
                drop(guard);
                self.finish_close();
                Err(e)
            }
        }
    }

    /// Reads one tree message and rebuilds it around the caller's local root
    /// path (the root path never travels on the wire).
    pub async fn receive_tree(&self, root_path: impl Into<PathBuf>) -> Result<DirectoryTree> {
        let root_path = root_path.into();
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or(Error::SessionClosed)?;
        match receive_tree_io(io, root_path).await {
            Ok(tree) => Ok(tree),
            Err(e) => {
                guard.take();
                drop(guard);
                self.finish_close();
                Err(e)
            }
        }
    }

    /// Streams one file from `tree`'s root as a header frame followed by
    /// size-prefixed chunks. The declared size is the scan-time size; a file
    /// that shrank underneath us aborts the transfer (and the session).
    pub async fn send_file(
        &self,
        tree: &DirectoryTree,
        node: &Node,
        chunk_size: u32,
    ) -> Result<()> {
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or(Error::SessionClosed)?;
        match send_file_io(io, tree, node, chunk_size).await {
            Ok(()) => Ok(()),
            Err(e) => {
                guard.take();
                drop(guard);
                self.finish_close();
                Err(e)
            }
        }
    }

    /// Receives one file message into `tree`'s root, creating parent
    /// directories and truncating any existing file. Returns the relative
    /// path written; the caller decides when to re-scan.
    pub async fn receive_file(&self, tree: &DirectoryTree) -> Result<PathBuf> {
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or(Error::SessionClosed)?;
        match receive_file_io(io, tree).await {
            Ok(path) => Ok(path),
            Err(e) => {
                guard.take();
                drop(guard);
                self.finish_close();
                Err(e)
            }
        }
    }

    /// Closes the session. Idempotent; queued operations fail with
    /// `SessionClosed` once they acquire the lock.
    pub async fn close(&self) {
        let mut guard = self.io.lock().await;
        if guard.take().is_some() {
            drop(guard);
            self.finish_close();
        }
    }

    fn finish_close(&self) {
        self.closed.store(true, Ordering::Release);
        let callback = self.on_close.lock().take();
        debug!(session = self.id, peer = %self.peer_addr, "session closed");
        if let Some(callback) = callback {
            callback(self);
        }
    }
}

async fn send_tree_io(io: &mut SessionIo, tree: &DirectoryTree) -> Result<()> {
    wire::serialize_tree_into(tree, &mut io.buf)?;
    let len = io.buf.len() as u64;
    if len > MAX_TREE_SIZE {
        return Err(Error::SizeLimit {
            what: "tree message",
            size: len,
            max: MAX_TREE_SIZE,
        });
    }
    io.stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(Error::Transport)?;
    io.stream.write_all(&io.buf).await.map_err(Error::Transport)?;
    debug!(bytes = len, "tree sent");
    Ok(())
}

async fn receive_tree_io(io: &mut SessionIo, root_path: PathBuf) -> Result<DirectoryTree> {
    let mut len_buf = [0u8; 8];
    io.stream
        .read_exact(&mut len_buf)
        .await
        .map_err(Error::Transport)?;
    let len = u64::from_be_bytes(len_buf);
    if len > MAX_TREE_SIZE {
        return Err(Error::SizeLimit {
            what: "tree message",
            size: len,
            max: MAX_TREE_SIZE,
        });
    }

    io.buf.resize(len as usize, 0);
    io.stream
        .read_exact(&mut io.buf)
        .await
        .map_err(Error::Transport)?;
    let root = wire::deserialize_tree(&io.buf)?;
    debug!(bytes = len, "tree received");
    DirectoryTree::from_parts(root_path, root)
}

async fn send_file_io(
    io: &mut SessionIo,
    tree: &DirectoryTree,
    node: &Node,
    chunk_size: u32,
) -> Result<()> {
    if chunk_size == 0 || chunk_size > MAX_FILE_CHUNK_SIZE {
        return Err(Error::SizeLimit {
            what: "chunk size",
            size: u64::from(chunk_size),
            max: u64::from(MAX_FILE_CHUNK_SIZE),
        });
    }
    let abs = tree.root_path().join(&node.path);
    let meta = node.file_meta().ok_or_else(|| Error::NotAFile(abs.clone()))?;
    let file_size = meta.size;
    let mut file = fs::File::open(&abs)
        .await
        .map_err(|e| Error::from_open(e, &abs))?;

    let mut header = Vec::new();
    wire::put_string(&mut header, &wire::path_to_wire(&node.path)?);
    wire::put_u64(&mut header, file_size);
    io.stream
        .write_all(&(header.len() as u64).to_be_bytes())
        .await
        .map_err(Error::Transport)?;
    io.stream.write_all(&header).await.map_err(Error::Transport)?;

    let mut remaining = file_size;
    while remaining > 0 {
        let n = remaining.min(u64::from(chunk_size)) as usize;
        io.buf.resize(n, 0);
        file.read_exact(&mut io.buf[..n]).await?;
        io.stream
            .write_all(&(n as u32).to_be_bytes())
            .await
            .map_err(Error::Transport)?;
        io.stream
            .write_all(&io.buf[..n])
            .await
            .map_err(Error::Transport)?;
        remaining -= n as u64;
    }
    debug!(path = %node.path.display(), bytes = file_size, "file sent");
    Ok(())
}

async fn receive_file_io(io: &mut SessionIo, tree: &DirectoryTree) -> Result<PathBuf> {
    let mut len_buf = [0u8; 8];
    io.stream
        .read_exact(&mut len_buf)
        .await
        .map_err(Error::Transport)?;
    let hdr_len = u64::from_be_bytes(len_buf);
    if hdr_len > u64::from(MAX_FILE_CHUNK_SIZE) {
        return Err(Error::SizeLimit {
            what: "file header",
            size: hdr_len,
            max: u64::from(MAX_FILE_CHUNK_SIZE),
        });
    }
    io.buf.resize(hdr_len as usize, 0);
    io.stream
        .read_exact(&mut io.buf)
        .await
        .map_err(Error::Transport)?;

    let (rel_path, file_size) = parse_file_header(&io.buf)?;
    let abs = tree.root_path().join(&rel_path);
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = fs::File::create(&abs).await?;

    let mut received = 0u64;
    while received < file_size {
        let mut chunk_len_buf = [0u8; 4];
        io.stream
            .read_exact(&mut chunk_len_buf)
            .await
            .map_err(Error::Transport)?;
        let chunk_len = u32::from_be_bytes(chunk_len_buf);
        if chunk_len == 0 {
            return Err(Error::wire("zero-length file chunk"));
        }
        if chunk_len > MAX_FILE_CHUNK_SIZE {
            return Err(Error::SizeLimit {
                what: "file chunk",
                size: u64::from(chunk_len),
                max: u64::from(MAX_FILE_CHUNK_SIZE),
            });
        }
        if received + u64::from(chunk_len) > file_size {
            return Err(Error::wire("chunk overruns declared file size"));
        }

        io.buf.resize(chunk_len as usize, 0);
        io.stream
            .read_exact(&mut io.buf)
            .await
            .map_err(Error::Transport)?;
        file.write_all(&io.buf).await?;
        received += u64::from(chunk_len);
    }

    file.flush().await?;
    debug!(path = %rel_path.display(), bytes = file_size, "file received");
    Ok(rel_path)
}

fn parse_file_header(buf: &[u8]) -> Result<(PathBuf, u64)> {
    let mut r = wire::Reader::new(buf);
    let rel_path = wire::wire_to_path(&r.string()?)?;
    let file_size = r.u64()?;
    r.expect_end()?;
    if rel_path.as_os_str().is_empty() {
        return Err(Error::wire("empty file path on wire"));
    }
    Ok((rel_path, file_size))
}
