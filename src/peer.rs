//! Process-level peer façade
//!
//! A `Peer` owns the listening acceptor, outbound resolution/connect, and the
//! registry of live sessions. Sessions run as tasks on the ambient tokio
//! runtime; the registry is the only state shared across them.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::Session;

pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    local_addr: SocketAddr,
    listener: parking_lot::Mutex<Option<TcpListener>>,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    sessions: parking_lot::Mutex<HashMap<u64, Arc<Session>>>,
    next_session_id: AtomicU64,
}

impl Peer {
    /// Binds a dual-stack (IPv6 with v4-mapped) listener on `port`, falling
    /// back to plain IPv4 on hosts without an IPv6 stack. Port 0 picks an
    /// ephemeral port; see [`Peer::local_addr`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(port: u16) -> Result<Self> {
        let listener = match bind_listener(Domain::IPV6, port) {
            Ok(listener) => listener,
            Err(_) => bind_listener(Domain::IPV4, port)?,
        };
        let local_addr = listener.local_addr().map_err(Error::Transport)?;
        info!(%local_addr, "peer listening");

        Ok(Peer {
            inner: Arc::new(PeerInner {
                local_addr,
                listener: parking_lot::Mutex::new(Some(listener)),
                accept_task: parking_lot::Mutex::new(None),
                sessions: parking_lot::Mutex::new(HashMap::new()),
                next_session_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Starts the accept loop. Every accepted connection is registered as a
    /// session and handed to `on_accept`, then the loop re-arms. An accept
    /// error stops the loop; existing sessions are unaffected.
    pub fn accept<F>(&self, mut on_accept: F) -> Result<()>
    where
        F: FnMut(Arc<Session>) + Send + 'static,
    {
        let listener = self.inner.listener.lock().take().ok_or_else(|| {
            Error::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "acceptor is closed or already armed",
            ))
        })?;

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let session = inner.register(stream, peer_addr);
                        on_accept(session);
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed, acceptor stopping");
                        break;
                    }
                }
            }
        });
        *self.inner.accept_task.lock() = Some(handle);
        Ok(())
    }

    /// Stops accepting new connections. Live sessions keep running.
    pub fn close_acceptor(&self) {
        self.inner.listener.lock().take();
        if let Some(task) = self.inner.accept_task.lock().take() {
            task.abort();
        }
    }

    /// Resolves `host` and connects to the first reachable address.
    pub async fn connect(&self, host: &str, port: u16) -> Result<Arc<Session>> {
        let addrs = lookup_host((host, port)).await.map_err(Error::Transport)?;
        let mut last_err: Option<io::Error> = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!(%addr, "connected");
                    return Ok(self.inner.register(stream, addr));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(Error::Transport(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
        })))
    }

    /// Closes every live session. Iterates over a snapshot because each close
    /// removes the session from the registry.
    pub async fn clear_sessions(&self) {
        let snapshot: Vec<Arc<Session>> = self.inner.sessions.lock().values().cloned().collect();
        for session in snapshot {
            session.close().await;
        }
    }

    /// Full teardown: stop accepting, then close all sessions.
    pub async fn shutdown(&self) {
        self.close_acceptor();
        self.clear_sessions().await;
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.close_acceptor();
    }
}

fn bind_listener(domain: Domain, port: u16) -> Result<TcpListener> {
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(Error::Transport)?;
    let addr: SocketAddr = if domain == Domain::IPV6 {
        socket.set_only_v6(false).map_err(Error::Transport)?;
        (Ipv6Addr::UNSPECIFIED, port).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, port).into()
    };
    socket.set_reuse_address(true).map_err(Error::Transport)?;
    socket.bind(&addr.into()).map_err(Error::Transport)?;
    socket.listen(1024).map_err(Error::Transport)?;
    socket.set_nonblocking(true).map_err(Error::Transport)?;
    TcpListener::from_std(socket.into()).map_err(Error::Transport)
}

impl PeerInner {
    fn register(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) -> Arc<Session> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<PeerInner> = Arc::downgrade(self);
        let session = Session::new(
            id,
            peer_addr,
            stream,
            Box::new(move |s| {
                if let Some(inner) = weak.upgrade() {
                    inner.sessions.lock().remove(&s.id());
                }
            }),
        );
        self.sessions.lock().insert(id, Arc::clone(&session));
        session
    }
}
