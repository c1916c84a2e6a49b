//! treesync - directory synchronization over TCP
//!
//! `serve` hosts a root directory and reconciles it with whatever connected
//! peers push; `push` sends a local root to a serving peer.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use treesync::drive::{self, SyncOptions};
use treesync::protocol::{DEFAULT_CHUNK_SIZE, DEFAULT_PORT};
use treesync::Peer;

#[derive(Parser, Debug)]
#[command(author, version, about = "Directory synchronization between peers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and reconcile the root with pushing peers
    Serve {
        /// Root directory to serve
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Port to listen on
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Delete local entries the pusher no longer has
        #[arg(long)]
        mirror: bool,
    },

    /// Push a local root to a serving peer
    Push {
        /// Root directory to push
        root: PathBuf,

        /// Host to connect to
        host: String,

        /// Port to connect to
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// File transfer chunk size in bytes
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Serve { root, port, mirror } => serve(root, port, mirror).await,
        Command::Push {
            root,
            host,
            port,
            chunk_size,
        } => push(root, host, port, chunk_size).await,
    }
}

async fn serve(root: PathBuf, port: u16, mirror: bool) -> Result<()> {
    let root = root
        .canonicalize()
        .with_context(|| format!("root {} does not exist", root.display()))?;
    let peer = Peer::bind(port).context("bind listener")?;
    info!(addr = %peer.local_addr(), root = %root.display(), "serving");

    let opts = SyncOptions {
        mirror,
        ..SyncOptions::default()
    };
    peer.accept(move |session| {
        let root = root.clone();
        let opts = opts.clone();
        tokio::spawn(async move {
            let peer_addr = session.peer_addr();
            if let Err(e) = drive::serve_session(session, root, opts).await {
                error!(peer = %peer_addr, error = %e, "sync failed");
            }
        });
    })
    .context("start accept loop")?;

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    peer.shutdown().await;
    Ok(())
}

async fn push(root: PathBuf, host: String, port: u16, chunk_size: u32) -> Result<()> {
    let root = root
        .canonicalize()
        .with_context(|| format!("root {} does not exist", root.display()))?;
    let peer = Peer::bind(0).context("bind client port")?;
    let session = peer
        .connect(&host, port)
        .await
        .with_context(|| format!("connect to {host}:{port}"))?;

    let opts = SyncOptions {
        chunk_size,
        ..SyncOptions::default()
    };
    let report = drive::push(&session, &root, &opts).await?;
    session.close().await;

    println!(
        "synced in {} round(s): {} file(s), {} byte(s)",
        report.rounds, report.files_sent, report.bytes_sent
    );
    Ok(())
}
