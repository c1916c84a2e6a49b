//! Treesync Library
//!
//! Directory subtree synchronization between two peers over TCP. Each side
//! scans a root into a canonically ordered tree, exchanges trees, computes
//! the differences with lazy content hashing, and transfers the files needed
//! to reconcile.

pub mod diff;
pub mod drive;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod tree;
pub mod wire;

pub use diff::{diff_trees, ChangeKind, NodeDiff, NodeSnapshot};
pub use error::{Error, Result};
pub use peer::Peer;
pub use session::Session;
pub use tree::{DirectoryTree, FileMeta, Hash, Node, NodeData, NodeType};
