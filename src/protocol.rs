//! Shared protocol constants for the treesync framed transport

/// Maximum serialized tree payload (64 MiB). A peer declaring more is cut off
/// before any payload byte is read.
pub const MAX_TREE_SIZE: u64 = 64 * 1024 * 1024;

/// Maximum single file chunk and maximum file header block (64 MiB).
pub const MAX_FILE_CHUNK_SIZE: u32 = 64 * 1024 * 1024;

/// Maximum directory nesting accepted by the scanner and the deserializer.
/// Trees deeper than this are rejected rather than risking unbounded
/// recursion on the decode path.
pub const MAX_TREE_DEPTH: usize = 128;

/// Default chunk size for file transfers (1 MiB).
pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 9310;
