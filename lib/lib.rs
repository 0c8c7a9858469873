//! blobfs shared library.

/// Remote blob store contract and implementations.
pub mod backend;
/// Caching primitives for blobfs.
pub mod cache;
/// Filesystem core: inode cache and write-back.
pub mod fs;
