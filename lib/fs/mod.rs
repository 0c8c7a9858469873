//! Filesystem core: inodes, buffers, and write-back for an object-store mount.
//!
//! # Consistency model
//!
//! The remote store accepts only whole-object (or whole-part) writes and has
//! no rename, so every POSIX mutation is buffered locally and replayed by a
//! background flusher. Conflict resolution is last-writer-wins: when the
//! remote ETag or size diverges from what we last observed, the local cache
//! for that inode is dropped and the remote version wins. Foreground
//! operations never block on conflicts.

/// Chunked buffer store backing each file.
pub mod buffer;
/// Process-wide filesystem state: inode table, config, flusher wiring.
pub mod blobfs;
/// Byte-addressable disk cache sink.
pub mod disk_cache;
/// Background write-back engine.
pub mod flusher;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to the inode core.
pub mod fuser;
/// File and directory nodes.
pub mod inode;
/// Blob metadata escaping and recognized attribute keys.
pub mod metadata;
/// Multipart upload bookkeeping.
pub mod multipart;

pub use blobfs::{BlobFs, FsConfig};
pub use inode::Inode;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Type representing an inode identifier.
pub type InodeId = u64;

/// The root inode id handed to the kernel. Allocation starts above it.
pub const ROOT_INO: InodeId = 1;

/// Type representing a file handle number.
pub type FileHandleId = u64;

/// Errors surfaced to the kernel, one variant per errno the core can return.
///
/// Backend failures are collapsed to [`FsError::Io`] at this boundary; the
/// richer taxonomy lives in [`crate::backend::BackendError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("no data available")]
    NoData,
    #[error("file exists")]
    Exists,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("function not implemented")]
    NotSupported,
    #[error("not a directory")]
    NotDirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("input/output error")]
    Io,
}

impl FsError {
    /// The errno value to reply to the kernel with.
    #[must_use]
    pub fn errno(self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::NoData => libc::ENODATA,
            Self::Exists => libc::EEXIST,
            Self::NotPermitted => libc::EPERM,
            Self::NotSupported => libc::ENOSYS,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::InvalidArgument => libc::EINVAL,
            Self::Io => libc::EIO,
        }
    }
}

bitflags::bitflags! {
    /// Flags for opening a file, mirroring unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;

        /// Synchronous writes.
        const SYNC = libc::O_SYNC;
        /// Do not follow symlinks.
        const NOFOLLOW = libc::O_NOFOLLOW;
        /// Fail if not a directory.
        const DIRECTORY = libc::O_DIRECTORY;
    }
}

/// A unix `st_mode` value: permission bits blended with type bits.
///
/// The whole blend is persisted to blob metadata as a single decimal
/// integer; symlink and device reinterpretation reads the type half back
/// out of it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileMode(u32);

impl FileMode {
    /// Permission bits, including sticky/setuid/setgid.
    pub const PERM_MASK: u32 = 0o7777;

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// The permission half of the mode.
    #[must_use]
    pub const fn perm(self) -> u32 {
        self.0 & Self::PERM_MASK
    }

    /// The type half of the mode (`S_IFMT` bits).
    #[must_use]
    pub const fn file_type(self) -> u32 {
        self.0 & libc::S_IFMT
    }

    #[must_use]
    pub const fn is_dir(self) -> bool {
        self.file_type() == libc::S_IFDIR
    }

    #[must_use]
    pub const fn is_symlink(self) -> bool {
        self.file_type() == libc::S_IFLNK
    }

    #[must_use]
    pub const fn is_device(self) -> bool {
        self.file_type() == libc::S_IFCHR || self.file_type() == libc::S_IFBLK
    }

    /// Replace the permission half, keeping the type half.
    #[must_use]
    pub const fn with_perm(self, perm: u32) -> Self {
        Self(self.file_type() | (perm & Self::PERM_MASK))
    }

    /// Replace the type half, keeping the permission half.
    #[must_use]
    pub const fn with_file_type(self, file_type: u32) -> Self {
        Self((self.0 & Self::PERM_MASK) | (file_type & libc::S_IFMT))
    }

    /// The `fuser` file type for this mode. Modes with no type bits are
    /// presented as regular files.
    #[must_use]
    pub fn kind(self) -> ::fuser::FileType {
        match self.file_type() {
            libc::S_IFDIR => ::fuser::FileType::Directory,
            libc::S_IFLNK => ::fuser::FileType::Symlink,
            libc::S_IFCHR => ::fuser::FileType::CharDevice,
            libc::S_IFBLK => ::fuser::FileType::BlockDevice,
            libc::S_IFIFO => ::fuser::FileType::NamedPipe,
            libc::S_IFSOCK => ::fuser::FileType::Socket,
            _ => ::fuser::FileType::RegularFile,
        }
    }
}

impl std::fmt::Debug for FileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileMode(0o{:o})", self.0)
    }
}

/// Size, times, and ownership for one inode. Freely copyable; no identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAttributes {
    pub size: u64,
    /// [`UNIX_EPOCH`] means "not yet known"; presentation substitutes the
    /// root's ctime so implicit directories show a stable timestamp.
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub mode: FileMode,
}

/// Local cache disposition of an inode relative to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CacheState {
    /// Mirrors remote; nothing to upload.
    Cached = 0,
    /// Exists only locally; must be created remotely.
    Created = 1,
    /// Exists remotely but carries local data and/or metadata changes.
    Modified = 2,
    /// Tombstoned locally; a remote delete is pending.
    Deleted = 3,
}

impl CacheState {
    #[must_use]
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Self::Created,
            2 => Self::Modified,
            3 => Self::Deleted,
            _ => Self::Cached,
        }
    }

    #[must_use]
    pub fn raw(self) -> i32 {
        self as i32
    }
}

/// Dirtiness of the user-metadata map, distinct from data dirtiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataDirty {
    /// In sync with the remote object.
    #[default]
    Clean,
    /// Fetched once but suspected stale; refresh on the next sync.
    NeedsRefresh,
    /// Modified locally; must be uploaded.
    LocalDirty,
}

/// Nanoseconds since the unix epoch, for atomically-stored timestamps.
#[must_use]
pub fn time_to_nanos(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

/// Inverse of [`time_to_nanos`].
#[must_use]
pub fn time_from_nanos(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_mode_splits_perm_and_type() {
        let mode = FileMode::from_bits(libc::S_IFREG | 0o644);
        assert_eq!(mode.perm(), 0o644);
        assert_eq!(mode.file_type(), libc::S_IFREG);
        assert!(!mode.is_dir());
        assert!(!mode.is_symlink());
    }

    #[test]
    fn file_mode_with_perm_keeps_type() {
        let mode = FileMode::from_bits(libc::S_IFDIR | 0o755).with_perm(0o700);
        assert_eq!(mode.bits(), libc::S_IFDIR | 0o700);
        assert!(mode.is_dir());
    }

    #[test]
    fn file_mode_with_type_keeps_perm() {
        let mode = FileMode::from_bits(0o644).with_file_type(libc::S_IFLNK);
        assert_eq!(mode.perm(), 0o644);
        assert!(mode.is_symlink());
    }

    #[test]
    fn device_modes_are_devices() {
        assert!(FileMode::from_bits(libc::S_IFCHR | 0o600).is_device());
        assert!(FileMode::from_bits(libc::S_IFBLK | 0o600).is_device());
        assert!(!FileMode::from_bits(libc::S_IFREG | 0o600).is_device());
    }

    #[test]
    fn nanos_round_trip() {
        let t = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(time_from_nanos(time_to_nanos(t)), t);
    }
}
