//! Byte-addressable disk cache sink.
//!
//! One cache file per inode, addressed positionally. Callers perform cache
//! I/O with the inode lock dropped, the same as remote calls; the handle is
//! cheap to clone into blocking tasks.

use std::io;
use std::os::unix::fs::FileExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use super::InodeId;

/// Positional I/O over one inode's cache file.
#[derive(Debug, Clone)]
pub struct DiskCache {
    file: Arc<std::fs::File>,
    path: PathBuf,
}

impl DiskCache {
    /// Open (or create) the cache file for `ino` under `dir`.
    pub async fn open(dir: &Path, ino: InodeId) -> io::Result<Self> {
        let path = dir.join(format!("{ino:016x}"));
        let open_path = path.clone();
        let file = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&open_path)
        })
        .await
        .map_err(|e| io::Error::other(e))??;
        Ok(Self {
            file: Arc::new(file),
            path,
        })
    }

    pub async fn read_at(&self, offset: u64, len: u64) -> io::Result<Bytes> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; usize::try_from(len).unwrap_or(usize::MAX)];
            file.read_exact_at(&mut buf, offset)?;
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(|e| io::Error::other(e))?
    }

    pub async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.write_all_at(&data, offset))
            .await
            .map_err(|e| io::Error::other(e))?
    }

    pub async fn truncate(&self, len: u64) -> io::Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.set_len(len))
            .await
            .map_err(|e| io::Error::other(e))?
    }

    /// Delete the cache file; the handle must not be used afterwards.
    pub async fn remove(self) -> io::Result<()> {
        let path = self.path;
        tokio::task::spawn_blocking(move || match std::fs::remove_file(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        })
        .await
        .map_err(|e| io::Error::other(e))?
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn positional_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DiskCache::open(dir.path(), 42).await.expect("open");

        cache
            .write_at(4096, Bytes::from_static(b"cached bytes"))
            .await
            .expect("write");
        let back = cache.read_at(4096, 12).await.expect("read");
        assert_eq!(&back[..], b"cached bytes");
    }

    #[tokio::test]
    async fn truncate_discards_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DiskCache::open(dir.path(), 7).await.expect("open");
        cache
            .write_at(0, Bytes::from_static(b"0123456789"))
            .await
            .expect("write");
        cache.truncate(4).await.expect("truncate");

        assert!(
            cache.read_at(0, 10).await.is_err(),
            "reading past the truncation point should fail"
        );
        let head = cache.read_at(0, 4).await.expect("read head");
        assert_eq!(&head[..], b"0123");
    }

    #[tokio::test]
    async fn remove_is_idempotent_about_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DiskCache::open(dir.path(), 1).await.expect("open");
        let path = cache.path().to_path_buf();
        std::fs::remove_file(&path).expect("remove underneath");
        cache.remove().await.expect("remove should tolerate ENOENT");
    }
}
