#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use blobfs::backend::memory::MemoryBackend;
use blobfs::backend::BlobItemOutput;
use blobfs::fs::{BlobFs, FsConfig};

/// A mounted filesystem over a shared in-memory backend.
pub struct Harness {
    pub fs: Arc<BlobFs>,
    pub backend: Arc<MemoryBackend>,
}

/// Mount a fresh in-memory backend.
pub async fn mount(config: FsConfig) -> Harness {
    let backend = Arc::new(MemoryBackend::new());
    let fs = BlobFs::new(config, backend.clone()).await;
    Harness { fs, backend }
}

/// Mount a second filesystem over an existing backend, simulating another
/// client of the same bucket.
pub async fn remount(config: FsConfig, backend: &Arc<MemoryBackend>) -> Harness {
    let fs = BlobFs::new(config, backend.clone()).await;
    Harness {
        fs,
        backend: Arc::clone(backend),
    }
}

/// Config with tiny multipart sizes so a handful of bytes exercises the
/// whole part machinery.
pub fn tiny_multipart_config() -> FsConfig {
    FsConfig {
        part_size: 8,
        multipart_threshold: 16,
        ..FsConfig::default()
    }
}

/// A listing observation with just the fields a test cares about.
pub fn blob_item(key: &str, size: u64, etag: Option<&str>) -> BlobItemOutput {
    BlobItemOutput {
        key: key.to_string(),
        size,
        etag: etag.map(str::to_string),
        last_modified: Some(SystemTime::now()),
        storage_class: Some("STANDARD".to_string()),
        metadata: None,
    }
}

/// Deterministic content for size `n`.
pub fn pattern(n: usize) -> Bytes {
    Bytes::from((0..n).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

/// Poll `check` until it returns true or the timeout trips.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
