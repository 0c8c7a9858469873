//! In-process blob store.
//!
//! Implements the whole [`StorageBackend`] contract, including multipart
//! assembly and content-derived ETags, so the write-back machinery can be
//! exercised end to end without a network. Also serves `mem://` mounts.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use sha2::{Digest as _, Sha256};

use super::{
    BackendError, Capabilities, GetBlobOutput, HeadBlobOutput, PutBlobOutput, StorageBackend,
};

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    metadata: HashMap<String, String>,
    etag: String,
    last_modified: SystemTime,
    storage_class: String,
}

#[derive(Debug, Default)]
struct PendingUpload {
    key: String,
    metadata: HashMap<String, String>,
    parts: std::collections::BTreeMap<u32, (Bytes, String)>,
}

#[derive(Debug, Default)]
struct Store {
    blobs: HashMap<String, StoredBlob>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u64,
}

/// Counters for assertions in tests, in the spirit of the mock providers
/// under `tests/common`.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub head: AtomicU64,
    pub get: AtomicU64,
    pub put: AtomicU64,
    pub upload_part: AtomicU64,
    pub complete: AtomicU64,
    pub abort: AtomicU64,
    pub delete: AtomicU64,
}

/// An in-memory [`StorageBackend`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    store: Mutex<Store>,
    /// When set, every PUT and part upload fails with `Unavailable`.
    fail_writes: AtomicBool,
    pub calls: CallCounts,
}

fn content_etag(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut etag = String::with_capacity(34);
    etag.push('"');
    for byte in &digest[..16] {
        etag.push_str(&format!("{byte:02x}"));
    }
    etag.push('"');
    etag
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail, for error-surfacing tests.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Seed a blob directly, bypassing the PUT path.
    pub fn insert_blob(&self, key: &str, data: Bytes, metadata: HashMap<String, String>) -> String {
        let etag = content_etag(&data);
        let mut store = self.store.lock().expect("store lock");
        store.blobs.insert(
            key.to_string(),
            StoredBlob {
                data,
                metadata,
                etag: etag.clone(),
                last_modified: SystemTime::now(),
                storage_class: "STANDARD".to_string(),
            },
        );
        etag
    }

    #[must_use]
    pub fn blob_bytes(&self, key: &str) -> Option<Bytes> {
        self.store
            .lock()
            .expect("store lock")
            .blobs
            .get(key)
            .map(|b| b.data.clone())
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.store
            .lock()
            .expect("store lock")
            .blobs
            .contains_key(key)
    }

    #[must_use]
    pub fn open_uploads(&self) -> usize {
        self.store.lock().expect("store lock").uploads.len()
    }

    fn check_writable(&self) -> Result<(), BackendError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(BackendError::Unavailable("write failure injected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities { name: "mem" }
    }

    async fn head_blob(&self, key: &str) -> Result<HeadBlobOutput, BackendError> {
        self.calls.head.fetch_add(1, Ordering::Relaxed);
        let store = self.store.lock().expect("store lock");
        let blob = store
            .blobs
            .get(key)
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        Ok(HeadBlobOutput {
            key: key.to_string(),
            size: blob.data.len() as u64,
            etag: Some(blob.etag.clone()),
            last_modified: Some(blob.last_modified),
            storage_class: Some(blob.storage_class.clone()),
            metadata: blob.metadata.clone(),
        })
    }

    async fn get_blob(
        &self,
        key: &str,
        offset: u64,
        len: u64,
    ) -> Result<GetBlobOutput, BackendError> {
        self.calls.get.fetch_add(1, Ordering::Relaxed);
        let store = self.store.lock().expect("store lock");
        let blob = store
            .blobs
            .get(key)
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(blob.data.len());
        let end = start
            .saturating_add(usize::try_from(len).unwrap_or(usize::MAX))
            .min(blob.data.len());
        Ok(GetBlobOutput {
            data: blob.data.slice(start..end),
            etag: Some(blob.etag.clone()),
        })
    }

    async fn put_blob(
        &self,
        key: &str,
        data: Bytes,
        metadata: HashMap<String, String>,
    ) -> Result<PutBlobOutput, BackendError> {
        self.calls.put.fetch_add(1, Ordering::Relaxed);
        self.check_writable()?;
        let etag = self.insert_blob(key, data, metadata);
        Ok(PutBlobOutput { etag: Some(etag) })
    }

    async fn create_multipart(
        &self,
        key: &str,
        metadata: HashMap<String, String>,
    ) -> Result<String, BackendError> {
        self.check_writable()?;
        let mut store = self.store.lock().expect("store lock");
        store.next_upload += 1;
        let upload_id = format!("upload-{}", store.next_upload);
        store.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                metadata,
                parts: std::collections::BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_num: u32,
        data: Bytes,
    ) -> Result<String, BackendError> {
        self.calls.upload_part.fetch_add(1, Ordering::Relaxed);
        self.check_writable()?;
        let etag = content_etag(&data);
        let mut store = self.store.lock().expect("store lock");
        let upload = store
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| BackendError::NotFound(format!("upload {upload_id}")))?;
        if upload.key != key {
            return Err(BackendError::InvalidRequest(format!(
                "upload {upload_id} belongs to {}, not {key}",
                upload.key
            )));
        }
        upload.parts.insert(part_num, (data, etag.clone()));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<Option<String>, BackendError> {
        self.calls.complete.fetch_add(1, Ordering::Relaxed);
        self.check_writable()?;
        let mut store = self.store.lock().expect("store lock");
        let upload = store
            .uploads
            .remove(upload_id)
            .ok_or_else(|| BackendError::NotFound(format!("upload {upload_id}")))?;

        let mut assembled = BytesMut::new();
        for (num, etag) in parts {
            let (data, stored_etag) = upload.parts.get(num).ok_or_else(|| {
                BackendError::InvalidRequest(format!("part {num} was never uploaded"))
            })?;
            if stored_etag != etag {
                return Err(BackendError::InvalidRequest(format!(
                    "part {num} etag mismatch"
                )));
            }
            assembled.extend_from_slice(data);
        }

        let data = assembled.freeze();
        let etag = content_etag(&data);
        store.blobs.insert(
            key.to_string(),
            StoredBlob {
                data,
                metadata: upload.metadata,
                etag: etag.clone(),
                last_modified: SystemTime::now(),
                storage_class: "STANDARD".to_string(),
            },
        );
        Ok(Some(etag))
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<(), BackendError> {
        self.calls.abort.fetch_add(1, Ordering::Relaxed);
        self.store
            .lock()
            .expect("store lock")
            .uploads
            .remove(upload_id);
        Ok(())
    }

    async fn delete_blob(&self, key: &str) -> Result<(), BackendError> {
        self.calls.delete.fetch_add(1, Ordering::Relaxed);
        let mut store = self.store.lock().expect("store lock");
        store
            .blobs
            .remove(key)
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_head_round_trips_metadata() {
        let backend = MemoryBackend::new();
        let mut meta = HashMap::new();
        meta.insert("color".to_string(), "blue".to_string());
        let put = backend
            .put_blob("a/b", Bytes::from_static(b"hello"), meta)
            .await
            .unwrap();

        let head = backend.head_blob("a/b").await.unwrap();
        assert_eq!(head.size, 5);
        assert_eq!(head.etag, put.etag);
        assert_eq!(head.metadata.get("color").map(String::as_str), Some("blue"));
    }

    #[tokio::test]
    async fn etag_tracks_content() {
        let backend = MemoryBackend::new();
        let first = backend
            .put_blob("k", Bytes::from_static(b"one"), HashMap::new())
            .await
            .unwrap();
        let second = backend
            .put_blob("k", Bytes::from_static(b"two"), HashMap::new())
            .await
            .unwrap();
        assert_ne!(first.etag, second.etag, "etag must change with content");
    }

    #[tokio::test]
    async fn multipart_assembles_in_order() {
        let backend = MemoryBackend::new();
        let upload = backend
            .create_multipart("big", HashMap::new())
            .await
            .unwrap();
        let e1 = backend
            .upload_part("big", &upload, 1, Bytes::from_static(b"aaa"))
            .await
            .unwrap();
        let e2 = backend
            .upload_part("big", &upload, 2, Bytes::from_static(b"bb"))
            .await
            .unwrap();

        backend
            .complete_multipart("big", &upload, &[(1, e1), (2, e2)])
            .await
            .unwrap();
        assert_eq!(backend.blob_bytes("big").as_deref(), Some(&b"aaabb"[..]));
        assert_eq!(backend.open_uploads(), 0);
    }

    #[tokio::test]
    async fn abort_discards_parts() {
        let backend = MemoryBackend::new();
        let upload = backend.create_multipart("k", HashMap::new()).await.unwrap();
        backend
            .upload_part("k", &upload, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();
        backend.abort_multipart("k", &upload).await.unwrap();
        assert_eq!(backend.open_uploads(), 0);
        assert!(!backend.contains("k"));
    }

    #[tokio::test]
    async fn ranged_get_clamps_to_object() {
        let backend = MemoryBackend::new();
        backend.insert_blob("k", Bytes::from_static(b"0123456789"), HashMap::new());
        let out = backend.get_blob("k", 7, 10).await.unwrap();
        assert_eq!(&out.data[..], b"789");
    }

    #[tokio::test]
    async fn injected_failure_rejects_writes() {
        let backend = MemoryBackend::new();
        backend.set_fail_writes(true);
        let err = backend
            .put_blob("k", Bytes::new(), HashMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.errno(), libc::EIO);
    }
}
