//! Remote blob store contract.
//!
//! The core consumes exactly this surface: HEAD, ranged GET, whole-object
//! PUT, the multipart lifecycle, and DELETE. Real stores (S3, GCS, …) plug
//! in behind [`StorageBackend`]; [`memory::MemoryBackend`] implements the
//! full contract in-process for tests and `mem://` mounts.

/// In-process backend implementing the full contract.
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

/// What a backend calls itself. The name namespaces xattrs: `s3.etag`
/// addresses the backend-metadata map on an S3 mount, `gcs.etag` on GCS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub name: &'static str,
}

/// Backend failure taxonomy. Transient failures are retried inside the
/// backend; what escapes here is terminal for the attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend failed to initialize: {0}")]
    Init(String),
}

impl BackendError {
    /// The errno this failure maps to at the FUSE boundary.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::AccessDenied(_) => libc::EACCES,
            Self::InvalidRequest(_) => libc::EINVAL,
            Self::Unavailable(_) | Self::Init(_) => libc::EIO,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// HEAD response.
#[derive(Debug, Clone)]
pub struct HeadBlobOutput {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
    pub storage_class: Option<String>,
    /// Raw (escaped) user metadata as stored.
    pub metadata: HashMap<String, String>,
}

/// One observed listing entry, fed into inode reconciliation.
#[derive(Debug, Clone, Default)]
pub struct BlobItemOutput {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
    pub storage_class: Option<String>,
    /// Raw metadata when the observation carried it (HEAD does; most
    /// listings do not).
    pub metadata: Option<HashMap<String, String>>,
}

impl From<&HeadBlobOutput> for BlobItemOutput {
    fn from(head: &HeadBlobOutput) -> Self {
        Self {
            key: head.key.clone(),
            size: head.size,
            etag: head.etag.clone(),
            last_modified: head.last_modified,
            storage_class: head.storage_class.clone(),
            metadata: Some(head.metadata.clone()),
        }
    }
}

/// Ranged GET response.
#[derive(Debug, Clone)]
pub struct GetBlobOutput {
    pub data: Bytes,
    pub etag: Option<String>,
}

/// PUT response.
#[derive(Debug, Clone)]
pub struct PutBlobOutput {
    pub etag: Option<String>,
}

/// The contract every remote store implements.
///
/// Every method is a suspension point for the core: callers snapshot state,
/// drop their locks, await, and revalidate on return.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    fn capabilities(&self) -> Capabilities;

    /// One-time setup (credential checks, bucket probes). Called through
    /// [`InitWrapper`]; implementations may assume at-most-once execution.
    async fn init(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn head_blob(&self, key: &str) -> Result<HeadBlobOutput, BackendError>;

    /// Read `len` bytes at `offset`. Short reads happen at end of object.
    async fn get_blob(&self, key: &str, offset: u64, len: u64)
    -> Result<GetBlobOutput, BackendError>;

    async fn put_blob(
        &self,
        key: &str,
        data: Bytes,
        metadata: HashMap<String, String>,
    ) -> Result<PutBlobOutput, BackendError>;

    /// Open a multipart upload; returns the upload token.
    async fn create_multipart(
        &self,
        key: &str,
        metadata: HashMap<String, String>,
    ) -> Result<String, BackendError>;

    /// Upload one part; returns its ETag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_num: u32,
        data: Bytes,
    ) -> Result<String, BackendError>;

    /// Assemble the object from the ordered `(part number, etag)` list;
    /// returns the final object ETag.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<Option<String>, BackendError>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), BackendError>;

    async fn delete_blob(&self, key: &str) -> Result<(), BackendError>;
}

/// Lazily-initialized backend binding for a mount point.
///
/// The first caller that needs the backend runs [`StorageBackend::init`];
/// everyone else awaits the same result. A failed init is sticky — the
/// mount surfaces errors rather than retrying setup on every operation —
/// and an errored binding is treated as prefix-oblivious by path
/// resolution.
pub struct InitWrapper {
    inner: Arc<dyn StorageBackend>,
    init: tokio::sync::OnceCell<Result<(), BackendError>>,
}

impl InitWrapper {
    #[must_use]
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            init: tokio::sync::OnceCell::new(),
        }
    }

    /// Run init exactly once and replay its verdict.
    pub async fn ensure_init(&self) -> Result<(), BackendError> {
        self.init
            .get_or_init(|| async { self.inner.init().await })
            .await
            .clone()
    }

    /// Whether init already ran and failed.
    #[must_use]
    pub fn init_failed(&self) -> bool {
        matches!(self.init.get(), Some(Err(_)))
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.inner
    }
}

impl std::fmt::Debug for InitWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitWrapper")
            .field("backend", &self.inner.capabilities().name)
            .field("init_failed", &self.init_failed())
            .finish()
    }
}
