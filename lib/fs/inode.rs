//! File and directory nodes.
//!
//! An [`Inode`] is shared between the FUSE dispatch path, the background
//! flusher, and the memory-pressure evictor. The mutable core lives behind
//! one async mutex; a handful of hot fields (refcount, open-handle count,
//! attribute-cache expiry, cache state) are atomics so the dispatch path can
//! consult them without the lock. Every remote call is made with the lock
//! dropped — callers snapshot what they need, await, and revalidate against
//! dirty ids or the known ETag when they reacquire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Instant, SystemTime};

use bytes::{Bytes, BytesMut};
use tokio::sync::{Mutex, MutexGuard, Notify};
use tracing::{debug, error, trace, warn};

use crate::backend::{BlobItemOutput, HeadBlobOutput, InitWrapper, StorageBackend};
use crate::fs::blobfs::BlobFs;
use crate::fs::buffer::{BufferList, RangeSegment};
use crate::fs::disk_cache::DiskCache;
use crate::fs::metadata::{apply_user_metadata, unescape_metadata};
use crate::fs::multipart::MultipartUpload;
use crate::fs::{
    CacheState, FileHandleId, FileMode, FsError, InodeAttributes, InodeId, MetadataDirty,
    time_from_nanos, time_to_nanos,
};

#[expect(clippy::cast_sign_loss, reason = "libc xattr flags are small positives")]
const XATTR_CREATE: u32 = libc::XATTR_CREATE as u32;
#[expect(clippy::cast_sign_loss, reason = "libc xattr flags are small positives")]
const XATTR_REPLACE: u32 = libc::XATTR_REPLACE as u32;

/// The backend a directory subtree is mounted against, plus the key prefix
/// all of its paths live under.
#[derive(Clone)]
pub struct MountBinding {
    pub wrapper: Arc<InitWrapper>,
    pub prefix: String,
}

/// Directory-only state: the child table and listing bookkeeping.
#[derive(Default)]
pub struct DirInodeData {
    /// Child name to inode. Presence here holds one kernel-style reference
    /// on the child.
    pub children: HashMap<String, Arc<Inode>>,
    /// How many descendants currently carry local modifications; directory
    /// listings consult this to know they cannot be served purely remotely.
    pub modified_children: i64,
    /// Offset cookie of the last readdir round, for cursor invalidation.
    pub readdir_cursor: u64,
}

/// Mutable inode state guarded by the inode mutex.
pub struct InodeState {
    pub attrs: InodeAttributes,
    /// Directory inferred from children rather than an explicit object.
    pub implicit_dir: bool,
    pub dir: Option<DirInodeData>,
    pub buffers: BufferList,
    pub disk_cache: Option<DiskCache>,
    pub mpu: Option<MultipartUpload>,
    /// `None` until fetched or locally created; an absent map routes user
    /// xattrs to ENOSYS.
    pub user_metadata: Option<HashMap<String, Vec<u8>>>,
    /// Backend-namespace xattrs (etag, storage class).
    pub s3_metadata: HashMap<String, Vec<u8>>,
    pub metadata_dirty: MetadataDirty,
    /// Last remote snapshot accepted, for conflict detection.
    pub known_size: u64,
    pub known_etag: Option<String>,
    /// Rename staging: the inode keeps resolving to its source key until
    /// the flusher commits the move.
    pub old_parent: Option<Weak<Inode>>,
    pub old_name: Option<String>,
    pub renaming_to: bool,
    pub last_write_end: u64,
    /// Non-zero while a flush needs a quiescent snapshot; writers wait.
    pub pause_writers: u32,
    pub force_flush: bool,
    pub is_flushing: bool,
    pub flush_error: Option<(FsError, Instant)>,
    pub read_error: Option<FsError>,
}

pub struct Inode {
    id: InodeId,
    fs: Weak<BlobFs>,
    /// Back-reference to our own `Arc`, so `&self` methods can hand owned
    /// handles to spawned tasks and the path walk.
    me: Weak<Inode>,
    /// Name and parent are read far more often than they change (rename
    /// only), and stale reads are acceptable there, so they sit outside the
    /// async mutex behind cheap sync locks.
    name: RwLock<String>,
    parent: RwLock<Option<Weak<Inode>>>,
    binding: RwLock<Option<MountBinding>>,
    dir_node: AtomicBool,
    /// Kernel lookup count, not Rust ownership.
    refcnt: AtomicI64,
    file_handles: AtomicI64,
    /// Attribute-cache expiry as nanoseconds since epoch; lock-free readers
    /// tolerate staleness because this only feeds expiry comparisons.
    attr_time: AtomicU64,
    cache_state: AtomicI32,
    /// Signaled on load/flush completion and on writer unpause.
    read_cond: Notify,
    state: Mutex<InodeState>,
}

/// An open handle on a file inode.
pub struct FileHandle {
    pub fh: FileHandleId,
    pub inode: Arc<Inode>,
}

impl Inode {
    pub(crate) fn new(
        fs: &Arc<BlobFs>,
        id: InodeId,
        parent: Option<&Arc<Inode>>,
        name: &str,
    ) -> Arc<Self> {
        if name.contains('/') {
            error!(name, "invalid child name");
        }
        let config = &fs.config;
        Arc::new_cyclic(|me| Self {
            id,
            fs: Arc::downgrade(fs),
            me: me.clone(),
            name: RwLock::new(name.to_string()),
            parent: RwLock::new(parent.map(Arc::downgrade)),
            binding: RwLock::new(None),
            dir_node: AtomicBool::new(false),
            refcnt: AtomicI64::new(0),
            file_handles: AtomicI64::new(0),
            attr_time: AtomicU64::new(time_to_nanos(SystemTime::now())),
            cache_state: AtomicI32::new(CacheState::Cached.raw()),
            read_cond: Notify::new(),
            state: Mutex::new(InodeState {
                attrs: InodeAttributes {
                    size: 0,
                    mtime: std::time::UNIX_EPOCH,
                    ctime: std::time::UNIX_EPOCH,
                    uid: config.uid,
                    gid: config.gid,
                    rdev: 0,
                    mode: config.file_mode,
                },
                implicit_dir: false,
                dir: None,
                buffers: BufferList::new(),
                disk_cache: None,
                mpu: None,
                user_metadata: None,
                s3_metadata: HashMap::new(),
                metadata_dirty: MetadataDirty::Clean,
                known_size: 0,
                known_etag: None,
                old_parent: None,
                old_name: None,
                renaming_to: false,
                last_write_end: 0,
                pause_writers: 0,
                force_flush: false,
                is_flushing: false,
                flush_error: None,
                read_error: None,
            }),
        })
    }

    #[must_use]
    pub fn id(&self) -> InodeId {
        self.id
    }

    pub(crate) fn fs(&self) -> Result<Arc<BlobFs>, FsError> {
        self.fs.upgrade().ok_or(FsError::Io)
    }

    fn arc(&self) -> Arc<Self> {
        self.me
            .upgrade()
            .unwrap_or_else(|| unreachable!("self is alive while borrowed"))
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.read().map(|n| n.clone()).unwrap_or_default()
    }

    pub(crate) fn set_name(&self, name: &str) {
        if let Ok(mut n) = self.name.write() {
            *n = name.to_string();
        }
    }

    #[must_use]
    pub fn parent(&self) -> Option<Arc<Inode>> {
        self.parent
            .read()
            .ok()
            .and_then(|p| p.as_ref().and_then(Weak::upgrade))
    }

    pub(crate) fn set_parent(&self, parent: Option<&Arc<Inode>>) {
        if let Ok(mut p) = self.parent.write() {
            *p = parent.map(Arc::downgrade);
        }
    }

    #[must_use]
    pub fn binding(&self) -> Option<MountBinding> {
        self.binding.read().ok().and_then(|b| b.clone())
    }

    /// Bind this directory subtree to a backend under `prefix`.
    pub fn set_binding(&self, wrapper: Arc<InitWrapper>, prefix: String) {
        if let Ok(mut b) = self.binding.write() {
            *b = Some(MountBinding { wrapper, prefix });
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.dir_node.load(Ordering::Acquire)
    }

    /// Convert a fresh node into a directory node. Mtime/ctime stay unset;
    /// presentation falls back to the root's ctime.
    pub async fn to_dir(&self) {
        let mut st = self.state.lock().await;
        if st.dir.is_none() {
            let config_mode = self.fs().map(|fs| fs.config.dir_mode);
            st.attrs.size = 4096;
            if let Ok(mode) = config_mode {
                st.attrs.mode = mode.with_file_type(libc::S_IFDIR);
            }
            st.dir = Some(DirInodeData::default());
            self.dir_node.store(true, Ordering::Release);
        }
    }

    #[must_use]
    pub fn cache_state(&self) -> CacheState {
        CacheState::from_raw(self.cache_state.load(Ordering::Acquire))
    }

    /// Cache-state writes go through here so they always happen under the
    /// inode lock; the guard parameter is the proof.
    pub(crate) fn set_cache_state(&self, _st: &mut InodeState, new: CacheState) {
        trace!(ino = self.id, ?new, "cache state transition");
        self.cache_state.store(new.raw(), Ordering::Release);
    }

    #[must_use]
    pub fn attr_time(&self) -> SystemTime {
        time_from_nanos(self.attr_time.load(Ordering::Relaxed))
    }

    pub fn set_attr_time(&self, t: SystemTime) {
        self.attr_time.store(time_to_nanos(t), Ordering::Relaxed);
    }

    #[must_use]
    pub fn file_handles(&self) -> i64 {
        self.file_handles.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn refcount(&self) -> i64 {
        self.refcnt.load(Ordering::Acquire)
    }

    pub(crate) fn notify_waiters(&self) {
        self.read_cond.notify_waiters();
    }

    /// A waiter on this inode's load/flush/unpause signal.
    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.read_cond.notified()
    }

    /// Slash-joined path from the root, for diagnostics.
    #[must_use]
    pub fn full_name(&self) -> String {
        let mut segments = vec![self.name()];
        let mut cursor = self.parent();
        while let Some(p) = cursor {
            if p.parent().is_some() {
                segments.push(p.name());
            }
            cursor = p.parent();
        }
        segments.reverse();
        segments.join("/")
    }

    /// Increment the kernel lookup count.
    pub fn inc_ref(&self) {
        let res = self.refcnt.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(ino = self.id, refcnt = res, "ref");
    }

    /// Decrement the kernel lookup count by `n`. Reaching zero while the
    /// inode mirrors remote releases it entirely; reaching zero with local
    /// changes leaves reaping to the flusher. Going negative is a
    /// bookkeeping bug and aborts.
    ///
    /// Returns true when the count reached zero.
    pub async fn dec_ref(&self, n: i64) -> bool {
        let res = self.refcnt.fetch_sub(n, Ordering::AcqRel) - n;
        assert!(
            res >= 0,
            "deref inode {} ({}) by {} from {}",
            self.id,
            self.full_name(),
            n,
            res + n
        );
        trace!(ino = self.id, by = n, refcnt = res, "deref");
        if res == 0 && self.cache_state() == CacheState::Cached {
            {
                let mut st = self.state.lock().await;
                self.reset_cache(&mut st);
            }
            if let Ok(fs) = self.fs() {
                fs.drop_inode(self.id);
            }
        }
        res == 0
    }

    /// Release buffers, the disk cache, and any open multipart upload, and
    /// return to the cached state.
    pub(crate) fn reset_cache(&self, st: &mut InodeState) {
        st.buffers.reset();
        if let Some(mpu) = st.mpu.take() {
            let inode = self.arc();
            tokio::spawn(async move {
                if let Ok((backend, _)) = inode.cloud().await
                    && let Err(e) = backend.abort_multipart(&mpu.key, &mpu.upload_id).await
                {
                    warn!(ino = inode.id, error = %e, "failed to abort multipart upload");
                }
            });
        }
        if let Some(cache) = st.disk_cache.take() {
            tokio::spawn(async move {
                if let Err(e) = cache.remove().await {
                    warn!(error = %e, "failed to remove disk cache file");
                }
            });
        }
        self.set_cache_state(st, CacheState::Cached);
    }

    /// Bump mtime/ctime after a local mutation.
    pub(crate) fn touch(st: &mut InodeState) {
        let now = SystemTime::now();
        st.attrs.mtime = now;
        st.attrs.ctime = now;
    }

    /// Project the internal attributes into the FUSE attribute shape.
    ///
    /// Atime is aliased to ctime (access times are not tracked) and crtime
    /// to mtime. An unset mtime is presented as the root's ctime so
    /// implicit directories show a stable timestamp.
    #[must_use]
    pub fn inflate_attributes(&self, st: &InodeState) -> fuser::FileAttr {
        let root_ctime = self
            .fs()
            .map_or(std::time::UNIX_EPOCH, |fs| fs.root_ctime());
        let mtime = if st.attrs.mtime == std::time::UNIX_EPOCH {
            root_ctime
        } else {
            st.attrs.mtime
        };
        let ctime = if st.attrs.ctime == std::time::UNIX_EPOCH {
            root_ctime
        } else {
            st.attrs.ctime
        };

        let symlink_attr = self.fs().map(|fs| fs.config.symlink_attr.clone());
        let (mode, nlink) = if st.dir.is_some() {
            (st.attrs.mode.with_file_type(libc::S_IFDIR), 2)
        } else if let (Ok(attr), Some(meta)) = (&symlink_attr, &st.user_metadata)
            && meta.contains_key(attr)
        {
            (st.attrs.mode.with_file_type(libc::S_IFLNK), 1)
        } else {
            (st.attrs.mode, 1)
        };

        fuser::FileAttr {
            ino: self.id,
            size: st.attrs.size,
            blocks: st.attrs.size.div_ceil(512),
            atime: ctime,
            mtime,
            ctime,
            crtime: mtime,
            kind: mode.kind(),
            perm: u16::try_from(mode.perm() & 0o7777).unwrap_or(0o644),
            nlink,
            uid: st.attrs.uid,
            gid: st.attrs.gid,
            rdev: st.attrs.rdev,
            blksize: 4096,
            flags: 0,
        }
    }

    pub async fn getattr(&self) -> fuser::FileAttr {
        let st = self.state.lock().await;
        self.inflate_attributes(&st)
    }

    /// Apply an observed remote snapshot.
    ///
    /// Conflict rule: the local cache is dropped whenever the observed ETag
    /// is present and differs from the last accepted one, **or** the
    /// observed size differs. Last-writer-wins: local modifications lose,
    /// loudly but without blocking anyone.
    pub async fn set_from_blob_item(&self, item: &BlobItemOutput) {
        let fs = self.fs().ok();
        let mut st = self.state.lock().await;

        let etag_conflict = item.etag.is_some() && st.known_etag != item.etag;
        if etag_conflict || item.size != st.known_size {
            if self.cache_state() != CacheState::Cached
                && (st.known_etag.is_some() || st.known_size > 0)
            {
                warn!(
                    ino = self.id,
                    path = %self.full_name(),
                    remote_etag = item.etag.as_deref().unwrap_or("-"),
                    remote_size = item.size,
                    local_etag = st.known_etag.as_deref().unwrap_or("-"),
                    local_size = st.known_size,
                    "remote object changed; dropping local cache"
                );
            }
            self.reset_cache(&mut st);
            st.buffers.resize(item.size, false, false);
            st.attrs.size = item.size;
            st.known_size = item.size;
            let fallback = fs.as_ref().map_or(std::time::UNIX_EPOCH, |f| f.root_ctime());
            let stamp = item.last_modified.unwrap_or(fallback);
            st.attrs.mtime = stamp;
            st.attrs.ctime = stamp;
            if let Some(raw) = &item.metadata {
                st.user_metadata = Some(unescape_metadata(raw));
                if let (Some(fs), Some(meta)) = (&fs, &st.user_metadata) {
                    let meta = meta.clone();
                    apply_user_metadata(&mut st.attrs, &meta, &fs.config);
                }
                st.metadata_dirty = MetadataDirty::Clean;
            }
        }

        match &item.etag {
            Some(etag) => {
                st.s3_metadata
                    .insert("etag".to_string(), etag.clone().into_bytes());
                st.known_etag = Some(etag.clone());
            }
            None => {
                st.s3_metadata.remove("etag");
            }
        }
        match &item.storage_class {
            Some(class) => {
                st.s3_metadata
                    .insert("storage-class".to_string(), class.clone().into_bytes());
            }
            None => {
                st.s3_metadata.remove("storage-class");
            }
        }

        // A future AttrTime is the never-expire sentinel; leave it alone.
        let now = SystemTime::now();
        if self.attr_time() < now {
            self.set_attr_time(now);
        }
    }

    /// Resolve the backend and object key for this inode.
    ///
    /// Walks toward the root collecting path segments until a directory
    /// with a backend binding is found; that binding supplies the backend
    /// and the key prefix. A binding whose init failed is prefix-oblivious.
    pub async fn cloud(&self) -> Result<(Arc<dyn StorageBackend>, String), FsError> {
        let (mut path, start) = if self.is_dir() {
            (String::new(), Some(self.arc()))
        } else {
            (self.name(), self.parent())
        };

        let mut binding = None;
        let mut cursor = start;
        while let Some(p) = cursor {
            if let Some(b) = p.binding() {
                binding = Some(b);
                break;
            }
            if path.is_empty() {
                path = p.name();
            } else if p.parent().is_some() {
                path = format!("{}/{}", p.name(), path);
            }
            cursor = p.parent();
        }

        let binding = binding.ok_or(FsError::Io)?;
        // Init here rather than lazily in the wrapper so the prefix below
        // is the right one; an errored backend is prefix-oblivious.
        let prefix = match binding.wrapper.ensure_init().await {
            Ok(()) => binding.prefix.as_str(),
            Err(_) => "",
        };

        let key = if path.is_empty() {
            prefix.trim_end_matches('/').to_string()
        } else {
            format!("{prefix}{path}")
        };
        Ok((Arc::clone(binding.wrapper.backend()), key))
    }

    /// Like [`cloud`](Self::cloud), but staging-aware: while a rename is in
    /// flight the inode's data still lives under its source key.
    pub(crate) async fn cloud_for_data(
        &self,
    ) -> Result<(Arc<dyn StorageBackend>, String), FsError> {
        let staged = {
            let st = self.state.lock().await;
            match (&st.old_parent, &st.old_name) {
                (Some(parent), Some(name)) => parent.upgrade().map(|p| (p, name.clone())),
                _ => None,
            }
        };
        match staged {
            Some((old_parent, old_name)) => {
                let (backend, parent_key) = old_parent.cloud().await?;
                Ok((backend, append_child_name(&parent_key, &old_name)))
            }
            None => self.cloud().await,
        }
    }

    // ---- xattrs ------------------------------------------------------------

    /// Populate backend metadata from a HEAD response. Storage class
    /// defaults to STANDARD when the store omits it.
    pub(crate) fn fill_xattr_from_head(&self, st: &mut InodeState, head: &HeadBlobOutput) {
        if let Some(etag) = &head.etag {
            st.s3_metadata
                .insert("etag".to_string(), etag.clone().into_bytes());
        }
        let class = head.storage_class.clone().unwrap_or_else(|| "STANDARD".into());
        st.s3_metadata
            .insert("storage-class".to_string(), class.into_bytes());
        st.user_metadata = Some(unescape_metadata(&head.metadata));
        if let (Ok(fs), Some(meta)) = (self.fs(), &st.user_metadata) {
            let meta = meta.clone();
            apply_user_metadata(&mut st.attrs, &meta, &fs.config);
        }
    }

    /// Upsert or remove one user-metadata key, marking the map for upload.
    pub(crate) fn set_user_meta(st: &mut InodeState, key: &str, value: Option<Vec<u8>>) {
        let meta = st.user_metadata.get_or_insert_with(HashMap::new);
        match value {
            Some(v) => {
                meta.insert(key.to_string(), v);
            }
            None => {
                meta.remove(key);
            }
        }
        st.metadata_dirty = MetadataDirty::LocalDirty;
    }

    /// Fetch user metadata from a blob HEAD if it was never populated.
    /// A missing explicit object promotes a directory to implicit instead
    /// of failing.
    pub(crate) async fn fill_xattr(&self) -> Result<(), FsError> {
        {
            let st = self.state.lock().await;
            if st.implicit_dir || st.user_metadata.is_some() {
                return Ok(());
            }
        }
        let (backend, mut key) = self.cloud_for_data().await?;
        if self.is_dir() {
            key.push('/');
        }
        match backend.head_blob(&key).await {
            Ok(head) => {
                let mut st = self.state.lock().await;
                if st.user_metadata.is_none() {
                    self.fill_xattr_from_head(&mut st, &head);
                }
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                if self.is_dir() {
                    let mut st = self.state.lock().await;
                    st.implicit_dir = true;
                }
                Ok(())
            }
            Err(e) => {
                debug!(ino = self.id, error = %e, "metadata fetch failed");
                Err(FsError::Io)
            }
        }
    }

    /// Route an xattr name to one of the two metadata maps.
    ///
    /// `<backend>.` addresses backend metadata (forbidden for callers that
    /// may only touch user state); `user.` addresses user metadata except
    /// for the reserved symlink attribute; anything else is EPERM in
    /// user-only mode and ENOSYS otherwise.
    async fn route_xattr(
        &self,
        name: &str,
        user_only: bool,
    ) -> Result<(XattrNamespace, String), FsError> {
        let (backend, _) = self.cloud().await?;
        let backend_prefix = format!("{}.", backend.capabilities().name);

        if let Some(stripped) = name.strip_prefix(&backend_prefix) {
            if user_only {
                return Err(FsError::NotPermitted);
            }
            return Ok((XattrNamespace::Backend, stripped.to_string()));
        }

        let reserved = self
            .fs()
            .map(|fs| format!("user.{}", fs.config.symlink_attr))
            .unwrap_or_default();
        if let Some(stripped) = name.strip_prefix("user.")
            && name != reserved
        {
            self.fill_xattr().await?;
            return Ok((XattrNamespace::User, stripped.to_string()));
        }

        if user_only {
            Err(FsError::NotPermitted)
        } else {
            Err(FsError::NotSupported)
        }
    }

    pub async fn get_xattr(&self, name: &str) -> Result<Vec<u8>, FsError> {
        let (ns, key) = self.route_xattr(name, false).await?;
        let st = self.state.lock().await;
        let meta = match ns {
            XattrNamespace::Backend => &st.s3_metadata,
            XattrNamespace::User => st.user_metadata.as_ref().ok_or(FsError::NotSupported)?,
        };
        meta.get(&key).cloned().ok_or(FsError::NoData)
    }

    pub async fn set_xattr(
        &self,
        name: &str,
        value: &[u8],
        flags: u32,
    ) -> Result<(), FsError> {
        let (ns, key) = self.route_xattr(name, true).await?;
        let mut wake = false;
        {
            let mut st = self.state.lock().await;
            {
                let meta = match ns {
                    XattrNamespace::Backend => &mut st.s3_metadata,
                    XattrNamespace::User => {
                        st.user_metadata.as_mut().ok_or(FsError::NotSupported)?
                    }
                };
                let exists = meta.contains_key(&key);
                if flags == XATTR_CREATE && exists {
                    return Err(FsError::Exists);
                }
                if flags == XATTR_REPLACE && !exists {
                    return Err(FsError::NoData);
                }
                meta.insert(key, value.to_vec());
            }
            st.metadata_dirty = MetadataDirty::LocalDirty;
            if self.cache_state() == CacheState::Cached {
                self.set_cache_state(&mut st, CacheState::Modified);
                wake = true;
            }
        }
        if wake && let Ok(fs) = self.fs() {
            fs.wakeup_flusher();
        }
        Ok(())
    }

    pub async fn remove_xattr(&self, name: &str) -> Result<(), FsError> {
        let (ns, key) = self.route_xattr(name, true).await?;
        let mut wake = false;
        {
            let mut st = self.state.lock().await;
            let removed = {
                let meta = match ns {
                    XattrNamespace::Backend => &mut st.s3_metadata,
                    XattrNamespace::User => {
                        st.user_metadata.as_mut().ok_or(FsError::NotSupported)?
                    }
                };
                meta.remove(&key).is_some()
            };
            if !removed {
                return Err(FsError::NoData);
            }
            st.metadata_dirty = MetadataDirty::LocalDirty;
            if self.cache_state() == CacheState::Cached {
                self.set_cache_state(&mut st, CacheState::Modified);
                wake = true;
            }
        }
        if wake && let Ok(fs) = self.fs() {
            fs.wakeup_flusher();
        }
        Ok(())
    }

    pub async fn list_xattr(&self) -> Result<Vec<String>, FsError> {
        self.fill_xattr().await?;
        let (backend, _) = self.cloud().await?;
        let backend_name = backend.capabilities().name;

        let st = self.state.lock().await;
        let mut names: Vec<String> = st
            .s3_metadata
            .keys()
            .map(|k| format!("{backend_name}.{k}"))
            .collect();
        if let Some(user) = &st.user_metadata {
            names.extend(user.keys().map(|k| format!("user.{k}")));
        }
        names.sort_unstable();
        Ok(names)
    }

    // ---- modes -------------------------------------------------------------

    /// Apply a chmod-style mode change, persisting the result to user
    /// metadata when it departs from the configured defaults.
    pub async fn set_file_mode(&self, new_mode: FileMode) -> Result<bool, FsError> {
        let fs = self.fs()?;
        let config = &fs.config;
        // A plain regular-file type is the absence of specialness.
        let new_mode = if new_mode.file_type() == libc::S_IFREG {
            new_mode.with_file_type(0)
        } else {
            new_mode
        };

        let mut wake = false;
        let changed;
        {
            let mut st = self.state.lock().await;
            let prev = st.attrs.mode;
            if config.enable_specials {
                if new_mode.is_dir() != st.dir.is_some() {
                    return Err(if new_mode.is_dir() {
                        FsError::NotDirectory
                    } else {
                        FsError::IsDirectory
                    });
                }
                st.attrs.mode = st.attrs.mode.with_file_type(new_mode.file_type());
            }
            if config.enable_perms {
                st.attrs.mode = st.attrs.mode.with_perm(new_mode.perm());
            }

            let default_mode = if st.dir.is_some() {
                config.dir_mode.with_file_type(libc::S_IFDIR)
            } else {
                config.file_mode
            };
            if st.attrs.mode.is_device() {
                let rdev = st.attrs.rdev;
                Self::set_user_meta(
                    &mut st,
                    &config.rdev_attr,
                    Some(rdev.to_string().into_bytes()),
                );
            }
            if st.attrs.mode == default_mode {
                Self::set_user_meta(&mut st, &config.file_mode_attr, None);
            } else {
                let bits = st.attrs.mode.bits();
                Self::set_user_meta(
                    &mut st,
                    &config.file_mode_attr,
                    Some(bits.to_string().into_bytes()),
                );
            }
            changed = prev != st.attrs.mode;
            if changed && self.cache_state() == CacheState::Cached {
                self.set_cache_state(&mut st, CacheState::Modified);
                wake = true;
            }
        }
        if wake {
            fs.wakeup_flusher();
        }
        Ok(changed)
    }

    /// Apply a chown. Ownership is persisted to user metadata when
    /// permission preservation is enabled.
    pub async fn set_owner(
        &self,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<(), FsError> {
        let fs = self.fs()?;
        let config = &fs.config;
        let mut wake = false;
        {
            let mut st = self.state.lock().await;
            if let Some(uid) = uid {
                st.attrs.uid = uid;
                if config.enable_perms {
                    Self::set_user_meta(
                        &mut st,
                        &config.uid_attr,
                        Some(uid.to_string().into_bytes()),
                    );
                }
            }
            if let Some(gid) = gid {
                st.attrs.gid = gid;
                if config.enable_perms {
                    Self::set_user_meta(
                        &mut st,
                        &config.gid_attr,
                        Some(gid.to_string().into_bytes()),
                    );
                }
            }
            st.attrs.ctime = SystemTime::now();
            if config.enable_perms && self.cache_state() == CacheState::Cached {
                self.set_cache_state(&mut st, CacheState::Modified);
                wake = true;
            }
        }
        if wake {
            fs.wakeup_flusher();
        }
        Ok(())
    }

    /// Apply a utimens-style mtime change, persisting it when mtime
    /// preservation is enabled.
    pub async fn set_mtime(&self, mtime: SystemTime) -> Result<(), FsError> {
        let fs = self.fs()?;
        let config = &fs.config;
        let mut wake = false;
        {
            let mut st = self.state.lock().await;
            st.attrs.mtime = mtime;
            st.attrs.ctime = SystemTime::now();
            if config.enable_mtime {
                let seconds = mtime
                    .duration_since(std::time::UNIX_EPOCH)
                    .map_or(0, |d| d.as_secs());
                Self::set_user_meta(
                    &mut st,
                    &config.mtime_attr,
                    Some(seconds.to_string().into_bytes()),
                );
                if self.cache_state() == CacheState::Cached {
                    self.set_cache_state(&mut st, CacheState::Modified);
                    wake = true;
                }
            }
        }
        if wake {
            fs.wakeup_flusher();
        }
        Ok(())
    }

    /// The link target of a symlink-flagged file: the value of the reserved
    /// symlink attribute.
    pub async fn readlink(&self) -> Result<Vec<u8>, FsError> {
        let fs = self.fs()?;
        self.fill_xattr().await?;
        let st = self.state.lock().await;
        st.user_metadata
            .as_ref()
            .and_then(|m| m.get(&fs.config.symlink_attr))
            .cloned()
            .ok_or(FsError::InvalidArgument)
    }

    // ---- open/read/write ---------------------------------------------------

    /// Open a handle. The 0→1 transition on a cached inode tells the parent
    /// it has one more locally-interesting descendant.
    pub async fn open(&self) -> Result<FileHandle, FsError> {
        let fs = self.fs()?;
        let fh = fs.next_fh();
        let n = self.file_handles.fetch_add(1, Ordering::AcqRel) + 1;
        if n == 1
            && self.cache_state() == CacheState::Cached
            && let Some(parent) = self.parent()
        {
            parent.add_modified(1).await;
        }
        debug!(ino = self.id, fh, "open");
        Ok(FileHandle {
            fh,
            inode: self.arc(),
        })
    }

    /// Drop a handle; the last one out schedules a flush of anything dirty.
    pub async fn release(&self) {
        let n = self.file_handles.fetch_sub(1, Ordering::AcqRel) - 1;
        debug_assert!(n >= 0, "release without open on inode {}", self.id);
        if n == 0 {
            if self.cache_state() == CacheState::Cached {
                if let Some(parent) = self.parent() {
                    parent.add_modified(-1).await;
                }
            } else {
                let mut st = self.state.lock().await;
                st.force_flush = true;
                drop(st);
                if let Ok(fs) = self.fs() {
                    fs.wakeup_flusher();
                }
            }
        }
    }

    pub(crate) async fn add_modified(&self, delta: i64) {
        let mut st = self.state.lock().await;
        if let Some(dir) = &mut st.dir {
            dir.modified_children += delta;
        }
    }

    /// Read `size` bytes at `offset`, fetching any uncached ranges.
    pub async fn read(&self, offset: u64, size: u64) -> Result<Bytes, FsError> {
        loop {
            let notified = self.read_cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut st = self.state.lock().await;
            if let Some(err) = st.read_error.take() {
                return Err(err);
            }
            let file_size = st.attrs.size;
            if offset >= file_size || size == 0 {
                return Ok(Bytes::new());
            }
            let want = size.min(file_size - offset);
            let segments = st.buffers.get_range(offset, want);

            let mut pending_load = None;
            let mut someone_elses_load = false;
            for seg in &segments {
                match seg {
                    RangeSegment::LoadFromDisk { offset, length } => {
                        pending_load = Some((*offset, *length, true));
                        break;
                    }
                    RangeSegment::LoadFromRemote { offset, length } => {
                        pending_load = Some((*offset, *length, false));
                        break;
                    }
                    RangeSegment::Loading { .. } => someone_elses_load = true,
                    RangeSegment::Data { .. } | RangeSegment::Zero { .. } => {}
                }
            }

            if let Some((load_off, load_len, from_disk)) = pending_load {
                st.buffers.mark_loading(load_off, load_len);
                let disk = st.disk_cache.clone();
                drop(st);
                self.load_range(load_off, load_len, from_disk, disk).await?;
                continue;
            }
            if someone_elses_load {
                drop(st);
                notified.await;
                continue;
            }

            // Fully materialized; assemble.
            let mut out = BytesMut::with_capacity(usize::try_from(want).unwrap_or(0));
            for seg in segments {
                match seg {
                    RangeSegment::Data { data, .. } => out.extend_from_slice(&data),
                    RangeSegment::Zero { length, .. } => {
                        out.resize(out.len() + usize::try_from(length).unwrap_or(0), 0);
                    }
                    RangeSegment::LoadFromDisk { .. }
                    | RangeSegment::LoadFromRemote { .. }
                    | RangeSegment::Loading { .. } => unreachable!("handled above"),
                }
            }
            return Ok(out.freeze());
        }
    }

    /// Fetch one marked-loading range and publish it. The inode lock is not
    /// held across the fetch; a failure clears the loading marks so other
    /// readers can retry.
    pub(crate) async fn load_range(
        &self,
        offset: u64,
        length: u64,
        from_disk: bool,
        disk: Option<DiskCache>,
    ) -> Result<(), FsError> {
        let fetched: Result<Bytes, FsError> = if from_disk {
            match disk {
                Some(cache) => cache.read_at(offset, length).await.map_err(|e| {
                    warn!(ino = self.id, error = %e, "disk cache read failed");
                    FsError::Io
                }),
                None => Err(FsError::Io),
            }
        } else {
            match self.cloud_for_data().await {
                Ok((backend, key)) => backend
                    .get_blob(&key, offset, length)
                    .await
                    .map(|out| out.data)
                    .map_err(|e| {
                        debug!(ino = self.id, key, error = %e, "remote read failed");
                        if e.is_not_found() {
                            FsError::NotFound
                        } else {
                            FsError::Io
                        }
                    }),
                Err(e) => Err(e),
            }
        };

        let fs = self.fs();
        let mut st = self.state.lock().await;
        match fetched {
            Ok(data) if data.len() as u64 == length => {
                if let Ok(fs) = &fs {
                    st.buffers.fill_loaded(offset, &data, fs.pool());
                }
                drop(st);
                self.read_cond.notify_waiters();
                if let Ok(fs) = &fs {
                    fs.lfru().access(self.id);
                    fs.maybe_reclaim();
                }
                Ok(())
            }
            Ok(short) => {
                // The remote object shrank under us; reconciliation will
                // sort the cache out. Fail this read rather than fabricate.
                debug!(
                    ino = self.id,
                    expected = length,
                    got = short.len(),
                    "short read from backend"
                );
                st.buffers.clear_loading(offset, length);
                drop(st);
                self.read_cond.notify_waiters();
                Err(FsError::Io)
            }
            Err(e) => {
                st.buffers.clear_loading(offset, length);
                drop(st);
                self.read_cond.notify_waiters();
                Err(e)
            }
        }
    }

    /// Buffer a write at `offset`. Blocks while the flusher holds writers
    /// paused; surfaces (and clears) a pending asynchronous flush error.
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let fs = self.fs()?;
        let mut st = loop {
            let notified = self.read_cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let st = self.state.lock().await;
            if st.pause_writers == 0 {
                break st;
            }
            drop(st);
            notified.await;
        };

        if let Some((err, when)) = st.flush_error.take() {
            if when.elapsed() < fs.config.flush_error_window {
                return Err(err);
            }
            // Stale failure; the flusher is retrying. Swallow it.
        }

        let outcome = st.buffers.write(offset, data, fs.pool());
        self.apply_write_outcome(&mut st, outcome, offset, data.len() as u64);

        let end = offset + data.len() as u64;
        st.attrs.size = st.attrs.size.max(end);
        st.last_write_end = end;
        Self::touch(&mut st);
        if self.cache_state() == CacheState::Cached {
            self.set_cache_state(&mut st, CacheState::Modified);
        }
        drop(st);

        fs.lfru().access(self.id);
        fs.wakeup_flusher();
        fs.maybe_reclaim();
        u32::try_from(data.len()).map_err(|_| FsError::InvalidArgument)
    }

    /// React to a write (or truncate) running over flushed multipart state.
    fn apply_write_outcome(
        &self,
        st: &mut InodeState,
        outcome: crate::fs::buffer::WriteOutcome,
        offset: u64,
        len: u64,
    ) {
        if outcome.overwrote_flushed_cut {
            // An undersized part cannot be patched; the whole upload
            // restarts.
            self.abandon_multipart(st);
        } else if outcome.overwrote_flushed_part
            && let Some(mpu) = &mut st.mpu
        {
            let part_size = mpu.part_size;
            let span_start = offset / part_size * part_size;
            let span_end = (offset + len).div_ceil(part_size) * part_size;
            let mut part_off = span_start;
            while part_off < span_end {
                mpu.discard_part_at(part_off);
                part_off += part_size;
            }
            st.buffers.reopen_range(span_start, span_end);
        }
    }

    /// Abandon the current multipart upload: parts are discarded remotely
    /// and all flushed chunks return to dirty.
    pub(crate) fn abandon_multipart(&self, st: &mut InodeState) {
        if let Some(mpu) = st.mpu.take() {
            debug!(ino = self.id, upload = %mpu.upload_id, "abandoning multipart upload");
            let inode = self.arc();
            tokio::spawn(async move {
                if let Ok((backend, _)) = inode.cloud().await
                    && let Err(e) = backend.abort_multipart(&mpu.key, &mpu.upload_id).await
                {
                    warn!(ino = inode.id, error = %e, "abort multipart failed");
                }
            });
        }
        st.buffers.reopen_flushed();
    }

    /// Truncate or extend to `new_size`. Extension zero-fills (the zeros
    /// are local data that must be uploaded).
    pub async fn truncate(&self, new_size: u64) -> Result<(), FsError> {
        let fs = self.fs()?;
        let mut st = loop {
            let notified = self.read_cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let st = self.state.lock().await;
            if st.pause_writers == 0 {
                break st;
            }
            drop(st);
            notified.await;
        };

        let old_size = st.attrs.size;
        let outcome = st.buffers.resize(new_size, true, false);
        self.apply_write_outcome(&mut st, outcome, new_size.min(old_size), 1);
        if new_size < old_size && let Some(mpu) = &mut st.mpu {
            // Part records past the truncation point can never be part of
            // the completed object.
            let part_size = mpu.part_size;
            let mut part_off = new_size / part_size * part_size;
            while part_off < old_size {
                mpu.discard_part_at(part_off);
                part_off += part_size;
            }
        }
        st.attrs.size = new_size;
        Self::touch(&mut st);
        if self.cache_state() == CacheState::Cached {
            self.set_cache_state(&mut st, CacheState::Modified);
        }
        drop(st);
        fs.wakeup_flusher();
        Ok(())
    }

    /// Wait until everything dirty has been flushed (or a flush error
    /// surfaces). Drives the fsync/flush FUSE paths.
    pub async fn sync(&self) -> Result<(), FsError> {
        if self.cache_state() == CacheState::Cached {
            return Ok(());
        }
        {
            let mut st = self.state.lock().await;
            st.force_flush = true;
        }
        let fs = self.fs()?;
        fs.wakeup_flusher();

        loop {
            let notified = self.read_cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().await;
                if let Some((err, _)) = st.flush_error.take() {
                    return Err(err);
                }
                if self.cache_state() == CacheState::Cached
                    || self.cache_state() == CacheState::Deleted
                {
                    return Ok(());
                }
                st.force_flush = true;
            }
            fs.wakeup_flusher();
            notified.await;
        }
    }

    /// Post an asynchronous flush failure; the next foreground write or
    /// close surfaces it.
    pub(crate) fn post_flush_error(&self, st: &mut InodeState, err: FsError) {
        st.flush_error = Some((err, Instant::now()));
        self.read_cond.notify_waiters();
    }

    /// Evict what the buffer list allows, reporting freed bytes.
    pub(crate) async fn evict_buffers(&self, max_bytes: u64) -> u64 {
        let mut st = self.state.lock().await;
        st.buffers.evict(max_bytes)
    }

    /// Lock the mutable core. Exposed for the flusher, the tree layer, and
    /// tests; FUSE-facing callers go through the typed operations above.
    pub async fn lock_state(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum XattrNamespace {
    Backend,
    User,
}

/// Join a child name onto a directory key.
#[must_use]
pub fn append_child_name(parent_key: &str, name: &str) -> String {
    if parent_key.is_empty() {
        name.to_string()
    } else {
        format!("{}/{name}", parent_key.trim_end_matches('/'))
    }
}

impl FileHandle {
    pub async fn read(&self, offset: u64, size: u64) -> Result<Bytes, FsError> {
        self.inode.read(offset, size).await
    }

    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        self.inode.write(offset, data).await
    }

    pub async fn sync(&self) -> Result<(), FsError> {
        self.inode.sync().await
    }

    pub async fn release(&self) {
        self.inode.release().await;
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("cache_state", &self.cache_state())
            .field("refcnt", &self.refcount())
            .finish_non_exhaustive()
    }
}
