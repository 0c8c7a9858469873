//! Process-wide filesystem state.
//!
//! [`BlobFs`] owns the inode table, the buffer pool, the eviction tracker,
//! and the background flusher, and carries the mount configuration. Tree
//! operations (lookup, create, unlink, rename) live here; per-inode
//! behavior lives on [`Inode`].

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::backend::{BlobItemOutput, InitWrapper, StorageBackend};
use crate::cache::eviction::lfru::{EvictionDeleter, LfruTracker};
use crate::fs::buffer::BufferPool;
use crate::fs::inode::{Inode, append_child_name};
use crate::fs::{
    CacheState, FileHandleId, FileMode, FsError, InodeAttributes, InodeId, MetadataDirty, ROOT_INO,
    time_to_nanos,
};

/// Mount configuration. Field defaults mirror what an S3 mount wants; the
/// binary layers CLI flags and the TOML config over this.
#[derive(Debug, Clone)]
pub struct FsConfig {
    pub uid: u32,
    pub gid: u32,
    /// Default mode for files (no type bits).
    pub file_mode: FileMode,
    /// Default permission half for directories.
    pub dir_mode: FileMode,
    /// Decode/encode the mtime-preservation attribute.
    pub enable_mtime: bool,
    /// Decode/encode uid/gid/permission attributes.
    pub enable_perms: bool,
    /// Decode/encode type bits (symlinks as flagged files, devices).
    pub enable_specials: bool,
    pub mtime_attr: String,
    pub uid_attr: String,
    pub gid_attr: String,
    pub file_mode_attr: String,
    pub rdev_attr: String,
    /// Reserved user attribute whose presence reinterprets a file as a
    /// symlink; its value is the link target.
    pub symlink_attr: String,
    /// Key prefix the mount lives under (empty or `…/`-terminated).
    pub mount_prefix: String,
    /// Size every full multipart part is cut to.
    pub part_size: u64,
    /// Files at or above this size flush via multipart upload.
    pub multipart_threshold: u64,
    /// Buffer memory target; 0 disables pressure eviction.
    pub memory_limit: u64,
    /// How long a posted flush error stays surfaceable before a retry
    /// clears it.
    pub flush_error_window: Duration,
    /// Entry/attribute TTL handed to the kernel.
    pub attr_ttl: Duration,
    /// Directory for per-inode disk cache files; `None` disables the disk
    /// cache.
    pub cache_dir: Option<PathBuf>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            file_mode: FileMode::from_bits(0o644),
            dir_mode: FileMode::from_bits(0o755),
            enable_mtime: true,
            enable_perms: false,
            enable_specials: false,
            mtime_attr: "mtime".to_string(),
            uid_attr: "uid".to_string(),
            gid_attr: "gid".to_string(),
            file_mode_attr: "mode".to_string(),
            rdev_attr: "rdev".to_string(),
            symlink_attr: "--symlink-target".to_string(),
            mount_prefix: String::new(),
            part_size: 5 * 1024 * 1024,
            multipart_threshold: 10 * 1024 * 1024,
            memory_limit: 256 * 1024 * 1024,
            flush_error_window: Duration::from_secs(30),
            attr_ttl: Duration::from_secs(1),
            cache_dir: None,
        }
    }
}

impl InodeAttributes {
    /// Fresh attributes for a regular file under this configuration.
    #[must_use]
    pub fn default_file(config: &FsConfig) -> Self {
        Self {
            size: 0,
            mtime: std::time::UNIX_EPOCH,
            ctime: std::time::UNIX_EPOCH,
            uid: config.uid,
            gid: config.gid,
            rdev: 0,
            mode: config.file_mode,
        }
    }
}

/// Evicts one inode's buffers when the tracker picks it as a victim.
#[derive(Clone)]
struct BufferEvictor {
    fs: std::sync::Weak<BlobFs>,
}

impl EvictionDeleter for BufferEvictor {
    async fn evict(&mut self, ino: InodeId, max_bytes: u64) -> u64 {
        let Some(fs) = self.fs.upgrade() else {
            return 0;
        };
        let Some(inode) = fs.get_inode(ino).await else {
            return 0;
        };
        let freed = inode.evict_buffers(max_bytes).await;
        if freed > 0 {
            debug!(ino, freed, "evicted buffer memory");
        }
        freed
    }
}

/// The mounted filesystem.
pub struct BlobFs {
    pub config: FsConfig,
    me: std::sync::Weak<BlobFs>,
    inodes: scc::HashMap<InodeId, Arc<Inode>>,
    next_ino: AtomicU64,
    next_fh: AtomicU64,
    forgot: AtomicU64,
    root_ctime: AtomicU64,
    pool: Arc<BufferPool>,
    lfru: LfruTracker,
    flusher_wake: Arc<Notify>,
}

impl BlobFs {
    /// Mount `backend` under `config.mount_prefix` and start the background
    /// workers. The returned handle is the root of ownership: inodes hold
    /// weak references back to it.
    pub async fn new(config: FsConfig, backend: Arc<dyn StorageBackend>) -> Arc<Self> {
        let pool = BufferPool::new(config.memory_limit);
        let fs = Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let lfru = LfruTracker::spawn(BufferEvictor { fs: weak.clone() });
            Self {
                config,
                me: weak.clone(),
                inodes: scc::HashMap::default(),
                next_ino: AtomicU64::new(ROOT_INO + 1),
                next_fh: AtomicU64::new(1),
                forgot: AtomicU64::new(0),
                root_ctime: AtomicU64::new(time_to_nanos(SystemTime::now())),
                pool,
                lfru,
                flusher_wake: Arc::new(Notify::new()),
            }
        });

        let root = Inode::new(&fs, ROOT_INO, None, "");
        root.to_dir().await;
        root.set_binding(
            Arc::new(InitWrapper::new(backend)),
            fs.config.mount_prefix.clone(),
        );
        {
            let mut st = root.lock_state().await;
            let now = SystemTime::now();
            st.attrs.mtime = now;
            st.attrs.ctime = now;
        }
        // The root is permanently referenced; the kernel never forgets it.
        root.inc_ref();
        let _ = fs.inodes.insert_async(ROOT_INO, root).await;

        crate::fs::flusher::spawn(&fs);
        fs
    }

    fn arc(&self) -> Arc<Self> {
        self.me
            .upgrade()
            .unwrap_or_else(|| unreachable!("self is alive while borrowed"))
    }

    #[must_use]
    pub fn root_ctime(&self) -> SystemTime {
        crate::fs::time_from_nanos(self.root_ctime.load(Ordering::Relaxed))
    }

    pub(crate) fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub(crate) fn lfru(&self) -> &LfruTracker {
        &self.lfru
    }

    pub(crate) fn flusher_wake(&self) -> Arc<Notify> {
        Arc::clone(&self.flusher_wake)
    }

    /// Idempotent "there is work" signal for the background flusher.
    pub fn wakeup_flusher(&self) {
        self.flusher_wake.notify_one();
    }

    /// Ask the eviction tracker to shed memory if the pool is over target.
    pub fn maybe_reclaim(&self) {
        if self.pool.over_limit() {
            let excess = self.pool.in_use().saturating_sub(self.pool.limit());
            self.lfru.cull(excess.max(1));
        }
    }

    pub(crate) fn next_fh(&self) -> FileHandleId {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    fn alloc_ino(&self) -> InodeId {
        self.next_ino.fetch_add(1, Ordering::Relaxed)
    }

    /// Kernel-forget count, for observability and tests.
    #[must_use]
    pub fn forgotten(&self) -> u64 {
        self.forgot.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    pub async fn get_inode(&self, ino: InodeId) -> Option<Arc<Inode>> {
        self.inodes.read_async(&ino, |_, v| Arc::clone(v)).await
    }

    pub async fn root(&self) -> Arc<Inode> {
        self.get_inode(ROOT_INO)
            .await
            .unwrap_or_else(|| unreachable!("root inode is seeded at mount"))
    }

    /// Drop an inode whose refcount hit zero in the cached state.
    pub(crate) fn drop_inode(&self, ino: InodeId) {
        if self.inodes.remove(&ino).is_some() {
            self.forgot.fetch_add(1, Ordering::Relaxed);
            self.lfru.forget(ino);
            debug!(ino, "inode released");
        }
    }

    /// Kernel forget: drop `nlookup` references.
    pub async fn forget(&self, ino: InodeId, nlookup: u64) {
        if let Some(inode) = self.get_inode(ino).await {
            inode.dec_ref(i64::try_from(nlookup).unwrap_or(i64::MAX)).await;
        }
    }

    /// Collect inodes that the flusher should look at.
    pub(crate) async fn dirty_inodes(&self) -> Vec<Arc<Inode>> {
        let mut dirty = Vec::new();
        self.inodes
            .scan_async(|_, inode| {
                if inode.cache_state() != CacheState::Cached {
                    dirty.push(Arc::clone(inode));
                }
            })
            .await;
        dirty
    }

    // ---- tree operations ---------------------------------------------------

    /// Look up `name` under `parent`: the child table first, then a remote
    /// HEAD for the file key and the explicit-directory key.
    ///
    /// Takes one kernel reference on the returned inode.
    pub async fn lookup(
        &self,
        parent: &Arc<Inode>,
        name: &str,
    ) -> Result<Arc<Inode>, FsError> {
        if !parent.is_dir() {
            return Err(FsError::NotDirectory);
        }
        {
            let st = parent.lock_state().await;
            if let Some(dir) = &st.dir
                && let Some(child) = dir.children.get(name)
            {
                let child = Arc::clone(child);
                drop(st);
                child.inc_ref();
                return Ok(child);
            }
        }

        let (backend, parent_key) = parent.cloud().await?;
        let key = append_child_name(&parent_key, name);

        let (item, is_dir) = match backend.head_blob(&key).await {
            Ok(head) => (BlobItemOutput::from(&head), false),
            Err(e) if e.is_not_found() => match backend.head_blob(&format!("{key}/")).await {
                Ok(head) => (BlobItemOutput::from(&head), true),
                Err(e2) if e2.is_not_found() => return Err(FsError::NotFound),
                Err(e2) => {
                    warn!(key, error = %e2, "lookup failed");
                    return Err(FsError::Io);
                }
            },
            Err(e) => {
                warn!(key, error = %e, "lookup failed");
                return Err(FsError::Io);
            }
        };

        let inode = Inode::new(&self.arc(), self.alloc_ino(), Some(parent), name);
        if is_dir {
            inode.to_dir().await;
        }
        inode.set_from_blob_item(&item).await;

        // Re-check under the parent lock: a concurrent lookup may have won.
        let mut st = parent.lock_state().await;
        let dir = st.dir.as_mut().ok_or(FsError::NotDirectory)?;
        if let Some(existing) = dir.children.get(name) {
            let existing = Arc::clone(existing);
            drop(st);
            existing.inc_ref();
            return Ok(existing);
        }
        // One reference for the child table, one for the kernel.
        inode.inc_ref();
        inode.inc_ref();
        dir.children.insert(name.to_string(), Arc::clone(&inode));
        drop(st);

        let _ = self.inodes.insert_async(inode.id(), Arc::clone(&inode)).await;
        Ok(inode)
    }

    /// Create a file that exists only locally until the flusher uploads it.
    pub async fn create_file(
        &self,
        parent: &Arc<Inode>,
        name: &str,
        perm: u32,
    ) -> Result<Arc<Inode>, FsError> {
        let inode = self.insert_new_child(parent, name, false, perm).await?;
        self.wakeup_flusher();
        Ok(inode)
    }

    /// Create a directory; it becomes an explicit `…/` object on flush.
    pub async fn mkdir(
        &self,
        parent: &Arc<Inode>,
        name: &str,
        perm: u32,
    ) -> Result<Arc<Inode>, FsError> {
        let inode = self.insert_new_child(parent, name, true, perm).await?;
        self.wakeup_flusher();
        Ok(inode)
    }

    /// Create a symlink: a zero-byte object whose reserved attribute holds
    /// the link target.
    pub async fn symlink(
        &self,
        parent: &Arc<Inode>,
        name: &str,
        target: &str,
    ) -> Result<Arc<Inode>, FsError> {
        let inode = self.insert_new_child(parent, name, false, 0o777).await?;
        {
            let mut st = inode.lock_state().await;
            let attr = self.config.symlink_attr.clone();
            Inode::set_user_meta(&mut st, &attr, Some(target.as_bytes().to_vec()));
        }
        self.wakeup_flusher();
        Ok(inode)
    }

    async fn insert_new_child(
        &self,
        parent: &Arc<Inode>,
        name: &str,
        dir: bool,
        perm: u32,
    ) -> Result<Arc<Inode>, FsError> {
        if !parent.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if name.is_empty() || name.contains('/') {
            return Err(FsError::InvalidArgument);
        }

        let inode = Inode::new(&self.arc(), self.alloc_ino(), Some(parent), name);
        if dir {
            inode.to_dir().await;
        }
        {
            let mut st = inode.lock_state().await;
            if self.config.enable_perms {
                st.attrs.mode = st.attrs.mode.with_perm(perm);
            }
            // Locally created nodes have a user-metadata map from birth;
            // there is nothing remote to fetch it from.
            st.user_metadata = Some(std::collections::HashMap::new());
            st.metadata_dirty = MetadataDirty::LocalDirty;
            let now = SystemTime::now();
            st.attrs.mtime = now;
            st.attrs.ctime = now;
            inode.set_cache_state(&mut st, CacheState::Created);
        }

        let mut st = parent.lock_state().await;
        let dir_data = st.dir.as_mut().ok_or(FsError::NotDirectory)?;
        if dir_data.children.contains_key(name) {
            return Err(FsError::Exists);
        }
        inode.inc_ref(); // child table
        inode.inc_ref(); // kernel
        dir_data.children.insert(name.to_string(), Arc::clone(&inode));
        drop(st);

        let _ = self.inodes.insert_async(inode.id(), Arc::clone(&inode)).await;
        debug!(ino = inode.id(), name, dir, "created");
        Ok(inode)
    }

    /// Tombstone a child; the flusher issues the remote delete.
    pub async fn unlink(&self, parent: &Arc<Inode>, name: &str) -> Result<(), FsError> {
        let child = {
            let mut st = parent.lock_state().await;
            let dir = st.dir.as_mut().ok_or(FsError::NotDirectory)?;
            dir.children.remove(name).ok_or(FsError::NotFound)?
        };
        {
            let mut st = child.lock_state().await;
            child.set_cache_state(&mut st, CacheState::Deleted);
        }
        // The child table's reference goes away; the flusher keeps the
        // inode alive through the table until the delete lands.
        child.dec_ref(1).await;
        self.wakeup_flusher();
        Ok(())
    }

    /// Remove a directory. Only empty directories (no cached children) go.
    pub async fn rmdir(&self, parent: &Arc<Inode>, name: &str) -> Result<(), FsError> {
        {
            let st = parent.lock_state().await;
            let dir = st.dir.as_ref().ok_or(FsError::NotDirectory)?;
            let child = dir.children.get(name).ok_or(FsError::NotFound)?;
            if !child.is_dir() {
                return Err(FsError::NotDirectory);
            }
            let child_st = child.lock_state().await;
            if child_st
                .dir
                .as_ref()
                .is_some_and(|d| !d.children.is_empty())
            {
                return Err(FsError::InvalidArgument);
            }
        }
        self.unlink(parent, name).await
    }

    /// Move `old_name` under `old_parent` to `new_name` under `new_parent`.
    ///
    /// The store has no rename, so this stages the move: the inode joins
    /// its new parent immediately but keeps resolving to the source key
    /// until the flusher copies the object and deletes the source.
    pub async fn rename(
        &self,
        old_parent: &Arc<Inode>,
        old_name: &str,
        new_parent: &Arc<Inode>,
        new_name: &str,
    ) -> Result<(), FsError> {
        // Overwrite semantics: a file already at the destination is
        // unlinked first.
        let target_exists = {
            let st = new_parent.lock_state().await;
            st.dir
                .as_ref()
                .is_some_and(|d| d.children.contains_key(new_name))
        };
        if target_exists {
            self.unlink(new_parent, new_name).await?;
        }

        let child = {
            let mut st = old_parent.lock_state().await;
            let dir = st.dir.as_mut().ok_or(FsError::NotDirectory)?;
            dir.children.remove(old_name).ok_or(FsError::NotFound)?
        };
        {
            let mut st = new_parent.lock_state().await;
            let dir = st.dir.as_mut().ok_or(FsError::NotDirectory)?;
            dir.children.insert(new_name.to_string(), Arc::clone(&child));
        }

        {
            let mut st = child.lock_state().await;
            // Keep the first staging if a rename is already in flight; the
            // data still lives under the original key.
            if st.old_parent.is_none() {
                st.old_parent = Some(Arc::downgrade(old_parent));
                st.old_name = Some(old_name.to_string());
            }
            st.renaming_to = false;
            if st.metadata_dirty == MetadataDirty::Clean {
                // Whatever we fetched was read under the source key; make
                // sure the next sync writes it back under the new one.
                st.metadata_dirty = MetadataDirty::NeedsRefresh;
            }
            child.set_name(new_name);
            child.set_parent(Some(new_parent));
            if child.cache_state() == CacheState::Cached {
                child.set_cache_state(&mut st, CacheState::Modified);
            }
        }
        self.wakeup_flusher();
        Ok(())
    }

    /// Directory entries served from the local child table.
    pub async fn readdir_local(
        &self,
        dir: &Arc<Inode>,
    ) -> Result<Vec<(String, InodeId, bool)>, FsError> {
        let mut st = dir.lock_state().await;
        let dir_data = st.dir.as_mut().ok_or(FsError::NotDirectory)?;
        let mut entries: Vec<(String, InodeId, bool)> = dir_data
            .children
            .iter()
            .filter(|(_, child)| child.cache_state() != CacheState::Deleted)
            .map(|(name, child)| (name.clone(), child.id(), child.is_dir()))
            .collect();
        entries.sort_unstable_by(|(a, _, _), (b, _, _)| a.cmp(b));
        dir_data.readdir_cursor = entries.len() as u64;
        Ok(entries)
    }

    /// Filesystem statistics for `statfs`.
    #[must_use]
    pub fn statfs(&self) -> (u64, u64) {
        (self.inode_count() as u64, self.pool.in_use())
    }
}

impl std::fmt::Debug for BlobFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobFs")
            .field("inodes", &self.inode_count())
            .field("buffer_bytes", &self.pool.in_use())
            .finish_non_exhaustive()
    }
}
