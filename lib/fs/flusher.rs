//! Background write-back engine.
//!
//! One worker task per mounted filesystem. Each round it collects inodes
//! whose cache state is not `Cached` and replays their local changes
//! against the store: whole-object PUTs for small files, the multipart
//! lifecycle for large ones, explicit-directory markers, deletes, and the
//! copy-and-delete that commits a rename.
//!
//! The worker never holds an inode lock across a remote call. It snapshots
//! `(offset, length, dirty_id)` triples under the lock, uploads with the
//! lock dropped, and commits only the chunks whose dirty id is unchanged on
//! reacquire — an interleaved write silently invalidates the upload result
//! for the chunks it touched, and those stay dirty for the next round.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::backend::StorageBackend;
use crate::fs::blobfs::BlobFs;
use crate::fs::buffer::{BufferState, RangeSegment};
use crate::fs::disk_cache::DiskCache;
use crate::fs::inode::{Inode, append_child_name};
use crate::fs::metadata::escape_metadata;
use crate::fs::multipart::{MultipartUpload, PartRecord};
use crate::fs::{CacheState, FsError, MetadataDirty};

/// How long the worker dozes between rounds when nothing wakes it. Also
/// paces retries after a flush error.
const IDLE_TICK: Duration = Duration::from_millis(500);

/// Upper bound on state-machine turns for one inode in one round; a bug in
/// the part bookkeeping must not wedge the worker forever.
const MAX_TURNS: u32 = 4096;

/// One step of the multipart state machine, chosen under the inode lock
/// and executed with it dropped.
enum Turn {
    Upload {
        num: u32,
        start: u64,
        end: u64,
        full: bool,
        data: Bytes,
        ids: Vec<(u64, u64, u64)>,
    },
    Load(u64, u64, bool, Option<DiskCache>),
    Finalize(u64, Vec<(u32, String)>, String),
    Idle,
}

fn escaped_user_meta(st: &crate::fs::inode::InodeState) -> std::collections::HashMap<String, String> {
    st.user_metadata
        .as_ref()
        .map(escape_metadata)
        .unwrap_or_default()
}

/// Start the write-back worker for `fs`.
pub(crate) fn spawn(fs: &Arc<BlobFs>) {
    let weak = Arc::downgrade(fs);
    let wake = fs.flusher_wake();
    tokio::spawn(async move {
        loop {
            let _ = tokio::time::timeout(IDLE_TICK, wake.notified()).await;
            let Some(fs) = weak.upgrade() else {
                // The filesystem was unmounted.
                return;
            };
            for inode in fs.dirty_inodes().await {
                if let Err(e) = flush_inode(&fs, &inode).await {
                    debug!(ino = inode.id(), error = %e, "flush attempt failed");
                }
            }
        }
    });
}

/// Flush one inode's pending changes. Errors are already posted to the
/// inode by the time this returns.
pub(crate) async fn flush_inode(fs: &Arc<BlobFs>, inode: &Arc<Inode>) -> Result<(), FsError> {
    {
        let mut st = inode.lock_state().await;
        if st.is_flushing {
            return Ok(());
        }
        st.is_flushing = true;
    }
    let result = match inode.cache_state() {
        CacheState::Cached => Ok(()),
        CacheState::Deleted => flush_delete(inode).await,
        CacheState::Created | CacheState::Modified => {
            if inode.is_dir() {
                flush_dir(inode).await
            } else {
                flush_file(fs, inode).await
            }
        }
    };
    {
        let mut st = inode.lock_state().await;
        st.is_flushing = false;
        match result {
            Ok(()) => {
                // A completed round supersedes any earlier failure.
                st.flush_error = None;
            }
            Err(err) => inode.post_flush_error(&mut st, err),
        }
    }
    inode.notify_waiters();
    reap_if_forgotten(fs, inode);
    result
}

/// Drop the inode once nothing references it and nothing is left to flush.
fn reap_if_forgotten(fs: &Arc<BlobFs>, inode: &Arc<Inode>) {
    if inode.refcount() == 0 && inode.cache_state() == CacheState::Cached {
        fs.drop_inode(inode.id());
    }
}

async fn flush_delete(inode: &Arc<Inode>) -> Result<(), FsError> {
    let (backend, mut key) = inode.cloud_for_data().await?;
    if inode.is_dir() {
        key.push('/');
    }

    let (mpu, was_implicit) = {
        let mut st = inode.lock_state().await;
        (st.mpu.take(), st.implicit_dir)
    };
    if let Some(mpu) = mpu
        && let Err(e) = backend.abort_multipart(&mpu.key, &mpu.upload_id).await
    {
        warn!(ino = inode.id(), error = %e, "abort during delete failed");
    }

    if !was_implicit {
        match backend.delete_blob(&key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(ino = inode.id(), key, error = %e, "remote delete failed");
                return Err(FsError::Io);
            }
        }
    }

    let mut st = inode.lock_state().await;
    st.buffers.reset();
    st.old_parent = None;
    st.old_name = None;
    st.renaming_to = false;
    inode.set_cache_state(&mut st, CacheState::Cached);
    debug!(ino = inode.id(), key, "deleted remotely");
    Ok(())
}

async fn flush_dir(inode: &Arc<Inode>) -> Result<(), FsError> {
    let (backend, key) = inode.cloud().await?;
    let dir_key = format!("{key}/");

    let (meta, staged_old, was_created) = {
        let mut st = inode.lock_state().await;
        let staged = match (&st.old_parent, &st.old_name) {
            (Some(p), Some(n)) => p.upgrade().map(|p| (p, n.clone())),
            _ => None,
        };
        st.renaming_to = staged.is_some();
        (
            escaped_user_meta(&st),
            staged,
            inode.cache_state() == CacheState::Created,
        )
    };

    let put = backend
        .put_blob(&dir_key, Bytes::new(), meta)
        .await
        .map_err(|e| {
            warn!(ino = inode.id(), key = dir_key, error = %e, "directory flush failed");
            FsError::Io
        })?;

    // Commit the rename by removing the old marker.
    if let Some((old_parent, old_name)) = staged_old {
        if let Ok((backend, parent_key)) = old_parent.cloud().await {
            let old_key = format!("{}/", append_child_name(&parent_key, &old_name));
            match backend.delete_blob(&old_key).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(old_key, error = %e, "old directory marker not removed"),
            }
        }
    }

    let mut st = inode.lock_state().await;
    if let Some(etag) = &put.etag {
        st.s3_metadata
            .insert("etag".to_string(), etag.clone().into_bytes());
        st.known_etag = Some(etag.clone());
    }
    st.metadata_dirty = MetadataDirty::Clean;
    st.implicit_dir = false;
    st.old_parent = None;
    st.old_name = None;
    st.renaming_to = false;
    inode.set_cache_state(&mut st, CacheState::Cached);
    drop(st);

    if was_created && let Some(parent) = inode.parent() {
        parent.add_modified(-1).await;
    }
    debug!(ino = inode.id(), key = dir_key, "directory flushed");
    Ok(())
}

async fn flush_file(fs: &Arc<BlobFs>, inode: &Arc<Inode>) -> Result<(), FsError> {
    // A PUT replaces the whole object, metadata included; make sure we are
    // not about to erase metadata we never fetched.
    inode.fill_xattr().await?;

    let (size, staged) = {
        let mut st = inode.lock_state().await;
        let staged = match (&st.old_parent, &st.old_name) {
            (Some(p), Some(n)) => p.upgrade().map(|p| (p, n.clone())),
            _ => None,
        };
        st.renaming_to = staged.is_some();
        (st.attrs.size, staged)
    };

    if size < fs.config.multipart_threshold {
        flush_small(inode, staged).await
    } else {
        flush_multipart(fs, inode, staged).await
    }
}

/// Whole-object PUT for files under the multipart threshold. Writers are
/// paused so the object body and its recorded ETag are a consistent
/// snapshot.
async fn flush_small(
    inode: &Arc<Inode>,
    staged: Option<(Arc<Inode>, String)>,
) -> Result<(), FsError> {
    let (backend, key) = inode.cloud().await?;

    {
        let mut st = inode.lock_state().await;
        // A file that shrank below the multipart threshold may still carry
        // an open upload; it cannot be completed against the new size.
        if st.mpu.is_some() {
            inode.abandon_multipart(&mut st);
        }
        st.pause_writers += 1;
    }

    let attempt: Result<(), FsError> = async {
        // Loop until the whole object is in memory; a reader's in-flight
        // load of the same range is waited out, not treated as a failure.
        let (data, ids, size, meta) = loop {
            materialize(inode).await?;
            let notified = inode.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = inode.lock_state().await;
                let size = st.attrs.size;
                if let Some(data) = st.buffers.materialized_range(0, size) {
                    let ids = st.buffers.dirty_ids_in_range(0, size);
                    st.force_flush = false;
                    break (data, ids, size, escaped_user_meta(&st));
                }
            }
            notified.await;
        };
        let put = backend.put_blob(&key, data, meta).await.map_err(|e| {
            warn!(ino = inode.id(), key, error = %e, "put failed");
            FsError::Io
        })?;

        let mut st = inode.lock_state().await;
        let committed = st.buffers.commit_flushed(&ids, BufferState::Clean);
        debug_assert_eq!(committed, ids.len(), "writers were paused");
        if let Some(etag) = &put.etag {
            st.s3_metadata
                .insert("etag".to_string(), etag.clone().into_bytes());
        }
        st.known_etag = put.etag;
        st.known_size = size;
        st.metadata_dirty = MetadataDirty::Clean;
        Ok(())
    }
    .await;

    let was_created = inode.cache_state() == CacheState::Created;
    {
        let mut st = inode.lock_state().await;
        st.pause_writers -= 1;
        if attempt.is_ok() {
            st.old_parent = None;
            st.old_name = None;
            st.renaming_to = false;
            if !st.buffers.has_dirty()
                && st.metadata_dirty == MetadataDirty::Clean
                && inode.cache_state() != CacheState::Deleted
            {
                inode.set_cache_state(&mut st, CacheState::Cached);
            }
        }
    }
    inode.notify_waiters();
    attempt?;

    // The new object is durable; the rename commits by deleting the source.
    if let Some((old_parent, old_name)) = staged {
        if let Ok((backend, parent_key)) = old_parent.cloud().await {
            let old_key = append_child_name(&parent_key, &old_name);
            match backend.delete_blob(&old_key).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(old_key, error = %e, "rename source not removed"),
            }
        }
    }

    if was_created
        && inode.cache_state() == CacheState::Cached
        && let Some(parent) = inode.parent()
    {
        parent.add_modified(-1).await;
    }
    trace!(ino = inode.id(), key, "small flush complete");
    Ok(())
}

/// Multipart write-back for large files.
///
/// Full dirty parts upload eagerly; the undersized tail uploads only once
/// finalization is requested; completion assembles the recorded ETags.
async fn flush_multipart(
    fs: &Arc<BlobFs>,
    inode: &Arc<Inode>,
    staged: Option<(Arc<Inode>, String)>,
) -> Result<(), FsError> {
    let (backend, key) = inode.cloud().await?;
    let part_size = fs.config.part_size;

    for _ in 0..MAX_TURNS {
        if inode.cache_state() == CacheState::Deleted {
            // Unlinked mid-flush; abandon and let the delete path run.
            return Ok(());
        }

        // Make sure an upload is open.
        let needs_mpu = {
            let st = inode.lock_state().await;
            st.mpu.is_none()
        };
        if needs_mpu {
            let meta = {
                let st = inode.lock_state().await;
                escaped_user_meta(&st)
            };
            let upload_id = backend.create_multipart(&key, meta).await.map_err(|e| {
                warn!(ino = inode.id(), key, error = %e, "create multipart failed");
                FsError::Io
            })?;
            let mut st = inode.lock_state().await;
            if st.mpu.is_none() {
                st.mpu = Some(MultipartUpload::new(upload_id, key.clone(), part_size));
            } else {
                // Lost a race with another flush round.
                drop(st);
                let _ = backend.abort_multipart(&key, &upload_id).await;
            }
            continue;
        }

        // Reopened cleared parts need their bytes back before re-upload.
        let reload = {
            let mut st = inode.lock_state().await;
            if let Some((off, len, on_disk)) = st.buffers.next_unloaded_dirty(0) {
                st.buffers.mark_loading(off, len);
                Some((off, len, on_disk, st.disk_cache.clone()))
            } else {
                None
            }
        };
        if let Some((off, len, on_disk, disk)) = reload {
            inode.load_range(off, len, on_disk, disk).await?;
            continue;
        }

        // Pick work: the lowest dirty part.
        let turn = {
            let mut st = inode.lock_state().await;
            let size = st.attrs.size;
            let finalize = st.force_flush || inode.file_handles() == 0;
            let dirty_parts = st.buffers.dirty_part_indexes(part_size);

            let chosen = dirty_parts.iter().find_map(|&idx| {
                let start = idx * part_size;
                let end = ((idx + 1) * part_size).min(size);
                let full = end - start == part_size;
                (full || finalize).then_some((idx, start, end, full))
            });

            if let Some((idx, start, end, full)) = chosen {
                match st.buffers.materialized_range(start, end) {
                    Some(data) => {
                        let ids = st.buffers.dirty_ids_in_range(start, end);
                        Turn::Upload {
                            num: u32::try_from(idx).unwrap_or(u32::MAX - 1) + 1,
                            start,
                            end,
                            full,
                            data,
                            ids,
                        }
                    }
                    None => {
                        // Something in the part is not in memory yet.
                        match first_load(&mut st, start, end - start) {
                            Some((off, len, on_disk)) => {
                                st.buffers.mark_loading(off, len);
                                Turn::Load(off, len, on_disk, st.disk_cache.clone())
                            }
                            None => Turn::Idle,
                        }
                    }
                }
            } else if finalize {
                match st
                    .mpu
                    .as_ref()
                    .and_then(|mpu| mpu.completion_list(size).map(|l| (l, mpu.upload_id.clone())))
                {
                    Some((list, upload_id)) => Turn::Finalize(size, list, upload_id),
                    None if st.buffers.has_dirty() => Turn::Idle,
                    None => {
                        // Parts were discarded (overwrite or truncate); the
                        // affected ranges must become dirty again so they
                        // re-upload.
                        let missing = missing_part_ranges(&st, part_size, size);
                        match missing {
                            Some((start, end)) => {
                                st.buffers.reopen_range(start, end);
                                continue;
                            }
                            None => Turn::Idle,
                        }
                    }
                }
            } else {
                Turn::Idle
            }
        };

        match turn {
            Turn::Idle => return Ok(()),
            Turn::Load(off, len, on_disk, disk) => {
                inode.load_range(off, len, on_disk, disk).await?;
            }
            Turn::Upload {
                num,
                start,
                end,
                full,
                data,
                ids,
            } => {
                let upload_id = {
                    let st = inode.lock_state().await;
                    match &st.mpu {
                        Some(mpu) => mpu.upload_id.clone(),
                        None => continue,
                    }
                };
                let spill = data.clone();
                let etag = backend
                    .upload_part(&key, &upload_id, num, data)
                    .await
                    .map_err(|e| {
                        warn!(ino = inode.id(), key, num, error = %e, "part upload failed");
                        FsError::Io
                    })?;

                let mut st = inode.lock_state().await;
                let still_same_upload =
                    st.mpu.as_ref().is_some_and(|m| m.upload_id == upload_id);
                if !still_same_upload {
                    continue;
                }
                let committed = st.buffers.commit_flushed(
                    &ids,
                    if full {
                        BufferState::FlushedFull
                    } else {
                        BufferState::FlushedCut
                    },
                );
                if committed != ids.len() {
                    // A writer interleaved; discard this part's result and
                    // let the next turn re-upload it.
                    trace!(ino = inode.id(), num, "part invalidated by concurrent write");
                    continue;
                }
                if full {
                    st.buffers.mark_range_flushed(start, end);
                }
                if let Some(mpu) = &mut st.mpu {
                    mpu.record_part(PartRecord {
                        num,
                        offset: start,
                        size: end - start,
                        etag,
                    });
                }
                drop(st);
                spill_to_disk(fs, inode, start, end, spill).await;
                inode.notify_waiters();
            }
            Turn::Finalize(size, list, upload_id) => {
                let etag = backend
                    .complete_multipart(&key, &upload_id, &list)
                    .await
                    .map_err(|e| {
                        warn!(ino = inode.id(), key, error = %e, "complete multipart failed");
                        FsError::Io
                    })?;

                let was_created = inode.cache_state() == CacheState::Created;
                {
                    let mut st = inode.lock_state().await;
                    if st
                        .mpu
                        .as_ref()
                        .is_none_or(|m| m.upload_id != upload_id)
                    {
                        continue;
                    }
                    st.mpu = None;
                    st.buffers.collapse_to_clean(size);
                    if let Some(etag) = &etag {
                        st.s3_metadata
                            .insert("etag".to_string(), etag.clone().into_bytes());
                    }
                    st.known_etag = etag.clone();
                    st.known_size = size;
                    st.metadata_dirty = MetadataDirty::Clean;
                    st.force_flush = false;
                    st.old_parent = None;
                    st.old_name = None;
                    st.renaming_to = false;
                    if !st.buffers.has_dirty() && inode.cache_state() != CacheState::Deleted {
                        inode.set_cache_state(&mut st, CacheState::Cached);
                    }
                }
                inode.notify_waiters();

                if let Some((old_parent, old_name)) = staged.clone() {
                    if let Ok((backend, parent_key)) = old_parent.cloud().await {
                        let old_key = append_child_name(&parent_key, &old_name);
                        match backend.delete_blob(&old_key).await {
                            Ok(()) => {}
                            Err(e) if e.is_not_found() => {}
                            Err(e) => warn!(old_key, error = %e, "rename source not removed"),
                        }
                    }
                }
                if was_created
                    && inode.cache_state() == CacheState::Cached
                    && let Some(parent) = inode.parent()
                {
                    parent.add_modified(-1).await;
                }
                debug!(ino = inode.id(), key, "multipart flush complete");
                return Ok(());
            }
        }
    }

    warn!(ino = inode.id(), "multipart flush exceeded its turn budget");
    Err(FsError::Io)
}

/// First not-in-memory segment of `[offset, offset + len)`, if any.
fn first_load(
    st: &mut crate::fs::inode::InodeState,
    offset: u64,
    len: u64,
) -> Option<(u64, u64, bool)> {
    for seg in st.buffers.get_range(offset, len) {
        match seg {
            RangeSegment::LoadFromDisk { offset, length } => return Some((offset, length, true)),
            RangeSegment::LoadFromRemote { offset, length } => {
                return Some((offset, length, false));
            }
            RangeSegment::Loading { .. }
            | RangeSegment::Data { .. }
            | RangeSegment::Zero { .. } => {}
        }
    }
    None
}

/// Materialize everything in `[0, size)`; used by the whole-object path.
async fn materialize(inode: &Arc<Inode>) -> Result<(), FsError> {
    loop {
        let pending = {
            let mut st = inode.lock_state().await;
            let size = st.attrs.size;
            match first_load(&mut st, 0, size) {
                Some((off, seg_len, on_disk)) => {
                    st.buffers.mark_loading(off, seg_len);
                    Some((off, seg_len, on_disk, st.disk_cache.clone()))
                }
                None => None,
            }
        };
        match pending {
            Some((off, len, on_disk, disk)) => {
                inode.load_range(off, len, on_disk, disk).await?;
            }
            None => return Ok(()),
        }
    }
}

/// The first contiguous span of parts whose records are missing — the
/// aftermath of a discarded part. Ends are clamped to the file size.
fn missing_part_ranges(
    st: &crate::fs::inode::InodeState,
    part_size: u64,
    size: u64,
) -> Option<(u64, u64)> {
    let mpu = st.mpu.as_ref()?;
    let mut missing_start = None;
    let mut off = 0;
    while off < size {
        let present = mpu.has_part(mpu.part_for_offset(off));
        if present {
            if let Some(start) = missing_start {
                return Some((start, off));
            }
        } else if missing_start.is_none() {
            missing_start = Some(off);
        }
        off += part_size;
    }
    missing_start.map(|start| (start, size))
}

/// Spill a finished part to the disk cache so memory-pressure eviction can
/// clear it and re-reads stay local.
async fn spill_to_disk(fs: &Arc<BlobFs>, inode: &Arc<Inode>, start: u64, end: u64, data: Bytes) {
    let Some(cache_dir) = &fs.config.cache_dir else {
        return;
    };

    let existing = {
        let st = inode.lock_state().await;
        st.disk_cache.clone()
    };
    let cache = match existing {
        Some(cache) => cache,
        None => match DiskCache::open(cache_dir, inode.id()).await {
            Ok(cache) => {
                let mut st = inode.lock_state().await;
                st.disk_cache.get_or_insert(cache).clone()
            }
            Err(e) => {
                warn!(ino = inode.id(), error = %e, "disk cache open failed");
                return;
            }
        },
    };

    if let Err(e) = cache.write_at(start, data).await {
        warn!(ino = inode.id(), error = %e, "disk cache spill failed");
        return;
    }
    let mut st = inode.lock_state().await;
    st.buffers.mark_on_disk(start, end);
}
