//! Chunked buffer store backing each file.
//!
//! A file's cached contents are a sorted, non-overlapping list of
//! [`FileBuffer`] chunks covering exactly `[0, size)`. Writes split and
//! replace chunks in place, so overlaps never persist; the newest write wins
//! at write time rather than at read time. Each mutation stamps the affected
//! chunks with a fresh dirty id, which is what lets the flusher upload a
//! snapshot while writers keep going: a chunk whose id changed under an
//! in-flight upload simply has that upload's result discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

/// Monotonic per-file chunk version. Zero means "matches the remote object".
pub type DirtyId = u64;

/// Flush state of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Matches remote; evictable at will.
    Clean,
    /// Holds user writes that have not been uploaded.
    Dirty,
    /// Uploaded as a full-sized part of an unfinalized multipart upload.
    FlushedFull,
    /// Uploaded as an undersized part; pinned in memory until finalization.
    FlushedCut,
    /// A [`FlushedFull`](Self::FlushedFull) chunk whose memory was released.
    FlCleared,
}

impl BufferState {
    /// Part of an unfinalized multipart upload.
    #[must_use]
    pub fn is_flushed(self) -> bool {
        matches!(self, Self::FlushedFull | Self::FlushedCut | Self::FlCleared)
    }
}

/// Process-wide accounting for buffer memory.
///
/// Chunks hold a [`PoolHandle`] back-reference; the charge is released when
/// the last chunk sharing the allocation drops it.
#[derive(Debug)]
pub struct BufferPool {
    limit: u64,
    in_use: AtomicU64,
}

impl BufferPool {
    #[must_use]
    pub fn new(limit: u64) -> Arc<Self> {
        Arc::new(Self {
            limit,
            in_use: AtomicU64::new(0),
        })
    }

    /// Account for `bytes` of freshly materialized chunk data.
    #[must_use]
    pub fn charge(self: &Arc<Self>, bytes: u64) -> PoolHandle {
        self.in_use.fetch_add(bytes, Ordering::Relaxed);
        PoolHandle(Arc::new(Charge {
            pool: Arc::clone(self),
            bytes,
        }))
    }

    #[must_use]
    pub fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    #[must_use]
    pub fn over_limit(&self) -> bool {
        self.limit > 0 && self.in_use() > self.limit
    }
}

/// Shared reference to one pool charge. Cloned when a chunk splits, so the
/// allocation stays accounted until every slice of it is gone.
#[derive(Debug, Clone)]
pub struct PoolHandle(Arc<Charge>);

#[derive(Debug)]
struct Charge {
    pool: Arc<BufferPool>,
    bytes: u64,
}

impl Drop for Charge {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(self.bytes, Ordering::Relaxed);
    }
}

/// One contiguous byte range `[offset, offset + length)` of a file.
#[derive(Debug, Clone)]
pub struct FileBuffer {
    pub offset: u64,
    pub length: u64,
    pub state: BufferState,
    /// A fetch (remote or disk cache) is in flight for this range.
    pub loading: bool,
    /// The authoritative bytes are in the disk-cache file.
    pub on_disk: bool,
    /// Logically unmaterialized: no bytes are held for this range.
    pub zero: bool,
    /// Recency stamp for the memory-pressure evictor.
    pub recency: u64,
    /// Zero iff the chunk matches the remote object.
    pub dirty_id: DirtyId,
    data: Option<Bytes>,
    ptr: Option<PoolHandle>,
}

impl FileBuffer {
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    #[must_use]
    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    fn zero_chunk(offset: u64, length: u64, state: BufferState, dirty_id: DirtyId) -> Self {
        Self {
            offset,
            length,
            state,
            loading: false,
            on_disk: false,
            zero: true,
            recency: 0,
            dirty_id,
            data: None,
            ptr: None,
        }
    }
}

/// One piece of a requested read range, in offset order.
#[derive(Debug)]
pub enum RangeSegment {
    /// Materialized bytes.
    Data { offset: u64, data: Bytes },
    /// Logical zeros (a local hole).
    Zero { offset: u64, length: u64 },
    /// Authoritative bytes live in the disk-cache file.
    LoadFromDisk { offset: u64, length: u64 },
    /// Must be fetched from the remote object.
    LoadFromRemote { offset: u64, length: u64 },
    /// Another task is already fetching this range; wait and retry.
    Loading { offset: u64, length: u64 },
}

/// What a write ran over, so the caller can react to multipart implications.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteOutcome {
    /// The write touched a [`BufferState::FlushedCut`] region — the current
    /// multipart upload can no longer be completed and must be abandoned.
    pub overwrote_flushed_cut: bool,
    /// The write touched a `FlushedFull`/`FlCleared` region — those parts
    /// must be discarded and re-uploaded.
    pub overwrote_flushed_part: bool,
}

impl WriteOutcome {
    fn absorb_state(&mut self, state: BufferState) {
        match state {
            BufferState::FlushedCut => self.overwrote_flushed_cut = true,
            BufferState::FlushedFull | BufferState::FlCleared => {
                self.overwrote_flushed_part = true;
            }
            BufferState::Clean | BufferState::Dirty => {}
        }
    }
}

/// A consistent snapshot of one dirty run, taken under the inode lock and
/// uploaded with the lock dropped.
#[derive(Debug, Clone)]
pub struct FlushSnapshot {
    pub offset: u64,
    pub data: Bytes,
    /// `(offset, length, dirty_id)` of every chunk in the run, used to
    /// detect interleaving writes at commit time.
    pub chunks: Vec<(u64, u64, DirtyId)>,
}

/// The sorted chunk list for one file.
#[derive(Debug, Default)]
pub struct BufferList {
    buffers: Vec<FileBuffer>,
    next_dirty_id: DirtyId,
    recency_counter: u64,
}

impl BufferList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// End of the covered range; equals the file size at rest.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.buffers.last().map_or(0, FileBuffer::end)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    #[must_use]
    pub fn iter(&self) -> std::slice::Iter<'_, FileBuffer> {
        self.buffers.iter()
    }

    fn alloc_dirty_id(&mut self) -> DirtyId {
        self.next_dirty_id += 1;
        self.next_dirty_id
    }

    fn touch_recency(&mut self) -> u64 {
        self.recency_counter += 1;
        self.recency_counter
    }

    /// Release every chunk.
    pub fn reset(&mut self) {
        self.buffers.clear();
    }

    /// Any chunk still holding unuploaded writes?
    #[must_use]
    pub fn has_dirty(&self) -> bool {
        self.buffers
            .iter()
            .any(|b| b.state == BufferState::Dirty)
    }

    /// Any chunk belonging to an unfinalized multipart upload?
    #[must_use]
    pub fn has_flushed(&self) -> bool {
        self.buffers.iter().any(|b| b.state.is_flushed())
    }

    /// Bytes held in memory by this list (zero and cleared chunks are free).
    #[must_use]
    pub fn memory_bytes(&self) -> u64 {
        self.buffers
            .iter()
            .filter(|b| b.data.is_some())
            .map(|b| b.length)
            .sum()
    }

    /// Split the chunk straddling `offset`, if any. Dirty halves each get a
    /// fresh dirty id so in-flight uploads of the old chunk are invalidated.
    pub fn split_at(&mut self, offset: u64) {
        let Some(idx) = self
            .buffers
            .iter()
            .position(|b| b.offset < offset && offset < b.end())
        else {
            return;
        };

        let left_len = offset - self.buffers[idx].offset;
        let mut right = self.buffers[idx].clone();
        {
            let left = &mut self.buffers[idx];
            left.length = left_len;
            if let Some(data) = &left.data {
                left.data = Some(data.slice(..usize::try_from(left_len).unwrap_or(usize::MAX)));
            }
        }
        right.offset = offset;
        right.length -= left_len;
        if let Some(data) = &right.data {
            right.data = Some(data.slice(usize::try_from(left_len).unwrap_or(usize::MAX)..));
        }
        if right.state == BufferState::Dirty {
            self.buffers[idx].dirty_id = self.alloc_dirty_id();
            right.dirty_id = self.alloc_dirty_id();
        }
        self.buffers.insert(idx + 1, right);
    }

    /// Grow or shrink coverage to `[0, new_size)`.
    ///
    /// `reset` releases everything first. Extension adds one unmaterialized
    /// chunk: dirty (a local hole that must be uploaded) when `zero_fill`,
    /// clean (an uncached remote range, fetched on demand) otherwise.
    pub fn resize(&mut self, new_size: u64, zero_fill: bool, reset: bool) -> WriteOutcome {
        let mut outcome = WriteOutcome::default();
        if reset {
            self.reset();
        }

        let end = self.end();
        if new_size < end {
            self.split_at(new_size);
            while self.buffers.last().is_some_and(|b| b.offset >= new_size) {
                let dropped = self.buffers.pop().unwrap_or_else(|| unreachable!());
                outcome.absorb_state(dropped.state);
            }
        } else if new_size > end {
            let (state, dirty_id) = if zero_fill {
                let id = self.alloc_dirty_id();
                (BufferState::Dirty, id)
            } else {
                (BufferState::Clean, 0)
            };
            self.buffers
                .push(FileBuffer::zero_chunk(end, new_size - end, state, dirty_id));
        }
        outcome
    }

    /// Overlay `[offset, offset + data.len())` with a fresh dirty chunk.
    ///
    /// A gap between the current end and `offset` becomes a dirty zero
    /// chunk, so reading it back returns zeros and flushing uploads them.
    pub fn write(&mut self, offset: u64, data: &[u8], pool: &Arc<BufferPool>) -> WriteOutcome {
        let mut outcome = WriteOutcome::default();
        if data.is_empty() {
            return outcome;
        }
        let len = data.len() as u64;
        let end = self.end();

        if offset > end {
            let gap_id = self.alloc_dirty_id();
            self.buffers.push(FileBuffer::zero_chunk(
                end,
                offset - end,
                BufferState::Dirty,
                gap_id,
            ));
        }

        self.split_at(offset);
        self.split_at(offset + len);

        // After the splits, every chunk is either fully inside or fully
        // outside the write range; the inside ones are replaced.
        self.buffers.retain(|b| {
            let covered = b.offset >= offset && b.end() <= offset + len;
            if covered {
                outcome.absorb_state(b.state);
            }
            !covered
        });
        let insert_at = self
            .buffers
            .iter()
            .position(|b| b.offset >= offset)
            .unwrap_or(self.buffers.len());

        let recency = self.touch_recency();
        let dirty_id = self.alloc_dirty_id();
        self.buffers.insert(
            insert_at,
            FileBuffer {
                offset,
                length: len,
                state: BufferState::Dirty,
                loading: false,
                on_disk: false,
                zero: false,
                recency,
                dirty_id,
                data: Some(Bytes::copy_from_slice(data)),
                ptr: Some(pool.charge(len)),
            },
        );
        outcome
    }

    /// Describe `[offset, offset + size)` as a sequence of segments.
    ///
    /// Callers resolve `LoadFrom*` segments by marking them loading,
    /// dropping the inode lock, fetching, and committing via
    /// [`fill_loaded`](Self::fill_loaded).
    pub fn get_range(&mut self, offset: u64, size: u64) -> Vec<RangeSegment> {
        let recency = self.touch_recency();
        let range_end = (offset + size).min(self.end());
        let mut segments = Vec::new();

        for b in &mut self.buffers {
            if b.end() <= offset {
                continue;
            }
            if b.offset >= range_end {
                break;
            }
            b.recency = recency;
            let seg_start = b.offset.max(offset);
            let seg_end = b.end().min(range_end);
            let seg_len = seg_end - seg_start;

            let segment = if b.loading {
                RangeSegment::Loading {
                    offset: seg_start,
                    length: seg_len,
                }
            } else if let Some(data) = &b.data {
                let from = usize::try_from(seg_start - b.offset).unwrap_or(usize::MAX);
                let to = usize::try_from(seg_end - b.offset).unwrap_or(usize::MAX);
                RangeSegment::Data {
                    offset: seg_start,
                    data: data.slice(from..to),
                }
            } else if b.zero && b.dirty_id != 0 {
                RangeSegment::Zero {
                    offset: seg_start,
                    length: seg_len,
                }
            } else if b.on_disk {
                RangeSegment::LoadFromDisk {
                    offset: seg_start,
                    length: seg_len,
                }
            } else {
                RangeSegment::LoadFromRemote {
                    offset: seg_start,
                    length: seg_len,
                }
            };
            segments.push(segment);
        }
        segments
    }

    /// Mark `[offset, offset + length)` as having a fetch in flight.
    /// Chunk boundaries are aligned to the range first.
    pub fn mark_loading(&mut self, offset: u64, length: u64) {
        self.split_at(offset);
        self.split_at(offset + length);
        for b in &mut self.buffers {
            if b.offset >= offset && b.end() <= offset + length && b.data.is_none() {
                b.loading = true;
            }
        }
    }

    /// Commit fetched bytes for `[offset, offset + data.len())`.
    ///
    /// Only chunks still marked loading accept the data — a write that
    /// landed while the fetch was in flight wins. Cleared multipart chunks
    /// that get their bytes back become evictable full parts again.
    pub fn fill_loaded(&mut self, offset: u64, data: &Bytes, pool: &Arc<BufferPool>) {
        let end = offset + data.len() as u64;
        for b in &mut self.buffers {
            if !b.loading || b.offset < offset || b.end() > end {
                continue;
            }
            let from = usize::try_from(b.offset - offset).unwrap_or(usize::MAX);
            let to = usize::try_from(b.end() - offset).unwrap_or(usize::MAX);
            b.data = Some(data.slice(from..to));
            b.ptr = Some(pool.charge(b.length));
            b.loading = false;
            b.zero = false;
            if b.state == BufferState::FlCleared {
                b.state = BufferState::FlushedFull;
            }
        }
    }

    /// Abort an in-flight load (fetch failed); chunks become fetchable again.
    pub fn clear_loading(&mut self, offset: u64, length: u64) {
        for b in &mut self.buffers {
            if b.loading && b.offset >= offset && b.end() <= offset + length {
                b.loading = false;
            }
        }
    }

    /// Snapshot the first dirty run at or after `from`, up to `max_len`
    /// bytes, materializing zeros for hole chunks.
    ///
    /// Chunk boundaries are aligned to `from` and to the length cap first,
    /// so the snapshot always covers whole chunks and
    /// [`commit_flushed`](Self::commit_flushed) can match them by exact
    /// `(offset, length, dirty_id)`. Stops at the first non-dirty or
    /// unmaterialized chunk so the run stays contiguous and snapshotable.
    pub fn next_dirty_run(&mut self, from: u64, max_len: u64) -> Option<FlushSnapshot> {
        self.split_at(from);
        let start_idx = self
            .buffers
            .iter()
            .position(|b| b.state == BufferState::Dirty && b.offset >= from)?;
        let run_start = self.buffers[start_idx].offset;
        let run_cap = run_start.saturating_add(max_len);
        self.split_at(run_cap);

        let mut chunks = Vec::new();
        let mut out = bytes::BytesMut::new();

        for b in &self.buffers[start_idx..] {
            if b.state != BufferState::Dirty
                || b.offset != run_start + out.len() as u64
                || b.end() > run_cap
            {
                break;
            }
            if b.zero {
                out.resize(
                    out.len() + usize::try_from(b.length).unwrap_or(usize::MAX),
                    0,
                );
            } else if let Some(data) = &b.data {
                out.extend_from_slice(data);
            } else {
                // No bytes in memory (a reopened cleared part); the caller
                // reloads the range before snapshotting it.
                break;
            }
            chunks.push((b.offset, b.length, b.dirty_id));
        }

        if chunks.is_empty() {
            return None;
        }
        Some(FlushSnapshot {
            offset: run_start,
            data: out.freeze(),
            chunks,
        })
    }

    /// The first dirty chunk at or after `from` that has no bytes in memory
    /// (a reopened cleared part). The flusher reloads these before
    /// snapshotting. The boolean is true when the bytes live in the disk
    /// cache.
    #[must_use]
    pub fn next_unloaded_dirty(&self, from: u64) -> Option<(u64, u64, bool)> {
        self.buffers
            .iter()
            .find(|b| {
                b.state == BufferState::Dirty
                    && b.end() > from
                    && !b.zero
                    && b.data.is_none()
                    && !b.loading
            })
            .map(|b| (b.offset, b.length, b.on_disk))
    }

    /// Record that `[start, end)` has been spilled to the disk cache.
    /// Dirty chunks are skipped — their content may already differ from
    /// what was spilled.
    pub fn mark_on_disk(&mut self, start: u64, end: u64) {
        for b in &mut self.buffers {
            if b.offset >= start
                && b.end() <= end
                && !b.loading
                && b.state != BufferState::Dirty
                && !b.zero
            {
                b.on_disk = true;
            }
        }
    }

    /// Commit an upload: transition every snapshot chunk that still carries
    /// its snapshot dirty id to `new_state`. Returns how many chunks
    /// accepted the transition; a partial or zero count means writers
    /// interleaved and the upload result is (partly) stale.
    pub fn commit_flushed(
        &mut self,
        snapshot: &[(u64, u64, DirtyId)],
        new_state: BufferState,
    ) -> usize {
        let mut committed = 0;
        for &(offset, length, dirty_id) in snapshot {
            for b in &mut self.buffers {
                if b.offset == offset
                    && b.length == length
                    && b.dirty_id == dirty_id
                    && b.state == BufferState::Dirty
                {
                    b.state = new_state;
                    if new_state == BufferState::Clean {
                        b.dirty_id = 0;
                    }
                    committed += 1;
                }
            }
        }
        committed
    }

    /// Downgrade flushed chunks inside `[start, end)` back to dirty with
    /// fresh ids. Used when a write invalidates already-uploaded parts:
    /// part boundaries must match on re-upload, so the whole part span is
    /// reopened, not just the overwritten bytes.
    pub fn reopen_range(&mut self, start: u64, end: u64) {
        self.split_at(start);
        self.split_at(end);
        for idx in 0..self.buffers.len() {
            let (off, chunk_end, flushed) = {
                let b = &self.buffers[idx];
                (b.offset, b.end(), b.state.is_flushed())
            };
            if flushed && off >= start && chunk_end <= end {
                let id = self.alloc_dirty_id();
                let b = &mut self.buffers[idx];
                b.state = BufferState::Dirty;
                b.dirty_id = id;
            }
        }
    }

    /// Mark clean, materialized chunks inside `[start, end)` as belonging
    /// to an uploaded part. A later write over them then invalidates the
    /// part instead of silently going stale under it.
    pub fn mark_range_flushed(&mut self, start: u64, end: u64) {
        self.split_at(start);
        self.split_at(end);
        for idx in 0..self.buffers.len() {
            let (off, chunk_end, eligible) = {
                let b = &self.buffers[idx];
                (
                    b.offset,
                    b.end(),
                    b.state == BufferState::Clean && b.data.is_some(),
                )
            };
            if eligible && off >= start && chunk_end <= end {
                let id = self.alloc_dirty_id();
                let b = &mut self.buffers[idx];
                b.state = BufferState::FlushedFull;
                b.dirty_id = id;
            }
        }
    }

    /// Assemble the bytes of `[start, end)` if every chunk in the range is
    /// either materialized or a local zero hole. `None` means something
    /// must be loaded first.
    #[must_use]
    pub fn materialized_range(&self, start: u64, end: u64) -> Option<Bytes> {
        let mut out = bytes::BytesMut::with_capacity(usize::try_from(end - start).unwrap_or(0));
        let mut cursor = start;
        for b in &self.buffers {
            if b.end() <= start {
                continue;
            }
            if b.offset >= end {
                break;
            }
            if b.offset > cursor || b.loading {
                return None;
            }
            let seg_start = cursor;
            let seg_end = b.end().min(end);
            let seg_len = usize::try_from(seg_end - seg_start).unwrap_or(usize::MAX);
            if let Some(data) = b.data() {
                let from = usize::try_from(seg_start - b.offset).unwrap_or(usize::MAX);
                out.extend_from_slice(&data[from..from + seg_len]);
            } else if b.zero && b.dirty_id != 0 {
                out.resize(out.len() + seg_len, 0);
            } else {
                return None;
            }
            cursor = seg_end;
        }
        (cursor == end).then(|| out.freeze())
    }

    /// `(offset, length, dirty_id)` of every dirty chunk inside
    /// `[start, end)`, for commit-time revalidation.
    #[must_use]
    pub fn dirty_ids_in_range(&self, start: u64, end: u64) -> Vec<(u64, u64, DirtyId)> {
        self.buffers
            .iter()
            .filter(|b| b.state == BufferState::Dirty && b.offset < end && b.end() > start)
            .map(|b| (b.offset, b.length, b.dirty_id))
            .collect()
    }

    /// Indexes (0-based) of the fixed-size parts that contain dirty bytes.
    #[must_use]
    pub fn dirty_part_indexes(&self, part_size: u64) -> Vec<u64> {
        let mut parts = Vec::new();
        for b in &self.buffers {
            if b.state != BufferState::Dirty {
                continue;
            }
            let first = b.offset / part_size;
            let last = (b.end() - 1) / part_size;
            for idx in first..=last {
                if parts.last() != Some(&idx) {
                    parts.push(idx);
                }
            }
        }
        parts.dedup();
        parts
    }

    /// Downgrade every flushed chunk back to dirty with fresh ids, so the
    /// next flush cycle re-uploads them. Used when a multipart upload is
    /// abandoned. Cleared parts come back without bytes; the flusher
    /// reloads them (disk cache or remote) before re-uploading.
    pub fn reopen_flushed(&mut self) {
        for idx in 0..self.buffers.len() {
            if self.buffers[idx].state.is_flushed() {
                let id = self.alloc_dirty_id();
                let b = &mut self.buffers[idx];
                b.state = BufferState::Dirty;
                b.dirty_id = id;
            }
        }
    }

    /// Release memory under pressure, oldest recency first: clean chunks
    /// drop their bytes outright, full flushed parts become cleared.
    /// Returns the number of bytes released.
    pub fn evict(&mut self, max_bytes: u64) -> u64 {
        let mut order: Vec<usize> = (0..self.buffers.len())
            .filter(|&i| {
                let b = &self.buffers[i];
                !b.loading
                    && b.data.is_some()
                    && matches!(b.state, BufferState::Clean | BufferState::FlushedFull)
            })
            .collect();
        order.sort_by_key(|&i| self.buffers[i].recency);

        let mut freed = 0;
        for i in order {
            if freed >= max_bytes {
                break;
            }
            let b = &mut self.buffers[i];
            freed += b.length;
            b.data = None;
            b.ptr = None;
            if b.state == BufferState::FlushedFull {
                b.state = BufferState::FlCleared;
            }
        }
        freed
    }

    /// Collapse the whole list into a single clean unmaterialized chunk,
    /// used after a finalized flush releases buffers.
    pub fn collapse_to_clean(&mut self, size: u64) {
        self.buffers.clear();
        if size > 0 {
            self.buffers
                .push(FileBuffer::zero_chunk(0, size, BufferState::Clean, 0));
        }
    }

    /// Validate the at-rest invariants. Panics on violation — an overlap or
    /// gap here means a bookkeeping bug, not a recoverable condition.
    pub fn check_invariants(&self, expected_size: u64) {
        let mut cursor = 0;
        for b in &self.buffers {
            assert!(
                b.offset == cursor,
                "buffer list has a gap or overlap at offset {} (expected {})",
                b.offset,
                cursor
            );
            assert!(b.length > 0, "zero-length buffer at offset {}", b.offset);
            assert_eq!(
                b.state == BufferState::Clean,
                b.dirty_id == 0,
                "clean iff dirty_id == 0 violated at offset {}",
                b.offset
            );
            if b.zero {
                assert!(b.data.is_none(), "zero chunk with data at {}", b.offset);
            }
            cursor = b.end();
        }
        assert_eq!(
            cursor, expected_size,
            "buffer coverage does not match file size"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<BufferPool> {
        BufferPool::new(0)
    }

    fn collect_bytes(list: &mut BufferList, offset: u64, size: u64) -> Vec<u8> {
        let mut out = vec![];
        for seg in list.get_range(offset, size) {
            match seg {
                RangeSegment::Data { data, .. } => out.extend_from_slice(&data),
                RangeSegment::Zero { length, .. } => {
                    out.extend(std::iter::repeat_n(0u8, length as usize));
                }
                other => panic!("unexpected segment {other:?}"),
            }
        }
        out
    }

    #[test]
    fn write_then_read_round_trips() {
        let pool = pool();
        let mut list = BufferList::new();
        list.write(0, b"hello world", &pool);
        assert_eq!(collect_bytes(&mut list, 0, 11), b"hello world");
        list.check_invariants(11);
    }

    #[test]
    fn overlapping_write_wins() {
        let pool = pool();
        let mut list = BufferList::new();
        list.write(0, b"aaaaaaaaaa", &pool);
        list.write(3, b"bbb", &pool);
        assert_eq!(collect_bytes(&mut list, 0, 10), b"aaabbbaaaa");
        list.check_invariants(10);
    }

    #[test]
    fn write_beyond_end_creates_dirty_zero_gap() {
        let pool = pool();
        let mut list = BufferList::new();
        list.write(0, b"xy", &pool);
        list.write(6, b"z", &pool);

        let gap = list
            .iter()
            .find(|b| b.zero)
            .expect("gap chunk should exist");
        assert_eq!((gap.offset, gap.length), (2, 4));
        assert_eq!(gap.state, BufferState::Dirty);
        assert_eq!(collect_bytes(&mut list, 0, 7), b"xy\0\0\0\0z");
        list.check_invariants(7);
    }

    #[test]
    fn split_assigns_fresh_dirty_ids() {
        let pool = pool();
        let mut list = BufferList::new();
        list.write(0, b"abcdef", &pool);
        let before = list.iter().next().unwrap().dirty_id;

        list.split_at(3);
        let ids: Vec<_> = list.iter().map(|b| b.dirty_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|&id| id != 0 && id != before));
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn resize_shrink_truncates_straddling_chunk() {
        let pool = pool();
        let mut list = BufferList::new();
        list.write(0, b"abcdefgh", &pool);
        list.resize(3, false, false);
        assert_eq!(list.end(), 3);
        assert_eq!(collect_bytes(&mut list, 0, 3), b"abc");
        list.check_invariants(3);
    }

    #[test]
    fn resize_extend_without_zero_fill_is_uncached() {
        let mut list = BufferList::new();
        list.resize(20, false, true);
        assert_eq!(list.end(), 20);
        let segs = list.get_range(0, 20);
        assert!(
            matches!(segs[..], [RangeSegment::LoadFromRemote { offset: 0, length: 20 }]),
            "clean unmaterialized range must be fetched: {segs:?}"
        );
    }

    #[test]
    fn resize_extend_with_zero_fill_reads_zeros() {
        let pool = pool();
        let mut list = BufferList::new();
        list.write(0, b"ab", &pool);
        list.resize(5, true, false);
        assert_eq!(collect_bytes(&mut list, 0, 5), b"ab\0\0\0");
        assert!(list.has_dirty());
    }

    #[test]
    fn resize_zero_with_reset_releases_everything() {
        let pool = pool();
        let mut list = BufferList::new();
        list.write(0, b"data", &pool);
        list.resize(0, false, true);
        assert!(list.is_empty());
        assert_eq!(list.get_range(0, 10).len(), 0);
        list.check_invariants(0);
    }

    #[test]
    fn pool_accounting_follows_chunk_lifetime() {
        let pool = pool();
        let mut list = BufferList::new();
        list.write(0, b"0123456789", &pool);
        assert_eq!(pool.in_use(), 10);

        // Splitting shares the allocation; no double count.
        list.split_at(4);
        assert_eq!(pool.in_use(), 10);

        list.reset();
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn loading_chunks_reject_stale_fill() {
        let pool = pool();
        let mut list = BufferList::new();
        list.resize(8, false, true);
        list.mark_loading(0, 8);

        // A write lands while the fetch is in flight.
        list.write(2, b"XX", &pool);

        list.fill_loaded(0, &Bytes::from_static(b"abcdefgh"), &pool);
        assert_eq!(collect_bytes(&mut list, 0, 8), b"abXXefgh");
        list.check_invariants(8);
    }

    #[test]
    fn snapshot_commit_requires_matching_dirty_id() {
        let pool = pool();
        let mut list = BufferList::new();
        list.write(0, b"hello", &pool);
        let snap = list.next_dirty_run(0, 1 << 20).expect("dirty run");
        assert_eq!(&snap.data[..], b"hello");

        // Writer interleaves before commit.
        list.write(0, b"HELLO", &pool);
        assert_eq!(list.commit_flushed(&snap.chunks, BufferState::Clean), 0);
        assert!(list.has_dirty(), "interleaved write must stay dirty");
    }

    #[test]
    fn snapshot_commit_transitions_to_clean() {
        let pool = pool();
        let mut list = BufferList::new();
        list.write(0, b"hello", &pool);
        let snap = list.next_dirty_run(0, 1 << 20).expect("dirty run");
        assert_eq!(list.commit_flushed(&snap.chunks, BufferState::Clean), 1);
        assert!(!list.has_dirty());
        list.check_invariants(5);
    }

    #[test]
    fn dirty_run_materializes_hole_zeros() {
        let pool = pool();
        let mut list = BufferList::new();
        list.write(0, b"ab", &pool);
        list.write(4, b"cd", &pool);
        let snap = list.next_dirty_run(0, 1 << 20).expect("dirty run");
        assert_eq!(&snap.data[..], b"ab\0\0cd");
        assert_eq!(snap.chunks.len(), 3);
    }

    #[test]
    fn evict_clears_clean_and_downgrades_flushed_full() {
        let pool = pool();
        let mut list = BufferList::new();
        list.write(0, b"aaaa", &pool);
        let snap = list.next_dirty_run(0, 1 << 20).unwrap();
        list.commit_flushed(&snap.chunks, BufferState::FlushedFull);

        let freed = list.evict(u64::MAX);
        assert_eq!(freed, 4);
        let b = list.iter().next().unwrap();
        assert_eq!(b.state, BufferState::FlCleared);
        assert!(b.data().is_none());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn write_over_flushed_cut_reports_it() {
        let pool = pool();
        let mut list = BufferList::new();
        list.write(0, b"tail", &pool);
        let snap = list.next_dirty_run(0, 1 << 20).unwrap();
        list.commit_flushed(&snap.chunks, BufferState::FlushedCut);

        let outcome = list.write(1, b"X", &pool);
        assert!(outcome.overwrote_flushed_cut);
        list.check_invariants(4);
    }

    #[test]
    fn collapse_to_clean_covers_size() {
        let pool = pool();
        let mut list = BufferList::new();
        list.write(0, b"abcdef", &pool);
        list.collapse_to_clean(6);
        list.check_invariants(6);
        assert!(!list.has_dirty());
        assert_eq!(pool.in_use(), 0);
    }
}
