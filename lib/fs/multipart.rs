//! Bookkeeping for one in-progress multipart upload.
//!
//! Parts are fixed-size slices of the file keyed by part number; the store
//! only accepts the final `complete` call when every part up to the last is
//! present and correctly sized, so the tracker's job is to remember each
//! part's ETag until then and to say whether the set is completable.

/// One uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRecord {
    /// 1-based part number.
    pub num: u32,
    pub offset: u64,
    pub size: u64,
    pub etag: String,
}

/// State of one multipart upload, held by the owning inode while any
/// flushed-but-unfinalized buffers exist.
#[derive(Debug, Clone)]
pub struct MultipartUpload {
    /// Backend upload token.
    pub upload_id: String,
    /// Key the upload was opened against. Rename while an upload is open
    /// restarts the flush cycle, so this never goes stale silently.
    pub key: String,
    /// Size every full part is cut to.
    pub part_size: u64,
    parts: Vec<Option<PartRecord>>,
}

impl MultipartUpload {
    #[must_use]
    pub fn new(upload_id: String, key: String, part_size: u64) -> Self {
        Self {
            upload_id,
            key,
            part_size,
            parts: Vec::new(),
        }
    }

    /// The 1-based part number covering `offset`.
    #[must_use]
    pub fn part_for_offset(&self, offset: u64) -> u32 {
        u32::try_from(offset / self.part_size).unwrap_or(u32::MAX - 1) + 1
    }

    /// Record (or replace) a part.
    pub fn record_part(&mut self, part: PartRecord) {
        let idx = usize::try_from(part.num - 1).unwrap_or(usize::MAX);
        if self.parts.len() <= idx {
            self.parts.resize(idx + 1, None);
        }
        self.parts[idx] = Some(part);
    }

    /// Drop the recorded part covering `offset`, if any. Used when a write
    /// dirties a region under an already-uploaded full part.
    pub fn discard_part_at(&mut self, offset: u64) {
        let idx = usize::try_from(self.part_for_offset(offset) - 1).unwrap_or(usize::MAX);
        if let Some(slot) = self.parts.get_mut(idx) {
            *slot = None;
        }
    }

    #[must_use]
    pub fn recorded_parts(&self) -> usize {
        self.parts.iter().flatten().count()
    }

    /// Whether a record exists for the 1-based part `num`.
    #[must_use]
    pub fn has_part(&self, num: u32) -> bool {
        usize::try_from(num)
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| self.parts.get(idx))
            .is_some_and(Option::is_some)
    }

    /// The ordered `(part number, etag)` list for the complete call, or
    /// `None` while any gap remains.
    #[must_use]
    pub fn completion_list(&self, total_size: u64) -> Option<Vec<(u32, String)>> {
        let covered: u64 = self.parts.iter().flatten().map(|p| p.size).sum();
        if covered != total_size {
            return None;
        }
        let mut list = Vec::with_capacity(self.parts.len());
        for (idx, slot) in self.parts.iter().enumerate() {
            let part = slot.as_ref()?;
            debug_assert_eq!(usize::try_from(part.num - 1).ok(), Some(idx));
            list.push((part.num, part.etag.clone()));
        }
        Some(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(num: u32, offset: u64, size: u64) -> PartRecord {
        PartRecord {
            num,
            offset,
            size,
            etag: format!("etag-{num}"),
        }
    }

    #[test]
    fn completion_requires_full_coverage() {
        let mut mpu = MultipartUpload::new("tok".into(), "k".into(), 100);
        mpu.record_part(part(1, 0, 100));
        assert_eq!(mpu.completion_list(150), None, "tail part missing");

        mpu.record_part(part(2, 100, 50));
        let list = mpu.completion_list(150).expect("complete");
        assert_eq!(
            list,
            vec![(1, "etag-1".to_string()), (2, "etag-2".to_string())]
        );
    }

    #[test]
    fn gaps_block_completion() {
        let mut mpu = MultipartUpload::new("tok".into(), "k".into(), 100);
        mpu.record_part(part(1, 0, 100));
        mpu.record_part(part(3, 200, 100));
        assert_eq!(mpu.completion_list(300), None);
    }

    #[test]
    fn discarded_part_reopens_the_gap() {
        let mut mpu = MultipartUpload::new("tok".into(), "k".into(), 100);
        mpu.record_part(part(1, 0, 100));
        mpu.record_part(part(2, 100, 100));
        assert!(mpu.completion_list(200).is_some());

        mpu.discard_part_at(120);
        assert_eq!(mpu.completion_list(200), None);
        assert_eq!(mpu.recorded_parts(), 1);
    }

    #[test]
    fn part_numbering_is_one_based_by_offset() {
        let mpu = MultipartUpload::new("tok".into(), "k".into(), 100);
        assert_eq!(mpu.part_for_offset(0), 1);
        assert_eq!(mpu.part_for_offset(99), 1);
        assert_eq!(mpu.part_for_offset(100), 2);
    }
}
