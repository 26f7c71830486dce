//! Read-only view over the segment sequence, with a sparse op-id index.
//!
//! The index maps the first op id of each indexed segment to its
//! location. It is kept forward-ordered and queried by predecessor
//! (`range(..=target).next_back()`), so a lookup returns the segment
//! that contains the target or the nearest preceding segment:
//!
//! Index entries (first op in the segment, segment number):
//! - `{0.10, seg002}`, `{0.20, seg003}`, `{0.40, seg004}`
//!
//! Example queries:
//! - segment containing `0.15` -> `{0.10, seg002}`
//! - segment containing `0.10` -> `{0.10, seg002}`
//! - segment containing `0.1`  -> none
//! - segment containing `0.100` -> `{0.40, seg004}`

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use kestrel_common::error::LogError;
use kestrel_common::types::OpId;

use crate::segment::{recovery_dir, ReadableSegment, ReplicateEntry};

/// Location of an indexed op id: owning segment and byte offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentIdxPos {
    pub sequence_number: u64,
    pub offset: u64,
}

struct ReaderInner {
    /// All current segments in increasing sequence-number order. Not
    /// every segment appears in `index` (a segment holding no
    /// id-carrying entries is present here but not there).
    segments: Vec<Arc<ReadableSegment>>,
    /// Sparse index: first op id of a segment -> its location.
    index: BTreeMap<OpId, SegmentIdxPos>,
}

impl ReaderInner {
    /// The indexed segment containing `op_id`, or the nearest preceding
    /// indexed segment.
    fn containing(&self, op_id: OpId) -> Option<SegmentIdxPos> {
        self.index.range(..=op_id).next_back().map(|(_, pos)| *pos)
    }

    fn position_of(&self, sequence_number: u64) -> Option<usize> {
        self.segments
            .iter()
            .position(|s| s.sequence_number() == sequence_number)
    }

    fn check_appendable(&self, segment: &ReadableSegment) -> Result<(), LogError> {
        if let Some(last) = self.segments.last() {
            if segment.sequence_number() <= last.sequence_number() {
                return Err(LogError::InvalidSequence(format!(
                    "segment {} not after current tail {}",
                    segment.sequence_number(),
                    last.sequence_number()
                )));
            }
            if !last.has_footer() && !last.is_scanned() {
                return Err(LogError::InvalidSequence(format!(
                    "cannot append after open tail segment {}",
                    last.sequence_number()
                )));
            }
        }
        Ok(())
    }

    fn index_segment(&mut self, segment: &ReadableSegment) {
        if let Some(entry) = segment.index_entry() {
            self.index.insert(
                entry.op_id,
                SegmentIdxPos {
                    sequence_number: segment.sequence_number(),
                    offset: entry.offset,
                },
            );
        }
    }
}

/// Reads a directory of segments. Headers and footers are parsed at
/// open; entry payloads are materialized only by range reads.
///
/// Thread safe.
pub struct LogReader {
    inner: Mutex<ReaderInner>,
}

impl LogReader {
    /// Open a reader on a tablet's log directory.
    pub fn open(log_dir: &Path) -> Result<Self, LogError> {
        Self::open_dir(log_dir)
    }

    /// Open a reader on the recovery directory holding the sealed copies
    /// used on restart.
    pub fn open_from_recovery_dir(log_dir: &Path) -> Result<Self, LogError> {
        Self::open_dir(&recovery_dir(log_dir))
    }

    /// A reader with no segments; for tests that drive the mutation API
    /// directly.
    pub fn empty_for_tests() -> Self {
        Self {
            inner: Mutex::new(ReaderInner {
                segments: Vec::new(),
                index: BTreeMap::new(),
            }),
        }
    }

    fn open_dir(dir: &Path) -> Result<Self, LogError> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("kestrel_") && n.ends_with(".seg"))
            })
            .collect();
        paths.sort();

        let mut inner = ReaderInner {
            segments: Vec::with_capacity(paths.len()),
            index: BTreeMap::new(),
        };
        for path in paths {
            let mut segment = ReadableSegment::open(&path)?;
            if !segment.has_footer() {
                // Sealing did not complete; recover the index entries by
                // scanning. Off the hot path by construction.
                segment.scan()?;
            }
            if let Some(last) = inner.segments.last() {
                if segment.sequence_number() <= last.sequence_number() {
                    return Err(LogError::InvalidSequence(format!(
                        "segment file order broken at {}",
                        path.display()
                    )));
                }
            }
            inner.index_segment(&segment);
            inner.segments.push(Arc::new(segment));
        }
        tracing::debug!(
            segments = inner.segments.len(),
            indexed = inner.index.len(),
            dir = %dir.display(),
            "log reader opened"
        );
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    pub fn num_segments(&self) -> usize {
        self.inner.lock().segments.len()
    }

    /// Copy of the current segment sequence.
    pub fn segments_snapshot(&self) -> Vec<Arc<ReadableSegment>> {
        self.inner.lock().segments.clone()
    }

    /// The largest prefix of segments guaranteed not to contain `op_id`.
    pub fn segment_prefix_not_including(&self, op_id: OpId) -> Vec<Arc<ReadableSegment>> {
        let inner = self.inner.lock();
        let Some(pos) = inner.containing(op_id) else {
            // No indexed point at or before the target: nothing can be
            // ruled out.
            return Vec::new();
        };
        inner
            .segments
            .iter()
            .take_while(|s| s.sequence_number() < pos.sequence_number)
            .cloned()
            .collect()
    }

    /// The smallest suffix of segments guaranteed to contain `op_id`.
    pub fn segment_suffix_including(
        &self,
        op_id: OpId,
    ) -> Result<Vec<Arc<ReadableSegment>>, LogError> {
        let inner = self.inner.lock();
        let pos = inner
            .containing(op_id)
            .ok_or_else(|| LogError::NotFound(format!("no segment may contain op {op_id}")))?;
        Ok(inner
            .segments
            .iter()
            .skip_while(|s| s.sequence_number() < pos.sequence_number)
            .cloned()
            .collect())
    }

    /// Materialize all replicate entries after `starting_after`
    /// (exclusive) up to `up_to` (inclusive). Fails with `NotFound` when
    /// `up_to` is not present in the readable log.
    pub fn read_all_replicate_entries(
        &self,
        starting_after: OpId,
        up_to: OpId,
    ) -> Result<Vec<ReplicateEntry>, LogError> {
        let segments = {
            let inner = self.inner.lock();
            let start = inner
                .containing(starting_after)
                .and_then(|pos| inner.position_of(pos.sequence_number))
                .unwrap_or(0);
            inner.segments[start..].to_vec()
        };

        let mut entries = Vec::new();
        let mut found_up_to = false;
        'segments: for segment in &segments {
            for entry in segment.read_entries()? {
                if entry.op_id <= starting_after {
                    continue;
                }
                if entry.op_id > up_to {
                    break 'segments;
                }
                found_up_to |= entry.op_id == up_to;
                entries.push(entry);
                if found_up_to {
                    break 'segments;
                }
            }
        }
        if !found_up_to {
            return Err(LogError::NotFound(format!(
                "op {up_to} not found in readable log"
            )));
        }
        Ok(entries)
    }

    // -- Mutation (used by the log's owner) ---------------------------------

    /// Append a segment, scanning it first if it has no footer. Not for
    /// new (still-written) segments; use `append_empty_segment`.
    pub fn append_segment(&self, mut segment: ReadableSegment) -> Result<(), LogError> {
        if !segment.has_footer() && !segment.is_scanned() {
            segment.scan()?;
        }
        let mut inner = self.inner.lock();
        inner.check_appendable(&segment)?;
        inner.index_segment(&segment);
        inner.segments.push(Arc::new(segment));
        Ok(())
    }

    /// Append a freshly created, still-empty active segment.
    pub fn append_empty_segment(&self, segment: ReadableSegment) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        inner.check_appendable(&segment)?;
        inner.segments.push(Arc::new(segment));
        Ok(())
    }

    /// Replace the tail segment with its sealed version. The
    /// replacement must carry a footer and the same sequence number.
    pub fn replace_last_segment(&self, segment: ReadableSegment) -> Result<(), LogError> {
        if !segment.has_footer() {
            return Err(LogError::InvalidSequence(
                "replacement segment must be sealed".to_string(),
            ));
        }
        let mut inner = self.inner.lock();
        let last = inner
            .segments
            .last()
            .ok_or_else(|| LogError::InvalidSequence("no segment to replace".to_string()))?;
        if last.sequence_number() != segment.sequence_number() {
            return Err(LogError::InvalidSequence(format!(
                "replacement sequence {} != tail sequence {}",
                segment.sequence_number(),
                last.sequence_number()
            )));
        }
        inner.index_segment(&segment);
        *inner.segments.last_mut().unwrap() = Arc::new(segment);
        Ok(())
    }

    /// Drop all segments with sequence numbers `<= sequence_number`,
    /// along with their index entries.
    pub fn trim_segments_up_to_and_including(&self, sequence_number: u64) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        inner
            .segments
            .retain(|s| s.sequence_number() > sequence_number);
        inner
            .index
            .retain(|_, pos| pos.sequence_number > sequence_number);
        Ok(())
    }

    /// Extend the readable window of the active tail segment. Requires a
    /// footerless tail.
    pub fn update_last_segment_offset(&self, readable_to_offset: u64) -> Result<(), LogError> {
        let inner = self.inner.lock();
        let last = inner
            .segments
            .last()
            .ok_or_else(|| LogError::InvalidSequence("no segments".to_string()))?;
        if last.has_footer() {
            return Err(LogError::InvalidSequence(
                "tail segment is sealed; offset updates not allowed".to_string(),
            ));
        }
        last.set_readable_to_offset(readable_to_offset);
        Ok(())
    }

    /// Every indexed op id must resolve to a live segment.
    #[cfg(test)]
    fn check_index_consistency(&self) {
        let inner = self.inner.lock();
        for pos in inner.index.values() {
            assert!(
                inner.position_of(pos.sequence_number).is_some(),
                "index references missing segment {}",
                pos.sequence_number
            );
        }
    }
}

impl std::fmt::Display for LogReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        write!(
            f,
            "LogReader[{} segments, {} indexed]",
            inner.segments.len(),
            inner.index.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentWriter;
    use tempfile::TempDir;

    fn entry(term: u64, index: u64) -> ReplicateEntry {
        ReplicateEntry {
            op_id: OpId::new(term, index),
            payload: Vec::new(),
        }
    }

    /// Build the reader from the log_reader contract's example table:
    /// seg002 starts at 0.10, seg003 at 0.20, seg004 at 0.40.
    fn example_reader(dir: &Path) -> LogReader {
        let reader = LogReader::empty_for_tests();
        for (seqno, first_index) in [(2u64, 10u64), (3, 20), (4, 40)] {
            let mut writer = SegmentWriter::create(dir, seqno).unwrap();
            for i in 0..10 {
                writer
                    .append_entry(&ReplicateEntry {
                        op_id: OpId::new(0, first_index + i),
                        payload: Vec::new(),
                    })
                    .unwrap();
            }
            reader.append_segment(writer.seal().unwrap()).unwrap();
        }
        reader
    }

    #[test]
    fn test_index_lower_bound_queries() {
        let dir = TempDir::new().unwrap();
        let reader = example_reader(dir.path());

        // 0.15 -> seg002
        let suffix = reader.segment_suffix_including(OpId::new(0, 15)).unwrap();
        assert_eq!(suffix[0].sequence_number(), 2);
        // 0.10 -> seg002
        let suffix = reader.segment_suffix_including(OpId::new(0, 10)).unwrap();
        assert_eq!(suffix[0].sequence_number(), 2);
        // 0.1 -> no segment may contain it
        assert!(matches!(
            reader.segment_suffix_including(OpId::new(0, 1)),
            Err(LogError::NotFound(_))
        ));
        // 0.100 -> seg004
        let suffix = reader.segment_suffix_including(OpId::new(0, 100)).unwrap();
        assert_eq!(suffix[0].sequence_number(), 4);
        assert_eq!(suffix.len(), 1);
    }

    #[test]
    fn test_prefix_not_including() {
        let dir = TempDir::new().unwrap();
        let reader = example_reader(dir.path());

        let prefix = reader.segment_prefix_not_including(OpId::new(0, 40));
        assert_eq!(
            prefix.iter().map(|s| s.sequence_number()).collect::<Vec<_>>(),
            vec![2, 3]
        );
        let prefix = reader.segment_prefix_not_including(OpId::new(0, 25));
        assert_eq!(
            prefix.iter().map(|s| s.sequence_number()).collect::<Vec<_>>(),
            vec![2]
        );
        // Target precedes every indexed point: nothing can be excluded.
        assert!(reader
            .segment_prefix_not_including(OpId::new(0, 1))
            .is_empty());
    }

    #[test]
    fn test_read_range_exclusive_inclusive() {
        let dir = TempDir::new().unwrap();
        let reader = example_reader(dir.path());

        let entries = reader
            .read_all_replicate_entries(OpId::new(0, 15), OpId::new(0, 23))
            .unwrap();
        let ids: Vec<u64> = entries.iter().map(|e| e.op_id.index).collect();
        assert_eq!(ids, vec![16, 17, 18, 19, 20, 21, 22, 23]);
    }

    #[test]
    fn test_read_range_missing_up_to() {
        let dir = TempDir::new().unwrap();
        let reader = example_reader(dir.path());
        // Index 200 is past every entry.
        assert!(matches!(
            reader.read_all_replicate_entries(OpId::new(0, 15), OpId::new(0, 200)),
            Err(LogError::NotFound(_))
        ));
    }

    #[test]
    fn test_open_directory_with_recovery_scan() {
        let dir = TempDir::new().unwrap();

        let mut writer = SegmentWriter::create(dir.path(), 1).unwrap();
        writer.append_entry(&entry(0, 1)).unwrap();
        writer.append_entry(&entry(0, 2)).unwrap();
        writer.seal().unwrap();

        // Tail segment was never sealed (simulated crash).
        let mut writer = SegmentWriter::create(dir.path(), 2).unwrap();
        writer.append_entry(&entry(0, 3)).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let reader = LogReader::open(dir.path()).unwrap();
        assert_eq!(reader.num_segments(), 2);
        let entries = reader
            .read_all_replicate_entries(OpId::min_value(), OpId::new(0, 3))
            .unwrap();
        assert_eq!(entries.len(), 3);
        reader.check_index_consistency();
    }

    #[test]
    fn test_replace_last_segment() {
        let dir = TempDir::new().unwrap();
        let reader = LogReader::empty_for_tests();

        let mut writer = SegmentWriter::create(dir.path(), 1).unwrap();
        writer.append_entry(&entry(0, 1)).unwrap();
        reader.append_segment(writer.seal().unwrap()).unwrap();

        // Empty active tail, then its sealed replacement (same sequence
        // number, now with entries and a footer).
        let sub = dir.path().join("active");
        let writer = SegmentWriter::create(&sub, 2).unwrap();
        reader
            .append_empty_segment(writer.finish_active().unwrap())
            .unwrap();

        let sealed_dir = dir.path().join("sealed");
        let mut writer = SegmentWriter::create(&sealed_dir, 2).unwrap();
        writer.append_entry(&entry(0, 5)).unwrap();
        writer.append_entry(&entry(0, 6)).unwrap();
        reader.replace_last_segment(writer.seal().unwrap()).unwrap();

        assert_eq!(reader.num_segments(), 2);
        let entries = reader
            .read_all_replicate_entries(OpId::min_value(), OpId::new(0, 6))
            .unwrap();
        assert_eq!(entries.len(), 3);
        reader.check_index_consistency();
    }

    #[test]
    fn test_replace_requires_matching_seqno_and_footer() {
        let dir = TempDir::new().unwrap();
        let reader = LogReader::empty_for_tests();
        let mut writer = SegmentWriter::create(dir.path(), 1).unwrap();
        writer.append_entry(&entry(0, 1)).unwrap();
        reader.append_segment(writer.seal().unwrap()).unwrap();

        // Wrong sequence number.
        let sub = dir.path().join("other");
        let writer = SegmentWriter::create(&sub, 9).unwrap();
        assert!(reader.replace_last_segment(writer.seal().unwrap()).is_err());

        // No footer.
        let sub2 = dir.path().join("open");
        let writer = SegmentWriter::create(&sub2, 1).unwrap();
        assert!(reader
            .replace_last_segment(writer.finish_active().unwrap())
            .is_err());
    }

    #[test]
    fn test_trim_drops_segments_and_index() {
        let dir = TempDir::new().unwrap();
        let reader = example_reader(dir.path());

        reader.trim_segments_up_to_and_including(3).unwrap();
        assert_eq!(reader.num_segments(), 1);
        reader.check_index_consistency();

        // Everything before seg004's range is gone.
        assert!(matches!(
            reader.segment_suffix_including(OpId::new(0, 15)),
            Err(LogError::NotFound(_))
        ));
        let suffix = reader.segment_suffix_including(OpId::new(0, 45)).unwrap();
        assert_eq!(suffix[0].sequence_number(), 4);
    }

    #[test]
    fn test_appends_enforce_ordering() {
        let dir = TempDir::new().unwrap();
        let reader = LogReader::empty_for_tests();

        let mut writer = SegmentWriter::create(dir.path(), 5).unwrap();
        writer.append_entry(&entry(0, 1)).unwrap();
        reader.append_segment(writer.seal().unwrap()).unwrap();

        // Same or lower sequence number is rejected.
        let sub = dir.path().join("dup");
        let writer = SegmentWriter::create(&sub, 5).unwrap();
        assert!(reader.append_segment(writer.seal().unwrap()).is_err());
    }

    #[test]
    fn test_update_last_segment_offset_requires_open_tail() {
        let dir = TempDir::new().unwrap();
        let reader = LogReader::empty_for_tests();

        let mut writer = SegmentWriter::create(dir.path(), 1).unwrap();
        writer.append_entry(&entry(0, 1)).unwrap();
        reader.append_segment(writer.seal().unwrap()).unwrap();
        assert!(reader.update_last_segment_offset(4096).is_err());

        let sub = dir.path().join("tail");
        let mut writer = SegmentWriter::create(&sub, 2).unwrap();
        writer.append_entry(&entry(0, 2)).unwrap();
        writer.flush().unwrap();
        let end = writer.offset();
        reader
            .append_empty_segment(writer.finish_active().unwrap())
            .unwrap();
        reader.update_last_segment_offset(end).unwrap();

        let entries = reader
            .read_all_replicate_entries(OpId::new(0, 1), OpId::new(0, 2))
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_open_from_recovery_dir() {
        let dir = TempDir::new().unwrap();
        let rec = crate::segment::recovery_dir(dir.path());
        let mut writer = SegmentWriter::create(&rec, 1).unwrap();
        writer.append_entry(&entry(0, 7)).unwrap();
        writer.seal().unwrap();

        let reader = LogReader::open_from_recovery_dir(dir.path()).unwrap();
        assert_eq!(reader.num_segments(), 1);
    }
}
