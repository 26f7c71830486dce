//! Append-only log segments and the recovery-time reader.
//!
//! A log is a directory of segment files ordered by sequence number.
//! Each file begins with a header record; once sealed it ends with a
//! footer carrying the segment's op-id index entry. The active (tail)
//! segment has no footer and is readable up to a watermark maintained by
//! the writer. `LogReader` exposes the sealed sequence plus a sparse
//! op-id index for point lookups and range selection.

pub mod reader;
pub mod segment;

pub use reader::{LogReader, SegmentIdxPos};
pub use segment::{
    recovery_dir, segment_filename, ReadableSegment, ReplicateEntry, SegmentFooter, SegmentWriter,
};
