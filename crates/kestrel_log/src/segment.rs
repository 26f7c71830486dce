//! On-disk segment layout.
//!
//! ```text
//! +------+---------+----------------+-----+----------------+----------------+---------+
//! | KSTL | version | header record  | ... | entry records  | footer record  | trailer |
//! +------+---------+----------------+-----+----------------+----------------+---------+
//! ```
//!
//! Every record is framed `[len:4][crc32:4][bincode data]`. Sealed
//! segments end with the footer record followed by an 8-byte locator
//! trailer (`footer frame length` + `KFTR`), so a reader can find the
//! footer without scanning. Active segments stop after the last entry.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use kestrel_common::error::LogError;
use kestrel_common::types::OpId;

/// Magic bytes at the start of each segment file.
pub const SEGMENT_MAGIC: &[u8; 4] = b"KSTL";

/// Magic bytes closing the footer locator trailer.
pub const FOOTER_MAGIC: &[u8; 4] = b"KFTR";

/// Segment format version for compatibility checks.
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Size of the fixed prelude: magic (4) + format version (4).
const SEGMENT_PRELUDE_SIZE: u64 = 8;

/// Size of the footer locator trailer: footer frame length (4) + magic (4).
const FOOTER_TRAILER_SIZE: u64 = 8;

/// Upper bound on a single framed record, to bound allocations when a
/// corrupt length field is read.
const MAX_FRAME_SIZE: u32 = 8 * 1024 * 1024;

/// File name for a segment with the given sequence number.
pub fn segment_filename(sequence_number: u64) -> String {
    format!("kestrel_{sequence_number:06}.seg")
}

/// Directory holding sealed copies used on restart.
pub fn recovery_dir(log_dir: &Path) -> PathBuf {
    log_dir.join("recovery")
}

/// First record in every segment file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SegmentHeader {
    sequence_number: u64,
}

/// A replicated operation as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateEntry {
    pub op_id: OpId,
    pub payload: Vec<u8>,
}

/// The op-id index entry a sealed segment contributes to the reader's
/// sparse index: the first op id in the segment and its byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FooterIndexEntry {
    pub op_id: OpId,
    pub offset: u64,
}

/// Closing record of a sealed segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentFooter {
    pub entry_count: u64,
    /// Absent for segments holding no id-carrying entries.
    pub index_entry: Option<FooterIndexEntry>,
}

fn write_frame<W: Write>(writer: &mut W, data: &[u8]) -> Result<u64, LogError> {
    let len = data.len() as u32;
    let crc = crc32fast::hash(data);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&crc.to_le_bytes())?;
    writer.write_all(data)?;
    Ok(8 + data.len() as u64)
}

/// Read one frame. Returns `None` on clean EOF at a frame boundary.
fn read_frame<R: Read>(reader: &mut R, segment: u64) -> Result<Option<Vec<u8>>, LogError> {
    let mut head = [0u8; 8];
    match reader.read_exact(&mut head[..1]) {
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        other => other?,
    }
    reader.read_exact(&mut head[1..])?;
    let len = u32::from_le_bytes(head[0..4].try_into().unwrap());
    let crc = u32::from_le_bytes(head[4..8].try_into().unwrap());
    if len > MAX_FRAME_SIZE {
        return Err(LogError::Corruption {
            segment,
            reason: format!("frame length {len} exceeds limit"),
        });
    }
    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data)?;
    if crc32fast::hash(&data) != crc {
        return Err(LogError::Corruption {
            segment,
            reason: "frame checksum mismatch".to_string(),
        });
    }
    Ok(Some(data))
}

// ---------------------------------------------------------------------------
// SegmentWriter
// ---------------------------------------------------------------------------

/// Writes a single segment file: header, entries, then either `seal()`
/// (footer + trailer) or `finish_active()` (no footer, tail segment).
pub struct SegmentWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    sequence_number: u64,
    offset: u64,
    entry_count: u64,
    first_index_entry: Option<FooterIndexEntry>,
}

impl SegmentWriter {
    /// Create `kestrel_<seqno>.seg` in `dir` and write the prelude and
    /// header record.
    pub fn create(dir: &Path, sequence_number: u64) -> Result<Self, LogError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(segment_filename(sequence_number));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(SEGMENT_MAGIC)?;
        writer.write_all(&SEGMENT_FORMAT_VERSION.to_le_bytes())?;
        let header = bincode::serialize(&SegmentHeader { sequence_number })
            .map_err(|e| LogError::Serialization(e.to_string()))?;
        let header_len = write_frame(&mut writer, &header)?;

        Ok(Self {
            path,
            writer,
            sequence_number,
            offset: SEGMENT_PRELUDE_SIZE + header_len,
            entry_count: 0,
            first_index_entry: None,
        })
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Current append offset; after a flush this is the readable extent.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Append one replicate entry, returning its byte offset.
    pub fn append_entry(&mut self, entry: &ReplicateEntry) -> Result<u64, LogError> {
        let at = self.offset;
        let data =
            bincode::serialize(entry).map_err(|e| LogError::Serialization(e.to_string()))?;
        self.offset += write_frame(&mut self.writer, &data)?;
        if self.first_index_entry.is_none() {
            self.first_index_entry = Some(FooterIndexEntry {
                op_id: entry.op_id,
                offset: at,
            });
        }
        self.entry_count += 1;
        Ok(at)
    }

    pub fn flush(&mut self) -> Result<(), LogError> {
        self.writer.flush()?;
        Ok(())
    }

    /// Write the footer and locator trailer, sync, and reopen the file
    /// as a sealed [`ReadableSegment`].
    pub fn seal(mut self) -> Result<ReadableSegment, LogError> {
        let footer = SegmentFooter {
            entry_count: self.entry_count,
            index_entry: self.first_index_entry,
        };
        let data =
            bincode::serialize(&footer).map_err(|e| LogError::Serialization(e.to_string()))?;
        let footer_frame_len = write_frame(&mut self.writer, &data)? as u32;
        self.writer.write_all(&footer_frame_len.to_le_bytes())?;
        self.writer.write_all(FOOTER_MAGIC)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        drop(self.writer);
        ReadableSegment::open(&self.path)
    }

    /// Flush without a footer; the segment stays active. The returned
    /// segment is readable up to the flushed offset and the log writer
    /// extends that window via `LogReader::update_last_segment_offset`.
    pub fn finish_active(mut self) -> Result<ReadableSegment, LogError> {
        self.writer.flush()?;
        drop(self.writer);
        let mut segment = ReadableSegment::open(&self.path)?;
        segment.readable_to_offset.store(self.offset, Ordering::Release);
        Ok(segment)
    }
}

// ---------------------------------------------------------------------------
// ReadableSegment
// ---------------------------------------------------------------------------

/// Read-only view of one segment file.
///
/// Headers and footers are parsed at open; entries are read on demand.
/// A footerless segment must be `scan()`ed before its index entry and
/// entry count are available (recovery path only).
#[derive(Debug)]
pub struct ReadableSegment {
    path: PathBuf,
    sequence_number: u64,
    footer: Option<SegmentFooter>,
    /// Index info recovered by `scan()` for footerless segments.
    recovered: Option<SegmentFooter>,
    /// Offset of the first entry record (end of the header frame).
    entries_start: u64,
    /// Exclusive end of readable entry bytes. For sealed segments this
    /// is the footer frame start; for active segments the writer's
    /// flushed watermark.
    readable_to_offset: AtomicU64,
}

impl ReadableSegment {
    /// Open the file, parse the prelude and header, and locate the
    /// footer when present.
    pub fn open(path: &Path) -> Result<Self, LogError> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();

        let mut prelude = [0u8; 8];
        file.read_exact(&mut prelude).map_err(|_| LogError::Corruption {
            segment: 0,
            reason: format!("{}: truncated prelude", path.display()),
        })?;
        if &prelude[0..4] != SEGMENT_MAGIC {
            return Err(LogError::Corruption {
                segment: 0,
                reason: format!("{}: bad magic", path.display()),
            });
        }
        let version = u32::from_le_bytes(prelude[4..8].try_into().unwrap());
        if version != SEGMENT_FORMAT_VERSION {
            return Err(LogError::Corruption {
                segment: 0,
                reason: format!("{}: unsupported format version {version}", path.display()),
            });
        }

        let header_data = read_frame(&mut file, 0)?.ok_or_else(|| LogError::Corruption {
            segment: 0,
            reason: format!("{}: missing header", path.display()),
        })?;
        let header: SegmentHeader = bincode::deserialize(&header_data)
            .map_err(|e| LogError::Serialization(e.to_string()))?;
        let entries_start = file.stream_position()?;
        let sequence_number = header.sequence_number;

        // Look for the footer locator trailer.
        let mut footer = None;
        let mut entries_end = entries_start;
        if file_size >= entries_start + FOOTER_TRAILER_SIZE {
            file.seek(SeekFrom::End(-(FOOTER_TRAILER_SIZE as i64)))?;
            let mut trailer = [0u8; 8];
            file.read_exact(&mut trailer)?;
            if &trailer[4..8] == FOOTER_MAGIC {
                let footer_frame_len = u32::from_le_bytes(trailer[0..4].try_into().unwrap()) as u64;
                let footer_start = file_size
                    .checked_sub(FOOTER_TRAILER_SIZE + footer_frame_len)
                    .filter(|&s| s >= entries_start)
                    .ok_or_else(|| LogError::Corruption {
                        segment: sequence_number,
                        reason: "footer locator out of bounds".to_string(),
                    })?;
                file.seek(SeekFrom::Start(footer_start))?;
                let footer_data =
                    read_frame(&mut file, sequence_number)?.ok_or_else(|| LogError::Corruption {
                        segment: sequence_number,
                        reason: "truncated footer".to_string(),
                    })?;
                footer = Some(
                    bincode::deserialize::<SegmentFooter>(&footer_data)
                        .map_err(|e| LogError::Serialization(e.to_string()))?,
                );
                entries_end = footer_start;
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            sequence_number,
            footer,
            recovered: None,
            entries_start,
            readable_to_offset: AtomicU64::new(entries_end),
        })
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when the segment carries an on-disk footer (sealed).
    pub fn has_footer(&self) -> bool {
        self.footer.is_some()
    }

    /// True when a footerless segment has been scanned.
    pub fn is_scanned(&self) -> bool {
        self.recovered.is_some()
    }

    pub fn entry_count(&self) -> Option<u64> {
        self.footer
            .as_ref()
            .or(self.recovered.as_ref())
            .map(|f| f.entry_count)
    }

    /// The segment's contribution to the sparse op-id index, if known.
    pub fn index_entry(&self) -> Option<FooterIndexEntry> {
        self.footer
            .as_ref()
            .or(self.recovered.as_ref())
            .and_then(|f| f.index_entry)
    }

    /// Extend the readable window of an active segment. Only meaningful
    /// for the footerless tail; the log writer calls this as it flushes.
    pub(crate) fn set_readable_to_offset(&self, offset: u64) {
        debug_assert!(self.footer.is_none());
        self.readable_to_offset.store(offset, Ordering::Release);
    }

    pub fn readable_to_offset(&self) -> u64 {
        self.readable_to_offset.load(Ordering::Acquire)
    }

    /// Scan a footerless segment end to end, recovering its entry count
    /// and index entry. Used only outside the hot path (restart).
    pub fn scan(&mut self) -> Result<(), LogError> {
        debug_assert!(self.footer.is_none());
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.entries_start))?;
        let mut entry_count = 0u64;
        let mut first: Option<FooterIndexEntry> = None;
        let mut offset = self.entries_start;
        loop {
            match read_frame(&mut file, self.sequence_number) {
                Ok(Some(data)) => {
                    let entry: ReplicateEntry = bincode::deserialize(&data)
                        .map_err(|e| LogError::Serialization(e.to_string()))?;
                    if first.is_none() {
                        first = Some(FooterIndexEntry {
                            op_id: entry.op_id,
                            offset,
                        });
                    }
                    entry_count += 1;
                    offset += 8 + data.len() as u64;
                }
                Ok(None) => break,
                Err(LogError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // Torn tail write; readable extent stops at the last
                    // complete entry.
                    tracing::warn!(
                        segment = self.sequence_number,
                        offset,
                        "segment scan stopped at torn record"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        self.recovered = Some(SegmentFooter {
            entry_count,
            index_entry: first,
        });
        self.readable_to_offset.store(offset, Ordering::Release);
        Ok(())
    }

    /// Read all entries within the readable window.
    pub fn read_entries(&self) -> Result<Vec<ReplicateEntry>, LogError> {
        let end = self.readable_to_offset();
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.entries_start))?;
        let mut entries = Vec::new();
        let mut offset = self.entries_start;
        while offset < end {
            let data = match read_frame(&mut file, self.sequence_number)? {
                Some(data) => data,
                None => break,
            };
            let entry: ReplicateEntry = bincode::deserialize(&data)
                .map_err(|e| LogError::Serialization(e.to_string()))?;
            entries.push(entry);
            offset += 8 + data.len() as u64;
        }
        Ok(entries)
    }
}
