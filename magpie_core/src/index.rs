//! Index records and the shared cursor over the record stream.
//!
//! The index provider hands out raw CSV rows of
//! `url, archive_locator, offset, length`. Workers pull rows from one shared
//! [`IndexCursor`] and parse them with [`IndexRecord::from_row`]; rows that
//! fail structural validation are dropped by the worker, never re-queued.

use csv::{ReaderBuilder, StringRecord};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_BATCH_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index I/O error: {0}")]
    Io(String),

    #[error("index CSV error: {0}")]
    Csv(String),
}

impl From<std::io::Error> for IndexError {
    fn from(err: std::io::Error) -> Self {
        IndexError::Io(err.to_string())
    }
}
impl From<csv::Error> for IndexError {
    fn from(err: csv::Error) -> Self {
        IndexError::Csv(err.to_string())
    }
}

/// Serializable position within the underlying record stream.
///
/// Mirrors [`csv::Position`] so a checkpoint can be written as plain data and
/// the stream re-seeked on resume.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamPosition {
    pub byte: u64,
    pub line: u64,
    pub record: u64,
}

impl StreamPosition {
    fn from_csv(pos: &csv::Position) -> Self {
        Self {
            byte: pos.byte(),
            line: pos.line(),
            record: pos.record(),
        }
    }

    fn to_csv(&self) -> csv::Position {
        let mut pos = csv::Position::new();
        pos.set_byte(self.byte);
        pos.set_line(self.line);
        pos.set_record(self.record);
        pos
    }
}

/// One candidate object inside a remote archive file, identified by locator
/// and byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub source_url: String,
    pub archive_locator: String,
    pub offset: u64,
    pub length: u64,
}

impl IndexRecord {
    /// Parses a raw index row, returning `None` for structurally invalid
    /// rows: fewer than 4 fields, a header row encountered mid-stream (the
    /// length column reads `"length"`), non-numeric offset/length, or a zero
    /// length that names no bytes at all.
    pub fn from_row(row: &StringRecord) -> Option<Self> {
        if row.len() < 4 || row.get(3) == Some("length") {
            return None;
        }
        let archive_locator = row.get(1)?.trim();
        if archive_locator.is_empty() {
            return None;
        }
        let offset: u64 = row.get(2)?.trim().parse().ok()?;
        let length: u64 = row.get(3)?.trim().parse().ok()?;
        if length == 0 {
            return None;
        }
        Some(Self {
            source_url: row.get(0)?.to_string(),
            archive_locator: archive_locator.to_string(),
            offset,
            length,
        })
    }
}

/// The stream of raw index rows consumed by the cursor.
///
/// Implementations must tolerate repeated `next_batch` calls after
/// exhaustion (returning empty batches) and support seeking for resumption.
pub trait IndexSource: Send {
    /// Appends up to `max` rows to `out`, returning how many were read.
    fn next_batch(&mut self, max: usize, out: &mut VecDeque<StringRecord>)
    -> Result<usize, IndexError>;

    /// Current position, suitable for a later [`IndexSource::seek`].
    fn position(&self) -> StreamPosition;

    fn seek(&mut self, pos: &StreamPosition) -> Result<(), IndexError>;
}

/// CSV-file-backed index source.
pub struct CsvIndexSource {
    reader: csv::Reader<File>,
}

impl CsvIndexSource {
    /// Opens the index CSV. Header handling is deliberately disabled: header
    /// rows are treated as data and dropped by row validation, which also
    /// copes with concatenated index files that repeat the header mid-stream.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;
        Ok(Self { reader })
    }
}

impl IndexSource for CsvIndexSource {
    fn next_batch(
        &mut self,
        max: usize,
        out: &mut VecDeque<StringRecord>,
    ) -> Result<usize, IndexError> {
        let mut read = 0;
        let mut row = StringRecord::new();
        while read < max {
            if !self.reader.read_record(&mut row)? {
                break;
            }
            out.push_back(row.clone());
            read += 1;
        }
        Ok(read)
    }

    fn position(&self) -> StreamPosition {
        StreamPosition::from_csv(self.reader.position())
    }

    fn seek(&mut self, pos: &StreamPosition) -> Result<(), IndexError> {
        self.reader.seek(pos.to_csv())?;
        Ok(())
    }
}

/// Thread-safe buffered cursor over an [`IndexSource`].
///
/// Pop-and-refill happens inside one critical section, so no row is handed
/// out twice within a run. Once a refill on an empty buffer yields zero rows
/// the cursor is exhausted for all current and future callers.
///
/// [`IndexCursor::checkpoint_position`] reports the stream position at the
/// start of the batch currently being consumed, so a resumed run replays any
/// rows that were buffered but not yet checkpointed (at-least-once, by
/// design).
pub struct IndexCursor<S: IndexSource> {
    inner: Mutex<CursorInner<S>>,
    batch_size: usize,
}

struct CursorInner<S> {
    source: S,
    buffer: VecDeque<StringRecord>,
    /// Source position at the start of the current buffered batch.
    committed: StreamPosition,
    exhausted: bool,
}

impl<S: IndexSource> IndexCursor<S> {
    pub fn new(source: S, batch_size: usize) -> Self {
        let committed = source.position();
        Self {
            inner: Mutex::new(CursorInner {
                source,
                buffer: VecDeque::new(),
                committed,
                exhausted: false,
            }),
            batch_size: batch_size.max(1),
        }
    }

    /// Pops the next raw row, refilling from the source if the buffer ran
    /// dry. `Ok(None)` means the stream is exhausted.
    pub fn next(&self) -> Result<Option<StringRecord>, IndexError> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(row) = inner.buffer.pop_front() {
                return Ok(Some(row));
            }
            if inner.exhausted {
                return Ok(None);
            }
            inner.committed = inner.source.position();
            let batch_size = self.batch_size;
            let CursorInner { source, buffer, .. } = &mut *inner;
            let read = source.next_batch(batch_size, buffer)?;
            if read == 0 {
                inner.exhausted = true;
                return Ok(None);
            }
        }
    }

    /// Position a checkpoint should record: the end of the last fully
    /// consumed batch.
    pub fn checkpoint_position(&self) -> StreamPosition {
        let inner = self.inner.lock();
        if inner.buffer.is_empty() {
            inner.source.position()
        } else {
            inner.committed.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn row(fields: &[&str]) -> StringRecord {
        StringRecord::from(fields.to_vec())
    }

    #[test]
    fn from_row_parses_valid_record() {
        let parsed = IndexRecord::from_row(&row(&[
            "https://example.com/a.pdf",
            "crawl-data/seg/file.warc.gz",
            "1024",
            "2048",
        ]))
        .unwrap();
        assert_eq!(parsed.archive_locator, "crawl-data/seg/file.warc.gz");
        assert_eq!(parsed.offset, 1024);
        assert_eq!(parsed.length, 2048);
    }

    #[test]
    fn from_row_drops_structurally_invalid_rows() {
        // Header row, short row, non-numeric fields, empty locator, zero length.
        assert!(
            IndexRecord::from_row(&row(&[
                "url",
                "warc_filename",
                "warc_record_offset",
                "length"
            ]))
            .is_none()
        );
        assert!(IndexRecord::from_row(&row(&["u", "loc", "3"])).is_none());
        assert!(IndexRecord::from_row(&row(&["u", "loc", "abc", "10"])).is_none());
        assert!(IndexRecord::from_row(&row(&["u", "loc", "3", "ten"])).is_none());
        assert!(IndexRecord::from_row(&row(&["u", "", "3", "10"])).is_none());
        assert!(IndexRecord::from_row(&row(&["u", "loc", "3", "0"])).is_none());
    }

    fn index_file(rows: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "url,warc_filename,warc_record_offset,warc_record_length").unwrap();
        for i in 0..rows {
            writeln!(file, "https://example.com/{i},crawl-data/file{i}.warc.gz,{i},10").unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn cursor_yields_each_row_once_then_exhausts() {
        let file = index_file(10);
        let source = CsvIndexSource::open(file.path()).unwrap();
        let cursor = IndexCursor::new(source, 4);

        let mut seen = Vec::new();
        while let Some(raw) = cursor.next().unwrap() {
            seen.push(raw);
        }
        // 10 data rows plus the header row, which is the caller's job to drop.
        assert_eq!(seen.len(), 11);
        let parsed: Vec<_> = seen
            .iter()
            .filter_map(IndexRecord::from_row)
            .collect();
        assert_eq!(parsed.len(), 10);
        assert_eq!(parsed[0].offset, 0);
        assert_eq!(parsed[9].offset, 9);

        // Exhaustion is permanent.
        assert!(cursor.next().unwrap().is_none());
        assert!(cursor.next().unwrap().is_none());
    }

    #[test]
    fn cursor_is_shared_safely_across_threads() {
        let file = index_file(200);
        let source = CsvIndexSource::open(file.path()).unwrap();
        let cursor = IndexCursor::new(source, 16);
        let total = std::sync::atomic::AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    while let Some(_row) = cursor.next().unwrap() {
                        total.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(total.load(std::sync::atomic::Ordering::SeqCst), 201);
    }

    #[test]
    fn checkpoint_position_resumes_at_batch_boundary() {
        let file = index_file(8);
        let source = CsvIndexSource::open(file.path()).unwrap();
        let cursor = IndexCursor::new(source, 3);

        // Consume one row; the first batch of 3 is now partially consumed,
        // so the checkpoint must point at the start of that batch.
        let batch_start = cursor.checkpoint_position();
        cursor.next().unwrap().unwrap();
        let mid_batch = cursor.checkpoint_position();
        assert_eq!(mid_batch, batch_start);

        // Resuming from that position replays the partially consumed batch.
        let mut resumed = CsvIndexSource::open(file.path()).unwrap();
        resumed.seek(&mid_batch).unwrap();
        let resumed_cursor = IndexCursor::new(resumed, 3);
        let mut count = 0;
        while resumed_cursor.next().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 9, "header plus all 8 data rows replay from the start");
    }

    #[test]
    fn checkpoint_position_after_drain_is_end_of_stream() {
        let file = index_file(5);
        let source = CsvIndexSource::open(file.path()).unwrap();
        let cursor = IndexCursor::new(source, 4096);
        while cursor.next().unwrap().is_some() {}
        let end = cursor.checkpoint_position();

        let mut resumed = CsvIndexSource::open(file.path()).unwrap();
        resumed.seek(&end).unwrap();
        let resumed_cursor = IndexCursor::new(resumed, 4096);
        assert!(resumed_cursor.next().unwrap().is_none());
    }

    #[test]
    fn empty_index_is_exhausted_immediately() {
        let file = NamedTempFile::new().unwrap();
        let source = CsvIndexSource::open(file.path()).unwrap();
        let cursor = IndexCursor::new(source, 4096);
        assert!(cursor.next().unwrap().is_none());
    }
}
