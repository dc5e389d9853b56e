//! Write-ahead binlog: entries, replicators, and replay readers.
//!
//! Every table put is mirrored as a [`LogEntry`] in the table's binlog.
//! Entries carry a monotonically increasing `log_index`; the log is split
//! into segments (files, on disk) that a reader rolls through during
//! replay. The reader surfaces the segment boundary explicitly via
//! [`ReadOutcome::WaitRecord`] so that replay loops can decide whether a
//! newer segment exists before rolling.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::table::Dimension;

/// Operation recorded by a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Row append.
    Put,
    /// Row deletion (carried in the log, not replayed by aggregators).
    Delete,
}

/// One replicated binlog record.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Position in the log. `0` on append means "assign the next index".
    pub log_index: u64,
    /// Leader term the entry was written under.
    pub term: u64,
    /// Operation kind.
    pub method: EntryKind,
    /// Wall-clock time of the originating put, milliseconds.
    pub ts: i64,
    /// Encoded row payload.
    pub value: Bytes,
    /// Index routing for the row.
    pub dimensions: Vec<Dimension>,
}

/// Errors from binlog operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Appended index is not beyond the last one.
    #[error("non-monotonic log index: got {got}, last {last}")]
    NonMonotonicIndex {
        /// Index carried by the rejected entry.
        got: u64,
        /// Highest index already in the log.
        last: u64,
    },
}

/// Outcome of one reader step.
#[derive(Debug)]
pub enum ReadOutcome {
    /// The next entry in the current segment.
    Entry(LogEntry),
    /// End of a sealed segment; a later segment may exist.
    WaitRecord,
    /// End of the open (last) segment.
    Eof,
}

/// Replay reader over a binlog.
pub trait LogReader: Send {
    /// Reads the next entry of the current segment.
    fn read_next(&mut self) -> ReadOutcome;

    /// Moves to the start of the next segment. Returns `false` if there
    /// is none.
    fn roll_next_segment(&mut self) -> bool;

    /// Index of the segment currently being read.
    fn segment_index(&self) -> usize;

    /// Index of the last segment in the log.
    fn last_segment_index(&self) -> usize;
}

/// A replicated, segmented binlog.
pub trait LogReplicator: Send + Sync {
    /// Appends `entry`, assigning the next index when `entry.log_index`
    /// is `0`. Returns the index the entry landed at.
    ///
    /// # Errors
    ///
    /// Fails if an explicit index does not advance the log.
    fn append(&self, entry: LogEntry) -> Result<u64, LogError>;

    /// Wakes any follower blocked on new entries.
    fn notify(&self);

    /// Whether the log holds no entries at all.
    fn is_empty(&self) -> bool;

    /// Highest index in the log, or `0` when empty.
    fn last_index(&self) -> u64;

    /// Opens a reader positioned at the segment containing `offset`
    /// (the first segment when `offset` precedes the log).
    fn read_from(&self, offset: u64) -> Box<dyn LogReader>;
}

#[derive(Default)]
struct Segment {
    entries: Vec<LogEntry>,
}

/// In-memory [`LogReplicator`] used by tests and single-process servers.
///
/// Segments model binlog file rotation: [`MemBinlog::roll_segment`] seals
/// the open segment so that readers observe a [`ReadOutcome::WaitRecord`]
/// boundary, exactly as they would at an on-disk file boundary.
pub struct MemBinlog {
    segments: RwLock<Vec<Segment>>,
    last_index: Mutex<u64>,
    notifications: AtomicU64,
}

impl MemBinlog {
    /// Creates an empty log with one open segment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            segments: RwLock::new(vec![Segment::default()]),
            last_index: Mutex::new(0),
            notifications: AtomicU64::new(0),
        }
    }

    /// Seals the open segment and starts a new one.
    pub fn roll_segment(&self) {
        self.segments.write().push(Segment::default());
    }

    /// Number of [`LogReplicator::notify`] calls observed.
    #[must_use]
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }
}

impl Default for MemBinlog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogReplicator for MemBinlog {
    fn append(&self, mut entry: LogEntry) -> Result<u64, LogError> {
        let mut last = self.last_index.lock();
        if entry.log_index == 0 {
            entry.log_index = *last + 1;
        } else if entry.log_index <= *last {
            return Err(LogError::NonMonotonicIndex {
                got: entry.log_index,
                last: *last,
            });
        }
        *last = entry.log_index;
        let assigned = entry.log_index;
        self.segments
            .write()
            .last_mut()
            .expect("log always has an open segment")
            .entries
            .push(entry);
        Ok(assigned)
    }

    fn notify(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    fn is_empty(&self) -> bool {
        self.segments.read().iter().all(|s| s.entries.is_empty())
    }

    fn last_index(&self) -> u64 {
        *self.last_index.lock()
    }

    fn read_from(&self, offset: u64) -> Box<dyn LogReader> {
        // Snapshot the segments; replay runs before live traffic.
        let segments: Vec<Vec<LogEntry>> = self
            .segments
            .read()
            .iter()
            .map(|s| s.entries.clone())
            .collect();
        let segment = segments
            .iter()
            .position(|s| s.last().is_some_and(|e| e.log_index >= offset))
            .unwrap_or(0);
        Box::new(MemLogReader {
            segments,
            segment,
            pos: 0,
        })
    }
}

struct MemLogReader {
    segments: Vec<Vec<LogEntry>>,
    segment: usize,
    pos: usize,
}

impl LogReader for MemLogReader {
    fn read_next(&mut self) -> ReadOutcome {
        let Some(seg) = self.segments.get(self.segment) else {
            return ReadOutcome::Eof;
        };
        if let Some(entry) = seg.get(self.pos) {
            self.pos += 1;
            return ReadOutcome::Entry(entry.clone());
        }
        if self.segment + 1 < self.segments.len() {
            ReadOutcome::WaitRecord
        } else {
            ReadOutcome::Eof
        }
    }

    fn roll_next_segment(&mut self) -> bool {
        if self.segment + 1 < self.segments.len() {
            self.segment += 1;
            self.pos = 0;
            true
        } else {
            false
        }
    }

    fn segment_index(&self) -> usize {
        self.segment
    }

    fn last_segment_index(&self) -> usize {
        self.segments.len().saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(idx: u64) -> LogEntry {
        LogEntry {
            log_index: idx,
            term: 1,
            method: EntryKind::Put,
            ts: 0,
            value: Bytes::new(),
            dimensions: vec![Dimension::new(0, "k")],
        }
    }

    #[test]
    fn test_append_assigns_indices() {
        let log = MemBinlog::new();
        assert!(log.is_empty());
        assert_eq!(log.append(entry(0)).unwrap(), 1);
        assert_eq!(log.append(entry(0)).unwrap(), 2);
        assert_eq!(log.append(entry(10)).unwrap(), 10);
        assert_eq!(log.last_index(), 10);
        assert!(!log.is_empty());
    }

    #[test]
    fn test_append_rejects_rewind() {
        let log = MemBinlog::new();
        log.append(entry(5)).unwrap();
        assert!(matches!(
            log.append(entry(3)),
            Err(LogError::NonMonotonicIndex { got: 3, last: 5 })
        ));
    }

    #[test]
    fn test_reader_rolls_segments() {
        let log = MemBinlog::new();
        log.append(entry(1)).unwrap();
        log.append(entry(2)).unwrap();
        log.roll_segment();
        log.append(entry(3)).unwrap();

        let mut reader = log.read_from(0);
        assert_eq!(reader.last_segment_index(), 1);

        let mut seen = Vec::new();
        loop {
            match reader.read_next() {
                ReadOutcome::Entry(e) => seen.push(e.log_index),
                ReadOutcome::WaitRecord => {
                    assert!(reader.segment_index() < reader.last_segment_index());
                    assert!(reader.roll_next_segment());
                }
                ReadOutcome::Eof => break,
            }
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_read_from_offset_lands_in_segment() {
        let log = MemBinlog::new();
        log.append(entry(1)).unwrap();
        log.roll_segment();
        log.append(entry(2)).unwrap();
        log.append(entry(3)).unwrap();

        let mut reader = log.read_from(2);
        assert_eq!(reader.segment_index(), 1);
        match reader.read_next() {
            ReadOutcome::Entry(e) => assert_eq!(e.log_index, 2),
            other => panic!("expected entry, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_log_reader() {
        let log = MemBinlog::new();
        let mut reader = log.read_from(0);
        assert!(matches!(reader.read_next(), ReadOutcome::Eof));
        assert!(!reader.roll_next_segment());
    }
}
