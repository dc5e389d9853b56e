//! Table abstraction and the in-memory reference implementation.
//!
//! A [`Table`] accepts encoded rows keyed by [`Dimension`]s and exposes a
//! [`TraverseIterator`] ordered ascending by primary key and **descending**
//! by the indexed timestamp column within a key. Re-putting the same
//! `(key, ts)` appends a newer version that shadows the older one for
//! readers while still counting toward [`Table::record_count`] — the same
//! multi-version discipline a log-structured store exhibits.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::row::{CodecError, RowView};
use crate::schema::SchemaRef;

/// A `(index position, key)` pair routing a row into a table index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    /// Index position the key belongs to.
    pub idx: u32,
    /// Key value within that index.
    pub key: String,
}

impl Dimension {
    /// Creates a dimension.
    #[must_use]
    pub fn new(idx: u32, key: impl Into<String>) -> Self {
        Self {
            idx,
            key: key.into(),
        }
    }
}

/// Errors from table operations.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// The requested index position does not exist.
    #[error("unknown index position {0}")]
    UnknownIndex(u32),

    /// The indexed ts column was NULL or unreadable.
    #[error("row has no value for ts column {0}")]
    MissingTsColumn(usize),

    /// Row decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Iterator over a table index.
///
/// Position semantics follow the store's descending-ts layout:
/// [`seek`](Self::seek) lands on the newest row of `key` whose ts is
/// *strictly less* than the seek ts; [`next`](Self::next) moves to the
/// next-older row (or next-newer version at the same ts, newest first);
/// [`next_pk`](Self::next_pk) jumps to the newest row of the next key.
pub trait TraverseIterator {
    /// Positions at the newest row of the first key.
    fn seek_to_first(&mut self);

    /// Positions within `key` at the newest row with `row_ts < ts`.
    ///
    /// Invalid if the key has no such row.
    fn seek(&mut self, key: &str, ts: i64);

    /// Whether the iterator points at a row.
    fn valid(&self) -> bool;

    /// Advances to the next row in traverse order.
    fn next(&mut self);

    /// Jumps to the newest row of the next primary key.
    fn next_pk(&mut self);

    /// Primary key of the current row.
    fn pk(&self) -> &str;

    /// Indexed ts of the current row.
    fn ts(&self) -> i64;

    /// Encoded row bytes.
    fn value(&self) -> &[u8];
}

/// A durable row sink with one traversable index.
pub trait Table: Send + Sync {
    /// Appends `row` under every dimension in `dims`.
    ///
    /// `time` is the wall-clock put time; ordering uses the indexed ts
    /// column extracted from the row, not `time`.
    ///
    /// # Errors
    ///
    /// Fails if the row cannot be decoded or lacks a ts value.
    fn put(&self, time: i64, row: Bytes, dims: &[Dimension]) -> Result<(), TableError>;

    /// Opens a traverse iterator over index `index_pos`.
    ///
    /// # Errors
    ///
    /// Fails for an unknown index position.
    fn traverse(&self, index_pos: u32) -> Result<Box<dyn TraverseIterator>, TableError>;

    /// Total rows ever put (versions included).
    fn record_count(&self) -> u64;
}

// Per key: ts -> versions in put order (oldest first).
type Partition = BTreeMap<i64, Vec<Bytes>>;

/// In-memory [`Table`] with a single index at position 0.
///
/// Rows are partitioned by dimension key; each partition is ordered by the
/// schema's ts column. Iteration yields versions newest-first within a ts
/// so that a re-put shadows its predecessor.
pub struct MemTable {
    name: String,
    schema: SchemaRef,
    ts_col: usize,
    partitions: RwLock<BTreeMap<String, Partition>>,
    records: AtomicU64,
}

impl MemTable {
    /// Creates a table over `schema`, indexed on the ts column `ts_col`.
    #[must_use]
    pub fn new(name: impl Into<String>, schema: SchemaRef, ts_col: usize) -> Self {
        Self {
            name: name.into(),
            schema,
            ts_col,
            partitions: RwLock::new(BTreeMap::new()),
            records: AtomicU64::new(0),
        }
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schema rows are validated against.
    #[must_use]
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }
}

impl Table for MemTable {
    fn put(&self, _time: i64, row: Bytes, dims: &[Dimension]) -> Result<(), TableError> {
        let view = RowView::new(&self.schema, &row)?;
        let ts = view
            .get_i64_key(self.ts_col)?
            .ok_or(TableError::MissingTsColumn(self.ts_col))?;
        let mut parts = self.partitions.write();
        for dim in dims {
            if dim.idx != 0 {
                return Err(TableError::UnknownIndex(dim.idx));
            }
            parts
                .entry(dim.key.clone())
                .or_default()
                .entry(ts)
                .or_default()
                .push(row.clone());
            self.records.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn traverse(&self, index_pos: u32) -> Result<Box<dyn TraverseIterator>, TableError> {
        if index_pos != 0 {
            return Err(TableError::UnknownIndex(index_pos));
        }
        // Snapshot into traverse order: pk asc, ts desc, version desc.
        let parts = self.partitions.read();
        let mut rows = Vec::new();
        for (pk, part) in parts.iter() {
            for (ts, versions) in part.iter().rev() {
                for row in versions.iter().rev() {
                    rows.push(SnapshotRow {
                        pk: pk.clone(),
                        ts: *ts,
                        row: row.clone(),
                    });
                }
            }
        }
        Ok(Box::new(SnapshotIterator { rows, pos: 0 }))
    }

    fn record_count(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }
}

struct SnapshotRow {
    pk: String,
    ts: i64,
    row: Bytes,
}

struct SnapshotIterator {
    rows: Vec<SnapshotRow>,
    pos: usize,
}

impl TraverseIterator for SnapshotIterator {
    fn seek_to_first(&mut self) {
        self.pos = 0;
    }

    fn seek(&mut self, key: &str, ts: i64) {
        self.pos = self
            .rows
            .iter()
            .position(|r| r.pk == key && r.ts < ts)
            .unwrap_or(self.rows.len());
    }

    fn valid(&self) -> bool {
        self.pos < self.rows.len()
    }

    fn next(&mut self) {
        if self.valid() {
            self.pos += 1;
        }
    }

    fn next_pk(&mut self) {
        if !self.valid() {
            return;
        }
        let cur = self.rows[self.pos].pk.clone();
        while self.valid() && self.rows[self.pos].pk == cur {
            self.pos += 1;
        }
    }

    fn pk(&self) -> &str {
        &self.rows[self.pos].pk
    }

    fn ts(&self) -> i64 {
        self.rows[self.pos].ts
    }

    fn value(&self) -> &[u8] {
        &self.rows[self.pos].row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::RowBuilder;
    use crate::schema::{ColumnDesc, DataType, Schema};
    use std::sync::Arc;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            ColumnDesc::new("key", DataType::String),
            ColumnDesc::new("ts", DataType::Timestamp),
            ColumnDesc::new("v", DataType::Int),
        ]))
    }

    fn row(schema: &SchemaRef, key: &str, ts: i64, v: i32) -> Bytes {
        let mut b = RowBuilder::new(schema);
        b.append_string(key.as_bytes()).unwrap();
        b.append_timestamp(ts).unwrap();
        b.append_int(v).unwrap();
        b.finish().unwrap()
    }

    fn put(table: &MemTable, key: &str, ts: i64, v: i32) {
        let r = row(table.schema(), key, ts, v);
        table
            .put(0, r, &[Dimension::new(0, key.to_string())])
            .unwrap();
    }

    #[test]
    fn test_traverse_descending_within_key() {
        let t = MemTable::new("t", schema(), 1);
        put(&t, "a", 100, 1);
        put(&t, "a", 300, 3);
        put(&t, "a", 200, 2);

        let mut it = t.traverse(0).unwrap();
        it.seek_to_first();
        let mut seen = Vec::new();
        while it.valid() {
            seen.push(it.ts());
            it.next();
        }
        assert_eq!(seen, vec![300, 200, 100]);
    }

    #[test]
    fn test_seek_strictly_less() {
        let t = MemTable::new("t", schema(), 1);
        put(&t, "a", 100, 1);
        put(&t, "a", 200, 2);

        let mut it = t.traverse(0).unwrap();
        it.seek("a", 201);
        assert!(it.valid());
        assert_eq!(it.ts(), 200);

        it.seek("a", 200);
        assert!(it.valid());
        assert_eq!(it.ts(), 100);

        it.seek("a", 100);
        assert!(!it.valid());

        it.seek("missing", 1_000);
        assert!(!it.valid());
    }

    #[test]
    fn test_reput_shadows_but_counts() {
        let t = MemTable::new("t", schema(), 1);
        put(&t, "a", 100, 1);
        put(&t, "a", 100, 9);
        assert_eq!(t.record_count(), 2);

        let mut it = t.traverse(0).unwrap();
        it.seek("a", 101);
        assert!(it.valid());
        let view = RowView::new(t.schema(), it.value()).unwrap();
        assert_eq!(view.get_int(2).unwrap(), Some(9));
        // Older version is still reachable behind the newest.
        it.next();
        assert!(it.valid());
        let view = RowView::new(t.schema(), it.value()).unwrap();
        assert_eq!(view.get_int(2).unwrap(), Some(1));
    }

    #[test]
    fn test_next_pk() {
        let t = MemTable::new("t", schema(), 1);
        put(&t, "a", 100, 1);
        put(&t, "a", 200, 2);
        put(&t, "b", 50, 3);
        put(&t, "c", 70, 4);

        let mut it = t.traverse(0).unwrap();
        it.seek_to_first();
        assert_eq!(it.pk(), "a");
        assert_eq!(it.ts(), 200);
        it.next_pk();
        assert_eq!(it.pk(), "b");
        it.next_pk();
        assert_eq!(it.pk(), "c");
        it.next_pk();
        assert!(!it.valid());
    }

    #[test]
    fn test_unknown_index_rejected() {
        let t = MemTable::new("t", schema(), 1);
        assert!(matches!(t.traverse(7), Err(TableError::UnknownIndex(7))));
    }
}
