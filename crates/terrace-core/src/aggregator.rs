//! The aggregator: bucket manager, flush writer, and recovery driver.
//!
//! One aggregator follows one base-table index and maintains, per bucket
//! key, a live [`AggrBuffer`] plus a history of flushed buckets in the
//! aggregate table. The bucket key is the primary key, extended by the
//! filter column's value for COUNT_WHERE so each filter value gets an
//! independent bucket stream.
//!
//! ## Locking
//!
//! The map mutex guards insertions into the bucket map only; each bucket
//! owns its own mutex behind an `Arc`, so map growth never moves a lock a
//! writer is holding. Bucket locks are released across aggregate-table
//! writes (flush, late-arrival merge) — no lock is held across I/O.
//!
//! ## Recovery
//!
//! `init` seeds one bucket per primary key from the aggregate table, then
//! replays the base binlog from the smallest flushed offset. The per
//! bucket offset guard and the drop-late-rows-in-recovery rule make the
//! replay idempotent.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use terrace_storage::{
    CodecError, DataType, Datum, Dimension, EntryKind, LogEntry, LogReplicator, ReadOutcome,
    RowBuilder, RowView, SchemaRef, Table, TraverseIterator,
};

use crate::buffer::{AggrBuffer, AggrBufferLocked};
use crate::error::AggrError;
use crate::kernel::{AggrFunc, AggrKernel};
use crate::window::{classify, WindowAction, WindowDef};

// Positional fields of the aggregate-table row.
const FIELD_KEY: usize = 0;
const FIELD_TS_BEGIN: usize = 1;
const FIELD_TS_END: usize = 2;
const FIELD_AGGR_CNT: usize = 3;
const FIELD_AGGR_VAL: usize = 4;
const FIELD_BINLOG_OFFSET: usize = 5;
const FIELD_FILTER: usize = 6;

/// Aggregator lifecycle state, observable without locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AggrStat {
    /// Constructed but not recovered; updates are rejected.
    UnInit = 0,
    /// Recovery in progress.
    Recovering = 1,
    /// Ready for live updates.
    Inited = 2,
}

impl AggrStat {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::UnInit,
            1 => Self::Recovering,
            _ => Self::Inited,
        }
    }
}

/// Construction bundle assembled by the factory.
pub(crate) struct AggregatorParts {
    pub base_schema: SchemaRef,
    pub aggr_schema: SchemaRef,
    pub aggr_table: Arc<dyn Table>,
    pub aggr_replicator: Arc<dyn LogReplicator>,
    pub index_pos: u32,
    pub func: AggrFunc,
    pub aggr_col_idx: Option<usize>,
    pub aggr_col_type: DataType,
    pub ts_col_idx: usize,
    pub filter_col_idx: Option<usize>,
    pub window: WindowDef,
    pub kernel: Box<dyn AggrKernel>,
    pub term: u64,
    pub notify_on_flush: bool,
}

/// Streaming pre-aggregator over one base-table index.
pub struct Aggregator {
    base_schema: SchemaRef,
    aggr_schema: SchemaRef,
    aggr_table: Arc<dyn Table>,
    aggr_replicator: Arc<dyn LogReplicator>,
    index_pos: u32,
    func: AggrFunc,
    aggr_col_idx: Option<usize>,
    aggr_col_type: DataType,
    ts_col_idx: usize,
    filter_col_idx: Option<usize>,
    window: WindowDef,
    kernel: Box<dyn AggrKernel>,
    count_all: bool,
    term: u64,
    notify_on_flush: bool,
    status: AtomicU8,
    buffers: Mutex<AHashMap<Vec<u8>, Arc<AggrBufferLocked>>>,
}

impl Aggregator {
    pub(crate) fn new(parts: AggregatorParts) -> Self {
        let count_all = matches!(parts.func, AggrFunc::Count | AggrFunc::CountWhere)
            && parts.aggr_col_idx.is_none();
        Self {
            base_schema: parts.base_schema,
            aggr_schema: parts.aggr_schema,
            aggr_table: parts.aggr_table,
            aggr_replicator: parts.aggr_replicator,
            index_pos: parts.index_pos,
            func: parts.func,
            aggr_col_idx: parts.aggr_col_idx,
            aggr_col_type: parts.aggr_col_type,
            ts_col_idx: parts.ts_col_idx,
            filter_col_idx: parts.filter_col_idx,
            window: parts.window,
            kernel: parts.kernel,
            count_all,
            term: parts.term,
            notify_on_flush: parts.notify_on_flush,
            status: AtomicU8::new(AggrStat::UnInit as u8),
            buffers: Mutex::new(AHashMap::new()),
        }
    }

    /// Current lifecycle state; a single atomic load.
    #[must_use]
    pub fn status(&self) -> AggrStat {
        AggrStat::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Window this aggregator buckets by.
    #[must_use]
    pub fn window(&self) -> WindowDef {
        self.window
    }

    /// Aggregate function this aggregator computes.
    #[must_use]
    pub fn func(&self) -> AggrFunc {
        self.func
    }

    /// Base-table index position this aggregator follows.
    #[must_use]
    pub fn index_pos(&self) -> u32 {
        self.index_pos
    }

    /// Folds one base-table row into its bucket.
    ///
    /// `key` is the indexed primary key, `row` the encoded base row, and
    /// `offset` the row's binlog offset. Closed buckets are flushed as a
    /// side effect; a row older than the live bucket is merged into its
    /// historical bucket in the aggregate table.
    ///
    /// # Errors
    ///
    /// Fails before recovery has completed, when `offset` rewinds, when a
    /// late row falls outside every flushed bucket's range, or on codec
    /// errors. Flush I/O failures are logged, not returned.
    pub fn update(&self, key: &str, row: &[u8], offset: u64) -> Result<(), AggrError> {
        self.update_inner(key, row, offset, false)
    }

    fn update_inner(
        &self,
        key: &str,
        row: &[u8],
        offset: u64,
        recover: bool,
    ) -> Result<(), AggrError> {
        if !recover && self.status() != AggrStat::Inited {
            return Err(AggrError::NotReady(self.status()));
        }
        let view = RowView::new(&self.base_schema, row)?;
        let cur_ts = view
            .get_i64_key(self.ts_col_idx)?
            .ok_or(AggrError::NullTimestamp)?;

        let mut bucket_key = key.as_bytes().to_vec();
        #[allow(clippy::cast_possible_truncation)]
        let key_end = bucket_key.len() as u32;
        if let Some(filter_idx) = self.filter_col_idx {
            bucket_key.extend_from_slice(&filter_repr(view.get_datum(filter_idx)?));
        }

        let cell = {
            let mut map = self.buffers.lock();
            Arc::clone(map.entry(bucket_key.clone()).or_insert_with(|| {
                Arc::new(AggrBufferLocked::new(AggrBuffer::new(
                    self.aggr_col_type,
                    key_end,
                    self.kernel.fresh_value(),
                )))
            }))
        };

        let mut buf = cell.buffer.lock();
        if buf.ts_begin == -1 {
            buf.ts_begin = cur_ts;
            buf.ts_end = match self.window {
                WindowDef::RowsRange(w) => cur_ts + w - 1,
                WindowDef::RowsNum(_) => cur_ts,
            };
        }

        if classify(self.window, &buf, cur_ts) == WindowAction::Rollover {
            let snapshot = buf.clone();
            let next_begin = snapshot.ts_end + 1;
            let next_end = match self.window {
                WindowDef::RowsRange(w) => next_begin + w - 1,
                WindowDef::RowsNum(_) => next_begin,
            };
            buf.reopen(
                next_begin,
                next_end,
                snapshot.binlog_offset + 1,
                self.kernel.fresh_value(),
            );
            drop(buf);
            self.flush_or_log(&bucket_key, &snapshot);
            buf = cell.buffer.lock();
        }

        if offset < buf.binlog_offset {
            if recover {
                // Replayed record already reflected in this lineage.
                return Ok(());
            }
            return Err(AggrError::OffsetRewound {
                got: offset,
                current: buf.binlog_offset,
            });
        }

        if cur_ts < buf.ts_begin {
            drop(buf);
            if recover {
                // The row is durable in some flushed bucket already.
                return Ok(());
            }
            return self.merge_flushed(&bucket_key, key_end as usize, &view, cur_ts, offset);
        }

        buf.aggr_cnt += 1;
        buf.binlog_offset = offset;
        if !self.window.is_time_ranged() {
            buf.ts_end = cur_ts;
        }
        self.fold_row(&view, &mut buf)?;

        if let WindowDef::RowsNum(rows) = self.window {
            if i64::from(buf.aggr_cnt) >= rows {
                let snapshot = buf.clone();
                let next_begin = snapshot.ts_end + 1;
                buf.reopen(
                    next_begin,
                    next_begin,
                    snapshot.binlog_offset + 1,
                    self.kernel.fresh_value(),
                );
                drop(buf);
                self.flush_or_log(&bucket_key, &snapshot);
            }
        }
        Ok(())
    }

    /// Closes and publishes every non-empty live bucket.
    ///
    /// # Errors
    ///
    /// Returns on the first bucket whose flush fails; remaining buckets
    /// keep their state.
    pub fn flush_all(&self) -> Result<(), AggrError> {
        if self.status() != AggrStat::Inited {
            return Err(AggrError::NotReady(self.status()));
        }
        let cells: Vec<(Vec<u8>, Arc<AggrBufferLocked>)> = {
            let map = self.buffers.lock();
            map.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };
        for (bucket_key, cell) in cells {
            let snapshot = {
                let mut buf = cell.buffer.lock();
                if buf.aggr_cnt == 0 {
                    continue;
                }
                let snap = buf.clone();
                let next_begin = snap.ts_end + 1;
                let next_end = match self.window {
                    WindowDef::RowsRange(w) => next_begin + w - 1,
                    WindowDef::RowsNum(_) => next_begin,
                };
                buf.reopen(
                    next_begin,
                    next_end,
                    snap.binlog_offset + 1,
                    self.kernel.fresh_value(),
                );
                snap
            };
            self.flush_bucket(&bucket_key, &snapshot)?;
        }
        Ok(())
    }

    /// Snapshot of the live bucket for `key` (plus `filter_value` when
    /// the aggregator partitions by a filter column).
    ///
    /// The query layer combines this un-flushed tail with the flushed
    /// rows in the aggregate table.
    #[must_use]
    pub fn live_bucket(&self, key: &str, filter_value: Option<&[u8]>) -> Option<AggrBuffer> {
        let mut bucket_key = key.as_bytes().to_vec();
        if let Some(filter) = filter_value {
            bucket_key.extend_from_slice(filter);
        }
        let cell = self.buffers.lock().get(&bucket_key).map(Arc::clone)?;
        let buf = cell.buffer.lock();
        Some(buf.clone())
    }

    /// Rebuilds bucket state from the aggregate table and replays the
    /// base binlog to catch up, then admits live traffic.
    ///
    /// Must be called exactly once, before any [`Aggregator::update`].
    ///
    /// # Errors
    ///
    /// Fails if called twice, on any storage or codec error, or when the
    /// base log ends behind the aggregate table's newest offset. On
    /// failure the aggregator reverts to [`AggrStat::UnInit`].
    pub fn init(&self, base_log: &dyn LogReplicator) -> Result<(), AggrError> {
        if self
            .status
            .compare_exchange(
                AggrStat::UnInit as u8,
                AggrStat::Recovering as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(AggrError::NotReady(self.status()));
        }
        match self.recover(base_log) {
            Ok(()) => {
                self.status.store(AggrStat::Inited as u8, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "recovery failed");
                self.status.store(AggrStat::UnInit as u8, Ordering::Release);
                Err(e)
            }
        }
    }

    fn recover(&self, base_log: &dyn LogReplicator) -> Result<(), AggrError> {
        if self.aggr_table.record_count() == 0 && base_log.is_empty() {
            info!("aggregate table and base log empty; nothing to recover");
            return Ok(());
        }

        let mut recovery_offset = u64::MAX;
        let mut aggr_latest = 0u64;
        {
            let mut it = self.aggr_table.traverse(0)?;
            it.seek_to_first();
            let mut map = self.buffers.lock();
            while it.valid() {
                let rv = RowView::new(&self.aggr_schema, it.value())?;
                let pk = required(rv.get_string(FIELD_KEY)?, "key")?;
                let filter = rv.get_string(FIELD_FILTER)?.unwrap_or_default();
                #[allow(clippy::cast_possible_truncation)]
                let key_end = pk.len() as u32;
                let mut buf =
                    AggrBuffer::new(self.aggr_col_type, key_end, self.kernel.fresh_value());
                buf.ts_begin = required(rv.get_timestamp(FIELD_TS_BEGIN)?, "ts_begin")?;
                buf.ts_end = required(rv.get_timestamp(FIELD_TS_END)?, "ts_end")?;
                buf.aggr_cnt = required(rv.get_int(FIELD_AGGR_CNT)?, "aggr_cnt")?;
                self.kernel
                    .decode(rv.get_string(FIELD_AGGR_VAL)?, &mut buf)?;
                #[allow(clippy::cast_sign_loss)]
                let offset =
                    required(rv.get_big_int(FIELD_BINLOG_OFFSET)?, "binlog_offset")? as u64;
                recovery_offset = recovery_offset.min(offset);
                aggr_latest = aggr_latest.max(offset);

                // The flushed window is durable; re-open for the next one.
                let next_begin = buf.ts_end + 1;
                let next_end = match self.window {
                    WindowDef::RowsRange(w) => next_begin + w - 1,
                    WindowDef::RowsNum(_) => next_begin,
                };
                buf.reopen(next_begin, next_end, offset + 1, self.kernel.fresh_value());

                let mut bucket_key = pk.to_vec();
                bucket_key.extend_from_slice(filter);
                map.insert(bucket_key, Arc::new(AggrBufferLocked::new(buf)));
                it.next_pk();
            }
        }
        if recovery_offset == u64::MAX {
            recovery_offset = 0;
        }

        let mut reader = base_log.read_from(recovery_offset);
        let mut cur_offset = recovery_offset;
        let mut last_eof_segment = usize::MAX;
        loop {
            match reader.read_next() {
                ReadOutcome::Entry(entry) => {
                    if entry.log_index <= cur_offset {
                        continue;
                    }
                    cur_offset = entry.log_index;
                    if entry.method == EntryKind::Delete {
                        warn!(
                            log_index = entry.log_index,
                            "skipping delete record; deletions are not propagated to aggregates"
                        );
                        continue;
                    }
                    for dim in &entry.dimensions {
                        if dim.idx == self.index_pos {
                            self.update_inner(&dim.key, &entry.value, entry.log_index, true)?;
                        }
                    }
                }
                ReadOutcome::WaitRecord => {
                    if reader.segment_index() < reader.last_segment_index() {
                        reader.roll_next_segment();
                    } else {
                        break;
                    }
                }
                ReadOutcome::Eof => {
                    if last_eof_segment == reader.segment_index() {
                        break;
                    }
                    last_eof_segment = reader.segment_index();
                }
            }
        }

        if cur_offset < aggr_latest {
            return Err(AggrError::ReplayBehind {
                replayed: cur_offset,
                latest: aggr_latest,
            });
        }
        info!(
            recovery_offset,
            replayed_to = cur_offset,
            buckets = self.buffers.lock().len(),
            "recovery complete"
        );
        Ok(())
    }

    /// Reads the aggregate column (if any) and folds it, maintaining the
    /// non-null count. Under `count(*)` every row counts.
    fn fold_row(&self, view: &RowView<'_>, buf: &mut AggrBuffer) -> Result<(), AggrError> {
        let datum = match self.aggr_col_idx {
            Some(idx) => view.get_datum(idx)?,
            None => None,
        };
        match datum {
            Some(d) => {
                self.kernel.fold(&d, buf)?;
                buf.non_null_cnt += 1;
            }
            None => {
                if self.count_all {
                    buf.non_null_cnt += 1;
                }
            }
        }
        Ok(())
    }

    /// Flush used on the update path: failures are logged, never
    /// propagated — the live bucket has already been re-opened.
    fn flush_or_log(&self, bucket_key: &[u8], snapshot: &AggrBuffer) {
        if snapshot.aggr_cnt == 0 {
            debug!("skipping flush of empty bucket");
            return;
        }
        if let Err(e) = self.flush_bucket(bucket_key, snapshot) {
            warn!(error = %e, ts_begin = snapshot.ts_begin, "bucket flush failed");
        }
    }

    /// Encodes `buf` as an aggregate-table row and publishes it to the
    /// table and its replicator.
    fn flush_bucket(&self, bucket_key: &[u8], buf: &AggrBuffer) -> Result<(), AggrError> {
        let key_end = buf.key_end as usize;
        let pk = &bucket_key[..key_end];
        let filter = &bucket_key[key_end..];
        let encoded = self.kernel.encode(buf);

        let mut builder = RowBuilder::new(&self.aggr_schema);
        builder.append_string(pk)?;
        builder.append_timestamp(buf.ts_begin)?;
        builder.append_timestamp(buf.ts_end)?;
        builder.append_int(buf.aggr_cnt)?;
        match &encoded {
            Some(bytes) => builder.append_string(bytes)?,
            None => builder.append_null()?,
        }
        #[allow(clippy::cast_possible_wrap)]
        builder.append_big_int(buf.binlog_offset as i64)?;
        if filter.is_empty() {
            builder.append_null()?;
        } else {
            builder.append_string(filter)?;
        }
        let row = builder.finish()?;

        let dims = vec![Dimension::new(0, String::from_utf8_lossy(pk).into_owned())];
        let now = now_ms();
        self.aggr_table.put(now, row.clone(), &dims)?;

        self.aggr_replicator.append(LogEntry {
            log_index: 0,
            term: self.term,
            method: EntryKind::Put,
            ts: now,
            value: row,
            dimensions: dims,
        })?;
        if self.notify_on_flush {
            self.aggr_replicator.notify();
        }
        debug!(
            ts_begin = buf.ts_begin,
            ts_end = buf.ts_end,
            cnt = buf.aggr_cnt,
            offset = buf.binlog_offset,
            "flushed bucket"
        );
        Ok(())
    }

    /// Merges a late row into the historical bucket covering it, then
    /// re-publishes that bucket under its original `ts_begin`.
    fn merge_flushed(
        &self,
        bucket_key: &[u8],
        key_end: usize,
        view: &RowView<'_>,
        cur_ts: i64,
        offset: u64,
    ) -> Result<(), AggrError> {
        let pk = &bucket_key[..key_end];
        let filter = &bucket_key[key_end..];
        let pk_str = String::from_utf8_lossy(pk).into_owned();

        let mut it = self.aggr_table.traverse(0)?;
        it.seek(&pk_str, cur_ts + 1);

        #[allow(clippy::cast_possible_truncation)]
        let mut tmp = AggrBuffer::new(
            self.aggr_col_type,
            key_end as u32,
            self.kernel.fresh_value(),
        );
        let mut found = false;
        while it.valid() && it.pk() == pk_str {
            let rv = RowView::new(&self.aggr_schema, it.value())?;
            // Rows of sibling filter streams share the primary key; skip
            // until the filter suffix matches ours.
            let row_filter = rv.get_string(FIELD_FILTER)?.unwrap_or_default();
            if row_filter != filter {
                it.next();
                continue;
            }
            tmp.ts_begin = required(rv.get_timestamp(FIELD_TS_BEGIN)?, "ts_begin")?;
            tmp.ts_end = required(rv.get_timestamp(FIELD_TS_END)?, "ts_end")?;
            tmp.aggr_cnt = required(rv.get_int(FIELD_AGGR_CNT)?, "aggr_cnt")?;
            self.kernel
                .decode(rv.get_string(FIELD_AGGR_VAL)?, &mut tmp)?;
            if cur_ts < tmp.ts_begin || cur_ts > tmp.ts_end {
                return Err(AggrError::LateOutOfRange {
                    cur_ts,
                    ts_begin: tmp.ts_begin,
                    ts_end: tmp.ts_end,
                });
            }
            found = true;
            break;
        }
        if !found {
            // No flushed bucket covers the row: publish a singleton.
            tmp.ts_begin = cur_ts;
            tmp.ts_end = cur_ts;
        }
        tmp.aggr_cnt += 1;
        tmp.binlog_offset = offset;
        self.fold_row(view, &mut tmp)?;
        self.flush_bucket(bucket_key, &tmp)?;
        info!(cur_ts, offset, "merged late row into flushed bucket");
        Ok(())
    }
}

fn required<T>(value: Option<T>, what: &str) -> Result<T, AggrError> {
    value.ok_or_else(|| {
        AggrError::Codec(CodecError::Corrupt(format!(
            "aggregate row missing {what}"
        )))
    })
}

/// String representation of a filter column value, as appended to the
/// bucket key and to field 6 of the aggregate row. NULL contributes an
/// empty segment.
fn filter_repr(datum: Option<Datum<'_>>) -> Vec<u8> {
    match datum {
        None => Vec::new(),
        Some(Datum::Str(b)) => b.to_vec(),
        Some(Datum::SmallInt(v)) => v.to_string().into_bytes(),
        Some(Datum::Int(v) | Datum::Date(v)) => v.to_string().into_bytes(),
        Some(Datum::BigInt(v) | Datum::Timestamp(v)) => v.to_string().into_bytes(),
        Some(Datum::Float(v)) => v.to_string().into_bytes(),
        Some(Datum::Double(v)) => v.to_string().into_bytes(),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

// Tests for the aggregator live in `tests/preagg.rs`, which drives the
// full engine against the in-memory table and binlog; the unit tests
// here cover pure helpers.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_round_trip() {
        assert_eq!(AggrStat::from_u8(AggrStat::UnInit as u8), AggrStat::UnInit);
        assert_eq!(
            AggrStat::from_u8(AggrStat::Recovering as u8),
            AggrStat::Recovering
        );
        assert_eq!(AggrStat::from_u8(AggrStat::Inited as u8), AggrStat::Inited);
    }

    #[test]
    fn test_filter_repr() {
        assert_eq!(filter_repr(None), b"".to_vec());
        assert_eq!(filter_repr(Some(Datum::Str(b"east"))), b"east".to_vec());
        assert_eq!(filter_repr(Some(Datum::Int(-5))), b"-5".to_vec());
        assert_eq!(filter_repr(Some(Datum::BigInt(7))), b"7".to_vec());
    }
}
