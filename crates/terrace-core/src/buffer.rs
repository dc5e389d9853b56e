//! Per-key partial aggregate state.

use parking_lot::Mutex;
use terrace_storage::DataType;

use crate::value::AggrValue;

/// Live partial state for one bucket of one key.
///
/// `ts_begin == -1` marks a bucket that has never seen a row; the first
/// update anchors the window.
#[derive(Debug, Clone)]
pub struct AggrBuffer {
    /// Inclusive lower bound of the bucket (`-1` = uninitialised).
    pub ts_begin: i64,
    /// Inclusive upper bound. Fixed at open for time-ranged windows;
    /// tracks the max row ts for row-count windows.
    pub ts_end: i64,
    /// Rows folded into this bucket, nulls included.
    pub aggr_cnt: i32,
    /// Non-null contributions (COUNT value, AVG denominator, MIN/MAX
    /// emptiness probe).
    pub non_null_cnt: i64,
    /// Highest base-table binlog offset folded in.
    pub binlog_offset: u64,
    /// Accumulator; semantics belong to the kernel.
    pub aggr_val: AggrValue,
    /// Aggregate column type snapshot, for encode/decode.
    pub data_type: DataType,
    /// Length of the primary key inside the composite bucket key; the
    /// rest is the filter-value suffix.
    pub key_end: u32,
}

impl AggrBuffer {
    /// Creates an uninitialised buffer.
    #[must_use]
    pub fn new(data_type: DataType, key_end: u32, aggr_val: AggrValue) -> Self {
        Self {
            ts_begin: -1,
            ts_end: -1,
            aggr_cnt: 0,
            non_null_cnt: 0,
            binlog_offset: 0,
            aggr_val,
            data_type,
            key_end,
        }
    }

    /// Whether the bucket has no non-null contributions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.non_null_cnt == 0
    }

    /// Re-opens the buffer for the window following a flush.
    ///
    /// Offsets are seeded one past the flushed bucket so every binlog
    /// offset belongs to exactly one bucket lineage.
    pub fn reopen(&mut self, ts_begin: i64, ts_end: i64, offset_seed: u64, aggr_val: AggrValue) {
        self.ts_begin = ts_begin;
        self.ts_end = ts_end;
        self.aggr_cnt = 0;
        self.non_null_cnt = 0;
        self.binlog_offset = offset_seed;
        self.aggr_val = aggr_val;
    }
}

/// A bucket pinned behind its own mutex.
///
/// Map entries hold these behind `Arc`, so rehashing the bucket map never
/// moves a mutex another thread is holding.
pub struct AggrBufferLocked {
    /// The guarded partial state.
    pub buffer: Mutex<AggrBuffer>,
}

impl AggrBufferLocked {
    /// Wraps `buffer` in its mutex.
    #[must_use]
    pub fn new(buffer: AggrBuffer) -> Self {
        Self {
            buffer: Mutex::new(buffer),
        }
    }
}
