//! Error types for the pre-aggregation engine.

use terrace_storage::{CodecError, DataType, LogError, TableError};

use crate::aggregator::AggrStat;

/// Errors from aggregator construction, updates, and recovery.
#[derive(Debug, thiserror::Error)]
pub enum AggrError {
    /// Unknown function, unsupported column type, or bad bucket size.
    /// Produced only by the factory.
    #[error("invalid aggregator config: {0}")]
    Config(String),

    /// An update arrived while the aggregator is not `Inited`.
    #[error("aggregator not ready (status {0:?})")]
    NotReady(AggrStat),

    /// The binlog offset moved backwards outside recovery.
    #[error("binlog offset went backwards: got {got}, bucket at {current}")]
    OffsetRewound {
        /// Offset carried by the rejected update.
        got: u64,
        /// Offset already folded into the bucket.
        current: u64,
    },

    /// A late row does not fall inside the historical bucket found for it.
    #[error("late row ts {cur_ts} outside bucket [{ts_begin}, {ts_end}]")]
    LateOutOfRange {
        /// Timestamp of the late row.
        cur_ts: i64,
        /// Lower bound of the located bucket.
        ts_begin: i64,
        /// Upper bound of the located bucket.
        ts_end: i64,
    },

    /// Replay finished behind the aggregate table's newest offset: the
    /// base binlog has been truncated past data the aggregate reflects.
    #[error("base log behind aggregate table: replayed to {replayed}, aggregate at {latest}")]
    ReplayBehind {
        /// Highest offset seen during replay.
        replayed: u64,
        /// Highest offset recorded in the aggregate table.
        latest: u64,
    },

    /// The timestamp column of an incoming row was NULL.
    #[error("timestamp column is null")]
    NullTimestamp,

    /// A fold met a column type the kernel does not support. The factory
    /// rejects these pairings up front; this is the defensive path.
    #[error("unsupported column type {0:?} for {1}")]
    UnsupportedType(DataType, &'static str),

    /// Row codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Aggregate table failure.
    #[error(transparent)]
    Table(#[from] TableError),

    /// Binlog failure.
    #[error(transparent)]
    Log(#[from] LogError),
}
