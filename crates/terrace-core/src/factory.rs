//! Aggregator construction and validation.
//!
//! The factory is the only component that produces configuration errors:
//! it parses the bucket-size spec, resolves column names against the base
//! schema, validates the kernel × column-type pairing, and assembles the
//! [`Aggregator`]. Anything it accepts will fold without type errors.

use std::sync::Arc;

use terrace_storage::{
    ColumnDesc, DataType, LogReplicator, Schema, SchemaRef, Table,
};

use crate::aggregator::{Aggregator, AggregatorParts};
use crate::error::AggrError;
use crate::kernel::{kernel_for, AggrFunc};
use crate::window::WindowDef;

/// Declarative description of one pre-aggregate.
#[derive(Debug, Clone)]
pub struct AggrSpec {
    /// Base column to aggregate, or `"*"` to count rows.
    pub aggr_col: String,
    /// Function name, case-insensitive (`sum`, `min`, `max`, `count`,
    /// `avg`, `count_where`).
    pub aggr_func: String,
    /// Base column providing the event timestamp (`bigint` or
    /// `timestamp`).
    pub ts_col: String,
    /// Bucket-size spec: digits for a row-count window, digits plus a
    /// time unit (`s`/`m`/`h`/`d`) for a time-ranged window.
    pub bucket_size: String,
    /// Filter column for `count_where`.
    pub filter_col: Option<String>,
}

/// Runtime wiring the factory needs besides the spec itself.
pub struct AggrRuntime {
    /// Base-table schema.
    pub base_meta: SchemaRef,
    /// Aggregate-table schema (the [`aggr_table_schema`] layout).
    pub aggr_meta: SchemaRef,
    /// Durable sink for flushed buckets.
    pub aggr_table: Arc<dyn Table>,
    /// Replicator of the aggregate table.
    pub aggr_replicator: Arc<dyn LogReplicator>,
    /// Base-table index position the aggregator follows.
    pub index_pos: u32,
    /// Leader term stamped on flush log entries.
    pub term: u64,
    /// Whether to notify the replicator after each flush.
    pub notify_on_flush: bool,
}

/// The positional schema of every aggregate table.
#[must_use]
pub fn aggr_table_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        ColumnDesc::new("key", DataType::String),
        ColumnDesc::new("ts_start", DataType::Timestamp),
        ColumnDesc::new("ts_end", DataType::Timestamp),
        ColumnDesc::new("num_rows", DataType::Int),
        ColumnDesc::nullable("agg_val", DataType::String),
        ColumnDesc::new("binlog_offset", DataType::BigInt),
        ColumnDesc::nullable("filter_key", DataType::String),
    ]))
}

/// Builds an aggregator from a spec, validating every moving part.
///
/// # Errors
///
/// Returns [`AggrError::Config`] for an unknown function, a bad bucket
/// size, unresolvable columns, a non-temporal ts column, or a
/// kernel/column-type pairing the engine does not support.
pub fn build_aggregator(
    runtime: AggrRuntime,
    spec: &AggrSpec,
) -> Result<Arc<Aggregator>, AggrError> {
    let window = WindowDef::parse(&spec.bucket_size)?;
    let func = AggrFunc::parse(&spec.aggr_func)?;

    let ts_col_idx = runtime
        .base_meta
        .index_of(&spec.ts_col)
        .ok_or_else(|| AggrError::Config(format!("unknown ts column: {}", spec.ts_col)))?;
    let ts_col_type = runtime
        .base_meta
        .column(ts_col_idx)
        .map(|c| c.data_type)
        .unwrap_or(DataType::String);
    if !matches!(ts_col_type, DataType::BigInt | DataType::Timestamp) {
        return Err(AggrError::Config(format!(
            "ts column {} must be bigint or timestamp, got {ts_col_type:?}",
            spec.ts_col
        )));
    }

    let (aggr_col_idx, aggr_col_type) = if spec.aggr_col == "*" {
        if !matches!(func, AggrFunc::Count | AggrFunc::CountWhere) {
            return Err(AggrError::Config(format!(
                "only count may aggregate '*', not {}",
                spec.aggr_func
            )));
        }
        (None, DataType::BigInt)
    } else {
        let idx = runtime.base_meta.index_of(&spec.aggr_col).ok_or_else(|| {
            AggrError::Config(format!("unknown aggregate column: {}", spec.aggr_col))
        })?;
        let ty = runtime
            .base_meta
            .column(idx)
            .map(|c| c.data_type)
            .unwrap_or(DataType::String);
        (Some(idx), ty)
    };

    let filter_col_idx = match (func, &spec.filter_col) {
        (AggrFunc::CountWhere, Some(name)) => {
            Some(runtime.base_meta.index_of(name).ok_or_else(|| {
                AggrError::Config(format!("unknown filter column: {name}"))
            })?)
        }
        (AggrFunc::CountWhere, None) => {
            return Err(AggrError::Config(
                "count_where requires a filter column".into(),
            ))
        }
        (_, Some(name)) => {
            return Err(AggrError::Config(format!(
                "filter column {name} is only supported with count_where"
            )))
        }
        (_, None) => None,
    };

    let kernel = kernel_for(func, aggr_col_type)?;

    Ok(Arc::new(Aggregator::new(AggregatorParts {
        base_schema: runtime.base_meta,
        aggr_schema: runtime.aggr_meta,
        aggr_table: runtime.aggr_table,
        aggr_replicator: runtime.aggr_replicator,
        index_pos: runtime.index_pos,
        func,
        aggr_col_idx,
        aggr_col_type,
        ts_col_idx,
        filter_col_idx,
        window,
        kernel,
        term: runtime.term,
        notify_on_flush: runtime.notify_on_flush,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use terrace_storage::{MemBinlog, MemTable};

    fn base_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            ColumnDesc::new("id", DataType::String),
            ColumnDesc::new("ts", DataType::Timestamp),
            ColumnDesc::new("v", DataType::Int),
            ColumnDesc::new("tag", DataType::String),
        ]))
    }

    fn runtime() -> AggrRuntime {
        let aggr_meta = aggr_table_schema();
        AggrRuntime {
            base_meta: base_schema(),
            aggr_meta: Arc::clone(&aggr_meta),
            aggr_table: Arc::new(MemTable::new("agg", aggr_meta, 1)),
            aggr_replicator: Arc::new(MemBinlog::new()),
            index_pos: 0,
            term: 1,
            notify_on_flush: false,
        }
    }

    fn spec(func: &str, col: &str, bucket: &str) -> AggrSpec {
        AggrSpec {
            aggr_col: col.into(),
            aggr_func: func.into(),
            ts_col: "ts".into(),
            bucket_size: bucket.into(),
            filter_col: None,
        }
    }

    #[test]
    fn test_builds_supported_specs() {
        for (func, col, bucket) in [
            ("sum", "v", "1s"),
            ("MIN", "tag", "2"),
            ("max", "v", "10m"),
            ("count", "*", "1h"),
            ("avg", "v", "1d"),
        ] {
            let agg = build_aggregator(runtime(), &spec(func, col, bucket));
            assert!(agg.is_ok(), "{func} over {col} with {bucket} rejected");
        }
    }

    #[test]
    fn test_count_where_needs_filter() {
        let mut s = spec("count_where", "*", "1s");
        assert!(matches!(
            build_aggregator(runtime(), &s),
            Err(AggrError::Config(_))
        ));
        s.filter_col = Some("tag".into());
        assert!(build_aggregator(runtime(), &s).is_ok());
    }

    #[test]
    fn test_filter_rejected_outside_count_where() {
        let mut s = spec("sum", "v", "1s");
        s.filter_col = Some("tag".into());
        assert!(matches!(
            build_aggregator(runtime(), &s),
            Err(AggrError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_bad_specs() {
        // Unknown function
        assert!(build_aggregator(runtime(), &spec("median", "v", "1s")).is_err());
        // Star outside count
        assert!(build_aggregator(runtime(), &spec("sum", "*", "1s")).is_err());
        // Unknown columns
        assert!(build_aggregator(runtime(), &spec("sum", "missing", "1s")).is_err());
        let mut s = spec("sum", "v", "1s");
        s.ts_col = "missing".into();
        assert!(build_aggregator(runtime(), &s).is_err());
        // Non-temporal ts column
        let mut s = spec("sum", "v", "1s");
        s.ts_col = "tag".into();
        assert!(build_aggregator(runtime(), &s).is_err());
        // Bad bucket sizes
        for bucket in ["", "1w", "abc"] {
            assert!(build_aggregator(runtime(), &spec("sum", "v", bucket)).is_err());
        }
        // SUM over a string column
        assert!(build_aggregator(runtime(), &spec("sum", "tag", "1s")).is_err());
    }

    #[test]
    fn test_aggr_table_schema_layout() {
        let schema = aggr_table_schema();
        assert_eq!(schema.len(), 7);
        assert_eq!(schema.index_of("ts_start"), Some(1));
        assert_eq!(schema.index_of("binlog_offset"), Some(5));
        assert!(schema.column(4).unwrap().nullable);
        assert!(schema.column(6).unwrap().nullable);
    }
}
