//! # Terrace Core
//!
//! Streaming pre-aggregation engine for the Terrace table server.
//!
//! As rows append to a base table, an [`Aggregator`] maintains per-key,
//! per-window partial aggregates (SUM, MIN, MAX, COUNT, COUNT_WHERE,
//! AVG) in a companion aggregate table. Window queries then combine a
//! few pre-aggregated bucket rows with the un-flushed live-bucket tail
//! instead of scanning raw history.
//!
//! ## Lifecycle
//!
//! 1. Build with [`factory::build_aggregator`].
//! 2. Call [`Aggregator::init`] with the base table's binlog to seed
//!    buckets from the aggregate table and replay the log.
//! 3. Feed live writes through [`Aggregator::update`]; completed buckets
//!    flush to the aggregate table automatically.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod aggregator;
pub mod buffer;
pub mod error;
pub mod factory;
mod kernel;
pub mod value;
pub mod window;

pub use aggregator::{Aggregator, AggrStat};
pub use buffer::{AggrBuffer, AggrBufferLocked};
pub use error::AggrError;
pub use factory::{aggr_table_schema, build_aggregator, AggrRuntime, AggrSpec};
pub use kernel::AggrFunc;
pub use value::AggrValue;
pub use window::{WindowAction, WindowDef};
