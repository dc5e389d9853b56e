//! # Terrace Storage
//!
//! Storage substrate for the Terrace table server: schema descriptors,
//! the packed positional row codec, the [`Table`](table::Table)
//! abstraction with an in-memory implementation, and the segmented
//! write-ahead binlog.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod binlog;
pub mod row;
pub mod schema;
pub mod table;

pub use binlog::{EntryKind, LogEntry, LogError, LogReader, LogReplicator, MemBinlog, ReadOutcome};
pub use row::{CodecError, Datum, RowBuilder, RowView};
pub use schema::{ColumnDesc, DataType, Schema, SchemaRef};
pub use table::{Dimension, MemTable, Table, TableError, TraverseIterator};
