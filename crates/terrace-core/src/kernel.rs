//! Aggregation kernels: fold, encode, decode.
//!
//! A kernel owns the accumulator semantics for one aggregate function.
//! Schema state (column indices, window shape) stays with the owning
//! aggregator; a kernel only ever sees the already-extracted datum and
//! the bucket it mutates. Null handling lives in the bucket manager —
//! `fold` is called for non-null input only.
//!
//! Encoded forms (field 4 of the aggregate row, little-endian):
//!
//! | function | encoding |
//! |---|---|
//! | SUM | `i64`, or `f32`/`f64` verbatim for float inputs |
//! | MIN/MAX | native width of the input; raw bytes for strings; NULL if empty |
//! | COUNT / COUNT_WHERE | `i64` non-null count |
//! | AVG | `f64` sum ++ `i64` count (16 bytes) |

use bytes::Bytes;
use terrace_storage::{CodecError, DataType, Datum};

use crate::buffer::AggrBuffer;
use crate::error::AggrError;
use crate::value::AggrValue;

/// Aggregate functions the engine supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggrFunc {
    /// Running sum.
    Sum,
    /// Running minimum.
    Min,
    /// Running maximum.
    Max,
    /// Non-null row count (`count(*)` counts every row).
    Count,
    /// Running mean, kept as sum + count.
    Avg,
    /// Count partitioned by a filter column's value.
    CountWhere,
}

impl AggrFunc {
    /// Resolves a case-insensitive function name.
    ///
    /// # Errors
    ///
    /// Returns [`AggrError::Config`] for unknown names.
    pub fn parse(name: &str) -> Result<Self, AggrError> {
        match name.to_ascii_lowercase().as_str() {
            "sum" => Ok(Self::Sum),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "count" => Ok(Self::Count),
            "avg" => Ok(Self::Avg),
            "count_where" => Ok(Self::CountWhere),
            other => Err(AggrError::Config(format!(
                "unsupported aggregate function: {other}"
            ))),
        }
    }
}

/// The fold/encode/decode capability the bucket manager drives.
pub(crate) trait AggrKernel: Send + Sync {
    /// A fresh accumulator arm for an empty bucket.
    fn fresh_value(&self) -> AggrValue;

    /// Folds one non-null datum into the accumulator.
    fn fold(&self, datum: &Datum<'_>, buf: &mut AggrBuffer) -> Result<(), AggrError>;

    /// Encodes the accumulator for field 4; `None` publishes NULL.
    fn encode(&self, buf: &AggrBuffer) -> Option<Bytes>;

    /// Restores accumulator state from field 4.
    fn decode(&self, raw: Option<&[u8]>, buf: &mut AggrBuffer) -> Result<(), AggrError>;
}

/// Builds the kernel for `func` over an aggregate column of `col_type`,
/// validating the pairing.
///
/// # Errors
///
/// Returns [`AggrError::Config`] for unsupported pairings.
pub(crate) fn kernel_for(
    func: AggrFunc,
    col_type: DataType,
) -> Result<Box<dyn AggrKernel>, AggrError> {
    match func {
        AggrFunc::Sum => {
            let acc = match col_type {
                DataType::SmallInt | DataType::Int | DataType::BigInt | DataType::Timestamp => {
                    AggrValue::Long(0)
                }
                DataType::Float => AggrValue::Float(0.0),
                DataType::Double => AggrValue::Double(0.0),
                DataType::Date | DataType::String => {
                    return Err(AggrError::Config(format!(
                        "SUM does not support column type {col_type:?}"
                    )))
                }
            };
            Ok(Box::new(SumKernel { acc }))
        }
        AggrFunc::Min | AggrFunc::Max => Ok(Box::new(MinMaxKernel {
            col_type,
            min: func == AggrFunc::Min,
        })),
        AggrFunc::Count | AggrFunc::CountWhere => Ok(Box::new(CountKernel)),
        AggrFunc::Avg => {
            if matches!(
                col_type,
                DataType::Date | DataType::Timestamp | DataType::String
            ) {
                return Err(AggrError::Config(format!(
                    "AVG does not support column type {col_type:?}"
                )));
            }
            Ok(Box::new(AvgKernel))
        }
    }
}

fn le_i64(raw: &[u8]) -> Result<i64, AggrError> {
    let arr: [u8; 8] = raw
        .try_into()
        .map_err(|_| AggrError::Codec(CodecError::Corrupt(format!(
            "expected 8 bytes, got {}",
            raw.len()
        ))))?;
    Ok(i64::from_le_bytes(arr))
}

fn le_f64(raw: &[u8]) -> Result<f64, AggrError> {
    let arr: [u8; 8] = raw
        .try_into()
        .map_err(|_| AggrError::Codec(CodecError::Corrupt(format!(
            "expected 8 bytes, got {}",
            raw.len()
        ))))?;
    Ok(f64::from_le_bytes(arr))
}

fn truncated(what: &str, raw: &[u8]) -> AggrError {
    AggrError::Codec(CodecError::Corrupt(format!(
        "{what}: unexpected length {}",
        raw.len()
    )))
}

// ── SUM ──────────────────────────────────────────────────────────────

struct SumKernel {
    acc: AggrValue,
}

impl AggrKernel for SumKernel {
    fn fresh_value(&self) -> AggrValue {
        self.acc.clone()
    }

    fn fold(&self, datum: &Datum<'_>, buf: &mut AggrBuffer) -> Result<(), AggrError> {
        match (&mut buf.aggr_val, datum) {
            (AggrValue::Long(acc), Datum::SmallInt(v)) => *acc += i64::from(*v),
            (AggrValue::Long(acc), Datum::Int(v)) => *acc += i64::from(*v),
            (AggrValue::Long(acc), Datum::BigInt(v) | Datum::Timestamp(v)) => *acc += *v,
            (AggrValue::Float(acc), Datum::Float(v)) => *acc += *v,
            (AggrValue::Double(acc), Datum::Double(v)) => *acc += *v,
            _ => return Err(AggrError::UnsupportedType(buf.data_type, "SUM")),
        }
        Ok(())
    }

    fn encode(&self, buf: &AggrBuffer) -> Option<Bytes> {
        Some(buf.aggr_val.to_le_bytes())
    }

    fn decode(&self, raw: Option<&[u8]>, buf: &mut AggrBuffer) -> Result<(), AggrError> {
        let Some(raw) = raw else {
            buf.aggr_val = self.fresh_value();
            return Ok(());
        };
        buf.aggr_val = match self.acc {
            AggrValue::Float(_) => {
                let arr: [u8; 4] = raw.try_into().map_err(|_| truncated("SUM f32", raw))?;
                AggrValue::Float(f32::from_le_bytes(arr))
            }
            AggrValue::Double(_) => AggrValue::Double(le_f64(raw)?),
            _ => AggrValue::Long(le_i64(raw)?),
        };
        Ok(())
    }
}

// ── MIN / MAX ────────────────────────────────────────────────────────

struct MinMaxKernel {
    col_type: DataType,
    min: bool,
}

impl MinMaxKernel {
    fn better<T: PartialOrd>(&self, candidate: &T, current: &T) -> bool {
        if self.min {
            candidate < current
        } else {
            candidate > current
        }
    }
}

impl AggrKernel for MinMaxKernel {
    fn fresh_value(&self) -> AggrValue {
        match self.col_type {
            DataType::SmallInt => AggrValue::SmallInt(0),
            DataType::Int | DataType::Date => AggrValue::Int(0),
            DataType::BigInt | DataType::Timestamp => AggrValue::Long(0),
            DataType::Float => AggrValue::Float(0.0),
            DataType::Double => AggrValue::Double(0.0),
            DataType::String => AggrValue::Str(Vec::new()),
        }
    }

    fn fold(&self, datum: &Datum<'_>, buf: &mut AggrBuffer) -> Result<(), AggrError> {
        let first = buf.is_empty();
        match (&mut buf.aggr_val, datum) {
            (AggrValue::SmallInt(acc), Datum::SmallInt(v)) => {
                if first || self.better(v, acc) {
                    *acc = *v;
                }
            }
            (AggrValue::Int(acc), Datum::Int(v) | Datum::Date(v)) => {
                if first || self.better(v, acc) {
                    *acc = *v;
                }
            }
            (AggrValue::Long(acc), Datum::BigInt(v) | Datum::Timestamp(v)) => {
                if first || self.better(v, acc) {
                    *acc = *v;
                }
            }
            (AggrValue::Float(acc), Datum::Float(v)) => {
                if first || self.better(v, acc) {
                    *acc = *v;
                }
            }
            (AggrValue::Double(acc), Datum::Double(v)) => {
                if first || self.better(v, acc) {
                    *acc = *v;
                }
            }
            (AggrValue::Str(acc), Datum::Str(v)) => {
                if first || self.better(v, &acc.as_slice()) {
                    acc.clear();
                    acc.extend_from_slice(v);
                }
            }
            _ => {
                return Err(AggrError::UnsupportedType(
                    buf.data_type,
                    if self.min { "MIN" } else { "MAX" },
                ))
            }
        }
        Ok(())
    }

    fn encode(&self, buf: &AggrBuffer) -> Option<Bytes> {
        if buf.is_empty() {
            None
        } else {
            Some(buf.aggr_val.to_le_bytes())
        }
    }

    fn decode(&self, raw: Option<&[u8]>, buf: &mut AggrBuffer) -> Result<(), AggrError> {
        let Some(raw) = raw else {
            buf.aggr_val = self.fresh_value();
            buf.non_null_cnt = 0;
            return Ok(());
        };
        buf.aggr_val = match self.col_type {
            DataType::SmallInt => {
                let arr: [u8; 2] = raw.try_into().map_err(|_| truncated("MIN/MAX i16", raw))?;
                AggrValue::SmallInt(i16::from_le_bytes(arr))
            }
            DataType::Int | DataType::Date => {
                let arr: [u8; 4] = raw.try_into().map_err(|_| truncated("MIN/MAX i32", raw))?;
                AggrValue::Int(i32::from_le_bytes(arr))
            }
            DataType::BigInt | DataType::Timestamp => AggrValue::Long(le_i64(raw)?),
            DataType::Float => {
                let arr: [u8; 4] = raw.try_into().map_err(|_| truncated("MIN/MAX f32", raw))?;
                AggrValue::Float(f32::from_le_bytes(arr))
            }
            DataType::Double => AggrValue::Double(le_f64(raw)?),
            DataType::String => AggrValue::Str(raw.to_vec()),
        };
        // The durable row does not carry the exact non-null count for
        // MIN/MAX; any non-zero value preserves the emptiness contract.
        buf.non_null_cnt = buf.non_null_cnt.max(1);
        Ok(())
    }
}

// ── COUNT / COUNT_WHERE ──────────────────────────────────────────────

struct CountKernel;

impl AggrKernel for CountKernel {
    fn fresh_value(&self) -> AggrValue {
        AggrValue::Long(0)
    }

    fn fold(&self, _datum: &Datum<'_>, _buf: &mut AggrBuffer) -> Result<(), AggrError> {
        // The count lives in `non_null_cnt`, maintained by the manager.
        Ok(())
    }

    fn encode(&self, buf: &AggrBuffer) -> Option<Bytes> {
        Some(AggrValue::Long(buf.non_null_cnt).to_le_bytes())
    }

    fn decode(&self, raw: Option<&[u8]>, buf: &mut AggrBuffer) -> Result<(), AggrError> {
        buf.non_null_cnt = match raw {
            Some(raw) => le_i64(raw)?,
            None => 0,
        };
        Ok(())
    }
}

// ── AVG ──────────────────────────────────────────────────────────────

struct AvgKernel;

impl AggrKernel for AvgKernel {
    fn fresh_value(&self) -> AggrValue {
        AggrValue::Double(0.0)
    }

    fn fold(&self, datum: &Datum<'_>, buf: &mut AggrBuffer) -> Result<(), AggrError> {
        let v = match datum {
            Datum::SmallInt(v) => f64::from(*v),
            Datum::Int(v) => f64::from(*v),
            #[allow(clippy::cast_precision_loss)]
            Datum::BigInt(v) => *v as f64,
            Datum::Float(v) => f64::from(*v),
            Datum::Double(v) => *v,
            _ => return Err(AggrError::UnsupportedType(buf.data_type, "AVG")),
        };
        if let AggrValue::Double(acc) = &mut buf.aggr_val {
            *acc += v;
            Ok(())
        } else {
            Err(AggrError::UnsupportedType(buf.data_type, "AVG"))
        }
    }

    fn encode(&self, buf: &AggrBuffer) -> Option<Bytes> {
        let sum = if let AggrValue::Double(acc) = buf.aggr_val {
            acc
        } else {
            0.0
        };
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&sum.to_le_bytes());
        out.extend_from_slice(&buf.non_null_cnt.to_le_bytes());
        Some(Bytes::from(out))
    }

    fn decode(&self, raw: Option<&[u8]>, buf: &mut AggrBuffer) -> Result<(), AggrError> {
        let Some(raw) = raw else {
            buf.aggr_val = self.fresh_value();
            buf.non_null_cnt = 0;
            return Ok(());
        };
        if raw.len() != 16 {
            return Err(truncated("AVG sum+count", raw));
        }
        buf.aggr_val = AggrValue::Double(le_f64(&raw[..8])?);
        buf.non_null_cnt = le_i64(&raw[8..])?;
        Ok(())
    }
}
