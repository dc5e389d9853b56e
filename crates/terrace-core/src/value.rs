//! Tagged accumulator value.
//!
//! The active arm is fixed when the aggregator is constructed (by the
//! aggregate column type and function), so fold paths never re-dispatch
//! on the accumulator itself — they match on the incoming datum and
//! mutate the known arm.

use bytes::Bytes;

/// Accumulator value for one bucket.
///
/// Numeric arms hold the running scalar; [`AggrValue::Str`] owns its
/// bytes and reuses the allocation across assignments, so steady-state
/// MIN/MAX over strings does not allocate per update.
#[derive(Debug, Clone, PartialEq)]
pub enum AggrValue {
    /// 16-bit integer accumulator.
    SmallInt(i16),
    /// 32-bit integer accumulator (also dates).
    Int(i32),
    /// 64-bit integer accumulator.
    Long(i64),
    /// 32-bit float accumulator.
    Float(f32),
    /// 64-bit float accumulator.
    Double(f64),
    /// Owned byte-string accumulator.
    Str(Vec<u8>),
}

impl AggrValue {
    /// Little-endian encoding of the scalar, or the raw bytes for the
    /// string arm.
    #[must_use]
    pub fn to_le_bytes(&self) -> Bytes {
        match self {
            Self::SmallInt(v) => Bytes::copy_from_slice(&v.to_le_bytes()),
            Self::Int(v) => Bytes::copy_from_slice(&v.to_le_bytes()),
            Self::Long(v) => Bytes::copy_from_slice(&v.to_le_bytes()),
            Self::Float(v) => Bytes::copy_from_slice(&v.to_le_bytes()),
            Self::Double(v) => Bytes::copy_from_slice(&v.to_le_bytes()),
            Self::Str(v) => Bytes::copy_from_slice(v),
        }
    }
}
