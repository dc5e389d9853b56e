//! Packed positional row codec.
//!
//! Rows are encoded against a [`Schema`] into a compact little-endian
//! layout:
//!
//! ```text
//! | version u8 | total_size u32 | null bitmap | fixed slots | var section |
//! ```
//!
//! Fixed-width columns occupy native-width slots in column order. `String`
//! columns occupy an 8-byte `(offset, len)` slot pointing into the var
//! section; the payload is raw bytes (not necessarily UTF-8 — aggregate
//! rows store binary scalar encodings in string columns). NULL columns
//! have their bitmap bit set and a zeroed slot.
//!
//! Endianness is explicitly little-endian so encoded rows are portable
//! across hosts.

use bytes::Bytes;

use crate::schema::{DataType, Schema};

/// Codec format version written into byte 0 of every row.
const ROW_VERSION: u8 = 1;

/// Header length before the null bitmap: version byte + u32 size.
const HEADER_LEN: usize = 5;

/// Errors from row encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Column index beyond the schema.
    #[error("column {0} out of range")]
    ColumnOutOfRange(usize),

    /// Accessor or append type does not match the schema.
    #[error("column {idx} type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch {
        /// Column index.
        idx: usize,
        /// Type declared by the schema.
        expected: DataType,
        /// Type requested by the caller.
        found: DataType,
    },

    /// NULL appended to a non-nullable column.
    #[error("null value for non-nullable column {0}")]
    NullViolation(usize),

    /// Row bytes are truncated or internally inconsistent.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// `finish` called before every column was appended.
    #[error("row incomplete: {appended} of {expected} columns appended")]
    Incomplete {
        /// Columns appended so far.
        appended: usize,
        /// Columns the schema requires.
        expected: usize,
    },
}

/// A typed view of one column value, borrowed from an encoded row.
///
/// The borrow lives only as long as the underlying row bytes; callers
/// fold the value and drop the view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Datum<'a> {
    /// 16-bit integer.
    SmallInt(i16),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    BigInt(i64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// Date as `i32` days.
    Date(i32),
    /// Timestamp as `i64` milliseconds.
    Timestamp(i64),
    /// Raw string bytes.
    Str(&'a [u8]),
}

fn bitmap_len(columns: usize) -> usize {
    columns.div_ceil(8)
}

/// Incremental row encoder. Columns must be appended in schema order;
/// [`RowBuilder::finish`] assembles the final buffer.
pub struct RowBuilder<'a> {
    schema: &'a Schema,
    next_col: usize,
    null_bits: Vec<u8>,
    fixed: Vec<u8>,
    var: Vec<u8>,
    // (position of the string slot inside `fixed`, offset into `var`, len)
    str_slots: Vec<(usize, u32, u32)>,
}

impl<'a> RowBuilder<'a> {
    /// Starts a new row for `schema`.
    #[must_use]
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            next_col: 0,
            null_bits: vec![0u8; bitmap_len(schema.len())],
            fixed: Vec::with_capacity(schema.len() * 8),
            var: Vec::new(),
            str_slots: Vec::new(),
        }
    }

    fn expect(&self, found: DataType) -> Result<(), CodecError> {
        let col = self
            .schema
            .column(self.next_col)
            .ok_or(CodecError::ColumnOutOfRange(self.next_col))?;
        if col.data_type == found {
            Ok(())
        } else {
            Err(CodecError::TypeMismatch {
                idx: self.next_col,
                expected: col.data_type,
                found,
            })
        }
    }

    fn push_slot(&mut self, raw: &[u8]) {
        self.fixed.extend_from_slice(raw);
        self.next_col += 1;
    }

    /// Appends a 16-bit integer.
    ///
    /// # Errors
    ///
    /// Fails when the next column's schema type differs.
    pub fn append_small_int(&mut self, v: i16) -> Result<(), CodecError> {
        self.expect(DataType::SmallInt)?;
        self.push_slot(&v.to_le_bytes());
        Ok(())
    }

    /// Appends a 32-bit integer.
    ///
    /// # Errors
    ///
    /// Fails when the next column's schema type differs.
    pub fn append_int(&mut self, v: i32) -> Result<(), CodecError> {
        self.expect(DataType::Int)?;
        self.push_slot(&v.to_le_bytes());
        Ok(())
    }

    /// Appends a 64-bit integer.
    ///
    /// # Errors
    ///
    /// Fails when the next column's schema type differs.
    pub fn append_big_int(&mut self, v: i64) -> Result<(), CodecError> {
        self.expect(DataType::BigInt)?;
        self.push_slot(&v.to_le_bytes());
        Ok(())
    }

    /// Appends a 32-bit float.
    ///
    /// # Errors
    ///
    /// Fails when the next column's schema type differs.
    pub fn append_float(&mut self, v: f32) -> Result<(), CodecError> {
        self.expect(DataType::Float)?;
        self.push_slot(&v.to_le_bytes());
        Ok(())
    }

    /// Appends a 64-bit float.
    ///
    /// # Errors
    ///
    /// Fails when the next column's schema type differs.
    pub fn append_double(&mut self, v: f64) -> Result<(), CodecError> {
        self.expect(DataType::Double)?;
        self.push_slot(&v.to_le_bytes());
        Ok(())
    }

    /// Appends a date (`i32` days).
    ///
    /// # Errors
    ///
    /// Fails when the next column's schema type differs.
    pub fn append_date(&mut self, v: i32) -> Result<(), CodecError> {
        self.expect(DataType::Date)?;
        self.push_slot(&v.to_le_bytes());
        Ok(())
    }

    /// Appends a timestamp (`i64` milliseconds).
    ///
    /// # Errors
    ///
    /// Fails when the next column's schema type differs.
    pub fn append_timestamp(&mut self, v: i64) -> Result<(), CodecError> {
        self.expect(DataType::Timestamp)?;
        self.push_slot(&v.to_le_bytes());
        Ok(())
    }

    /// Appends raw string bytes.
    ///
    /// # Errors
    ///
    /// Fails when the next column's schema type differs.
    pub fn append_string(&mut self, v: &[u8]) -> Result<(), CodecError> {
        self.expect(DataType::String)?;
        let var_off = u32::try_from(self.var.len())
            .map_err(|_| CodecError::Corrupt("var section exceeds u32".into()))?;
        let len = u32::try_from(v.len())
            .map_err(|_| CodecError::Corrupt("string exceeds u32".into()))?;
        self.var.extend_from_slice(v);
        self.str_slots.push((self.fixed.len(), var_off, len));
        self.push_slot(&[0u8; 8]);
        Ok(())
    }

    /// Appends NULL for the next column.
    ///
    /// # Errors
    ///
    /// Fails when the next column is non-nullable.
    pub fn append_null(&mut self) -> Result<(), CodecError> {
        let col = self
            .schema
            .column(self.next_col)
            .ok_or(CodecError::ColumnOutOfRange(self.next_col))?;
        if !col.nullable {
            return Err(CodecError::NullViolation(self.next_col));
        }
        self.null_bits[self.next_col / 8] |= 1 << (self.next_col % 8);
        let width = col.data_type.slot_width();
        let slot = [0u8; 8];
        self.push_slot(&slot[..width]);
        Ok(())
    }

    /// Assembles the encoded row.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Incomplete`] if not every column was appended.
    pub fn finish(mut self) -> Result<Bytes, CodecError> {
        if self.next_col != self.schema.len() {
            return Err(CodecError::Incomplete {
                appended: self.next_col,
                expected: self.schema.len(),
            });
        }
        let var_base = HEADER_LEN + self.null_bits.len() + self.fixed.len();
        for (slot_pos, var_off, len) in &self.str_slots {
            let abs = u32::try_from(var_base).map_err(|_| {
                CodecError::Corrupt("row exceeds u32".into())
            })? + var_off;
            self.fixed[*slot_pos..slot_pos + 4].copy_from_slice(&abs.to_le_bytes());
            self.fixed[slot_pos + 4..slot_pos + 8].copy_from_slice(&len.to_le_bytes());
        }
        let total = var_base + self.var.len();
        let total32 = u32::try_from(total)
            .map_err(|_| CodecError::Corrupt("row exceeds u32".into()))?;
        let mut out = Vec::with_capacity(total);
        out.push(ROW_VERSION);
        out.extend_from_slice(&total32.to_le_bytes());
        out.extend_from_slice(&self.null_bits);
        out.extend_from_slice(&self.fixed);
        out.extend_from_slice(&self.var);
        Ok(Bytes::from(out))
    }
}

/// Zero-copy decoder over an encoded row.
pub struct RowView<'a> {
    schema: &'a Schema,
    data: &'a [u8],
    bitmap_start: usize,
    fixed_start: usize,
}

impl<'a> RowView<'a> {
    /// Wraps `data`, validating the header against `schema`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Corrupt`] on version or length mismatch.
    pub fn new(schema: &'a Schema, data: &'a [u8]) -> Result<Self, CodecError> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::Corrupt("row shorter than header".into()));
        }
        if data[0] != ROW_VERSION {
            return Err(CodecError::Corrupt(format!(
                "unknown row version {}",
                data[0]
            )));
        }
        let mut size = [0u8; 4];
        size.copy_from_slice(&data[1..5]);
        let declared = u32::from_le_bytes(size) as usize;
        if declared != data.len() {
            return Err(CodecError::Corrupt(format!(
                "declared size {declared} != actual {}",
                data.len()
            )));
        }
        let bitmap_start = HEADER_LEN;
        let fixed_start = bitmap_start + bitmap_len(schema.len());
        let fixed_len: usize = schema.columns().map(|c| c.data_type.slot_width()).sum();
        if fixed_start + fixed_len > data.len() {
            return Err(CodecError::Corrupt("fixed region truncated".into()));
        }
        Ok(Self {
            schema,
            data,
            bitmap_start,
            fixed_start,
        })
    }

    fn check(&self, idx: usize, found: DataType) -> Result<(), CodecError> {
        let col = self
            .schema
            .column(idx)
            .ok_or(CodecError::ColumnOutOfRange(idx))?;
        if col.data_type == found {
            Ok(())
        } else {
            Err(CodecError::TypeMismatch {
                idx,
                expected: col.data_type,
                found,
            })
        }
    }

    /// Whether column `idx` is NULL.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ColumnOutOfRange`] for a bad index.
    pub fn is_null(&self, idx: usize) -> Result<bool, CodecError> {
        if idx >= self.schema.len() {
            return Err(CodecError::ColumnOutOfRange(idx));
        }
        Ok(self.data[self.bitmap_start + idx / 8] & (1 << (idx % 8)) != 0)
    }

    fn slot(&self, idx: usize) -> &[u8] {
        let off: usize = self
            .schema
            .columns()
            .take(idx)
            .map(|c| c.data_type.slot_width())
            .sum();
        let width = self
            .schema
            .column(idx)
            .map(|c| c.data_type.slot_width())
            .unwrap_or(0);
        &self.data[self.fixed_start + off..self.fixed_start + off + width]
    }

    fn fixed_le<const N: usize>(&self, idx: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slot(idx));
        out
    }

    /// Reads a 16-bit integer column.
    ///
    /// # Errors
    ///
    /// Type mismatch or bad index.
    pub fn get_small_int(&self, idx: usize) -> Result<Option<i16>, CodecError> {
        self.check(idx, DataType::SmallInt)?;
        if self.is_null(idx)? {
            return Ok(None);
        }
        Ok(Some(i16::from_le_bytes(self.fixed_le::<2>(idx))))
    }

    /// Reads a 32-bit integer column.
    ///
    /// # Errors
    ///
    /// Type mismatch or bad index.
    pub fn get_int(&self, idx: usize) -> Result<Option<i32>, CodecError> {
        self.check(idx, DataType::Int)?;
        if self.is_null(idx)? {
            return Ok(None);
        }
        Ok(Some(i32::from_le_bytes(self.fixed_le::<4>(idx))))
    }

    /// Reads a 64-bit integer column.
    ///
    /// # Errors
    ///
    /// Type mismatch or bad index.
    pub fn get_big_int(&self, idx: usize) -> Result<Option<i64>, CodecError> {
        self.check(idx, DataType::BigInt)?;
        if self.is_null(idx)? {
            return Ok(None);
        }
        Ok(Some(i64::from_le_bytes(self.fixed_le::<8>(idx))))
    }

    /// Reads a timestamp column as `i64` milliseconds.
    ///
    /// # Errors
    ///
    /// Type mismatch or bad index.
    pub fn get_timestamp(&self, idx: usize) -> Result<Option<i64>, CodecError> {
        self.check(idx, DataType::Timestamp)?;
        if self.is_null(idx)? {
            return Ok(None);
        }
        Ok(Some(i64::from_le_bytes(self.fixed_le::<8>(idx))))
    }

    /// Reads a string column as raw bytes.
    ///
    /// # Errors
    ///
    /// Type mismatch, bad index, or out-of-bounds var slot.
    pub fn get_string(&self, idx: usize) -> Result<Option<&'a [u8]>, CodecError> {
        self.check(idx, DataType::String)?;
        if self.is_null(idx)? {
            return Ok(None);
        }
        let slot = self.fixed_le::<8>(idx);
        let mut off = [0u8; 4];
        let mut len = [0u8; 4];
        off.copy_from_slice(&slot[..4]);
        len.copy_from_slice(&slot[4..]);
        let off = u32::from_le_bytes(off) as usize;
        let len = u32::from_le_bytes(len) as usize;
        if off + len > self.data.len() {
            return Err(CodecError::Corrupt(format!(
                "string slot ({off}, {len}) beyond row of {}",
                self.data.len()
            )));
        }
        Ok(Some(&self.data[off..off + len]))
    }

    /// Reads any column as a typed [`Datum`].
    ///
    /// # Errors
    ///
    /// Bad index or corrupt var slot.
    pub fn get_datum(&self, idx: usize) -> Result<Option<Datum<'a>>, CodecError> {
        let col = self
            .schema
            .column(idx)
            .ok_or(CodecError::ColumnOutOfRange(idx))?;
        if self.is_null(idx)? {
            return Ok(None);
        }
        let datum = match col.data_type {
            DataType::SmallInt => Datum::SmallInt(i16::from_le_bytes(self.fixed_le::<2>(idx))),
            DataType::Int => Datum::Int(i32::from_le_bytes(self.fixed_le::<4>(idx))),
            DataType::BigInt => Datum::BigInt(i64::from_le_bytes(self.fixed_le::<8>(idx))),
            DataType::Float => Datum::Float(f32::from_le_bytes(self.fixed_le::<4>(idx))),
            DataType::Double => Datum::Double(f64::from_le_bytes(self.fixed_le::<8>(idx))),
            DataType::Date => Datum::Date(i32::from_le_bytes(self.fixed_le::<4>(idx))),
            DataType::Timestamp => {
                Datum::Timestamp(i64::from_le_bytes(self.fixed_le::<8>(idx)))
            }
            DataType::String => {
                let Some(bytes) = self.get_string(idx)? else {
                    return Ok(None);
                };
                Datum::Str(bytes)
            }
        };
        Ok(Some(datum))
    }

    /// Reads a `BigInt` or `Timestamp` column as `i64`.
    ///
    /// # Errors
    ///
    /// Type mismatch for any other column type.
    pub fn get_i64_key(&self, idx: usize) -> Result<Option<i64>, CodecError> {
        let col = self
            .schema
            .column(idx)
            .ok_or(CodecError::ColumnOutOfRange(idx))?;
        match col.data_type {
            DataType::BigInt => self.get_big_int(idx),
            DataType::Timestamp => self.get_timestamp(idx),
            other => Err(CodecError::TypeMismatch {
                idx,
                expected: DataType::Timestamp,
                found: other,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDesc;

    fn test_schema() -> Schema {
        Schema::new(vec![
            ColumnDesc::new("id", DataType::String),
            ColumnDesc::new("ts", DataType::Timestamp),
            ColumnDesc::new("small", DataType::SmallInt),
            ColumnDesc::new("int", DataType::Int),
            ColumnDesc::new("big", DataType::BigInt),
            ColumnDesc::new("f", DataType::Float),
            ColumnDesc::new("d", DataType::Double),
            ColumnDesc::new("day", DataType::Date),
            ColumnDesc::nullable("opt", DataType::Int),
            ColumnDesc::nullable("tail", DataType::String),
        ])
    }

    fn build_full(schema: &Schema) -> Bytes {
        let mut b = RowBuilder::new(schema);
        b.append_string(b"key-1").unwrap();
        b.append_timestamp(1_700_000_000_000).unwrap();
        b.append_small_int(-3).unwrap();
        b.append_int(42).unwrap();
        b.append_big_int(1 << 40).unwrap();
        b.append_float(1.5).unwrap();
        b.append_double(-2.25).unwrap();
        b.append_date(19_700).unwrap();
        b.append_null().unwrap();
        b.append_string(b"").unwrap();
        b.finish().unwrap()
    }

    #[test]
    fn test_round_trip_all_types() {
        let schema = test_schema();
        let row = build_full(&schema);
        let view = RowView::new(&schema, &row).unwrap();
        assert_eq!(view.get_string(0).unwrap(), Some(&b"key-1"[..]));
        assert_eq!(view.get_timestamp(1).unwrap(), Some(1_700_000_000_000));
        assert_eq!(view.get_small_int(2).unwrap(), Some(-3));
        assert_eq!(view.get_int(3).unwrap(), Some(42));
        assert_eq!(view.get_big_int(4).unwrap(), Some(1 << 40));
        assert_eq!(view.get_datum(5).unwrap(), Some(Datum::Float(1.5)));
        assert_eq!(view.get_datum(6).unwrap(), Some(Datum::Double(-2.25)));
        assert_eq!(view.get_datum(7).unwrap(), Some(Datum::Date(19_700)));
        assert_eq!(view.get_int(8).unwrap(), None);
        assert!(view.is_null(8).unwrap());
        assert_eq!(view.get_string(9).unwrap(), Some(&b""[..]));
    }

    #[test]
    fn test_non_utf8_string_payload() {
        let schema = Schema::new(vec![ColumnDesc::new("blob", DataType::String)]);
        let raw = [0x00u8, 0xFF, 0x80, 0x01];
        let mut b = RowBuilder::new(&schema);
        b.append_string(&raw).unwrap();
        let row = b.finish().unwrap();
        let view = RowView::new(&schema, &row).unwrap();
        assert_eq!(view.get_string(0).unwrap(), Some(&raw[..]));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let schema = test_schema();
        let mut b = RowBuilder::new(&schema);
        let err = b.append_int(1).unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { idx: 0, .. }));
    }

    #[test]
    fn test_null_violation() {
        let schema = test_schema();
        let mut b = RowBuilder::new(&schema);
        assert!(matches!(b.append_null(), Err(CodecError::NullViolation(0))));
    }

    #[test]
    fn test_incomplete_row() {
        let schema = test_schema();
        let mut b = RowBuilder::new(&schema);
        b.append_string(b"k").unwrap();
        assert!(matches!(
            b.finish(),
            Err(CodecError::Incomplete {
                appended: 1,
                expected: 10
            })
        ));
    }

    #[test]
    fn test_corrupt_rows_rejected() {
        let schema = test_schema();
        let row = build_full(&schema);

        // Truncated
        assert!(RowView::new(&schema, &row[..row.len() - 1]).is_err());
        // Bad version
        let mut bad = row.to_vec();
        bad[0] = 9;
        assert!(RowView::new(&schema, &bad).is_err());
        // Size mismatch
        let mut bad = row.to_vec();
        bad[1] = bad[1].wrapping_add(1);
        assert!(RowView::new(&schema, &bad).is_err());
    }
}
