//! Window definition and the bucket classifier.
//!
//! A window is either *time-ranged* (fixed span of milliseconds) or
//! *row-count* (fixed number of rows). The classifier maps an incoming
//! row's timestamp plus the live bucket state to one of three actions;
//! bucket anchoring (`ts_begin == -1`) is handled by the bucket manager
//! before classification.

use crate::buffer::AggrBuffer;
use crate::error::AggrError;

/// Parsed window definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDef {
    /// Time-ranged window spanning this many milliseconds.
    RowsRange(i64),
    /// Row-count window holding this many rows.
    RowsNum(i64),
}

impl WindowDef {
    /// Parses a bucket-size spec.
    ///
    /// An all-digit string is a row-count window; a digit string followed
    /// by one of `s`/`m`/`h`/`d` (case-insensitive) is a time-ranged
    /// window of that many seconds/minutes/hours/days.
    ///
    /// # Errors
    ///
    /// Returns [`AggrError::Config`] for anything else.
    pub fn parse(bucket_size: &str) -> Result<Self, AggrError> {
        let spec = bucket_size.trim();
        if spec.is_empty() {
            return Err(AggrError::Config("bucket size is empty".into()));
        }
        if spec.bytes().all(|b| b.is_ascii_digit()) {
            let rows: i64 = spec
                .parse()
                .map_err(|_| AggrError::Config(format!("bucket size overflows: {spec}")))?;
            if rows == 0 {
                return Err(AggrError::Config("bucket size must be positive".into()));
            }
            return Ok(Self::RowsNum(rows));
        }
        let mut chars = spec.chars();
        let Some(unit) = chars.next_back() else {
            return Err(AggrError::Config("bucket size is empty".into()));
        };
        let digits = chars.as_str();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AggrError::Config(format!(
                "bucket size is not a number: {spec}"
            )));
        }
        let n: i64 = digits
            .parse()
            .map_err(|_| AggrError::Config(format!("bucket size overflows: {spec}")))?;
        if n == 0 {
            return Err(AggrError::Config("bucket size must be positive".into()));
        }
        let unit_ms = match unit.to_ascii_lowercase() {
            's' => 1_000,
            'm' => 60_000,
            'h' => 3_600_000,
            'd' => 86_400_000,
            _ => {
                return Err(AggrError::Config(format!(
                    "unsupported time unit in bucket size: {spec}"
                )))
            }
        };
        Ok(Self::RowsRange(n * unit_ms))
    }

    /// Window size: milliseconds for time-ranged, rows for row-count.
    #[must_use]
    pub fn size(&self) -> i64 {
        match self {
            Self::RowsRange(ms) => *ms,
            Self::RowsNum(rows) => *rows,
        }
    }

    /// Whether the window is time-ranged.
    #[must_use]
    pub fn is_time_ranged(&self) -> bool {
        matches!(self, Self::RowsRange(_))
    }
}

/// Classifier outcome for one incoming row against a live bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAction {
    /// The row folds into the live bucket.
    InBucket,
    /// The live bucket is full; flush it and fold into its successor.
    Rollover,
    /// The row precedes the live bucket; route to the late-arrival path.
    Late,
}

/// Classifies `cur_ts` against an initialised bucket.
///
/// Rollover fires for a time-ranged window when the row passes `ts_end`,
/// or for a row-count window when folding one more row would exceed the
/// size. A row before `ts_begin` is late; late takes precedence.
#[must_use]
pub fn classify(def: WindowDef, buf: &AggrBuffer, cur_ts: i64) -> WindowAction {
    if cur_ts < buf.ts_begin {
        return WindowAction::Late;
    }
    let full = match def {
        WindowDef::RowsRange(_) => cur_ts > buf.ts_end,
        WindowDef::RowsNum(rows) => i64::from(buf.aggr_cnt) + 1 > rows,
    };
    if full {
        WindowAction::Rollover
    } else {
        WindowAction::InBucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::AggrValue;
    use terrace_storage::DataType;

    #[test]
    fn test_parse_row_count() {
        assert_eq!(WindowDef::parse("100").unwrap(), WindowDef::RowsNum(100));
        assert_eq!(WindowDef::parse(" 2 ").unwrap(), WindowDef::RowsNum(2));
    }

    #[test]
    fn test_parse_time_units() {
        assert_eq!(WindowDef::parse("1s").unwrap(), WindowDef::RowsRange(1_000));
        assert_eq!(WindowDef::parse("1s").unwrap().size(), 1_000);
        assert!(WindowDef::parse("1s").unwrap().is_time_ranged());
        assert!(!WindowDef::parse("5").unwrap().is_time_ranged());
        assert_eq!(
            WindowDef::parse("5M").unwrap(),
            WindowDef::RowsRange(300_000)
        );
        assert_eq!(
            WindowDef::parse("2h").unwrap(),
            WindowDef::RowsRange(7_200_000)
        );
        assert_eq!(
            WindowDef::parse("1D").unwrap(),
            WindowDef::RowsRange(86_400_000)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "s", "12w", "1.5s", "-3", "abc", "1 0s"] {
            assert!(WindowDef::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    fn bucket(ts_begin: i64, ts_end: i64, cnt: i32) -> AggrBuffer {
        let mut buf = AggrBuffer::new(DataType::BigInt, 0, AggrValue::Long(0));
        buf.ts_begin = ts_begin;
        buf.ts_end = ts_end;
        buf.aggr_cnt = cnt;
        buf
    }

    #[test]
    fn test_classify_time_ranged() {
        let def = WindowDef::RowsRange(1_000);
        let buf = bucket(1_000, 1_999, 1);
        assert_eq!(classify(def, &buf, 1_500), WindowAction::InBucket);
        assert_eq!(classify(def, &buf, 1_999), WindowAction::InBucket);
        assert_eq!(classify(def, &buf, 2_000), WindowAction::Rollover);
        assert_eq!(classify(def, &buf, 999), WindowAction::Late);
    }

    #[test]
    fn test_classify_row_count() {
        let def = WindowDef::RowsNum(2);
        assert_eq!(
            classify(def, &bucket(100, 200, 1), 300),
            WindowAction::InBucket
        );
        assert_eq!(
            classify(def, &bucket(100, 200, 2), 300),
            WindowAction::Rollover
        );
        // Late wins over a full bucket.
        assert_eq!(classify(def, &bucket(100, 200, 2), 50), WindowAction::Late);
    }
}
