//! Row ↔ entity mapping.
//!
//! Every persisted entity lists its columns once in `FIELDS` (id first) and
//! converts to and from a row of raw sqlite values in that order.

use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;

use crate::error::StoreError;


pub trait Record: Sized {
    const TABLE: &'static str;
    /// Column names in row order. The first column is always `id`.
    const FIELDS: &'static [&'static str];

    fn id(&self) -> i64;
    fn from_values(values: &[Value]) -> Result<Self, StoreError>;
    fn to_values(&self) -> Vec<Value>;
}


/// Positional reader over one row, producing typed errors that name the
/// offending column.
pub struct RowReader<'a> {
    table: &'static str,
    fields: &'static [&'static str],
    values: &'a [Value],
}


impl<'a> RowReader<'a> {
    pub fn new<R: Record>(values: &'a [Value]) -> Result<RowReader<'a>, StoreError> {
        if values.len() != R::FIELDS.len() {
            return Err(StoreError::RowShape {
                table: R::TABLE,
                expected: R::FIELDS.len(),
                got: values.len(),
            });
        }
        Ok(RowReader {
            table: R::TABLE,
            fields: R::FIELDS,
            values,
        })
    }

    fn invalid(&self, i: usize, message: String) -> StoreError {
        StoreError::InvalidValue {
            table: self.table,
            field: self.fields[i],
            message,
        }
    }

    pub fn opt_int(&self, i: usize) -> Result<Option<i64>, StoreError> {
        match &self.values[i] {
            Value::Null => Ok(None),
            Value::Integer(v) => Ok(Some(*v)),
            other => Err(self.invalid(i, format!("expected integer, got {:?}", other))),
        }
    }

    pub fn int(&self, i: usize) -> Result<i64, StoreError> {
        self.opt_int(i)?
            .ok_or_else(|| self.invalid(i, "unexpected NULL".into()))
    }

    pub fn flag(&self, i: usize) -> Result<bool, StoreError> {
        Ok(self.opt_int(i)?.unwrap_or(0) != 0)
    }

    pub fn opt_text(&self, i: usize) -> Result<Option<String>, StoreError> {
        match &self.values[i] {
            Value::Null => Ok(None),
            Value::Text(s) => Ok(Some(s.clone())),
            other => Err(self.invalid(i, format!("expected text, got {:?}", other))),
        }
    }

    pub fn text(&self, i: usize) -> Result<String, StoreError> {
        Ok(self.opt_text(i)?.unwrap_or_default())
    }

    pub fn opt_time(&self, i: usize) -> Result<Option<DateTime<Utc>>, StoreError> {
        match self.opt_text(i)? {
            None => Ok(None),
            Some(s) => DateTime::parse_from_rfc3339(&s)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| self.invalid(i, format!("bad timestamp '{}': {}", s, e))),
        }
    }

    pub fn time(&self, i: usize) -> Result<DateTime<Utc>, StoreError> {
        self.opt_time(i)?
            .ok_or_else(|| self.invalid(i, "unexpected NULL".into()))
    }

    /// Text column parsed through `FromStr`.
    pub fn parsed<T>(&self, i: usize) -> Result<T, StoreError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.text(i)?;
        raw.parse::<T>()
            .map_err(|e| self.invalid(i, e.to_string()))
    }

    /// Integer column converted through `TryFrom<i64>`.
    pub fn coded<T>(&self, i: usize) -> Result<T, StoreError>
    where
        T: TryFrom<i64>,
        T::Error: Display,
    {
        let raw = self.int(i)?;
        T::try_from(raw).map_err(|e| self.invalid(i, e.to_string()))
    }
}


// ---------------------------------------------------------------------------
// Value constructors
// ---------------------------------------------------------------------------

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

pub fn flag(b: bool) -> Value {
    Value::Integer(b as i64)
}

pub fn opt_int(v: Option<i64>) -> Value {
    v.map_or(Value::Null, Value::Integer)
}

pub fn opt_text(v: Option<&str>) -> Value {
    v.map_or(Value::Null, text)
}

pub fn time(t: &DateTime<Utc>) -> Value {
    Value::Text(t.to_rfc3339())
}

pub fn opt_time(t: Option<&DateTime<Utc>>) -> Value {
    t.map_or(Value::Null, time)
}
