// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dynamically typed cell values.
//!
//! Tables are copied without compile-time knowledge of their schema, so a row
//! is just a `Vec<SqlValue>` in column order.

use sqlx::any::{Any, AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Row, ValueRef};

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// One row, values in the same order as the column list it was read with.
pub type SqlRow = Vec<SqlValue>;

impl SqlValue {
    /// Decode column `idx`, trying the portable Any types in turn.
    pub fn decode(row: &AnyRow, idx: usize) -> Result<Self, sqlx::Error> {
        if row.try_get_raw(idx)?.is_null() {
            return Ok(Self::Null);
        }
        if let Ok(v) = row.try_get::<bool, _>(idx) {
            return Ok(Self::Bool(v));
        }
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Ok(Self::Int(v));
        }
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Ok(Self::Float(v));
        }
        if let Ok(v) = row.try_get::<String, _>(idx) {
            return Ok(Self::Text(v));
        }
        if let Ok(v) = row.try_get::<Vec<u8>, _>(idx) {
            return Ok(Self::Bytes(v));
        }
        Err(sqlx::Error::ColumnDecode {
            index: idx.to_string(),
            source: "value type not supported by the Any driver".into(),
        })
    }

    /// Decode every column of `row`.
    pub fn decode_row(row: &AnyRow) -> Result<SqlRow, sqlx::Error> {
        (0..row.len()).map(|idx| Self::decode(row, idx)).collect()
    }

    /// Bind this value as the next query parameter.
    pub(crate) fn bind_to<'q>(
        &self,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> Query<'q, Any, AnyArguments<'q>> {
        match self {
            Self::Null => query.bind(None::<String>),
            Self::Bool(v) => query.bind(*v),
            Self::Int(v) => query.bind(*v),
            Self::Float(v) => query.bind(*v),
            Self::Text(v) => query.bind(v.clone()),
            Self::Bytes(v) => query.bind(v.clone()),
        }
    }

    /// Integer view, parsing text (PostgreSQL reads everything as text).
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// String form used to compare business keys across databases.
    #[must_use]
    pub fn key_string(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(v) => Some(v.to_string()),
            Self::Int(v) => Some(v.to_string()),
            Self::Float(v) => Some(v.to_string()),
            Self::Text(v) => Some(v.clone()),
            Self::Bytes(v) => Some(String::from_utf8_lossy(v).into_owned()),
        }
    }

    /// Replace an integer key, keeping the representation it was read in.
    #[must_use]
    pub fn with_i64(&self, value: i64) -> Self {
        match self {
            Self::Text(_) => Self::Text(value.to_string()),
            _ => Self::Int(value),
        }
    }
}
