//! Event payload values.
//!
//! [`Value`] is the tagged discriminated union carried by every external
//! event and observation sample. Values are deep-cloneable and
//! deep-comparable, and serialize through serde for trame payloads and
//! project descriptions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A payload carried by an event or returned by an observation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    /// The absence of a value. Storage views skip null samples.
    Null,
    /// A boolean flag.
    Boolean(bool),
    /// A signed 64-bit integer.
    Integer(i64),
    /// A double-precision real.
    Double(f64),
    /// A character string.
    String(String),
    /// A fixed-length sequence of doubles.
    Tuple(Vec<f64>),
    /// An ordered sequence of arbitrary values.
    Set(Vec<Value>),
    /// A string-keyed dictionary of values.
    Map(BTreeMap<String, Value>),
    /// A two-dimensional, row-major matrix of values.
    Table(Table),
}

impl Value {
    /// True when this value is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the boolean payload, if any.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer payload, if any.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the double payload, widening an integer when needed.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Returns the string payload, if any.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the set payload, if any.
    pub fn as_set(&self) -> Option<&[Value]> {
        match self {
            Value::Set(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the map payload, if any.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Returns the table payload, if any.
    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
            Value::Set(items) => {
                write!(f, "{{")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "}}")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{k}={v}")?;
                }
                write!(f, "}}")
            }
            Value::Table(t) => write!(f, "table[{}x{}]", t.columns(), t.rows()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// A row-major matrix of values with fixed dimensions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: usize,
    rows: usize,
    data: Vec<Value>,
}

impl Table {
    /// Creates a table of the given dimensions filled with nulls.
    pub fn new(columns: usize, rows: usize) -> Self {
        Self {
            columns,
            rows,
            data: vec![Value::Null; columns * rows],
        }
    }

    /// Number of columns.
    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Returns the cell at `(column, row)`, or `None` out of bounds.
    pub fn get(&self, column: usize, row: usize) -> Option<&Value> {
        if column < self.columns && row < self.rows {
            self.data.get(row * self.columns + column)
        } else {
            None
        }
    }

    /// Replaces the cell at `(column, row)`. Out-of-bounds writes are
    /// ignored and reported with `false`.
    pub fn set(&mut self, column: usize, row: usize, value: Value) -> bool {
        if column < self.columns && row < self.rows {
            self.data[row * self.columns + column] = value;
            true
        } else {
            false
        }
    }

    /// Appends a row. The row is truncated or null-padded to the width.
    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns, Value::Null);
        self.data.extend(row);
        self.rows += 1;
    }
}
