//! Value types for the entity data model
//!
//! This module defines:
//! - Value: Unified enum for all payload types a catalog entity can hold
//! - ValueKind: Type tag used by schema definitions to constrain values
//!
//! ## Canonical Value Model
//!
//! The Value enum has exactly 8 variants:
//! - Bool, Int, Decimal, String, Moment, Range, Array, Object
//!
//! ### Type Rules
//!
//! - No implicit type coercions: `Int(1) != Decimal(1)`
//! - Monetary and numeric business data uses `Decimal` (exact arithmetic),
//!   never floating point — this keeps the whole enum totally ordered and
//!   hashable, which representative-tuple indexing relies on
//! - `Object` is the composite form reserved for associated data; attribute
//!   schemas reject it because attributes must stay indexable

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::range::DateTimeRange;

/// Canonical value type for attribute and associated-data payloads
///
/// Different variants are NEVER equal, even if they contain the same
/// "value": `Int(1) != Decimal(1)`.
///
/// The enum derives a total order so values can key deterministic maps
/// (representative tuples in the reference bundle, ordered change sets).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// Exact decimal number (amounts, rates, quantities)
    Decimal(Decimal),
    /// UTF-8 string
    String(String),
    /// Point in time (UTC)
    Moment(DateTime<Utc>),
    /// Date-time validity range
    Range(DateTimeRange),
    /// Array of values
    Array(Vec<Value>),
    /// Composite object with string keys (associated data only)
    Object(BTreeMap<String, Value>),
}

/// Type tag discriminating [`Value`] variants
///
/// Schema definitions constrain values by kind; the check is a plain
/// equality of `value.kind()` against the declared kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// Boolean value
    Bool,
    /// 64-bit signed integer
    Int,
    /// Exact decimal number
    Decimal,
    /// UTF-8 string
    String,
    /// Point in time
    Moment,
    /// Date-time validity range
    Range,
    /// Array of values
    Array,
    /// Composite object
    Object,
}

impl ValueKind {
    /// Get the kind name as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Bool => "Bool",
            ValueKind::Int => "Int",
            ValueKind::Decimal => "Decimal",
            ValueKind::String => "String",
            ValueKind::Moment => "Moment",
            ValueKind::Range => "Range",
            ValueKind::Array => "Array",
            ValueKind::Object => "Object",
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Value {
    /// Get the type tag of this value
    pub const fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Decimal(_) => ValueKind::Decimal,
            Value::String(_) => ValueKind::String,
            Value::Moment(_) => ValueKind::Moment,
            Value::Range(_) => ValueKind::Range,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }

    /// Check if this is a boolean value
    pub const fn is_bool(&self) -> bool {
        matches!(self, Value::Bool(_))
    }

    /// Check if this is an integer value
    pub const fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    /// Check if this is a decimal value
    pub const fn is_decimal(&self) -> bool {
        matches!(self, Value::Decimal(_))
    }

    /// Check if this is a string value
    pub const fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    /// Check if this is a moment value
    pub const fn is_moment(&self) -> bool {
        matches!(self, Value::Moment(_))
    }

    /// Check if this is a range value
    pub const fn is_range(&self) -> bool {
        matches!(self, Value::Range(_))
    }

    /// Check if this is an array value
    pub const fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    /// Check if this is a composite object value
    pub const fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// Get as bool if this is a Bool value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as i64 if this is an Int value
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as Decimal if this is a Decimal value
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    /// Get as &str if this is a String value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as DateTime if this is a Moment value
    pub fn as_moment(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Moment(m) => Some(*m),
            _ => None,
        }
    }

    /// Get as &DateTimeRange if this is a Range value
    pub fn as_range(&self) -> Option<&DateTimeRange> {
        match self {
            Value::Range(r) => Some(r),
            _ => None,
        }
    }

    /// Get as &[Value] if this is an Array value
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Get as &BTreeMap if this is an Object value
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }
}

// ============================================================================
// From implementations for ergonomic API usage
// ============================================================================

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

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Value::Decimal(d)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(m: DateTime<Utc>) -> Self {
        Value::Moment(m)
    }
}

impl From<DateTimeRange> for Value {
    fn from(r: DateTimeRange) -> Self {
        Value::Range(r)
    }
}

impl From<Vec<Value>> for Value {
    fn from(a: Vec<Value>) -> Self {
        Value::Array(a)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(o: BTreeMap<String, Value>) -> Self {
        Value::Object(o)
    }
}
