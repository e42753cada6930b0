//! Runtime value types for attribute values and query parameters.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

/// A runtime attribute value.
///
/// This enum represents all values that can be stored in an entity attribute,
/// attached to a reference edge, or passed as a constraint argument.
///
/// Note: Arrays are typed (e.g., `Int64Array`, `StringArray`) to avoid
/// recursive type issues with rkyv serialization.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 32-bit signed integer.
    Int32(i32),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit floating point.
    Float64(f64),
    /// UTF-8 string.
    String(String),
    /// Binary data.
    Bytes(Vec<u8>),
    /// Timestamp as microseconds since Unix epoch.
    Timestamp(i64),
    /// Array of 64-bit integers.
    Int64Array(Vec<i64>),
    /// Array of strings.
    StringArray(Vec<String>),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if this value is an array type.
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Int64Array(_) | Value::StringArray(_))
    }

    /// Try to get as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(i) | Value::Timestamp(i) => Some(*i),
            Value::Int32(i) => Some(*i as i64),
            _ => None,
        }
    }

    /// Try to get as f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(f) => Some(*f),
            Value::Int32(i) => Some(*i as f64),
            Value::Int64(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get as string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the type name of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Float64(_) => "float64",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
            Value::Int64Array(_) => "int64[]",
            Value::StringArray(_) => "string[]",
        }
    }

    /// Expand the value into its scalar components.
    ///
    /// Array values index every element separately, scalars yield themselves.
    pub fn scalars(&self) -> Vec<Value> {
        match self {
            Value::Int64Array(items) => items.iter().map(|i| Value::Int64(*i)).collect(),
            Value::StringArray(items) => items.iter().cloned().map(Value::String).collect(),
            other => vec![other.clone()],
        }
    }

    /// Rank of the value family, used to order values of unrelated types.
    fn family_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int32(_) | Value::Int64(_) | Value::Float64(_) => 2,
            Value::Timestamp(_) => 3,
            Value::String(_) => 4,
            Value::Bytes(_) => 5,
            Value::Int64Array(_) => 6,
            Value::StringArray(_) => 7,
        }
    }

    /// Total ordering over values.
    ///
    /// Numeric values compare across integer and float representations,
    /// floats use IEEE total ordering. Values of unrelated families are
    /// ordered by family so the result is always defined.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int32(a), Value::Int32(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Int32(a), Value::Int64(b)) => (*a as i64).cmp(b),
            (Value::Int64(a), Value::Int32(b)) => a.cmp(&(*b as i64)),
            (Value::Float64(a), Value::Float64(b)) => a.total_cmp(b),
            (Value::Float64(_), _) | (_, Value::Float64(_))
                if self.family_rank() == 2 && other.family_rank() == 2 =>
            {
                let a = self.as_f64().unwrap_or(f64::NAN);
                let b = other.as_f64().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Int64Array(a), Value::Int64Array(b)) => a.cmp(b),
            (Value::StringArray(a), Value::StringArray(b)) => a.cmp(b),
            _ => self.family_rank().cmp(&other.family_rank()),
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int32(i) => i.hash(state),
            Value::Int64(i) | Value::Timestamp(i) => i.hash(state),
            Value::Float64(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::Int64Array(items) => items.hash(state),
            Value::StringArray(items) => items.hash(state),
        }
    }
}

// Convenient From implementations

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_from() {
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(42i32), Value::Int32(42));
        assert_eq!(Value::from(42i64), Value::Int64(42));
        assert_eq!(Value::from("hello"), Value::String("hello".into()));
        assert_eq!(Value::from(None::<i32>), Value::Null);
    }

    #[test]
    fn test_numeric_cross_type_ordering() {
        assert_eq!(Value::Int32(5).total_cmp(&Value::Int64(5)), Ordering::Equal);
        assert_eq!(Value::Int32(4).total_cmp(&Value::Float64(4.5)), Ordering::Less);
        assert_eq!(Value::Float64(10.0).total_cmp(&Value::Int64(3)), Ordering::Greater);
    }

    #[test]
    fn test_unrelated_families_are_ordered() {
        assert_eq!(Value::Null.total_cmp(&Value::Bool(false)), Ordering::Less);
        assert_eq!(
            Value::String("a".into()).total_cmp(&Value::Int64(1)),
            Ordering::Greater
        );
    }

    #[test]
    fn test_array_scalars() {
        let value = Value::StringArray(vec!["a".into(), "b".into()]);
        assert!(value.is_array());
        assert_eq!(
            value.scalars(),
            vec![Value::String("a".into()), Value::String("b".into())]
        );
        assert_eq!(Value::Int64(1).scalars(), vec![Value::Int64(1)]);
    }
}
