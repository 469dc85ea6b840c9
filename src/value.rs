//! A small, driver-agnostic value type used to represent prepared-statement
//! arguments. `sqlpool` only needs these values for two things: hashing them
//! as part of a [`crate::cache::StatementKey`] and, when
//! `include_query_parameters` is enabled, rendering them into log events —
//! it never interprets or binds them itself, that's the embedding driver's
//! job.

use std::hash::{Hash, Hasher};

use derive_more::{Display, From};

/// A single bound parameter value.
#[derive(Clone, Debug, Display, From)]
pub enum Value {
    #[display("NULL")]
    Null,
    #[display("{_0}")]
    #[from]
    Bool(bool),
    #[display("{_0}")]
    #[from]
    I64(i64),
    #[display("{_0}")]
    F64(f64),
    #[display("{_0:?}")]
    #[from]
    Text(String),
    #[display("<{} bytes>", _0.len())]
    Bytes(Vec<u8>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            // Bit-pattern equality rather than IEEE-754 equality: two calls
            // with the same argument bytes must hit the same cache entry,
            // even when that argument happens to be NaN.
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            _ => false,
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
            Value::I64(i) => i.hash(state),
            Value::F64(f) => f.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_is_equal_to_itself_by_bit_pattern() {
        let a = Value::F64(f64::NAN);
        let b = Value::F64(f64::NAN);
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_variants_are_unequal() {
        assert_ne!(Value::Null, Value::Bool(false));
    }
}
