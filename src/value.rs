//! Cell values for table rows.
//!
//! A row is a fixed-length vector of [`Datum`] positioned by schema field
//! order. Datum carries its own manual equality/hash/ordering so rows can key
//! hash maps and sort deterministically: floats compare by bit pattern for
//! identity and by `total_cmp` for ordering, and `Null` sorts before
//! everything else.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// A single cell value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Duration(Duration),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Datum::Null => "null",
            Datum::Bool(_) => "bool",
            Datum::Int(_) => "int",
            Datum::Float(_) => "float",
            Datum::Text(_) => "text",
            Datum::Duration(_) => "duration",
        }
    }

    /// Rank used for cross-type ordering. Null is lowest so nulls sort first.
    fn rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::Int(_) => 2,
            Datum::Float(_) => 3,
            Datum::Text(_) => 4,
            Datum::Duration(_) => 5,
        }
    }

    /// Convert a JSON scalar into a cell value.
    ///
    /// Whole numbers that fit i64 become `Int`, all other numbers `Float`.
    /// Arrays and objects map to `Null` — structure belongs to the mapper
    /// tree, not to a cell.
    pub fn from_json(value: &Value) -> Datum {
        match value {
            Value::Null => Datum::Null,
            Value::Bool(b) => Datum::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Datum::Int(i)
                } else {
                    Datum::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => Datum::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => Datum::Null,
        }
    }

    /// Convert back to JSON for delimited-text output.
    pub fn to_json(&self) -> Value {
        match self {
            Datum::Null => Value::Null,
            Datum::Bool(b) => Value::Bool(*b),
            Datum::Int(i) => Value::Number((*i).into()),
            Datum::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Datum::Text(s) => Value::String(s.clone()),
            Datum::Duration(d) => Value::Number(
                serde_json::Number::from_f64(d.as_secs_f64()).unwrap_or_else(|| 0.into()),
            ),
        }
    }

    /// Fact summation: numeric/duration monoid with `Null` as identity.
    ///
    /// Mixed Int/Float coerces to Float. Any other mix is a fatal error —
    /// a fact column that changes type mid-stream is a mapper bug.
    pub fn sum(&mut self, other: &Datum, column: usize) -> Result<()> {
        match (&mut *self, other) {
            (_, Datum::Null) => {}
            (Datum::Null, rhs) => *self = rhs.clone(),
            (Datum::Int(a), Datum::Int(b)) => *a = a.wrapping_add(*b),
            (Datum::Float(a), Datum::Float(b)) => *a += b,
            (Datum::Int(a), Datum::Float(b)) => *self = Datum::Float(*a as f64 + b),
            (Datum::Float(a), Datum::Int(b)) => *a += *b as f64,
            (Datum::Duration(a), Datum::Duration(b)) => *a = a.saturating_add(*b),
            (lhs, rhs) => {
                return Err(EngineError::FactType {
                    column,
                    left: lhs.type_name(),
                    right: rhs.type_name(),
                })
            }
        }
        Ok(())
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Datum::Null, Datum::Null) => true,
            (Datum::Bool(a), Datum::Bool(b)) => a == b,
            (Datum::Int(a), Datum::Int(b)) => a == b,
            (Datum::Float(a), Datum::Float(b)) => a.to_bits() == b.to_bits(),
            (Datum::Text(a), Datum::Text(b)) => a == b,
            (Datum::Duration(a), Datum::Duration(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Datum {}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Datum::Null => {}
            Datum::Bool(b) => b.hash(state),
            Datum::Int(i) => i.hash(state),
            Datum::Float(f) => f.to_bits().hash(state),
            Datum::Text(s) => s.hash(state),
            Datum::Duration(d) => d.hash(state),
        }
    }
}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Bool(a), Datum::Bool(b)) => a.cmp(b),
            (Datum::Int(a), Datum::Int(b)) => a.cmp(b),
            (Datum::Float(a), Datum::Float(b)) => a.total_cmp(b),
            (Datum::Text(a), Datum::Text(b)) => a.cmp(b),
            (Datum::Duration(a), Datum::Duration(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// A row positioned according to schema field order.
pub type Row = Vec<Datum>;

/// Order-sensitive FNV-1a (32-bit) over a sequence of cell values.
///
/// Used for hash-surrogate keys, so it must be deterministic across runs,
/// workers and partitions — the std randomized hasher cannot serve here.
pub fn fnv1a32<'a, I>(values: I) -> u32
where
    I: IntoIterator<Item = &'a Datum>,
{
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let mut hash = OFFSET;
    let mut eat = |bytes: &[u8]| {
        for b in bytes {
            hash ^= u32::from(*b);
            hash = hash.wrapping_mul(PRIME);
        }
    };

    for value in values {
        eat(&[value.rank()]);
        match value {
            Datum::Null => {}
            Datum::Bool(b) => eat(&[*b as u8]),
            Datum::Int(i) => eat(&i.to_le_bytes()),
            Datum::Float(f) => eat(&f.to_bits().to_le_bytes()),
            Datum::Text(s) => {
                eat(&(s.len() as u32).to_le_bytes());
                eat(s.as_bytes());
            }
            Datum::Duration(d) => {
                eat(&d.as_secs().to_le_bytes());
                eat(&d.subsec_nanos().to_le_bytes());
            }
        }
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sum_int_and_float() {
        let mut a = Datum::Int(3);
        a.sum(&Datum::Int(4), 0).unwrap();
        assert_eq!(a, Datum::Int(7));

        let mut b = Datum::Float(1.5);
        b.sum(&Datum::Int(2), 0).unwrap();
        assert_eq!(b, Datum::Float(3.5));
    }

    #[test]
    fn test_sum_duration() {
        let mut d = Datum::Duration(Duration::from_secs(30));
        d.sum(&Datum::Duration(Duration::from_secs(45)), 0).unwrap();
        assert_eq!(d, Datum::Duration(Duration::from_secs(75)));
    }

    #[test]
    fn test_null_is_identity() {
        let mut a = Datum::Null;
        a.sum(&Datum::Int(5), 0).unwrap();
        assert_eq!(a, Datum::Int(5));

        let mut b = Datum::Int(5);
        b.sum(&Datum::Null, 0).unwrap();
        assert_eq!(b, Datum::Int(5));
    }

    #[test]
    fn test_sum_mismatch_is_fatal() {
        let mut a = Datum::Text("x".into());
        assert!(a.sum(&Datum::Int(1), 2).is_err());
    }

    #[test]
    fn test_null_sorts_first() {
        let mut values = vec![Datum::Int(1), Datum::Null, Datum::Int(-3)];
        values.sort();
        assert_eq!(values[0], Datum::Null);
        assert_eq!(values[1], Datum::Int(-3));
    }

    #[test]
    fn test_float_identity_by_bits() {
        assert_eq!(Datum::Float(1.0), Datum::Float(1.0));
        assert_ne!(Datum::Float(0.0), Datum::Float(-0.0));
    }

    #[test]
    fn test_from_json() {
        assert_eq!(Datum::from_json(&json!(42)), Datum::Int(42));
        assert_eq!(Datum::from_json(&json!(2.5)), Datum::Float(2.5));
        assert_eq!(Datum::from_json(&json!("hi")), Datum::Text("hi".into()));
        assert_eq!(Datum::from_json(&json!({"a": 1})), Datum::Null);
    }

    #[test]
    fn test_fnv_is_order_sensitive() {
        let a = [Datum::Int(1), Datum::Int(2)];
        let b = [Datum::Int(2), Datum::Int(1)];
        assert_ne!(fnv1a32(a.iter()), fnv1a32(b.iter()));
        assert_eq!(fnv1a32(a.iter()), fnv1a32(a.iter()));
    }
}
