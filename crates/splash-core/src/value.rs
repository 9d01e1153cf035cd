//! The polymorphic value carried by attributes and tree leaves.

use std::fmt;

/// Convenience alias for an argument list, the payload of every attribute
/// message.
pub type Values = Vec<Value>;

/// Discriminant tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Boolean,
    Integer,
    Real,
    String,
    Values,
    Tuple,
}

impl ValueKind {
    /// Single-character code used in attribute signatures.
    pub fn type_code(self) -> TypeCode {
        match self {
            Self::Boolean => b'b',
            Self::Integer => b'i',
            Self::Real => b'r',
            Self::String => b's',
            Self::Values => b'v',
            Self::Tuple => b't',
        }
    }
}

/// Per-position argument type code, as declared by attribute signatures.
pub type TypeCode = u8;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Data {
    Boolean(bool),
    Integer(i64),
    Real(f64),
    String(String),
    Values(Vec<Value>),
    /// A list whose elements carry leaf names, used to map onto tree nodes.
    Tuple(Vec<Value>),
}

/// A typed scalar or list, optionally named.
///
/// The name is only meaningful when the value is serialized into a tree
/// node; two values with the same content but different names do not compare
/// equal.
///
/// Numeric and string coercions are total: `as_int` on a string parses it
/// and falls back to 0, `as_string` on a number formats it, and coercing a
/// list yields its first element. The [`kind`](Self::kind) tag is the way to
/// check for an exact shape before coercing.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    name: Option<String>,
    data: Data,
}

impl Value {
    pub fn new_bool(value: bool) -> Self {
        Self::from_data(Data::Boolean(value))
    }

    pub fn new_int(value: i64) -> Self {
        Self::from_data(Data::Integer(value))
    }

    pub fn new_real(value: f64) -> Self {
        Self::from_data(Data::Real(value))
    }

    pub fn new_string(value: impl Into<String>) -> Self {
        Self::from_data(Data::String(value.into()))
    }

    pub fn new_values(values: Vec<Value>) -> Self {
        Self::from_data(Data::Values(values))
    }

    /// A list whose elements are named, mapping onto a tree branch.
    pub fn new_tuple(values: Vec<Value>) -> Self {
        Self::from_data(Data::Tuple(values))
    }

    fn from_data(data: Data) -> Self {
        Self { name: None, data }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn kind(&self) -> ValueKind {
        match &self.data {
            Data::Boolean(_) => ValueKind::Boolean,
            Data::Integer(_) => ValueKind::Integer,
            Data::Real(_) => ValueKind::Real,
            Data::String(_) => ValueKind::String,
            Data::Values(_) => ValueKind::Values,
            Data::Tuple(_) => ValueKind::Tuple,
        }
    }

    /// 1 for scalars, the element count for lists and tuples.
    pub fn size(&self) -> usize {
        match &self.data {
            Data::Values(v) | Data::Tuple(v) => v.len(),
            _ => 1,
        }
    }

    pub fn as_bool(&self) -> bool {
        match &self.data {
            Data::Boolean(b) => *b,
            Data::Integer(i) => *i != 0,
            Data::Real(r) => *r != 0.0,
            Data::String(s) => s == "true" || s.parse::<f64>().map_or(false, |v| v != 0.0),
            Data::Values(v) | Data::Tuple(v) => v.first().map_or(false, Value::as_bool),
        }
    }

    pub fn as_int(&self) -> i64 {
        match &self.data {
            Data::Boolean(b) => i64::from(*b),
            Data::Integer(i) => *i,
            Data::Real(r) => *r as i64,
            Data::String(s) => s
                .parse::<i64>()
                .unwrap_or_else(|_| s.parse::<f64>().map_or(0, |v| v as i64)),
            Data::Values(v) | Data::Tuple(v) => v.first().map_or(0, Value::as_int),
        }
    }

    pub fn as_real(&self) -> f64 {
        match &self.data {
            Data::Boolean(b) => f64::from(u8::from(*b)),
            Data::Integer(i) => *i as f64,
            Data::Real(r) => *r,
            Data::String(s) => s.parse::<f64>().unwrap_or(0.0),
            Data::Values(v) | Data::Tuple(v) => v.first().map_or(0.0, Value::as_real),
        }
    }

    /// String form; the parse direction falls back to the raw string, so
    /// `as_string` never fails.
    pub fn as_string(&self) -> String {
        match &self.data {
            Data::Boolean(b) => b.to_string(),
            Data::Integer(i) => i.to_string(),
            Data::Real(r) => r.to_string(),
            Data::String(s) => s.clone(),
            Data::Values(v) | Data::Tuple(v) => v.first().map_or_else(String::new, Value::as_string),
        }
    }

    /// List form; a scalar yields a single-element list.
    pub fn as_values(&self) -> Vec<Value> {
        match &self.data {
            Data::Values(v) | Data::Tuple(v) => v.clone(),
            _ => vec![self.clone()],
        }
    }

    /// Borrow the elements of a list or tuple, if this is one.
    pub fn elements(&self) -> Option<&[Value]> {
        match &self.data {
            Data::Values(v) | Data::Tuple(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            Data::Values(v) | Data::Tuple(v) => {
                write!(f, "[")?;
                for (i, value) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{value}")?;
                }
                write!(f, "]")
            }
            _ => write!(f, "{}", self.as_string()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::new_bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::new_int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::new_int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::new_int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::new_real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::new_string(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::new_string(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Self::new_values(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_string_coercions_are_total() {
        assert_eq!(Value::from("27").as_int(), 27);
        assert_eq!(Value::from("2.5").as_int(), 2);
        assert_eq!(Value::from("not a number").as_int(), 0);
        assert_eq!(Value::from(3).as_string(), "3");
        assert_eq!(Value::from(true).as_int(), 1);
        assert!((Value::from("0.5").as_real() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn list_coercion_yields_first_element() {
        let list = Value::new_values(vec![Value::from(7), Value::from("two")]);
        assert_eq!(list.as_int(), 7);
        assert_eq!(list.size(), 2);
        assert_eq!(Value::from(1).as_values().len(), 1);
    }

    #[test]
    fn equality_is_structural() {
        let a = Value::new_values(vec![Value::from(1), Value::from("two")]);
        let b = Value::new_values(vec![Value::from(1), Value::from("two")]);
        assert_eq!(a, b);
        assert_ne!(a, a.clone().with_name("named"));
    }
}
