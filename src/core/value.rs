//! Values exchanged between peers.
//!
//! Scalars and tuples cross the boundary by copy; everything else is an
//! [`ObjectRef`] and crosses by reference.

use std::fmt;
use std::sync::Arc;

use crate::core::object::RemoteObject;
use crate::error::{Fault, Phase, Result};

/// Shared handle to a hostable object (local instance or proxy).
pub type ObjectRef = Arc<dyn RemoteObject>;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Fixed-length ordered immutable sequence
    Tuple(Vec<Value>),
    Object(ObjectRef),
}

impl Value {
    pub fn object<T: RemoteObject>(obj: T) -> Self {
        Value::Object(Arc::new(obj))
    }

    pub fn type_label(&self) -> &str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::Object(obj) => obj.type_name(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Object(obj) if obj.is_callable())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            // objects compare by identity
            (Value::Object(a), Value::Object(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(b) => write!(f, "{b:?}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            Value::Tuple(items) => f.debug_tuple("").field(items).finish(),
            Value::Object(obj) => write!(f, "<{} object>", obj.type_name()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<ObjectRef> for Value {
    fn from(v: ObjectRef) -> Self {
        Value::Object(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::None)
    }
}

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    pub positional: Vec<Value>,
    pub keyword: Vec<(String, Value)>,
}

impl Args {
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keyword: Vec::new(),
        }
    }

    pub fn with_kwargs(positional: Vec<Value>, keyword: Vec<(String, Value)>) -> Self {
        Self {
            positional,
            keyword,
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.keyword
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Positional argument `index`, falling back to keyword `name`.
    pub fn arg(&self, index: usize, name: &str) -> Option<&Value> {
        self.get(index).or_else(|| self.kwarg(name))
    }

    /// Required integer argument; a missing or mistyped value is a `TypeError`.
    pub fn int(&self, index: usize, name: &str) -> Result<i64> {
        self.arg(index, name)
            .and_then(Value::as_int)
            .ok_or_else(|| type_error(name, "int"))
    }

    pub fn float(&self, index: usize, name: &str) -> Result<f64> {
        self.arg(index, name)
            .and_then(Value::as_float)
            .ok_or_else(|| type_error(name, "float"))
    }

    pub fn str(&self, index: usize, name: &str) -> Result<&str> {
        self.arg(index, name)
            .and_then(Value::as_str)
            .ok_or_else(|| type_error(name, "str"))
    }
}

fn type_error(name: &str, expected: &str) -> Fault {
    Fault::raised(
        Phase::Call,
        "TypeError",
        format!("argument '{name}' must be {expected}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_equality() {
        assert_eq!(Value::from(5), Value::Int(5));
        assert_eq!(Value::from("a"), Value::Str("a".into()));
        assert_ne!(Value::Int(1), Value::Bool(true));
        assert_eq!(
            Value::Tuple(vec![1.into(), "x".into()]),
            Value::Tuple(vec![Value::Int(1), Value::Str("x".into())])
        );
    }

    #[test]
    fn test_args_lookup() {
        let args = Args::with_kwargs(vec![2.into()], vec![("b".into(), 3.into())]);
        assert_eq!(args.int(0, "a").ok(), Some(2));
        assert_eq!(args.int(1, "b").ok(), Some(3));
        let err = args.int(2, "c").err();
        assert!(matches!(err, Some(Fault::Execution { ref kind, .. }) if kind == "TypeError"));
    }
}
