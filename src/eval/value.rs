use std::{any::Any, collections::BTreeMap, fmt, sync::Arc};

use crate::flake::LazyInput;

pub type Attrs = BTreeMap<String, Value>;

/// Values exchanged with the evaluator
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    List(Vec<Value>),
    Attrs(Attrs),
    Lambda(Lambda),
    /// A flake input that is fetched, verified and evaluated when forced
    Lazy(LazyInput),
    /// The enclosing flake's own result, bound under `self`
    SelfRef,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "a Boolean",
            Value::Int(_) => "an integer",
            Value::String(_) => "a string",
            Value::List(_) => "a list",
            Value::Attrs(_) => "a set",
            Value::Lambda(_) => "a function",
            Value::Lazy(_) => "a flake input",
            Value::SelfRef => "a self reference",
        }
    }

    pub fn as_attrs(&self) -> Option<&Attrs> {
        match self {
            Value::Attrs(attrs) => Some(attrs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Attribute lookup on sets
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.as_attrs().and_then(|attrs| attrs.get(name))
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

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<Attrs> for Value {
    fn from(attrs: Attrs) -> Self {
        Value::Attrs(attrs)
    }
}

/// A function value. The body is owned by the evaluator that produced it and
/// is opaque to everyone else; only the formal parameters are visible.
#[derive(Clone)]
pub struct Lambda {
    /// Names of an attribute-set pattern parameter, `None` for a plain
    /// parameter
    formals: Option<Vec<String>>,
    body: Arc<dyn Any + Send + Sync>,
}

impl Lambda {
    pub fn new<T: Any + Send + Sync>(formals: Option<Vec<String>>, body: T) -> Self {
        Lambda {
            formals,
            body: Arc::new(body),
        }
    }

    pub fn formals(&self) -> Option<&[String]> {
        self.formals.as_deref()
    }

    pub fn body<T: Any>(&self) -> Option<&T> {
        self.body.downcast_ref::<T>()
    }
}

impl fmt::Debug for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lambda")
            .field("formals", &self.formals)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Lambda {
    fn eq(&self, other: &Self) -> bool {
        self.formals == other.formals
            && std::ptr::eq(
                Arc::as_ptr(&self.body) as *const u8,
                Arc::as_ptr(&other.body) as *const u8,
            )
    }
}
