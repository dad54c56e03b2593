use crate::error::CallError;
use crate::task::TaskRef;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Something a callback task can invoke.
/// Externally supplied functions (script bindings, closures) implement this.
pub trait Invocable: Send + Sync {
    fn invoke(&self, args: &[Value]) -> Result<Value, CallError>;
}

impl<F> Invocable for F
where
    F: Fn(&[Value]) -> Result<Value, CallError> + Send + Sync,
{
    fn invoke(&self, args: &[Value]) -> Result<Value, CallError> {
        self(args)
    }
}

pub type Callable = Arc<dyn Invocable>;

/// Wrap a closure as a callable [`Value`].
pub fn callable<F>(f: F) -> Value
where
    F: Fn(&[Value]) -> Result<Value, CallError> + Send + Sync + 'static,
{
    Value::Callable(Arc::new(f))
}

/// A dynamically typed, shared value passed to and returned from callables.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<Value>),
    Task(TaskRef),
    Callable(Callable),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view; integers widen to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<&TaskRef> {
        match self {
            Value::Task(task) => Some(task),
            _ => None,
        }
    }

    pub fn as_callable(&self) -> Option<&Callable> {
        match self {
            Value::Callable(f) => Some(f),
            _ => None,
        }
    }

    /// Human-readable rendering used in diagnostics.
    pub fn repr(&self) -> String {
        self.to_string()
    }
}

fn same_allocation<T: ?Sized, U: ?Sized>(a: &Arc<T>, b: &Arc<U>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (Value::Task(a), Value::Task(b)) => Arc::ptr_eq(a, b),
            (Value::Callable(a), Value::Callable(b)) => same_allocation(a, b),
            (Value::Opaque(a), Value::Opaque(b)) => same_allocation(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Seq(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Task(task) => write!(f, "<{task}>"),
            Value::Callable(_) => write!(f, "<callable>"),
            Value::Opaque(_) => write!(f, "<opaque>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
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

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Seq(v)
    }
}

impl From<TaskRef> for Value {
    fn from(v: TaskRef) -> Self {
        Value::Task(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::None)
    }
}
