use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::ptr::Ptr;

/// Callable entry point produced by the bitcode loader / node-specialization
/// system. The context only knows the call shape; a call may fail with the
/// designated [`Unwind`] signal or any other engine fault.
pub trait CallTarget: Send + Sync {
    fn call(&self, args: &[Value]) -> Result<Value>;
}

impl<F> CallTarget for F
where
    F: Fn(&[Value]) -> Result<Value> + Send + Sync,
{
    fn call(&self, args: &[Value]) -> Result<Value> {
        self(args)
    }
}

/// Argument or return value for entry-point invocation.
#[derive(Clone)]
pub enum Value {
    Unit,
    I64(i64),
    Pointer(Ptr),
    Function(Arc<dyn CallTarget>),
}

impl Value {
    pub fn as_ptr(&self) -> Option<&Ptr> {
        match self {
            Value::Pointer(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Arc<dyn CallTarget>> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "Unit"),
            Value::I64(v) => write!(f, "I64({v})"),
            Value::Pointer(p) => write!(f, "Pointer({p:?})"),
            Value::Function(t) => write!(f, "Function(@ {:#x})", Arc::as_ptr(t) as *const () as usize),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::Pointer(a), Value::Pointer(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Ptr> for Value {
    fn from(value: Ptr) -> Self {
        Value::Pointer(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

/// Designated non-local-exit signal raised by interpreted code.
///
/// During best-effort teardown this is the only fault that is swallowed; any
/// other error propagates to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unwind;

impl fmt::Display for Unwind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "non-local exit")
    }
}

impl std::error::Error for Unwind {}

/// True when `err` carries the designated non-local-exit signal.
pub fn is_unwind(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Unwind>().is_some()
}
