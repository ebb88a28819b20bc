use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::ptr::Ptr;

/// Managed value that can sit behind a handle or a managed pointer.
///
/// Payloads are shared through `Arc`; identity is the address of the payload
/// allocation, so two clones of the same value are the same object while two
/// separately built values never are. The `Container` variant doubles as the
/// disposable-container capability checked at context teardown.
#[derive(Clone)]
pub enum Managed {
    /// Mutable byte buffer (argv/envp strings, the init random seed).
    Buffer(Arc<Mutex<Vec<u8>>>),
    /// Immutable array of managed values.
    Array(Arc<Vec<Managed>>),
    /// Container backing a pointer-typed global variable.
    Container(Arc<GlobalContainer>),
    /// Opaque host object.
    Foreign(Arc<dyn Any + Send + Sync>),
}

impl Managed {
    pub fn buffer(bytes: Vec<u8>) -> Self {
        Managed::Buffer(Arc::new(Mutex::new(bytes)))
    }

    pub fn array(items: Vec<Managed>) -> Self {
        Managed::Array(Arc::new(items))
    }

    pub fn container(container: GlobalContainer) -> Self {
        Managed::Container(Arc::new(container))
    }

    pub fn foreign(object: impl Any + Send + Sync) -> Self {
        Managed::Foreign(Arc::new(object))
    }

    /// Stable identity of the referenced object, valid while any clone lives.
    pub fn identity(&self) -> usize {
        match self {
            Managed::Buffer(b) => Arc::as_ptr(b) as usize,
            Managed::Array(a) => Arc::as_ptr(a) as *const () as usize,
            Managed::Container(c) => Arc::as_ptr(c) as usize,
            Managed::Foreign(f) => Arc::as_ptr(f) as *const () as usize,
        }
    }

    /// Disposable-container capability query, used only at teardown.
    pub fn as_container(&self) -> Option<&Arc<GlobalContainer>> {
        match self {
            Managed::Container(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&Arc<Mutex<Vec<u8>>>> {
        match self {
            Managed::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Arc<Vec<Managed>>> {
        match self {
            Managed::Array(a) => Some(a),
            _ => None,
        }
    }
}

impl fmt::Debug for Managed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Managed::Buffer(b) => {
                let len = b.lock().map(|v| v.len()).unwrap_or(0);
                write!(f, "Buffer({len} bytes @ {:#x})", self.identity())
            }
            Managed::Array(a) => write!(f, "Array({} items @ {:#x})", a.len(), self.identity()),
            Managed::Container(_) => write!(f, "Container(@ {:#x})", self.identity()),
            Managed::Foreign(_) => write!(f, "Foreign(@ {:#x})", self.identity()),
        }
    }
}

impl PartialEq for Managed {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Managed {}

/// Backing object for a pointer-typed global that lives in managed memory.
///
/// Holds the global's current pointer value. Disposal clears the value and
/// latches; repeated disposal is a no-op.
#[derive(Debug, Default)]
pub struct GlobalContainer {
    value: Mutex<Ptr>,
    disposed: AtomicBool,
}

impl GlobalContainer {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(Ptr::null()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn with_value(value: Ptr) -> Self {
        Self {
            value: Mutex::new(value),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> Ptr {
        self.value.lock().unwrap().clone()
    }

    pub fn set(&self, value: Ptr) {
        *self.value.lock().unwrap() = value;
    }

    /// Returns true when this call performed the dispose.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.value.lock().unwrap() = Ptr::null();
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_identity() {
        let a = Managed::buffer(vec![1, 2, 3]);
        let b = a.clone();
        assert_eq!(a, b);
        assert_eq!(a.identity(), b.identity());

        let c = Managed::buffer(vec![1, 2, 3]);
        assert_ne!(a, c);
    }

    #[test]
    fn container_capability_is_variant_tagged() {
        let container = Managed::container(GlobalContainer::new());
        assert!(container.as_container().is_some());
        assert!(Managed::buffer(vec![]).as_container().is_none());
        assert!(Managed::foreign("host object").as_container().is_none());
    }

    #[test]
    fn container_dispose_latches() {
        let container = GlobalContainer::with_value(Ptr::native(0x1000));
        assert!(!container.is_disposed());
        assert!(container.dispose());
        assert!(container.is_disposed());
        assert!(container.get().is_null());
        // second dispose is a no-op
        assert!(!container.dispose());
    }
}
