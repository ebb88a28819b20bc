use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::obj::Managed;

/// Raw address in the emulated native address space.
///
/// Addresses are plain integers; they only gain meaning through the memory
/// subsystem and the handle table that hand them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct NativePtr(pub u64);

impl NativePtr {
    pub const NULL: NativePtr = NativePtr(0);

    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NativePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Interop type tag attached to a managed pointer when the object was
/// exported with an explicit foreign type. Opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InteropType {
    pub name: Arc<str>,
}

impl InteropType {
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }
}

/// Pointer to a managed object, optionally carrying an interop type tag.
///
/// Identity (equality, ordering, hashing) is the identity of the referenced
/// object; the type tag never participates.
#[derive(Debug, Clone)]
pub struct ManagedPtr {
    object: Managed,
    export_type: Option<Arc<InteropType>>,
}

impl ManagedPtr {
    pub fn new(object: Managed) -> Self {
        Self {
            object,
            export_type: None,
        }
    }

    pub fn with_type(object: Managed, export_type: Arc<InteropType>) -> Self {
        Self {
            object,
            export_type: Some(export_type),
        }
    }

    #[inline]
    pub fn object(&self) -> &Managed {
        &self.object
    }

    #[inline]
    pub fn export_type(&self) -> Option<&Arc<InteropType>> {
        self.export_type.as_ref()
    }
}

impl PartialEq for ManagedPtr {
    fn eq(&self, other: &Self) -> bool {
        self.object.identity() == other.object.identity()
    }
}

impl Eq for ManagedPtr {}

impl Hash for ManagedPtr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.object.identity().hash(state);
    }
}

/// Opaque pointer value: either a raw native address or a reference to a
/// managed object. Equality is by variant-specific identity; the two
/// variants never compare equal by bit pattern.
#[derive(Debug, Clone)]
pub enum Ptr {
    Native(NativePtr),
    Managed(ManagedPtr),
}

impl Ptr {
    pub const fn null() -> Self {
        Ptr::Native(NativePtr::NULL)
    }

    pub fn native(address: u64) -> Self {
        Ptr::Native(NativePtr(address))
    }

    pub fn managed(object: Managed) -> Self {
        Ptr::Managed(ManagedPtr::new(object))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Ptr::Native(p) if p.is_null())
    }

    pub fn as_native(&self) -> Option<NativePtr> {
        match self {
            Ptr::Native(p) => Some(*p),
            Ptr::Managed(_) => None,
        }
    }

    pub fn as_managed(&self) -> Option<&ManagedPtr> {
        match self {
            Ptr::Native(_) => None,
            Ptr::Managed(p) => Some(p),
        }
    }
}

impl Default for Ptr {
    fn default() -> Self {
        Ptr::null()
    }
}

impl From<NativePtr> for Ptr {
    fn from(value: NativePtr) -> Self {
        Ptr::Native(value)
    }
}

impl From<ManagedPtr> for Ptr {
    fn from(value: ManagedPtr) -> Self {
        Ptr::Managed(value)
    }
}

impl PartialEq for Ptr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Ptr::Native(a), Ptr::Native(b)) => a == b,
            (Ptr::Managed(a), Ptr::Managed(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Ptr {}

impl Hash for Ptr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Ptr::Native(p) => {
                0u8.hash(state);
                p.hash(state);
            }
            Ptr::Managed(p) => {
                1u8.hash(state);
                p.hash(state);
            }
        }
    }
}

impl PartialOrd for Ptr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ptr {
    // Native pointers sort before managed ones; within a variant the order is
    // address order resp. object-identity order. Arbitrary but total.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Ptr::Native(a), Ptr::Native(b)) => a.cmp(b),
            (Ptr::Managed(a), Ptr::Managed(b)) => a.object().identity().cmp(&b.object().identity()),
            (Ptr::Native(_), Ptr::Managed(_)) => Ordering::Less,
            (Ptr::Managed(_), Ptr::Native(_)) => Ordering::Greater,
        }
    }
}
