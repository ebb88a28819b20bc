//! Reference-counted native-address aliases for managed objects.
//!
//! Native-style pointer code cannot address a managed object directly, so the
//! table synthesizes a native address for it on first acquire and hands the
//! same address back on every later acquire. Handle records live in a slab;
//! the object index and the address index both key by slab position, so
//! neither map owns a record outright. A handle is live iff its reference
//! count is positive, and the live addresses and live objects are always in
//! bijection.

use std::fmt;
use std::sync::Mutex;

use anyhow::Result;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::mem::EngineMemory;
use crate::obj::Managed;
use crate::ptr::NativePtr;

/// Error raised when a native address does not map to a live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnresolvedHandle(pub NativePtr);

impl fmt::Display for UnresolvedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot resolve native handle: {}", self.0)
    }
}

impl std::error::Error for UnresolvedHandle {}

#[derive(Debug)]
struct Handle {
    refcnt: u64,
    address: NativePtr,
    object: Managed,
}

#[derive(Debug, Default)]
struct HandleSlab {
    records: Vec<Option<Handle>>,
    free: Vec<usize>,
}

impl HandleSlab {
    fn insert(&mut self, handle: Handle) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.records[index] = Some(handle);
                index
            }
            None => {
                self.records.push(Some(handle));
                self.records.len() - 1
            }
        }
    }

    fn get_mut(&mut self, index: usize) -> &mut Handle {
        self.records[index].as_mut().expect("live slab index")
    }

    fn get(&self, index: usize) -> &Handle {
        self.records[index].as_ref().expect("live slab index")
    }

    fn remove(&mut self, index: usize) -> Handle {
        let handle = self.records[index].take().expect("live slab index");
        self.free.push(index);
        handle
    }
}

#[derive(Debug, Default)]
struct Indices {
    slab: HandleSlab,
    by_object: FxHashMap<usize, usize>,
    by_address: FxHashMap<NativePtr, usize>,
}

/// Bidirectional, reference-counted mapping between managed objects and
/// synthesized native addresses. One mutex guards both indices; the
/// cross-index invariants require every update to be a single atomic unit.
#[derive(Debug, Default)]
pub struct HandleTable {
    inner: Mutex<Indices>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the native address aliasing `object`, creating the handle on first
    /// use, and take one reference. `auto_deref` selects the allocator region
    /// whose addresses are auto-dereferenced on access; it only matters for
    /// the creating call.
    pub fn acquire(&self, memory: &dyn EngineMemory, object: Managed, auto_deref: bool) -> NativePtr {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let key = object.identity();
        let index = match inner.by_object.get(&key) {
            Some(index) => *index,
            None => {
                let address = memory.allocate_handle(auto_deref);
                let index = inner.slab.insert(Handle {
                    refcnt: 0,
                    address,
                    object,
                });
                inner.by_object.insert(key, index);
                inner.by_address.insert(address, index);
                index
            }
        };

        let handle = inner.slab.get_mut(index);
        handle.refcnt += 1;
        trace!(target: "cinder::handles", address = %handle.address, refcnt = handle.refcnt, "handle acquired");
        handle.address
    }

    /// Look up the managed object behind `address`.
    pub fn resolve(&self, address: NativePtr) -> Result<Managed> {
        let guard = self.inner.lock().unwrap();
        match guard.by_address.get(&address) {
            Some(index) => Ok(guard.slab.get(*index).object.clone()),
            None => Err(anyhow::Error::new(UnresolvedHandle(address))),
        }
    }

    /// Drop one reference from the handle at `address`; when the count hits
    /// zero the handle is removed from both indices and the address returns
    /// to the allocator.
    pub fn release(&self, memory: &dyn EngineMemory, address: NativePtr) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let index = match inner.by_address.get(&address) {
            Some(index) => *index,
            None => return Err(anyhow::Error::new(UnresolvedHandle(address))),
        };

        let handle = inner.slab.get_mut(index);
        handle.refcnt -= 1;
        trace!(target: "cinder::handles", %address, refcnt = handle.refcnt, "handle released");
        if handle.refcnt == 0 {
            let handle = inner.slab.remove(index);
            inner.by_address.remove(&address);
            inner.by_object.remove(&handle.object.identity());
            memory.free(address);
        }
        Ok(())
    }

    /// True iff a live handle maps from `address`. Never allocates or mutates.
    pub fn contains(&self, address: NativePtr) -> bool {
        self.inner.lock().unwrap().by_address.contains_key(&address)
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod handles_test;
