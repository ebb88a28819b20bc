//! Emulated native memory consumed by the execution context.
//!
//! The context never touches real process memory; addresses are carved out of
//! disjoint regions of a synthetic address space so that handle pointers,
//! auto-deref handle pointers, and plain block allocations can be told apart
//! from the address alone.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::ptr::NativePtr;

/// Memory subsystem contract used by the handle table and the context.
pub trait EngineMemory: Send + Sync {
    /// Reserve a fresh address in the handle region. `auto_deref` selects the
    /// region whose addresses take one extra indirection on access.
    fn allocate_handle(&self, auto_deref: bool) -> NativePtr;

    /// Allocate a block of `size` bytes, 16-byte aligned.
    fn allocate(&self, size: usize) -> NativePtr;

    /// Return a previously allocated handle address or block.
    fn free(&self, address: NativePtr);
}

// Region bases of the synthetic address space. Handle slots are pointer-sized;
// block allocations grow upward from the general base.
const GENERAL_BASE: u64 = 0x0000_1000_0000;
const DEREF_HANDLE_BASE: u64 = 0x4000_0000_0000;
const HANDLE_BASE: u64 = 0x8000_0000_0000;
const HANDLE_SLOT: u64 = 8;

/// True when `address` lies in the auto-deref handle region.
pub fn is_deref_handle_address(address: NativePtr) -> bool {
    (DEREF_HANDLE_BASE..HANDLE_BASE).contains(&address.0)
}

/// True when `address` lies in either handle region.
pub fn is_handle_address(address: NativePtr) -> bool {
    address.0 >= DEREF_HANDLE_BASE
}

#[derive(Debug, Default)]
struct RegionState {
    next_handle: u64,
    next_deref_handle: u64,
    free_handles: Vec<NativePtr>,
    free_deref_handles: Vec<NativePtr>,
    next_block: u64,
    live_blocks: FxHashMap<u64, usize>,
}

/// Default [`EngineMemory`]: a bump allocator per region with free lists for
/// the fixed-size handle slots.
#[derive(Debug, Default)]
pub struct EmulatedMemory {
    state: Mutex<RegionState>,
}

impl EmulatedMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EngineMemory for EmulatedMemory {
    fn allocate_handle(&self, auto_deref: bool) -> NativePtr {
        let mut state = self.state.lock().unwrap();
        let address = if auto_deref {
            state.free_deref_handles.pop().unwrap_or_else(|| {
                let slot = state.next_deref_handle;
                state.next_deref_handle += 1;
                NativePtr(DEREF_HANDLE_BASE + slot * HANDLE_SLOT)
            })
        } else {
            state.free_handles.pop().unwrap_or_else(|| {
                let slot = state.next_handle;
                state.next_handle += 1;
                NativePtr(HANDLE_BASE + slot * HANDLE_SLOT)
            })
        };
        trace!(target: "cinder::mem", %address, auto_deref, "handle slot allocated");
        address
    }

    fn allocate(&self, size: usize) -> NativePtr {
        let mut state = self.state.lock().unwrap();
        let aligned = (size.max(1) as u64 + 15) & !15;
        let address = GENERAL_BASE + state.next_block;
        state.next_block += aligned;
        state.live_blocks.insert(address, size);
        trace!(target: "cinder::mem", address = %NativePtr(address), size, "block allocated");
        NativePtr(address)
    }

    fn free(&self, address: NativePtr) {
        let mut state = self.state.lock().unwrap();
        if is_deref_handle_address(address) {
            state.free_deref_handles.push(address);
        } else if is_handle_address(address) {
            state.free_handles.push(address);
        } else {
            assert!(
                state.live_blocks.remove(&address.0).is_some(),
                "free of unallocated block {address}"
            );
        }
        trace!(target: "cinder::mem", %address, "freed");
    }
}

/// Native backing for the interpreter stacks. Owns the main stack; interpreter
/// threads get their own stacks from the same allocator.
#[derive(Debug)]
pub struct ThreadingStack {
    base: NativePtr,
    size: usize,
    // Stack grows downward from base + size.
    sp: Mutex<u64>,
    main_freed: AtomicBool,
}

impl ThreadingStack {
    pub fn new(memory: &dyn EngineMemory, stack_size_kb: usize) -> Self {
        let size = stack_size_kb * 1024;
        let base = memory.allocate(size);
        Self {
            base,
            size,
            sp: Mutex::new(base.0 + size as u64),
            main_freed: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Open a fresh frame on the main stack. Dropping the guard restores the
    /// stack pointer.
    pub fn new_frame(&self) -> StackFrame<'_> {
        let saved = *self.sp.lock().unwrap();
        StackFrame { stack: self, saved }
    }

    /// Release the main stack's native backing. Idempotent; called
    /// unconditionally during context teardown.
    pub fn free_main_stack(&self, memory: &dyn EngineMemory) {
        if !self.main_freed.swap(true, Ordering::SeqCst) {
            memory.free(self.base);
        }
    }
}

/// RAII guard for one stack frame; yields the frame pointer handed to entry
/// points and restores the stack pointer on drop.
#[derive(Debug)]
pub struct StackFrame<'a> {
    stack: &'a ThreadingStack,
    saved: u64,
}

impl StackFrame<'_> {
    pub fn pointer(&self) -> NativePtr {
        NativePtr(*self.stack.sp.lock().unwrap())
    }

    /// Move the stack pointer down by `size` bytes within this frame.
    pub fn reserve(&self, size: usize) -> NativePtr {
        let mut sp = self.stack.sp.lock().unwrap();
        let new_sp = sp
            .checked_sub(size as u64)
            .filter(|p| *p >= self.stack.base.0)
            .expect("interpreter stack overflow");
        *sp = new_sp;
        NativePtr(new_sp)
    }
}

impl Drop for StackFrame<'_> {
    fn drop(&mut self) {
        *self.stack.sp.lock().unwrap() = self.saved;
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::sync::atomic::AtomicU64;

    /// Test double that records every free and delegates to [`EmulatedMemory`].
    #[derive(Debug, Default)]
    pub(crate) struct RecordingMemory {
        inner: EmulatedMemory,
        pub(crate) handle_allocs: AtomicU64,
        pub(crate) freed: Mutex<Vec<NativePtr>>,
    }

    impl RecordingMemory {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn freed_count_of(&self, address: NativePtr) -> usize {
            self.freed.lock().unwrap().iter().filter(|a| **a == address).count()
        }
    }

    impl EngineMemory for RecordingMemory {
        fn allocate_handle(&self, auto_deref: bool) -> NativePtr {
            self.handle_allocs.fetch_add(1, Ordering::SeqCst);
            self.inner.allocate_handle(auto_deref)
        }

        fn allocate(&self, size: usize) -> NativePtr {
            self.inner.allocate(size)
        }

        fn free(&self, address: NativePtr) {
            self.freed.lock().unwrap().push(address);
            self.inner.free(address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_regions_are_disjoint() {
        let memory = EmulatedMemory::new();
        let plain = memory.allocate_handle(false);
        let deref = memory.allocate_handle(true);
        assert!(is_handle_address(plain));
        assert!(!is_deref_handle_address(plain));
        assert!(is_deref_handle_address(deref));
        assert_ne!(plain, deref);
    }

    #[test]
    fn freed_handle_slots_are_reused() {
        let memory = EmulatedMemory::new();
        let first = memory.allocate_handle(false);
        memory.free(first);
        let second = memory.allocate_handle(false);
        assert_eq!(first, second);
    }

    #[test]
    fn blocks_do_not_overlap_handle_space() {
        let memory = EmulatedMemory::new();
        let block = memory.allocate(64);
        assert!(!is_handle_address(block));
        memory.free(block);
    }

    #[test]
    #[should_panic(expected = "free of unallocated block")]
    fn double_free_of_block_panics() {
        let memory = EmulatedMemory::new();
        let block = memory.allocate(8);
        memory.free(block);
        memory.free(block);
    }

    #[test]
    fn stack_frame_restores_pointer() {
        let memory = EmulatedMemory::new();
        let stack = ThreadingStack::new(&memory, 64);
        let outer = {
            let frame = stack.new_frame();
            let before = frame.pointer();
            let inner = frame.reserve(128);
            assert_eq!(inner.0, before.0 - 128);
            before
        };
        let frame = stack.new_frame();
        assert_eq!(frame.pointer(), outer);
    }

    #[test]
    fn main_stack_free_is_idempotent() {
        let memory = EmulatedMemory::new();
        let stack = ThreadingStack::new(&memory, 16);
        stack.free_main_stack(&memory);
        stack.free_main_stack(&memory);
    }
}
