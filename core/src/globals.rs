//! Reverse index from pointer values to the global variables they back.
//!
//! The loader registers globals in per-library batches: an optional backing
//! store holding the batch's non-pointer-typed globals, plus a mapping from
//! each global's pointer to its descriptor. The directory owns the backing
//! stores until context teardown.

use std::sync::Arc;

use anyhow::Result;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::ptr::Ptr;
use crate::val::{CallTarget, Value};

/// Loader-produced descriptor for one program-level global variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Global {
    symbol: Arc<str>,
}

impl Global {
    pub fn new(symbol: impl Into<Arc<str>>) -> Self {
        Self { symbol: symbol.into() }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

#[derive(Debug, Default)]
pub struct GlobalDirectory {
    reverse_map: FxHashMap<Ptr, Global>,
    // Owned backing blocks for non-pointer globals, freed at teardown.
    non_pointer_stores: Vec<Option<Ptr>>,
}

impl GlobalDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one batch: the backing store (if the batch has non-pointer
    /// globals) and its pointer-to-descriptor entries. A pointer already
    /// present keeps the later registration.
    pub fn register_batch(
        &mut self,
        backing_store: Option<Ptr>,
        entries: impl IntoIterator<Item = (Ptr, Global)>,
    ) {
        self.non_pointer_stores.push(backing_store);
        for (pointer, global) in entries {
            trace!(target: "cinder::globals", symbol = global.symbol(), "global registered");
            if let Some(previous) = self.reverse_map.insert(pointer, global) {
                debug!(
                    target: "cinder::globals",
                    symbol = previous.symbol(),
                    "global mapping replaced by a later registration"
                );
            }
        }
    }

    /// Pure lookup of the global backed by `pointer`.
    pub fn find(&self, pointer: &Ptr) -> Option<&Global> {
        self.reverse_map.get(pointer)
    }

    pub fn len(&self) -> usize {
        self.reverse_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reverse_map.is_empty()
    }

    /// Teardown duty: free every non-null backing store through the external
    /// `free` entry point, then dispose every managed global container.
    ///
    /// Stores may reference containers by value, never vice versa, so stores
    /// must go first; the reverse order is not safe.
    pub(crate) fn dispose(&self, free: &dyn CallTarget) -> Result<()> {
        for store in self.non_pointer_stores.iter().flatten() {
            // first argument is the stack-pointer slot, unused by `free`
            free.call(&[Value::I64(-1), Value::Pointer(store.clone())])?;
        }

        for pointer in self.reverse_map.keys() {
            if let Ptr::Managed(managed) = pointer
                && let Some(container) = managed.object().as_container()
            {
                container.dispose();
            }
        }
        Ok(())
    }
}
