//! The execution context: process-wide mutable state for one run of an
//! embedded bitcode program.
//!
//! The context bridges the managed object space and the emulated native
//! address space. It owns the handle table, the global directory, the library
//! registry and link chain, and the thread registry for its whole lifetime,
//! and it sequences teardown when the interpreted program may already have
//! left things in an inconsistent state.
//!
//! Lifecycle is linear: `Created → Initialized → Disposed`. Construction is
//! cheap and runs no interpreted code; `initialize` invokes the program's
//! init entry point exactly once; `dispose` runs best-effort program cleanup
//! and then frees every engine-owned native allocation. Disposal must only
//! begin after the caller has joined all interpreter threads; disposing with
//! threads still running is a caller error.

mod options;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use anyhow::{Result, anyhow};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

pub use options::ContextOptions;

use crate::globals::{Global, GlobalDirectory};
use crate::handles::HandleTable;
use crate::layout::{DataLayout, Type};
use crate::link::{DynamicLinkChain, ExternalLibrary, ExternalLibraryRegistry, LibrarySearchPath, Scope};
use crate::mem::{EngineMemory, ThreadingStack};
use crate::obj::Managed;
use crate::ptr::{NativePtr, Ptr};
use crate::threads::{InterpreterThread, ThreadRegistry};
use crate::val::{CallTarget, Value, is_unwind};

// Snapshot the host environment once per process so every context sees the
// same environment regardless of later setenv calls by the host.
static HOST_ENVIRONMENT: Lazy<Vec<(String, String)>> = Lazy::new(|| std::env::vars().collect());

/// Entry point invoked by `initialize` with `(frame, argv, envp, seed)`.
pub const INIT_CONTEXT_SYMBOL: &str = "__cinder_init_context";
/// Entry point invoked during `dispose` with `(frame)`.
pub const DISPOSE_CONTEXT_SYMBOL: &str = "__cinder_dispose_context";

/// Descriptor for one interpreted function exposed through a native pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    name: Arc<str>,
    signature: Arc<str>,
    index: u32,
}

impl FunctionDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

#[derive(Debug, Default)]
struct FunctionPointerRegistry {
    next_index: u32,
    descriptors: FxHashMap<NativePtr, FunctionDescriptor>,
}

/// Execution context of one interpreter session.
pub struct ExecutionContext {
    options: ContextOptions,
    environment: Vec<(String, String)>,

    search_path: Mutex<LibrarySearchPath>,
    libraries: Mutex<ExternalLibraryRegistry>,
    globals: Mutex<GlobalDirectory>,
    data_layout: Mutex<DataLayout>,
    link_chain: Mutex<DynamicLinkChain>,
    global_scope: Scope,

    handles: HandleTable,
    threads: Arc<ThreadRegistry>,
    threading_stack: ThreadingStack,

    destructors: Mutex<Vec<Arc<dyn CallTarget>>>,
    function_pointers: Mutex<FunctionPointerRegistry>,
    native_call_stats: Option<Mutex<FxHashMap<String, u64>>>,
    caught_exceptions: Mutex<Vec<NativePtr>>,

    // Per-thread slots as explicit maps: thread-local primitives are hard to
    // enumerate and tear down deterministically.
    tls: DashMap<ThreadId, Value>,
    clear_child_tid: DashMap<ThreadId, Ptr>,

    free_intrinsic: Arc<dyn CallTarget>,

    initialized: AtomicBool,
    cleanup_necessary: AtomicBool,
    disposed: AtomicBool,
    default_libraries_loaded: AtomicBool,
}

impl ExecutionContext {
    /// Build a context. Cheap; no interpreted code runs until `initialize`.
    ///
    /// `global_scope` must (by the time `initialize`/`dispose` run) bind the
    /// two lifecycle entry points; `free_intrinsic` is the external `free`
    /// used to release global backing stores at teardown.
    pub fn new(
        options: ContextOptions,
        memory: &dyn EngineMemory,
        global_scope: Scope,
        free_intrinsic: Arc<dyn CallTarget>,
    ) -> Self {
        let environment = options
            .environment
            .clone()
            .unwrap_or_else(|| HOST_ENVIRONMENT.clone());

        let mut search_path = LibrarySearchPath::new();
        search_path.add_directories(options.library_paths.iter().cloned());

        let threading_stack = ThreadingStack::new(memory, options.stack_size_kb);
        let native_call_stats = options
            .native_call_stats
            .then(|| Mutex::new(FxHashMap::default()));

        Self {
            options,
            environment,
            search_path: Mutex::new(search_path),
            libraries: Mutex::new(ExternalLibraryRegistry::new()),
            globals: Mutex::new(GlobalDirectory::new()),
            data_layout: Mutex::new(DataLayout::new()),
            link_chain: Mutex::new(DynamicLinkChain::new()),
            global_scope,
            handles: HandleTable::new(),
            threads: Arc::new(ThreadRegistry::new()),
            threading_stack,
            destructors: Mutex::new(Vec::new()),
            function_pointers: Mutex::new(FunctionPointerRegistry {
                next_index: 1,
                descriptors: FxHashMap::default(),
            }),
            native_call_stats,
            caught_exceptions: Mutex::new(Vec::new()),
            tls: DashMap::new(),
            clear_child_tid: DashMap::new(),
            free_intrinsic,
            initialized: AtomicBool::new(false),
            cleanup_necessary: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            default_libraries_loaded: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    pub fn global_scope(&self) -> &Scope {
        &self.global_scope
    }

    // ---- lifecycle -----------------------------------------------------

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Run the program's init entry point with a synthesized
    /// `(frame, argv, envp, seed)` argument list. A second call is a no-op.
    pub fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug_assert!(!self.cleanup_necessary.load(Ordering::SeqCst));
        self.cleanup_necessary.store(true, Ordering::SeqCst);
        debug!(target: "cinder::ctx", "initializing execution context");

        let init = self.global_scope.get_function(INIT_CONTEXT_SYMBOL)?;
        let frame = self.threading_stack.new_frame();
        let args = [
            Value::Pointer(Ptr::Native(frame.pointer())),
            Value::Pointer(self.application_arguments()),
            Value::Pointer(self.environment_variables()),
            Value::Pointer(self.random_seed()?),
        ];
        init.call(&args)?;
        Ok(())
    }

    /// Abnormal-exit paths (`_exit`, `abort`) clear this to skip the
    /// program-level cleanup entry point during `dispose`.
    pub fn set_cleanup_necessary(&self, value: bool) {
        self.cleanup_necessary.store(value, Ordering::SeqCst);
    }

    /// Tear the context down. Emits native-call statistics, runs the
    /// program's dispose entry point (best effort: the designated non-local
    /// exit is expected there and swallowed), then frees the main stack and
    /// the global backing stores.
    ///
    /// Teardown steps are independent: a non-`Unwind` fault from the dispose
    /// entry point is captured, the remaining steps still run, and the fault
    /// is returned afterwards. Calling `dispose` again is a no-op.
    pub fn dispose(&self, memory: &dyn EngineMemory) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(target: "cinder::ctx", "disposing execution context");

        self.emit_native_call_statistics();

        // Cleanup cases: exit()/normal teardown runs the program's dispose
        // entry point; _exit()/abort() cleared cleanup_necessary beforehand.
        let mut program_cleanup_fault = None;
        if self.cleanup_necessary.load(Ordering::SeqCst) {
            match self.run_program_dispose() {
                Ok(()) => {}
                Err(err) if is_unwind(&err) => {
                    // cleanup after abort is undefined; a non-local exit here
                    // is expected and ignored
                    trace!(target: "cinder::ctx", "program dispose unwound");
                }
                Err(err) => program_cleanup_fault = Some(err),
            }
        }

        self.threading_stack.free_main_stack(memory);

        let dispose_result = self
            .globals
            .lock()
            .unwrap()
            .dispose(self.free_intrinsic.as_ref());

        match program_cleanup_fault {
            Some(err) => Err(err),
            None => dispose_result,
        }
    }

    fn run_program_dispose(&self) -> Result<()> {
        let target = self.global_scope.get_function(DISPOSE_CONTEXT_SYMBOL)?;
        let frame = self.threading_stack.new_frame();
        target.call(&[Value::Pointer(Ptr::Native(frame.pointer()))])?;
        Ok(())
    }

    fn application_arguments(&self) -> Ptr {
        let mut strings = Vec::with_capacity(self.options.main_arguments.len() + 1);
        // the program path is not known yet; program start patches argv[0]
        strings.push(Managed::buffer(Vec::new()));
        for arg in &self.options.main_arguments {
            strings.push(Managed::buffer(arg.clone().into_bytes()));
        }
        Ptr::managed(Managed::array(strings))
    }

    fn environment_variables(&self) -> Ptr {
        let vars = self
            .environment
            .iter()
            .map(|(key, value)| Managed::buffer(format!("{key}={value}").into_bytes()))
            .collect();
        Ptr::managed(Managed::array(vars))
    }

    fn random_seed(&self) -> Result<Ptr> {
        let mut seed = [0u8; 16];
        getrandom::getrandom(&mut seed).map_err(|err| anyhow!("failed to gather seed entropy: {err}"))?;
        Ok(Ptr::managed(Managed::buffer(seed.to_vec())))
    }

    // ---- handles -------------------------------------------------------

    /// Native-pointer alias for `object`; no extra indirection on access.
    pub fn handle_for_managed(&self, memory: &dyn EngineMemory, object: Managed) -> NativePtr {
        self.handles.acquire(memory, object, false)
    }

    /// Native-pointer alias whose address is auto-dereferenced on access.
    pub fn deref_handle_for_managed(&self, memory: &dyn EngineMemory, object: Managed) -> NativePtr {
        self.handles.acquire(memory, object, true)
    }

    pub fn resolve_handle(&self, address: NativePtr) -> Result<Managed> {
        self.handles.resolve(address)
    }

    pub fn release_handle(&self, memory: &dyn EngineMemory, address: NativePtr) -> Result<()> {
        self.handles.release(memory, address)
    }

    pub fn is_handle(&self, address: NativePtr) -> bool {
        self.handles.contains(address)
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    // ---- libraries and linking ----------------------------------------

    pub fn add_library_paths<I, P>(&self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<std::path::PathBuf>,
    {
        self.search_path.lock().unwrap().add_directories(paths);
    }

    /// Resolve and register an external library. `None` means the library
    /// was already linked and the caller should skip re-processing it.
    pub fn add_external_library(&self, name: &str, is_native: bool) -> Result<Option<Arc<ExternalLibrary>>> {
        let search_path = self.search_path.lock().unwrap();
        self.libraries.lock().unwrap().register(&search_path, name, is_native)
    }

    pub fn external_libraries(&self, filter: impl Fn(&ExternalLibrary) -> bool) -> Vec<Arc<ExternalLibrary>> {
        self.libraries.lock().unwrap().filter(filter)
    }

    /// Append the symbol scopes of a freshly linked library to the chain.
    pub fn register_scopes(&self, scopes: &[Scope]) {
        self.link_chain.lock().unwrap().append_scopes(scopes);
    }

    pub fn link_chain_len(&self) -> usize {
        self.link_chain.lock().unwrap().len()
    }

    pub fn are_default_libraries_loaded(&self) -> bool {
        self.default_libraries_loaded.load(Ordering::SeqCst)
    }

    pub fn set_default_libraries_loaded(&self) {
        self.default_libraries_loaded.store(true, Ordering::SeqCst);
    }

    // ---- globals -------------------------------------------------------

    /// Register one batch of loader-produced globals. Loading is serialized
    /// by the host; concurrent registration during steady-state execution is
    /// not supported.
    pub fn register_globals(
        &self,
        backing_store: Option<Ptr>,
        entries: impl IntoIterator<Item = (Ptr, Global)>,
    ) {
        self.globals.lock().unwrap().register_batch(backing_store, entries);
    }

    pub fn find_global(&self, pointer: &Ptr) -> Option<Global> {
        self.globals.lock().unwrap().find(pointer).cloned()
    }

    // ---- data layout ---------------------------------------------------

    /// Merge the layout fragment contributed by a newly loaded library.
    /// A fragment contradicting an already-agreed entry panics: offsets for
    /// already-loaded types must never change.
    pub fn add_data_layout(&self, layout: &DataLayout) {
        self.data_layout.lock().unwrap().merge(layout);
    }

    pub fn byte_alignment(&self, ty: &Type) -> u64 {
        self.data_layout.lock().unwrap().alignment_of(ty)
    }

    pub fn byte_size(&self, ty: &Type) -> u64 {
        self.data_layout.lock().unwrap().size_of(ty)
    }

    pub fn byte_padding(&self, offset: u64, ty: &Type) -> u64 {
        self.data_layout.lock().unwrap().padding_at(offset, ty)
    }

    pub fn index_offset(&self, index: usize, ty: &Type) -> u64 {
        self.data_layout.lock().unwrap().offset_of(index, ty)
    }

    // ---- threads -------------------------------------------------------

    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    pub fn register_thread(&self, thread: Arc<InterpreterThread>) {
        self.threads.register(thread);
    }

    pub fn unregister_thread(&self, thread: &Arc<InterpreterThread>) {
        self.threads.unregister(thread);
    }

    pub fn shutdown_threads(&self) {
        self.threads.shutdown_all();
    }

    pub fn await_thread_termination(&self) {
        self.threads.await_all_terminated();
    }

    pub fn threading_stack(&self) -> &ThreadingStack {
        &self.threading_stack
    }

    // ---- per-thread slots ---------------------------------------------

    /// Thread-local value slot of the calling thread; null pointer when
    /// unset.
    pub fn thread_local_storage(&self) -> Value {
        self.tls
            .get(&thread::current().id())
            .map(|entry| entry.value().clone())
            .unwrap_or(Value::Pointer(Ptr::null()))
    }

    pub fn set_thread_local_storage(&self, value: Value) {
        self.tls.insert(thread::current().id(), value);
    }

    /// Clear-child-id slot of the calling thread, used by thread-exit
    /// protocols; null pointer when unset.
    pub fn clear_child_tid(&self) -> Ptr {
        self.clear_child_tid
            .get(&thread::current().id())
            .map(|entry| entry.value().clone())
            .unwrap_or_else(Ptr::null)
    }

    pub fn set_clear_child_tid(&self, value: Ptr) {
        self.clear_child_tid.insert(thread::current().id(), value);
    }

    // ---- function pointers --------------------------------------------

    /// Mint a descriptor with a fresh function index.
    pub fn create_function_descriptor(
        &self,
        name: impl Into<Arc<str>>,
        signature: impl Into<Arc<str>>,
    ) -> FunctionDescriptor {
        let mut registry = self.function_pointers.lock().unwrap();
        let index = registry.next_index;
        registry.next_index += 1;
        FunctionDescriptor {
            name: name.into(),
            signature: signature.into(),
            index,
        }
    }

    pub fn register_function_pointer(&self, address: NativePtr, descriptor: FunctionDescriptor) {
        self.function_pointers
            .lock()
            .unwrap()
            .descriptors
            .insert(address, descriptor);
    }

    pub fn function_descriptor(&self, address: NativePtr) -> Option<FunctionDescriptor> {
        self.function_pointers.lock().unwrap().descriptors.get(&address).cloned()
    }

    // ---- destructors ---------------------------------------------------

    /// Track a destructor to run on program exit. Registering the same
    /// target twice is a loader bug.
    pub fn register_destructor(&self, destructor: Arc<dyn CallTarget>) {
        let mut destructors = self.destructors.lock().unwrap();
        assert!(
            !destructors.iter().any(|d| Arc::ptr_eq(d, &destructor)),
            "destructor registered twice"
        );
        destructors.push(destructor);
    }

    pub fn destructors(&self) -> Vec<Arc<dyn CallTarget>> {
        self.destructors.lock().unwrap().clone()
    }

    // ---- signals -------------------------------------------------------

    pub fn sig_dfl(&self) -> NativePtr {
        NativePtr(0)
    }

    pub fn sig_ign(&self) -> NativePtr {
        NativePtr(1)
    }

    pub fn sig_err(&self) -> NativePtr {
        NativePtr(u64::MAX)
    }

    // ---- exception plumbing -------------------------------------------

    pub fn push_caught_exception(&self, pointer: NativePtr) {
        self.caught_exceptions.lock().unwrap().push(pointer);
    }

    pub fn pop_caught_exception(&self) -> Option<NativePtr> {
        self.caught_exceptions.lock().unwrap().pop()
    }

    pub fn caught_exception_depth(&self) -> usize {
        self.caught_exceptions.lock().unwrap().len()
    }

    // ---- statistics ----------------------------------------------------

    /// Count one native call when statistics collection is enabled.
    pub fn register_native_call(&self, descriptor: &FunctionDescriptor) {
        if let Some(stats) = &self.native_call_stats {
            let key = format!("{} {}", descriptor.name(), descriptor.signature());
            *stats.lock().unwrap().entry(key).or_insert(0) += 1;
        }
    }

    /// Snapshot of the collected native-call counts, sorted ascending by
    /// count. Remains readable after `dispose`.
    pub fn native_call_statistics(&self) -> Option<Vec<(String, u64)>> {
        let stats = self.native_call_stats.as_ref()?;
        let mut entries: Vec<(String, u64)> = stats
            .lock()
            .unwrap()
            .iter()
            .map(|(name, count)| (name.clone(), *count))
            .collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Some(entries)
    }

    fn emit_native_call_statistics(&self) {
        if let Some(entries) = self.native_call_statistics() {
            for (symbol, count) in entries {
                info!(target: "cinder::ctx", %symbol, count, "native call count");
            }
        }
    }
}
