pub mod ctx;
pub mod globals;
pub mod handles;
pub mod layout;
pub mod link;
pub mod mem;
pub mod obj;
pub mod ptr;
pub mod threads;
pub mod val;

pub use ctx::{ContextOptions, ExecutionContext, FunctionDescriptor};
pub use globals::{Global, GlobalDirectory};
pub use handles::{HandleTable, UnresolvedHandle};
pub use layout::{DataLayout, LayoutEntry, Type};
pub use link::{
    DynamicLinkChain, ExternalLibrary, ExternalLibraryRegistry, LibraryNotFound, LibrarySearchPath, Scope,
};
pub use mem::{EmulatedMemory, EngineMemory, StackFrame, ThreadingStack};
pub use obj::{GlobalContainer, Managed};
pub use ptr::{InteropType, ManagedPtr, NativePtr, Ptr};
pub use threads::{InterpreterThread, ThreadRegistry};
pub use val::{CallTarget, Unwind, Value};
