//! Library resolution and dynamic linking state.
//!
//! The loader resolves library names through the ordered search path,
//! registers the resulting descriptors (deduplicated by `(name, path)`
//! identity), and appends each library's symbol scope to the link chain.
//! Symbol resolution order across the chain is insertion order; the chain
//! itself is a pure ordered store and never inspects scope contents.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::val::{CallTarget, Value};

/// Error raised when an absolute library path does not exist on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryNotFound(pub String);

impl fmt::Display for LibraryNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "library \"{}\" does not exist", self.0)
    }
}

impl std::error::Error for LibraryNotFound {}

/// Ordered, de-duplicated list of directories searched during library
/// resolution.
#[derive(Debug, Clone, Default)]
pub struct LibrarySearchPath {
    dirs: Vec<PathBuf>,
}

impl LibrarySearchPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `path` if it is an existing directory not already present.
    /// Non-directories are silently ignored; callers may pass speculative
    /// paths.
    pub fn add_directory(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if path.is_dir() && !self.dirs.contains(&path) {
            trace!(target: "cinder::link", dir = %path.display(), "search directory added");
            self.dirs.push(path);
        }
    }

    pub fn add_directories<I, P>(&mut self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for path in paths {
            self.add_directory(path);
        }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Resolve a library name to a filesystem path.
    ///
    /// An absolute name must exist on disk. A relative name is searched
    /// through the directories in insertion order; the first existing
    /// candidate wins. `Ok(None)` means unresolved, not an error: a
    /// native loader may still find the library through OS-level mechanisms.
    pub fn resolve(&self, name: &str) -> Result<Option<PathBuf>> {
        let requested = Path::new(name);
        if requested.is_absolute() {
            if requested.exists() {
                return Ok(Some(requested.to_path_buf()));
            }
            return Err(anyhow::Error::new(LibraryNotFound(name.to_string())));
        }

        for dir in &self.dirs {
            let candidate = dir.join(requested);
            if candidate.exists() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}

/// Descriptor for one linked external library. Identity is `(name, path)`;
/// the native flag never participates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalLibrary {
    name: String,
    path: Option<PathBuf>,
    is_native: bool,
}

impl ExternalLibrary {
    /// Build a descriptor from a resolved path; the name is the file stem.
    pub fn from_path(path: PathBuf, is_native: bool) -> Self {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            name,
            path: Some(path),
            is_native,
        }
    }

    /// Build a descriptor for a name the search path could not resolve.
    pub fn unresolved(name: impl Into<String>, is_native: bool) -> Self {
        Self {
            name: name.into(),
            path: None,
            is_native,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_native(&self) -> bool {
        self.is_native
    }
}

impl PartialEq for ExternalLibrary {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.path == other.path
    }
}

impl Eq for ExternalLibrary {}

impl Hash for ExternalLibrary {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.path.hash(state);
    }
}

impl fmt::Display for ExternalLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{} ({})", self.name, path.display()),
            None => write!(f, "{}", self.name),
        }
    }
}

/// De-duplicated set of loaded library descriptors.
#[derive(Debug, Default)]
pub struct ExternalLibraryRegistry {
    libraries: Vec<Arc<ExternalLibrary>>,
}

impl ExternalLibraryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `name` and insert the resulting descriptor. Returns the new
    /// entry, or `None` when an equal entry already exists; the caller skips
    /// re-processing an already-linked library.
    pub fn register(
        &mut self,
        search_path: &LibrarySearchPath,
        name: &str,
        is_native: bool,
    ) -> Result<Option<Arc<ExternalLibrary>>> {
        let library = match search_path.resolve(name)? {
            Some(path) => ExternalLibrary::from_path(path, is_native),
            None => ExternalLibrary::unresolved(name, is_native),
        };
        if self.libraries.iter().any(|existing| **existing == library) {
            debug!(target: "cinder::link", library = %library, "already linked, skipping");
            return Ok(None);
        }
        debug!(target: "cinder::link", library = %library, is_native, "library registered");
        let library = Arc::new(library);
        self.libraries.push(library.clone());
        Ok(Some(library))
    }

    pub fn len(&self) -> usize {
        self.libraries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ExternalLibrary>> {
        self.libraries.iter()
    }

    /// Snapshot of the libraries matching `filter`.
    pub fn filter(&self, filter: impl Fn(&ExternalLibrary) -> bool) -> Vec<Arc<ExternalLibrary>> {
        self.libraries.iter().filter(|l| filter(l)).cloned().collect()
    }
}

/// Opaque symbol namespace contributed by one linked library.
///
/// Scopes are shared by reference; identity is the allocation, so a scope can
/// appear in the link chain at most once regardless of how it is cloned.
#[derive(Debug, Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

#[derive(Debug)]
struct ScopeInner {
    name: Arc<str>,
    symbols: Mutex<FxHashMap<Arc<str>, Value>>,
}

impl Scope {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                name: name.into(),
                symbols: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Bind `symbol` in this scope, replacing any previous binding.
    pub fn define(&self, symbol: impl Into<Arc<str>>, value: Value) {
        self.inner.symbols.lock().unwrap().insert(symbol.into(), value);
    }

    pub fn get(&self, symbol: &str) -> Option<Value> {
        self.inner.symbols.lock().unwrap().get(symbol).cloned()
    }

    /// Look up a symbol bound to a call target.
    pub fn get_function(&self, symbol: &str) -> Result<Arc<dyn CallTarget>> {
        match self.get(symbol) {
            Some(Value::Function(target)) => Ok(target),
            Some(other) => Err(anyhow!(
                "symbol {symbol} in scope {} is not callable: {other:?}",
                self.name()
            )),
            None => Err(anyhow!("symbol {symbol} not defined in scope {}", self.name())),
        }
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Scope {}

impl Hash for Scope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

/// Ordered sequence of symbol scopes accumulated as libraries are linked.
/// Append-only; scopes live for the context's lifetime.
#[derive(Debug, Default)]
pub struct DynamicLinkChain {
    scopes: Vec<Scope>,
}

impl DynamicLinkChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_scopes(&mut self, scopes: &[Scope]) {
        for scope in scopes {
            self.append_scope(scope.clone());
        }
    }

    fn append_scope(&mut self, scope: Scope) {
        // A duplicate here means the loader linked the same library twice.
        assert!(
            !self.scopes.contains(&scope),
            "scope {} already present in the link chain",
            scope.name()
        );
        trace!(target: "cinder::link", scope = scope.name(), "scope appended");
        self.scopes.push(scope);
    }

    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}
