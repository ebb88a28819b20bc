use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Construction-time configuration for an execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextOptions {
    /// Size of the main interpreter stack, in KiB.
    pub stack_size_kb: usize,
    /// Collect per-symbol native call counts and emit them at dispose time.
    pub native_call_stats: bool,
    /// Initial library search directories. Non-directories are ignored.
    pub library_paths: Vec<PathBuf>,
    /// Program arguments. argv[0] is reserved empty and patched by program
    /// start once the real program path is known.
    pub main_arguments: Vec<String>,
    /// Environment presented to interpreted code; `None` snapshots the host
    /// environment at construction.
    pub environment: Option<Vec<(String, String)>>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            stack_size_kb: 8 * 1024,
            native_call_stats: false,
            library_paths: Vec::new(),
            main_arguments: Vec::new(),
            environment: None,
        }
    }
}
