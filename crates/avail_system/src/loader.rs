//! Module-loading callbacks.
//!
//! The core never reads module source itself: the embedder supplies a
//! [`ModuleRootResolver`] (root name → directory) and a [`FileManager`]
//! (path → bytes), and the compiler drives a [`ModuleLoader`] built from
//! the two. Simple filesystem and in-memory implementations are provided
//! for hosts and tests.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use avail_base::{ErrorKind, VmError, VmResult};

/// Maps module-root names to base paths.
pub trait ModuleRootResolver: Send + Sync {
    fn resolve_root(&self, root_name: &str) -> Option<String>;
}

/// Reads file contents on behalf of the loader.
pub trait FileManager: Send + Sync {
    fn read_file(&self, path: &str) -> VmResult<Vec<u8>>;
}

/// Resolves fully qualified module names (`/Root/Path/To/Module`) to
/// source text.
pub trait ModuleLoader: Send + Sync {
    fn load_module(&self, qualified_name: &str) -> VmResult<String>;
}

/// A root resolver over a fixed name → path table.
#[derive(Default)]
pub struct MapRootResolver {
    roots: RwLock<FxHashMap<String, String>>,
}

impl MapRootResolver {
    pub fn new() -> Self {
        MapRootResolver::default()
    }

    pub fn add_root(&self, name: impl Into<String>, path: impl Into<String>) {
        self.roots.write().insert(name.into(), path.into());
    }
}

impl ModuleRootResolver for MapRootResolver {
    fn resolve_root(&self, root_name: &str) -> Option<String> {
        self.roots.read().get(root_name).cloned()
    }
}

/// A file manager over the local filesystem.
pub struct FsFileManager;

impl FileManager for FsFileManager {
    fn read_file(&self, path: &str) -> VmResult<Vec<u8>> {
        std::fs::read(path)
            .map_err(|e| VmError::with_detail(ErrorKind::NotSupported, e.to_string()))
    }
}

/// An in-memory file manager for tests and embedded sources.
#[derive(Default)]
pub struct InMemoryFileManager {
    files: RwLock<FxHashMap<String, Vec<u8>>>,
}

impl InMemoryFileManager {
    pub fn new() -> Self {
        InMemoryFileManager::default()
    }

    pub fn add_file(&self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.files.write().insert(path.into(), contents.into());
    }
}

impl FileManager for InMemoryFileManager {
    fn read_file(&self, path: &str) -> VmResult<Vec<u8>> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| VmError::with_detail(ErrorKind::NotSupported, format!("no file {path}")))
    }
}

/// The standard loader: resolve the root, join the module path, read the
/// file, decode UTF-8.
pub struct StandardLoader {
    roots: Arc<dyn ModuleRootResolver>,
    files: Arc<dyn FileManager>,
}

impl StandardLoader {
    pub fn new(roots: Arc<dyn ModuleRootResolver>, files: Arc<dyn FileManager>) -> Self {
        StandardLoader { roots, files }
    }
}

impl ModuleLoader for StandardLoader {
    fn load_module(&self, qualified_name: &str) -> VmResult<String> {
        let mut segments = qualified_name.trim_start_matches('/').splitn(2, '/');
        let root_name = segments.next().unwrap_or_default();
        let rest = segments.next().unwrap_or_default();
        let base = self.roots.resolve_root(root_name).ok_or_else(|| {
            VmError::with_detail(
                ErrorKind::NotSupported,
                format!("unknown module root {root_name:?}"),
            )
        })?;
        let path = format!("{base}/{rest}.avail");
        let bytes = self.files.read_file(&path)?;
        String::from_utf8(bytes)
            .map_err(|_| VmError::with_detail(ErrorKind::NotSupported, "module is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_loader_resolves_and_reads() {
        let roots = Arc::new(MapRootResolver::new());
        roots.add_root("avail", "/lib/avail");
        let files = Arc::new(InMemoryFileManager::new());
        files.add_file("/lib/avail/Foundation.avail", "Module \"Foundation\"");
        let loader = StandardLoader::new(roots, files);
        let source = loader.load_module("/avail/Foundation").unwrap();
        assert!(source.contains("Foundation"));
    }

    #[test]
    fn unknown_root_is_an_error() {
        let loader = StandardLoader::new(
            Arc::new(MapRootResolver::new()),
            Arc::new(InMemoryFileManager::new()),
        );
        assert!(loader.load_module("/nowhere/Module").is_err());
    }
}
