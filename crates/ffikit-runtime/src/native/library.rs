//! Dynamic library loading
//!
//! Resolves short names (`"m"` becomes `libm.so`, `libm.dylib` or `m.dll`)
//! against platform search paths and hands out symbol addresses and
//! [`ForeignFunction`]s that keep the library mapped.

use super::{ForeignFunction, Signature};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("Library not found: {0}")]
    LibraryNotFound(String),

    #[error("Symbol '{symbol}' not found in library '{library}'")]
    SymbolNotFound { library: String, symbol: String },

    #[error("Failed to load library: {0}")]
    LoadFailed(String),
}

/// An opened dynamic library
///
/// Cloning shares the mapping; it is unloaded once the last clone and the
/// last [`ForeignFunction`] taken from it are gone.
#[derive(Clone)]
pub struct Library {
    name: String,
    path: Option<PathBuf>,
    inner: Arc<libloading::Library>,
}

impl Library {
    /// Open by path or short name using the default search paths
    ///
    /// # Safety
    ///
    /// Loading runs the library's initialisers, which may do anything.
    pub unsafe fn open(name: &str) -> Result<Self, LoadError> {
        Self::open_in(name, &default_search_paths())
    }

    /// Open by path or short name, trying `search_paths` in order
    ///
    /// # Safety
    ///
    /// Same contract as [`Library::open`].
    pub unsafe fn open_in(name: &str, search_paths: &[PathBuf]) -> Result<Self, LoadError> {
        let path = resolve_library_path(name, search_paths)
            .ok_or_else(|| LoadError::LibraryNotFound(name.to_string()))?;
        let inner =
            libloading::Library::new(&path).map_err(|e| LoadError::LoadFailed(e.to_string()))?;
        info!(library = name, path = %path.display(), "Library loaded");
        Ok(Self {
            name: name.to_string(),
            path: Some(path),
            inner: Arc::new(inner),
        })
    }

    /// The running program and everything it already links
    pub fn this() -> Result<Self, LoadError> {
        #[cfg(unix)]
        let inner: libloading::Library = libloading::os::unix::Library::this().into();
        #[cfg(windows)]
        let inner: libloading::Library = libloading::os::windows::Library::this()
            .map_err(|e| LoadError::LoadFailed(e.to_string()))?
            .into();
        Ok(Self {
            name: "<self>".to_string(),
            path: None,
            inner: Arc::new(inner),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved file, `None` for [`Library::this`]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Address of an exported symbol
    pub fn symbol(&self, name: &str) -> Result<u64, LoadError> {
        // SAFETY: only the address is read, never called through this type
        let symbol = unsafe { self.inner.get::<unsafe extern "C" fn()>(name.as_bytes()) }
            .map_err(|_| LoadError::SymbolNotFound {
                library: self.name.clone(),
                symbol: name.to_string(),
            })?;
        let address = *symbol as usize as u64;
        debug!(library = %self.name, symbol = name, address, "Symbol resolved");
        Ok(address)
    }

    /// Bind an exported function to `signature`
    ///
    /// # Safety
    ///
    /// `signature` must match the function's real C prototype.
    pub unsafe fn function(
        &self,
        name: &str,
        signature: Signature,
    ) -> Result<ForeignFunction, LoadError> {
        let address = self.symbol(name)?;
        Ok(ForeignFunction::new(address, signature).keep_alive(Arc::clone(&self.inner)))
    }

    /// Give up this handle, unloading the library if nothing else holds it
    ///
    /// Returns `true` when the library was unloaded and `false` when other
    /// clones or bound functions keep it mapped; it unloads when they drop.
    /// Unload errors reported by the platform loader surface as `LoadFailed`.
    pub fn close(self) -> Result<bool, LoadError> {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => {
                inner
                    .close()
                    .map_err(|e| LoadError::LoadFailed(e.to_string()))?;
                info!(library = %self.name, "Library unloaded");
                Ok(true)
            }
            Err(_) => {
                debug!(library = %self.name, "Library still referenced, unload deferred");
                Ok(false)
            }
        }
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

/// Platform-specific library search paths, working directory first
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/lib"));
        if cfg!(target_pointer_width = "64") {
            paths.push(PathBuf::from("/usr/lib64"));
            paths.push(PathBuf::from("/lib64"));
            paths.push(PathBuf::from("/usr/lib/x86_64-linux-gnu"));
            paths.push(PathBuf::from("/usr/lib/aarch64-linux-gnu"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/opt/homebrew/lib"));
    }

    #[cfg(target_os = "windows")]
    {
        paths.push(PathBuf::from("C:\\Windows\\System32"));
        if let Ok(system_root) = std::env::var("SystemRoot") {
            paths.push(PathBuf::from(format!("{}\\System32", system_root)));
        }
    }

    if let Ok(cwd) = std::env::current_dir() {
        paths.insert(0, cwd);
    }

    paths
}

fn resolve_library_path(name: &str, search_paths: &[PathBuf]) -> Option<PathBuf> {
    let path = Path::new(name);
    if path.components().count() > 1 || path.is_absolute() {
        return path.exists().then(|| path.to_path_buf());
    }

    let extensions: &[&str] = if cfg!(target_os = "windows") {
        &["dll"]
    } else if cfg!(target_os = "macos") {
        &["dylib", "so"]
    } else {
        &["so"]
    };
    let prefixes: &[&str] = if cfg!(target_os = "windows") {
        &["", "lib"]
    } else {
        &["lib", ""]
    };

    for dir in search_paths {
        // Exact file names such as "libc.so.6" first
        let exact = dir.join(name);
        if exact.is_file() {
            return Some(exact);
        }
        for prefix in prefixes {
            for ext in extensions {
                let candidate = dir.join(format!("{}{}.{}", prefix, name, ext));
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
    }

    None
}
