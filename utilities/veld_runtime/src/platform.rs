//! Platform abstraction over the OS shared-library loader.
//!
//! Four operations, nothing more: open, resolve, close and the error
//! text, the latter folded into the `Result` of the failing operation
//! since `libloading` captures `dlerror`/`GetLastError` itself.

use libloading::Library;
use std::path::Path;

/// Handle of an opened shared library.
pub(crate) type LibraryHandle = Library;

/// Opens the shared library at `path`.
///
/// The error string carries the platform loader's own message.
pub(crate) fn open_library(path: &Path) -> Result<LibraryHandle, String> {
    // SAFETY: opening a library runs its platform initializers. Plugin
    // libraries are bound by the entry-point contract to do no work
    // before `plugin_init` is called.
    unsafe { Library::new(path) }.map_err(|error| error.to_string())
}

/// Resolves the symbol `name` to a value of type `T`.
///
/// # Safety
///
/// `T` must match the actual type of the exported symbol.
pub(crate) unsafe fn resolve_symbol<T: Copy>(library: &LibraryHandle, name: &str) -> Option<T> {
    // SAFETY: the caller guarantees the symbol type; libloading appends
    // the trailing NUL to the name itself.
    unsafe { library.get::<T>(name.as_bytes()) }
        .ok()
        .map(|symbol| *symbol)
}

/// Closes a library handle.
///
/// Close failures are diagnostic only; there is nothing a caller could do
/// with them during teardown.
pub(crate) fn close_library(library: LibraryHandle) {
    if let Err(error) = library.close() {
        tracing::warn!(%error, "failed to close plugin library");
    }
}

/// Extension of shared libraries on this platform, without the dot
/// (`so`, `dll` or `dylib`).
pub fn shared_library_extension() -> &'static str {
    std::env::consts::DLL_EXTENSION
}
