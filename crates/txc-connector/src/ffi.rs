//! Raw symbol table of the connector library.
//!
//! Every export of `txmlconnector.h` has a function pointer type here. [`Api`]
//! owns the loaded [`Library`] together with the resolved pointers, so a
//! pointer can never outlive the mapping it points into: whoever holds an
//! `Arc<Api>` (connector, senders, live buffers) keeps the library loaded.

use std::ffi::{CStr, c_int, c_void};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use tracing::{debug, info};
use txc_core::{Result, TxcError};

pub type InitializeFn = unsafe extern "C" fn(*const u8, c_int) -> *mut u8;
pub type InitializeExFn = unsafe extern "C" fn(*const u8) -> *mut u8;
pub type SetLogLevelFn = unsafe extern "C" fn(c_int) -> *mut u8;
pub type SendCommandFn = unsafe extern "C" fn(*const u8) -> *mut u8;
pub type FreeMemoryFn = unsafe extern "C" fn(*mut u8) -> bool;
pub type UnInitializeFn = unsafe extern "C" fn() -> *mut u8;

/// Callback registered with `SetCallback`. Owns `data` and must release it.
pub type CallbackFn = extern "C" fn(data: *const u8) -> bool;
pub type SetCallbackFn = unsafe extern "C" fn(CallbackFn) -> bool;

/// Callback registered with `SetCallbackEx`; `ctx` is handed back verbatim.
pub type CallbackExFn = extern "C" fn(data: *const u8, ctx: *mut c_void) -> bool;
pub type SetCallbackExFn = unsafe extern "C" fn(CallbackExFn, *mut c_void) -> bool;

/// File name looked up when a directory is given instead of a library path.
#[cfg(target_arch = "x86")]
pub const DEFAULT_LIBRARY_NAME: &str = "txmlconnector.dll";
#[cfg(not(target_arch = "x86"))]
pub const DEFAULT_LIBRARY_NAME: &str = "txmlconnector64.dll";

/// Resolved exports of one loaded connector library.
pub struct Api {
    pub(crate) fn_initialize: InitializeFn,
    pub(crate) fn_initialize_ex: Option<InitializeExFn>,
    pub(crate) fn_set_log_level: SetLogLevelFn,
    pub(crate) fn_send_command: SendCommandFn,
    pub(crate) fn_set_callback: Option<SetCallbackFn>,
    pub(crate) fn_set_callback_ex: SetCallbackExFn,
    pub(crate) fn_free_memory: FreeMemoryFn,
    pub(crate) fn_uninitialize: UnInitializeFn,
    pub(crate) path: Option<PathBuf>,
    pub(crate) lib: Option<Library>,
}

impl Api {
    /// Load the library at `path` and resolve its exports.
    ///
    /// `InitializeEx` and `SetCallback` are optional, older builds lack them;
    /// the rest are mandatory.
    pub fn load(path: &Path) -> Result<Arc<Api>> {
        info!("loading connector library {}", path.display());

        // SAFETY: loading runs the library's initialisers; the path is
        // expected to name the connector, which has no unusual load-time
        // requirements.
        let lib = unsafe { Library::new(path) }
            .map_err(|e| TxcError::Load(format!("{}: {e}", path.display())))?;

        // SAFETY: the pointer types mirror the declarations of
        // txmlconnector.h; the library stays alive as long as the table.
        let api = unsafe {
            Api {
                fn_initialize: required(&lib, b"Initialize\0")?,
                fn_initialize_ex: optional(&lib, b"InitializeEx\0"),
                fn_set_log_level: required(&lib, b"SetLogLevel\0")?,
                fn_send_command: required(&lib, b"SendCommand\0")?,
                fn_set_callback: optional(&lib, b"SetCallback\0"),
                fn_set_callback_ex: required(&lib, b"SetCallbackEx\0")?,
                fn_free_memory: required(&lib, b"FreeMemory\0")?,
                fn_uninitialize: required(&lib, b"UnInitialize\0")?,
                path: Some(path.to_path_buf()),
                lib: Some(lib),
            }
        };
        debug!("connector exports resolved: {api:?}");
        Ok(Arc::new(api))
    }

    pub fn has_initialize_ex(&self) -> bool {
        self.fn_initialize_ex.is_some()
    }

    pub fn has_set_callback(&self) -> bool {
        self.fn_set_callback.is_some()
    }

    /// Whether the table is backed by a dynamically loaded library.
    pub fn is_dynamic(&self) -> bool {
        self.lib.is_some()
    }

    #[inline]
    pub(crate) fn initialize(&self, log_path: &CStr, log_level: c_int) -> *mut u8 {
        // SAFETY: NUL-terminated argument, valid for the call.
        unsafe { (self.fn_initialize)(log_path.as_ptr().cast(), log_level) }
    }

    /// `None` when the export is absent.
    #[inline]
    pub(crate) fn initialize_ex(&self, xml: &CStr) -> Option<*mut u8> {
        // SAFETY: as for `initialize`.
        self.fn_initialize_ex.map(|f| unsafe { f(xml.as_ptr().cast()) })
    }

    #[inline]
    pub(crate) fn set_log_level(&self, log_level: c_int) -> *mut u8 {
        // SAFETY: plain integer argument.
        unsafe { (self.fn_set_log_level)(log_level) }
    }

    #[inline]
    pub(crate) fn send_command(&self, command: &CStr) -> *mut u8 {
        // SAFETY: NUL-terminated argument; the connector copies it before
        // returning.
        unsafe { (self.fn_send_command)(command.as_ptr().cast()) }
    }

    /// # Safety
    /// `ctx` must stay valid and `callback` must accept it until the
    /// connector is uninitialized or another callback is installed.
    #[inline]
    pub(crate) unsafe fn set_callback_ex(&self, callback: CallbackExFn, ctx: *mut c_void) -> bool {
        unsafe { (self.fn_set_callback_ex)(callback, ctx) }
    }

    /// # Safety
    /// `callback` must release every buffer it receives with `FreeMemory`.
    #[inline]
    pub(crate) unsafe fn set_callback(&self, callback: CallbackFn) -> Option<bool> {
        self.fn_set_callback.map(|f| unsafe { f(callback) })
    }

    /// # Safety
    /// `buffer` must come from this connector and not have been released.
    #[inline]
    pub(crate) unsafe fn free_memory(&self, buffer: *mut u8) -> bool {
        unsafe { (self.fn_free_memory)(buffer) }
    }

    #[inline]
    pub(crate) fn uninitialize(&self) -> *mut u8 {
        // SAFETY: no arguments.
        unsafe { (self.fn_uninitialize)() }
    }
}

impl fmt::Debug for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api")
            .field("path", &self.path)
            .field("initialize_ex", &self.has_initialize_ex())
            .field("set_callback", &self.has_set_callback())
            .finish()
    }
}

unsafe fn required<T: Copy + 'static>(lib: &Library, name: &'static [u8]) -> Result<T> {
    // SAFETY: forwarded to the caller; `T` matches the export's signature.
    unsafe { lib.get::<T>(name) }
        .map(|sym| *sym)
        .map_err(|e| TxcError::Load(format!("missing export {}: {e}", symbol_name(name))))
}

unsafe fn optional<T: Copy + 'static>(lib: &Library, name: &'static [u8]) -> Option<T> {
    match unsafe { required(lib, name) } {
        Ok(f) => Some(f),
        Err(_) => {
            debug!("optional export {} not present", symbol_name(name));
            None
        }
    }
}

fn symbol_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)).into_owned()
}

/// Turn a configured location into the library file to load.
///
/// A directory gets [`DEFAULT_LIBRARY_NAME`] appended; the result must exist.
pub fn resolve_library_path(path: &Path) -> Result<PathBuf> {
    let file = if path.is_dir() {
        path.join(DEFAULT_LIBRARY_NAME)
    } else {
        path.to_path_buf()
    };
    if file.is_file() {
        Ok(file)
    } else {
        Err(TxcError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("connector library {} does not exist", file.display()),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("txc-ffi-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn directory_gets_default_name() {
        let dir = scratch_dir("dir");
        let lib = dir.join(DEFAULT_LIBRARY_NAME);
        std::fs::write(&lib, b"").unwrap();
        assert_eq!(resolve_library_path(&dir).unwrap(), lib);
        assert_eq!(resolve_library_path(&lib).unwrap(), lib);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_library_is_not_found() {
        let dir = scratch_dir("missing");
        match resolve_library_path(&dir) {
            Err(TxcError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected {other:?}"),
        }
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn load_reports_bad_file() {
        let dir = scratch_dir("bad");
        let lib = dir.join(DEFAULT_LIBRARY_NAME);
        std::fs::write(&lib, b"not a library").unwrap();
        assert!(matches!(Api::load(&lib), Err(TxcError::Load(_))));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn symbol_names_drop_terminator() {
        assert_eq!(symbol_name(b"FreeMemory\0"), "FreeMemory");
    }
}
