//! FFI (Foreign Function Interface) bindings for native UI shells.
//!
//! This module exposes the [`Manager`] command interface through
//! C-compatible functions that can be called from Swift, C# or C++.
//!
//! # Memory Management
//!
//! - Rust allocates memory and returns pointers to the caller
//! - The calling code MUST call the corresponding `_free` functions to prevent leaks
//! - Strings are null-terminated UTF-8
//!
//! # Errors
//!
//! Functions signal failure with a null pointer or [`CResultCode::Error`].
//! `xpm_last_error()` then returns the failure of the calling thread as JSON
//! `{"kind": "...", "message": "..."}`.
//!
//! # Usage from Swift (macOS)
//!
//! ```swift
//! let manager = xpm_manager_open(nil)
//! defer { xpm_manager_free(manager) }
//!
//! let list = xpm_scan(manager)
//! defer { xpm_free_plugin_list(list) }
//! for i in 0..<xpm_plugin_list_count(list) {
//!     let plugin = xpm_plugin_list_get(list, i)
//!     // Use plugin data...
//!     xpm_free_plugin(plugin)
//! }
//! ```

use crate::error::{ErrorReport, PluginError};
use crate::operations::Manager;
use crate::plugin::{PluginEntry, PluginState};
use crate::progress::Control;
use crate::settings::Settings;
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::path::PathBuf;
use std::ptr;

thread_local! {
    static LAST_ERROR: RefCell<Option<ErrorReport>> = const { RefCell::new(None) };
}

// ============================================================================
// C-Compatible Types
// ============================================================================

/// Opaque handle to a plugin manager session
pub struct XpmManager {
    manager: Manager,
}

/// Opaque handle to a list of plugins
pub struct XpmPluginList {
    plugins: Vec<PluginEntry>,
}

/// C-compatible plugin information
#[repr(C)]
pub struct XpmPlugin {
    pub name: *mut c_char,
    pub path: *mut c_char,
    /// 1 when enabled, 0 when disabled
    pub enabled: c_int,
}

/// Result code for operations
#[repr(C)]
#[derive(Debug, PartialEq, Eq)]
pub enum CResultCode {
    Success = 0,
    Error = 1,
}

// ============================================================================
// Session
// ============================================================================

/// Open a manager from the settings file at `settings_path`, or from the
/// default settings location when null.
/// Caller MUST call xpm_manager_free() when done.
#[no_mangle]
pub extern "C" fn xpm_manager_open(settings_path: *const c_char) -> *mut XpmManager {
    let path = if settings_path.is_null() {
        match Settings::default_path() {
            Ok(p) => p,
            Err(e) => return fail(e, ptr::null_mut()),
        }
    } else {
        match c_path(settings_path) {
            Some(p) => p,
            None => return invalid_argument(ptr::null_mut()),
        }
    };

    match Settings::load(&path).and_then(|s| s.open_manager()) {
        Ok(manager) => Box::into_raw(Box::new(XpmManager { manager })),
        Err(e) => fail(e, ptr::null_mut()),
    }
}

/// Free a manager returned by xpm_manager_open().
#[no_mangle]
pub extern "C" fn xpm_manager_free(manager: *mut XpmManager) {
    if !manager.is_null() {
        unsafe {
            let _ = Box::from_raw(manager);
        }
    }
}

// ============================================================================
// Plugin Scanning
// ============================================================================

/// Scan the plugins folder.
/// Caller MUST call xpm_free_plugin_list() when done.
#[no_mangle]
pub extern "C" fn xpm_scan(manager: *const XpmManager) -> *mut XpmPluginList {
    let Some(manager) = (unsafe { manager.as_ref() }) else {
        return invalid_argument(ptr::null_mut());
    };
    match manager.manager.scan() {
        Ok(plugins) => Box::into_raw(Box::new(XpmPluginList { plugins })),
        Err(e) => fail(e, ptr::null_mut()),
    }
}

/// Get the number of plugins in a list.
#[no_mangle]
pub extern "C" fn xpm_plugin_list_count(list: *const XpmPluginList) -> c_int {
    match unsafe { list.as_ref() } {
        Some(list) => list.plugins.len() as c_int,
        None => 0,
    }
}

/// Get plugin information at a specific index.
/// Caller MUST call xpm_free_plugin() when done.
#[no_mangle]
pub extern "C" fn xpm_plugin_list_get(list: *const XpmPluginList, index: c_int) -> *mut XpmPlugin {
    let Some(list) = (unsafe { list.as_ref() }) else {
        return ptr::null_mut();
    };
    let Some(plugin) = usize::try_from(index).ok().and_then(|i| list.plugins.get(i)) else {
        return ptr::null_mut();
    };

    Box::into_raw(Box::new(XpmPlugin {
        name: string_to_c_char(&plugin.name),
        path: string_to_c_char(&plugin.path.to_string_lossy()),
        enabled: plugin.is_enabled() as c_int,
    }))
}

/// Free a plugin list returned by xpm_scan().
#[no_mangle]
pub extern "C" fn xpm_free_plugin_list(list: *mut XpmPluginList) {
    if !list.is_null() {
        unsafe {
            let _ = Box::from_raw(list);
        }
    }
}

/// Free an XpmPlugin returned by xpm_plugin_list_get().
#[no_mangle]
pub extern "C" fn xpm_free_plugin(plugin: *mut XpmPlugin) {
    if !plugin.is_null() {
        unsafe {
            let p = Box::from_raw(plugin);
            free_c_char(p.name);
            free_c_char(p.path);
        }
    }
}

// ============================================================================
// Plugin Operations
// ============================================================================

/// Install a plugin from a `.zip` file or a folder.
#[no_mangle]
pub extern "C" fn xpm_install(
    manager: *const XpmManager,
    source: *const c_char,
    allow_overwrite: c_int,
) -> CResultCode {
    let (Some(manager), Some(source)) = (unsafe { manager.as_ref() }, c_path(source)) else {
        return invalid_argument(CResultCode::Error);
    };
    code(manager.manager.install_path(&source, allow_overwrite != 0, &Control::new()))
}

/// Back up the named plugin.
/// Returns the archive path on success, or null on error.
/// Caller MUST call xpm_free_string() when done.
#[no_mangle]
pub extern "C" fn xpm_backup(manager: *const XpmManager, name: *const c_char) -> *mut c_char {
    let (Some(manager), Some(name)) = (unsafe { manager.as_ref() }, c_str(name)) else {
        return invalid_argument(ptr::null_mut());
    };
    match manager.manager.backup_named(&name, &Control::new()) {
        Ok(backup) => string_to_c_char(&backup.archive_path.to_string_lossy()),
        Err(e) => fail(e, ptr::null_mut()),
    }
}

/// Restore a plugin from a backup archive.
#[no_mangle]
pub extern "C" fn xpm_restore(
    manager: *const XpmManager,
    archive_path: *const c_char,
    allow_overwrite: c_int,
) -> CResultCode {
    let (Some(manager), Some(path)) = (unsafe { manager.as_ref() }, c_path(archive_path)) else {
        return invalid_argument(CResultCode::Error);
    };
    code(manager.manager.restore_path(&path, allow_overwrite != 0, &Control::new()))
}

/// Enable (non-zero) or disable (zero) the named plugin.
#[no_mangle]
pub extern "C" fn xpm_set_enabled(manager: *const XpmManager, name: *const c_char, enabled: c_int) -> CResultCode {
    let (Some(manager), Some(name)) = (unsafe { manager.as_ref() }, c_str(name)) else {
        return invalid_argument(CResultCode::Error);
    };
    let state = if enabled != 0 {
        PluginState::Enabled
    } else {
        PluginState::Disabled
    };
    code(manager.manager.set_state_named(&name, state))
}

/// Delete the named plugin. Irreversible.
#[no_mangle]
pub extern "C" fn xpm_remove(manager: *const XpmManager, name: *const c_char) -> CResultCode {
    let (Some(manager), Some(name)) = (unsafe { manager.as_ref() }, c_str(name)) else {
        return invalid_argument(CResultCode::Error);
    };
    code(manager.manager.remove_named(&name))
}

/// The operation log as a JSON array, oldest first.
/// Caller MUST call xpm_free_string() when done.
#[no_mangle]
pub extern "C" fn xpm_records_json(manager: *const XpmManager) -> *mut c_char {
    let Some(manager) = (unsafe { manager.as_ref() }) else {
        return invalid_argument(ptr::null_mut());
    };
    let records = manager.manager.records(None, None);
    match serde_json::to_string(&records) {
        Ok(json) => string_to_c_char(&json),
        Err(e) => {
            tracing::error!("Failed to encode operation records: {}", e);
            ptr::null_mut()
        }
    }
}

/// Why the operation journal is not being saved, as JSON
/// `{"kind": "...", "message": "..."}`, or null while it is being saved.
/// Caller MUST call xpm_free_string() when done.
#[no_mangle]
pub extern "C" fn xpm_journal_error(manager: *const XpmManager) -> *mut c_char {
    let Some(manager) = (unsafe { manager.as_ref() }) else {
        return invalid_argument(ptr::null_mut());
    };
    match manager.manager.journal_error().map(|report| serde_json::to_string(&report)) {
        Some(Ok(json)) => string_to_c_char(&json),
        _ => ptr::null_mut(),
    }
}

// ============================================================================
// Errors and Strings
// ============================================================================

/// The last error raised on this thread as JSON, or null if none.
/// Caller MUST call xpm_free_string() when done.
#[no_mangle]
pub extern "C" fn xpm_last_error() -> *mut c_char {
    LAST_ERROR.with(|slot| match &*slot.borrow() {
        Some(report) => match serde_json::to_string(report) {
            Ok(json) => string_to_c_char(&json),
            Err(_) => ptr::null_mut(),
        },
        None => ptr::null_mut(),
    })
}

/// Free a string returned by FFI functions.
#[no_mangle]
pub extern "C" fn xpm_free_string(s: *mut c_char) {
    free_c_char(s);
}

// ============================================================================
// Helper Functions
// ============================================================================

fn fail<T>(error: PluginError, ret: T) -> T {
    tracing::debug!("ffi call failed: {}", error);
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(error.to_report()));
    ret
}

fn invalid_argument<T>(ret: T) -> T {
    fail(
        PluginError::io(
            "Invalid argument",
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        ),
        ret,
    )
}

fn code<T>(result: crate::error::Result<T>) -> CResultCode {
    match result {
        Ok(_) => CResultCode::Success,
        Err(e) => fail(e, CResultCode::Error),
    }
}

fn c_str(s: *const c_char) -> Option<String> {
    if s.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(s) }.to_str().ok().map(str::to_string)
}

fn c_path(s: *const c_char) -> Option<PathBuf> {
    c_str(s).map(PathBuf::from)
}

fn string_to_c_char(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(c_str) => c_str.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

fn free_c_char(s: *mut c_char) {
    if !s.is_null() {
        unsafe {
            let _ = CString::from_raw(s);
        }
    }
}
