//! Library entry point and initialization levels

use std::ffi::c_void;

use crate::interface::HostInterface;

/// Engine startup phase. The host initializes in ascending order and
/// deinitializes in descending order.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InitializationLevel {
    /// Core types, before any server exists
    Core = 0,
    /// Rendering, physics and audio servers
    Servers = 1,
    /// Scene classes; the usual level for extension classes
    Scene = 2,
    /// Editor-only classes
    Editor = 3,
}

impl InitializationLevel {
    /// All levels in initialization order
    pub const ALL: [InitializationLevel; 4] = [
        InitializationLevel::Core,
        InitializationLevel::Servers,
        InitializationLevel::Scene,
        InitializationLevel::Editor,
    ];
}

/// Called once per level at or above `minimum_level`
pub type InitializeFn = unsafe extern "C" fn(userdata: *mut c_void, level: InitializationLevel);

/// Called once per level, in reverse order, at unload
pub type DeinitializeFn = unsafe extern "C" fn(userdata: *mut c_void, level: InitializationLevel);

/// Filled in by the extension's entry point
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ExtensionInitialization {
    /// Lowest level the extension wants callbacks for
    pub minimum_level: InitializationLevel,
    /// Passed back to `initialize` and `deinitialize`
    pub userdata: *mut c_void,
    /// Level-up callback
    pub initialize: Option<InitializeFn>,
    /// Level-down callback
    pub deinitialize: Option<DeinitializeFn>,
}

impl Default for ExtensionInitialization {
    fn default() -> Self {
        Self {
            minimum_level: InitializationLevel::Scene,
            userdata: std::ptr::null_mut(),
            initialize: None,
            deinitialize: None,
        }
    }
}

/// Signature of the symbol the host looks up when loading the library.
/// Returns false when the extension cannot run against this host.
pub type EntryPointFn = unsafe extern "C" fn(
    interface: *const HostInterface,
    library: *mut c_void,
    init: *mut ExtensionInitialization,
) -> bool;
