//! C ABI over a process-wide handle table backed by the platform
//! collaborators.
//!
//! ```c
//! int   nettask_start(const char *settings);
//! char *nettask_wait_for_next_event(int handle);
//! void  nettask_event_free(char *event);
//! int   nettask_is_done(int handle);
//! void  nettask_interrupt(int handle);
//! void  nettask_destroy(int handle);
//! ```

use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::event::BUG_JSON_DUMP;
use crate::handles::HandleTable;
use std::ffi::{c_char, c_int, CStr, CString};
use std::sync::OnceLock;

fn table() -> &'static HandleTable {
    static TABLE: OnceLock<HandleTable> = OnceLock::new();
    TABLE.get_or_init(|| HandleTable::new(EngineContext::default_platform(EngineConfig::default())))
}

fn to_handle(handle: c_int) -> u32 {
    u32::try_from(handle).unwrap_or(0)
}

/// Start a task. Returns 0 for a null pointer, invalid UTF-8 or a full table.
///
/// # Safety
/// `settings` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn nettask_start(settings: *const c_char) -> c_int {
    if settings.is_null() {
        return 0;
    }
    let text = match CStr::from_ptr(settings).to_str() {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "settings are not valid UTF-8");
            return 0;
        }
    };
    c_int::try_from(table().start(Some(text))).unwrap_or(0)
}

/// Next event as a NUL-terminated JSON string; release with [`nettask_event_free`].
#[no_mangle]
pub extern "C" fn nettask_wait_for_next_event(handle: c_int) -> *mut c_char {
    let event = table().wait_for_next_event(to_handle(handle));
    CString::new(event)
        .or_else(|_| CString::new(BUG_JSON_DUMP))
        .map(CString::into_raw)
        .unwrap_or(std::ptr::null_mut())
}

/// # Safety
/// `event` must be null or come from [`nettask_wait_for_next_event`], and is
/// released at most once.
#[no_mangle]
pub unsafe extern "C" fn nettask_event_free(event: *mut c_char) {
    if !event.is_null() {
        drop(CString::from_raw(event));
    }
}

#[no_mangle]
pub extern "C" fn nettask_is_done(handle: c_int) -> c_int {
    c_int::from(table().is_done(to_handle(handle)))
}

#[no_mangle]
pub extern "C" fn nettask_interrupt(handle: c_int) {
    table().interrupt(to_handle(handle));
}

#[no_mangle]
pub extern "C" fn nettask_destroy(handle: c_int) {
    table().destroy(to_handle(handle));
}
