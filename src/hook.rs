//! The C interface used by the hooking layer.
//!
//! The hooking layer intercepts the host's file functions and calls the `dwpack_redirect_*`
//! functions from its replacements. It gives us the original functions with
//! [`dwpack_redirect_install`] so that we can still reach the real files.

use std::ffi::{c_char, CStr};

use once_cell::sync::OnceCell;

use crate::{
    native::{Handle, NativeIo, ReadOutcome, Status},
    redirect::Redirector,
    settings::Options,
};

/// The value of a read offset that means "read from the current position".
pub const USE_FILE_POINTER_POSITION: i64 = -2;

/// Reads `length` bytes into `buffer`. `offset` is null to read from the current position.
pub type ReadFn = unsafe extern "C" fn(
    handle: Handle,
    buffer: *mut u8,
    length: u32,
    offset: *const i64,
    transferred: *mut usize,
) -> i32;

pub type SetPositionFn = unsafe extern "C" fn(handle: Handle, position: i64) -> i32;

/// Writes the end-of-file offset to `size`.
pub type QuerySizeFn = unsafe extern "C" fn(handle: Handle, size: *mut u64) -> i32;

/// The host's original file functions.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Originals {
    pub read: ReadFn,
    pub set_position: SetPositionFn,
    pub query_size: QuerySizeFn,
}

impl NativeIo for Originals {
    fn read(&self, handle: Handle, offset: Option<u64>, buffer: &mut [u8]) -> ReadOutcome {
        let offset = offset.map(|offset| offset as i64);
        let offset_ptr = offset
            .as_ref()
            .map_or(std::ptr::null(), |offset| offset as *const i64);

        let length = u32::try_from(buffer.len()).unwrap_or(u32::MAX);
        let mut transferred = 0usize;

        let status = unsafe {
            (self.read)(
                handle,
                buffer.as_mut_ptr(),
                length,
                offset_ptr,
                &mut transferred,
            )
        };

        ReadOutcome {
            status: Status(status),
            transferred,
        }
    }

    fn set_position(&self, handle: Handle, position: u64) -> Status {
        Status(unsafe { (self.set_position)(handle, position as i64) })
    }

    fn query_size(&self, handle: Handle) -> Result<u64, Status> {
        let mut size = 0u64;
        let status = Status(unsafe { (self.query_size)(handle, &mut size) });

        if status.is_success() {
            Ok(size)
        } else {
            Err(status)
        }
    }
}

static REDIRECTOR: OnceCell<Redirector<Originals>> = OnceCell::new();

/// Returns the installed redirector, if there is one.
fn redirector() -> Option<&'static Redirector<Originals>> {
    REDIRECTOR.get()
}

/// Converts a C string from the host into a `&str`, logging failures.
unsafe fn host_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }

    match CStr::from_ptr(ptr).to_str() {
        Ok(string) => Some(string),
        Err(err) => {
            log::warn!("Ignoring path that isn't valid UTF-8: {}", err);
            None
        }
    }
}

/// Creates the redirector. Must be called before any of the other functions do anything.
/// Returns `false` if the redirector couldn't be created or already exists.
#[no_mangle]
pub extern "C" fn dwpack_redirect_install(originals: Originals) -> bool {
    let redirector = match Redirector::new(originals, &Options::get()) {
        Ok(redirector) => redirector,
        Err(err) => {
            log::error!("Unable to create redirector: {:?}", err);
            return false;
        }
    };

    if REDIRECTOR.set(redirector).is_err() {
        log::warn!("Redirector has already been installed");
        return false;
    }

    log::info!("Redirector installed");
    true
}

/// Returns `true` if the file at `path` would be redirected when opened.
///
/// # Safety
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn dwpack_redirect_accepts_path(path: *const c_char) -> bool {
    match (redirector(), host_str(path)) {
        (Some(redirector), Some(path)) => redirector.accepts_path(path),
        _ => false,
    }
}

/// Tells the redirector that the host has opened `path` as `handle`. Returns `true` if the
/// handle is now being redirected.
///
/// # Safety
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn dwpack_redirect_on_open(path: *const c_char, handle: Handle) -> bool {
    match (redirector(), host_str(path)) {
        (Some(redirector), Some(path)) => redirector.on_open(path, handle),
        _ => false,
    }
}

/// Tells the redirector that `handle` has been closed.
#[no_mangle]
pub extern "C" fn dwpack_redirect_on_close(handle: Handle) {
    if let Some(redirector) = redirector() {
        redirector.on_close(handle);
    }
}

/// Returns `true` if `handle` is being redirected.
#[no_mangle]
pub extern "C" fn dwpack_redirect_owns(handle: Handle) -> bool {
    redirector().map_or(false, |redirector| redirector.owns(handle))
}

/// Replacement for the host's read function. Arguments are the same as `ReadFn`. An `offset`
/// holding `USE_FILE_POINTER_POSITION` is treated the same as a null one.
///
/// # Safety
/// `buffer` must be valid for `length` bytes of writes, and `offset` and `transferred` must be
/// null or valid.
#[no_mangle]
pub unsafe extern "C" fn dwpack_redirect_read(
    handle: Handle,
    buffer: *mut u8,
    length: u32,
    offset: *const i64,
    transferred: *mut usize,
) -> i32 {
    let Some(redirector) = redirector() else {
        return Status::UNSUCCESSFUL.0;
    };

    let offset = match offset.as_ref() {
        Some(&USE_FILE_POINTER_POSITION) | None => None,
        Some(&offset) if offset < 0 => None,
        Some(&offset) => Some(offset as u64),
    };

    let buffer: &mut [u8] = if length == 0 || buffer.is_null() {
        &mut []
    } else {
        std::slice::from_raw_parts_mut(buffer, length as usize)
    };

    let outcome = redirector.on_read(handle, offset, buffer);

    if let Some(transferred) = transferred.as_mut() {
        *transferred = outcome.transferred;
    }

    outcome.status.0
}

/// Replacement for the host's set-position function.
#[no_mangle]
pub extern "C" fn dwpack_redirect_set_position(handle: Handle, position: i64) -> i32 {
    match redirector() {
        Some(redirector) if position >= 0 => {
            redirector.on_set_position(handle, position as u64).0
        }
        _ => Status::UNSUCCESSFUL.0,
    }
}

/// Replacement for the host's size query.
///
/// # Safety
/// `size` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn dwpack_redirect_query_size(handle: Handle, size: *mut u64) -> i32 {
    let Some(redirector) = redirector() else {
        return Status::UNSUCCESSFUL.0;
    };

    match redirector.on_query_size(handle) {
        Ok(reported) => {
            if let Some(size) = size.as_mut() {
                *size = reported;
            }

            Status::SUCCESS.0
        }

        Err(status) => status.0,
    }
}
