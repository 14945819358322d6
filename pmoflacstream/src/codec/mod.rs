//! Thin owners of the libFLAC decoder and encoder handles.
//!
//! These types hold the raw handles, register the C callbacks and translate
//! them into calls on a handler trait. They know nothing about channels or
//! async code; the session modules drive them from a blocking thread.

pub(crate) mod decoder;
pub(crate) mod encoder;
pub mod metadata;

use std::{
    ffi::{CStr, CString, c_char},
    path::Path,
};

use libflac_sys::FLAC__bool;

use crate::error::FlacError;

pub(crate) fn flac_bool(value: bool) -> FLAC__bool {
    if value { 1 } else { 0 }
}

pub(crate) fn c_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

pub(crate) fn path_to_cstring(path: &Path) -> Result<CString, FlacError> {
    let text = path.to_str().ok_or_else(|| {
        FlacError::InvalidOption(format!("path is not valid UTF-8: {}", path.display()))
    })?;
    CString::new(text)
        .map_err(|_| FlacError::InvalidOption(format!("path contains a NUL byte: {text}")))
}
