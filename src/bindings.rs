//! C Bindings for MelShare
//!
//! Maps are addressed by name through the process-wide [`MapRegistry`].
//! Every function returns an `int` status:
//!
//! - `>= 0`: success. Reads return the number of elements copied,
//!   `melshare_get_size` returns the payload size in bytes, everything else 0.
//! - `< 0`: one of the `MELSHARE_ERR_*` codes below.

use crate::error::MapError;
use crate::frame::Scalar;
use crate::registry::MapRegistry;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::slice;

pub const MELSHARE_OK: c_int = 0;
pub const MELSHARE_ERR_SEGMENT: c_int = -1;
pub const MELSHARE_ERR_LOCK: c_int = -2;
pub const MELSHARE_ERR_ABANDONED: c_int = -3;
pub const MELSHARE_ERR_TIMEOUT: c_int = -4;
pub const MELSHARE_ERR_TOO_LARGE: c_int = -5;
pub const MELSHARE_ERR_CORRUPT: c_int = -6;
pub const MELSHARE_ERR_OUT_OF_RANGE: c_int = -7;
pub const MELSHARE_ERR_CLOSED: c_int = -8;
pub const MELSHARE_ERR_INVALID: c_int = -9;

fn error_code(err: &MapError) -> c_int {
    match err {
        MapError::Segment { .. } | MapError::InvalidCapacity { .. } => MELSHARE_ERR_SEGMENT,
        MapError::Lock { .. } => MELSHARE_ERR_LOCK,
        MapError::LockAbandoned { .. } => MELSHARE_ERR_ABANDONED,
        MapError::LockTimeout { .. } => MELSHARE_ERR_TIMEOUT,
        MapError::PayloadTooLarge { .. } => MELSHARE_ERR_TOO_LARGE,
        MapError::CorruptFrame { .. } => MELSHARE_ERR_CORRUPT,
        MapError::OutOfRange { .. } => MELSHARE_ERR_OUT_OF_RANGE,
        MapError::HandleClosed | MapError::NotOpen(_) => MELSHARE_ERR_CLOSED,
        MapError::InvalidName { .. } | MapError::NameTooLong { .. } | MapError::Encode { .. } => {
            MELSHARE_ERR_INVALID
        }
    }
}

fn status(result: crate::Result<usize>) -> c_int {
    match result {
        Ok(n) => c_int::try_from(n).unwrap_or(MELSHARE_ERR_OUT_OF_RANGE),
        Err(e) => error_code(&e),
    }
}

unsafe fn name_arg<'a>(name: *const c_char) -> Option<&'a str> {
    if name.is_null() {
        return None;
    }
    CStr::from_ptr(name).to_str().ok()
}

unsafe fn input<'a, T>(data: *const T, len: usize) -> Option<&'a [T]> {
    if len == 0 {
        Some(&[])
    } else if data.is_null() {
        None
    } else {
        Some(slice::from_raw_parts(data, len))
    }
}

unsafe fn read_map<T: Scalar>(name: *const c_char, buf: *mut T, buf_len: usize) -> c_int {
    let Some(name) = name_arg(name) else {
        return MELSHARE_ERR_INVALID;
    };
    let values = match MapRegistry::global()
        .get(name)
        .and_then(|map| map.read_scalars::<T>())
    {
        Ok(values) => values,
        Err(e) => return error_code(&e),
    };
    if values.len() > buf_len || (buf.is_null() && !values.is_empty()) {
        return MELSHARE_ERR_INVALID;
    }
    if !values.is_empty() {
        std::ptr::copy_nonoverlapping(values.as_ptr(), buf, values.len());
    }
    status(Ok(values.len()))
}

unsafe fn write_map<T: Scalar>(name: *const c_char, data: *const T, len: usize) -> c_int {
    let (Some(name), Some(data)) = (name_arg(name), input(data, len)) else {
        return MELSHARE_ERR_INVALID;
    };
    status(
        MapRegistry::global()
            .get(name)
            .and_then(|map| map.write_scalars(data))
            .map(|()| 0),
    )
}

/// Open or create a map, adding a reference to it
///
/// # Safety
/// name must be a valid null-terminated string
#[no_mangle]
pub unsafe extern "C" fn melshare_open(name: *const c_char, capacity: usize) -> c_int {
    let Some(name) = name_arg(name) else {
        return MELSHARE_ERR_INVALID;
    };
    status(MapRegistry::global().open_or_create(name, capacity).map(|_| 0))
}

/// Open an existing map, adding a reference to it
#[no_mangle]
pub unsafe extern "C" fn melshare_open_only(name: *const c_char) -> c_int {
    let Some(name) = name_arg(name) else {
        return MELSHARE_ERR_INVALID;
    };
    status(MapRegistry::global().open_only(name).map(|_| 0))
}

/// Drop one reference; the last one closes the map
#[no_mangle]
pub unsafe extern "C" fn melshare_close(name: *const c_char) -> c_int {
    let Some(name) = name_arg(name) else {
        return MELSHARE_ERR_INVALID;
    };
    status(MapRegistry::global().close(name).map(|()| 0))
}

/// Current payload size in bytes
#[no_mangle]
pub unsafe extern "C" fn melshare_get_size(name: *const c_char) -> c_int {
    let Some(name) = name_arg(name) else {
        return MELSHARE_ERR_INVALID;
    };
    status(MapRegistry::global().get_size(name))
}

#[no_mangle]
pub unsafe extern "C" fn melshare_read_bytes(name: *const c_char, buf: *mut u8, buf_len: usize) -> c_int {
    read_map(name, buf, buf_len)
}

#[no_mangle]
pub unsafe extern "C" fn melshare_read_ints(name: *const c_char, buf: *mut i32, buf_len: usize) -> c_int {
    read_map(name, buf, buf_len)
}

#[no_mangle]
pub unsafe extern "C" fn melshare_read_floats(name: *const c_char, buf: *mut f32, buf_len: usize) -> c_int {
    read_map(name, buf, buf_len)
}

#[no_mangle]
pub unsafe extern "C" fn melshare_read_doubles(name: *const c_char, buf: *mut f64, buf_len: usize) -> c_int {
    read_map(name, buf, buf_len)
}

/// Copy the text payload and its terminator into `buf`
///
/// Returns the text length excluding the terminator.
#[no_mangle]
pub unsafe extern "C" fn melshare_read_text(name: *const c_char, buf: *mut c_char, buf_len: usize) -> c_int {
    let Some(name) = name_arg(name) else {
        return MELSHARE_ERR_INVALID;
    };
    let text = match MapRegistry::global().read_text(name) {
        Ok(text) => text,
        Err(e) => return error_code(&e),
    };
    if buf.is_null() || text.len() + 1 > buf_len {
        return MELSHARE_ERR_INVALID;
    }
    std::ptr::copy_nonoverlapping(text.as_ptr().cast::<c_char>(), buf, text.len());
    *buf.add(text.len()) = 0;
    status(Ok(text.len()))
}

#[no_mangle]
pub unsafe extern "C" fn melshare_write_bytes(name: *const c_char, data: *const u8, len: usize) -> c_int {
    write_map(name, data, len)
}

#[no_mangle]
pub unsafe extern "C" fn melshare_write_ints(name: *const c_char, data: *const i32, len: usize) -> c_int {
    write_map(name, data, len)
}

#[no_mangle]
pub unsafe extern "C" fn melshare_write_floats(name: *const c_char, data: *const f32, len: usize) -> c_int {
    write_map(name, data, len)
}

#[no_mangle]
pub unsafe extern "C" fn melshare_write_doubles(name: *const c_char, data: *const f64, len: usize) -> c_int {
    write_map(name, data, len)
}

/// Write a null-terminated string as a text payload
#[no_mangle]
pub unsafe extern "C" fn melshare_write_text(name: *const c_char, text: *const c_char) -> c_int {
    let (Some(name), Some(text)) = (name_arg(name), name_arg(text)) else {
        return MELSHARE_ERR_INVALID;
    };
    status(MapRegistry::global().write_text(name, text).map(|()| 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::unique_name;
    use std::ffi::CString;

    #[test]
    fn test_c_round_trip() {
        let name = CString::new(unique_name("ffi_round_trip")).unwrap();
        unsafe {
            assert_eq!(melshare_open(name.as_ptr(), 64), MELSHARE_OK);

            let values = [1.0f64, 2.0, 3.0];
            assert_eq!(
                melshare_write_doubles(name.as_ptr(), values.as_ptr(), values.len()),
                MELSHARE_OK
            );
            assert_eq!(melshare_get_size(name.as_ptr()), 24);

            let mut out = [0f64; 8];
            assert_eq!(melshare_read_doubles(name.as_ptr(), out.as_mut_ptr(), out.len()), 3);
            assert_eq!(&out[..3], &values);

            // Buffer too small for the payload
            let mut small = [0f64; 2];
            assert_eq!(
                melshare_read_doubles(name.as_ptr(), small.as_mut_ptr(), small.len()),
                MELSHARE_ERR_INVALID
            );

            let too_big = [0i32; 32];
            assert_eq!(
                melshare_write_ints(name.as_ptr(), too_big.as_ptr(), too_big.len()),
                MELSHARE_ERR_TOO_LARGE
            );

            assert_eq!(melshare_close(name.as_ptr()), MELSHARE_OK);
            assert_eq!(melshare_close(name.as_ptr()), MELSHARE_ERR_CLOSED);
        }
    }

    #[test]
    fn test_c_text() {
        let name = CString::new(unique_name("ffi_text")).unwrap();
        let text = CString::new("hi").unwrap();
        unsafe {
            assert_eq!(melshare_open(name.as_ptr(), 16), MELSHARE_OK);
            assert_eq!(melshare_write_text(name.as_ptr(), text.as_ptr()), MELSHARE_OK);
            assert_eq!(melshare_get_size(name.as_ptr()), 3);

            let mut buf = [0 as c_char; 16];
            assert_eq!(melshare_read_text(name.as_ptr(), buf.as_mut_ptr(), buf.len()), 2);
            assert_eq!(CStr::from_ptr(buf.as_ptr()).to_str().unwrap(), "hi");

            let mut ints = [0i32; 4];
            assert_eq!(
                melshare_read_ints(name.as_ptr(), ints.as_mut_ptr(), ints.len()),
                MELSHARE_ERR_CORRUPT
            );
            assert_eq!(melshare_close(name.as_ptr()), MELSHARE_OK);
        }
    }

    #[test]
    fn test_c_rejects_null_arguments() {
        unsafe {
            assert_eq!(melshare_open(std::ptr::null(), 64), MELSHARE_ERR_INVALID);
            let name = CString::new(unique_name("ffi_null")).unwrap();
            assert_eq!(
                melshare_write_bytes(name.as_ptr(), std::ptr::null(), 4),
                MELSHARE_ERR_INVALID
            );
        }
    }
}
