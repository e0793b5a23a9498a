/********************************************************************************
 * Copyright (c) 2025 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

use core::fmt::{self, Debug, Formatter};
use std::ffi::c_char;

/// This type represents a native model object as an opaque struct.
/// Note that this struct is empty as we only use pointers to it on Rust side.
#[repr(C)]
pub struct NativeObject {
    _dummy: [u8; 0],
}

/// This type represents a native value iterator as an opaque struct.
/// Note that this struct is empty as we only use pointers to it on Rust side.
#[repr(C)]
pub struct NativeIter {
    _dummy: [u8; 0],
}

/// String view similar to C++'s std::string_view.
/// Holds a pointer to a string and its length without requiring null termination. The viewed
/// bytes are always borrowed; neither side releases them.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StringView {
    pub data: *const c_char,
    pub len: u32,
}

impl From<&'_ str> for StringView {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            StringView {
                data: std::ptr::null(),
                len: 0,
            }
        } else {
            StringView {
                data: s.as_ptr() as *const c_char,
                len: s.len() as u32,
            }
        }
    }
}

impl StringView {
    /// Reinterpret the view as a byte slice.
    ///
    /// # Safety
    ///
    /// `data` must point to at least `len` readable bytes that stay alive and unmodified for `'a`.
    pub unsafe fn as_bytes<'a>(&self) -> &'a [u8] {
        if self.data.is_null() || self.len == 0 {
            &[]
        } else {
            // SAFETY: upheld by the caller as documented above.
            unsafe { std::slice::from_raw_parts(self.data as *const u8, self.len as usize) }
        }
    }
}

impl Debug for StringView {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StringView").field("len", &self.len).finish()
    }
}

pub const NATIVE_OK: i32 = 0;
pub const NATIVE_FAILED: i32 = 1;
/// The value is not computed yet; the caller may retry later.
pub const NATIVE_TRY_AGAIN: i32 = 2;
pub const NATIVE_CANCELED: i32 = 3;
/// A callback into Rust failed and the failure could not be represented otherwise.
pub const NATIVE_UNHANDLED_CALLBACK: i32 = 4;
pub const NATIVE_NOT_FOUND: i32 = 5;

/// Error out-parameter of every fallible native entry point.
///
/// The caller zero-initializes it (`NativeError::default()`), the callee fills it on failure. A
/// non-null `message` is transferred to the caller and has to be released with the native
/// string release function exactly once.
#[repr(C)]
#[derive(Debug)]
pub struct NativeError {
    pub code: i32,
    pub message: *mut c_char,
}

impl Default for NativeError {
    fn default() -> Self {
        Self {
            code: NATIVE_OK,
            message: std::ptr::null_mut(),
        }
    }
}

impl NativeError {
    pub fn is_ok(&self) -> bool {
        self.code == NATIVE_OK
    }
}

pub const VALUE_EMPTY: u32 = 0;
pub const VALUE_BOOL: u32 = 1;
pub const VALUE_INT: u32 = 2;
pub const VALUE_UINT: u32 = 3;
pub const VALUE_DOUBLE: u32 = 4;
pub const VALUE_STRING: u32 = 5;
pub const VALUE_OBJECT: u32 = 6;
pub const VALUE_ITER: u32 = 7;

#[repr(C)]
#[derive(Clone, Copy)]
pub union NativeValuePayload {
    pub boolean: bool,
    pub int: i64,
    pub uint: u64,
    pub double: f64,
    pub string: *mut c_char,
    pub object: *mut NativeObject,
    pub iter: *mut NativeIter,
}

/// Discriminated value container of the native library.
///
/// Which payload field is valid is decided by `tag` (one of the `VALUE_*` constants). Whether
/// the pointer payloads are owned by the holder depends on the ownership convention of the call
/// that produced the value.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NativeValue {
    pub tag: u32,
    pub payload: NativeValuePayload,
}

impl Default for NativeValue {
    fn default() -> Self {
        Self::empty()
    }
}

impl NativeValue {
    pub const fn empty() -> Self {
        Self {
            tag: VALUE_EMPTY,
            payload: NativeValuePayload { uint: 0 },
        }
    }

    pub const fn boolean(value: bool) -> Self {
        Self {
            tag: VALUE_BOOL,
            payload: NativeValuePayload { boolean: value },
        }
    }

    pub const fn int(value: i64) -> Self {
        Self {
            tag: VALUE_INT,
            payload: NativeValuePayload { int: value },
        }
    }

    pub const fn uint(value: u64) -> Self {
        Self {
            tag: VALUE_UINT,
            payload: NativeValuePayload { uint: value },
        }
    }

    pub const fn double(value: f64) -> Self {
        Self {
            tag: VALUE_DOUBLE,
            payload: NativeValuePayload { double: value },
        }
    }

    pub const fn string(value: *mut c_char) -> Self {
        Self {
            tag: VALUE_STRING,
            payload: NativeValuePayload { string: value },
        }
    }

    pub const fn object(value: *mut NativeObject) -> Self {
        Self {
            tag: VALUE_OBJECT,
            payload: NativeValuePayload { object: value },
        }
    }

    pub const fn iter(value: *mut NativeIter) -> Self {
        Self {
            tag: VALUE_ITER,
            payload: NativeValuePayload { iter: value },
        }
    }
}

impl Debug for NativeValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeValue").field("tag", &self.tag).finish()
    }
}

pub const FUTURE_PENDING: u32 = 0;
pub const FUTURE_RESOLVED: u32 = 1;
pub const FUTURE_FAILED: u32 = 2;
pub const FUTURE_CANCELED: u32 = 3;
