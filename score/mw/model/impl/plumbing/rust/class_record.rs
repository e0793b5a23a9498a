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

//! Callback signatures and the class record through which the native library dispatches the
//! overridable model capabilities.
//!
//! Ownership convention of the slots:
//! - `name` views and input values are borrowed for the duration of the call.
//! - `out_value` is transferred to the caller, who clears it with the native value release
//!   function.
//! - The object returned by `add_child` carries one reference that is transferred to the caller.
//! - `child` passed to `del_child` is borrowed.

use core::fmt::{self, Debug, Formatter};
use std::ffi::c_void;

use crate::common::{NativeError, NativeObject, NativeValue, StringView};

/// Invoked by the native side whenever a connected event is raised. `payload` points to the
/// event's record type, or is NULL for events without payload.
pub type EventCallback =
    unsafe extern "C" fn(object: *mut NativeObject, payload: *const c_void, user_data: *mut c_void);

/// Releases callback state once the native side will never use `user_data` again.
pub type DestroyNotify = unsafe extern "C" fn(user_data: *mut c_void);

/// Invoked once a native future reached a terminal state.
pub type FutureCallback = unsafe extern "C" fn(future: *mut NativeObject, user_data: *mut c_void);

pub type GetPropertySlot = unsafe extern "C" fn(
    object: *mut NativeObject,
    name: StringView,
    out_value: *mut NativeValue,
    error: *mut NativeError,
) -> bool;

pub type SetPropertySlot = unsafe extern "C" fn(
    object: *mut NativeObject,
    name: StringView,
    value: *const NativeValue,
    out_value: *mut NativeValue,
    error: *mut NativeError,
) -> bool;

pub type GetChildrenCountSlot =
    unsafe extern "C" fn(object: *mut NativeObject, error: *mut NativeError) -> u32;

pub type AddChildSlot =
    unsafe extern "C" fn(object: *mut NativeObject, error: *mut NativeError) -> *mut NativeObject;

pub type DelChildSlot = unsafe extern "C" fn(
    object: *mut NativeObject,
    child: *mut NativeObject,
    error: *mut NativeError,
) -> bool;

/// Per-type table of the overridable capabilities. The native library copies the record on type
/// registration.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ModelClass {
    pub get_property: GetPropertySlot,
    pub set_property: SetPropertySlot,
    pub get_children_count: GetChildrenCountSlot,
    pub add_child: AddChildSlot,
    pub del_child: DelChildSlot,
}

impl Debug for ModelClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelClass").finish()
    }
}

#[cfg(all(test, target_pointer_width = "64"))]
mod tests {
    use super::ModelClass;
    use crate::test_utils::SizeInfo;
    use crate::verify_size_and_align;

    #[test]
    fn test_model_class_size() {
        let native = SizeInfo { size: 40, align: 8 };
        verify_size_and_align!(ModelClass, native, "ModelClass");
    }
}
