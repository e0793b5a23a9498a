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

///This module gives the same memory layout as the event payload records of the native model
///library. The native side hands a pointer to one of these records to every event callback; the
///record and everything it points to is borrowed for the duration of the callback only.
use core::fmt::Debug;
use std::ffi::c_char;

use crate::common::NativeObject;

/// Payload of the `properties-changed` event.
///
/// Both members point to NULL-terminated arrays of NUL-terminated property names. A NULL array
/// is equivalent to an empty one.
#[repr(C)]
pub struct PropertiesChangedRecord {
    pub changed: *const *const c_char,
    pub invalidated: *const *const c_char,
}

/// Payload of the `child-added` and `child-removed` events.
///
/// `index` is an ordinal hint only. `child` is borrowed and may be NULL if the native side no
/// longer has a live reference to hand out.
#[repr(C)]
pub struct ChildEventRecord {
    pub index: u32,
    pub child: *mut NativeObject,
}

impl Debug for PropertiesChangedRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PropertiesChangedRecord").finish()
    }
}

impl Debug for ChildEventRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChildEventRecord")
            .field("index", &self.index)
            .field("has_child", &!self.child.is_null())
            .finish()
    }
}
