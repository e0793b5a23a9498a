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

/// Size and alignment of a record as the native compiler lays it out.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeInfo {
    pub size: u64,
    pub align: u64,
}

impl SizeInfo {
    /// Layout of `T` as compiled on the Rust side.
    pub fn of<T>() -> Self {
        Self {
            size: std::mem::size_of::<T>() as u64,
            align: std::mem::align_of::<T>() as u64,
        }
    }
}

/// Assert that the Rust mirror `$rust_type` has the layout the native side reported.
///
/// # Panics
/// On any size or alignment difference, naming the record and both layouts.
#[macro_export]
macro_rules! verify_size_and_align {
    ($rust_type:ty, $native_size_info:expr, $type_name:expr) => {{
        let native: $crate::test_utils::SizeInfo = $native_size_info;
        let rust = $crate::test_utils::SizeInfo::of::<$rust_type>();
        assert!(
            rust == native,
            "{} layout mismatch: rust {:?}, native {:?}",
            $type_name,
            rust,
            native
        );
    }};
}
