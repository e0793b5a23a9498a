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

/// Declare a table of typed native entry points.
///
/// Every field is resolved by the symbol name `<prefix>_<suffix>` through the given lookup
/// function and reinterpreted as the declared function pointer type. Resolution stops at the
/// first missing symbol.
///
/// ```ignore
/// native_symbols! {
///     pub struct ObjectApi {
///         object_ref: "object_ref" =>
///             unsafe extern "C" fn(*mut NativeObject) -> *mut NativeObject,
///     }
/// }
/// ```
#[macro_export]
macro_rules! native_symbols {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($field:ident: $suffix:literal => $fn_ty:ty),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy)]
        $vis struct $name {
            $(pub $field: $fn_ty),*
        }

        impl $name {
            /// Names of all symbols of this table, without prefix.
            pub const SYMBOLS: &'static [&'static str] = &[$($suffix),*];

            pub(crate) fn resolve<F>(prefix: &str, mut lookup: F) -> $crate::Result<Self>
            where
                F: FnMut(&str) -> $crate::Result<$crate::native::RawSymbol>,
            {
                Ok(Self {
                    $($field: {
                        let raw = lookup(&format!("{}_{}", prefix, $suffix))?;
                        // SAFETY: The symbol is exported by the native library under this name
                        // with exactly this signature; the function pointer and the data
                        // pointer have the same size on every supported target.
                        unsafe {
                            std::mem::transmute::<*mut std::ffi::c_void, $fn_ty>(raw.as_ptr())
                        }
                    }),*
                })
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.debug_struct(stringify!($name)).finish()
            }
        }
    };
}
