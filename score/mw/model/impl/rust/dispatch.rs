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

//! Per-type virtual dispatch tables for model types implemented in Rust.
//!
//! A Rust model type implements [`ModelImpl`] and lists the capabilities it overrides. For every
//! overridable capability the table holds either a trampoline into the Rust implementation or,
//! if the capability is not overridden, the native base implementation. The table is built and
//! registered with the native type system once per Rust type and cached for the rest of the
//! process. Since the trampolines of a type are shared by all its instances, a Rust model type can
//! only be registered with one native library per process.

use core::fmt::{self, Debug, Display, Formatter};
use std::any::TypeId;
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::{Arc, OnceLock};

use log::debug;
use parking_lot::Mutex;

use model_api_concept::{CallbackResult, Error, Result, Value};
use model_plumbing_rs::{
    AddChildSlot, DelChildSlot, GetChildrenCountSlot, GetPropertySlot, ModelClass, NativeError,
    NativeObject, NativeValue, SetPropertySlot, StringView,
};

use crate::guard::{guarded, CallbackScope};
use crate::handle::NativeHandle;
use crate::marshal::{transfer_value, BorrowedValue, FromNative, ObjectRef, Ownership};
use crate::native::{NativeApi, NativeLibrary, RawSymbol};

/// Capabilities of the model contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    GetProperties,
    GetProperty,
    SetProperty,
    GetChildrenCount,
    GetPropertyReady,
    GetChildrenSlice,
    AddChild,
    DelChild,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::GetProperties,
        Capability::GetProperty,
        Capability::SetProperty,
        Capability::GetChildrenCount,
        Capability::GetPropertyReady,
        Capability::GetChildrenSlice,
        Capability::AddChild,
        Capability::DelChild,
    ];

    /// Capabilities with a slot in the native class record.
    pub const OVERRIDABLE: [Capability; 5] = [
        Capability::GetProperty,
        Capability::SetProperty,
        Capability::GetChildrenCount,
        Capability::AddChild,
        Capability::DelChild,
    ];

    /// Name of the capability as used in native symbol names.
    pub fn native_name(self) -> &'static str {
        match self {
            Capability::GetProperties => "get_properties",
            Capability::GetProperty => "get_property",
            Capability::SetProperty => "set_property",
            Capability::GetChildrenCount => "get_children_count",
            Capability::GetPropertyReady => "get_property_ready",
            Capability::GetChildrenSlice => "get_children_slice",
            Capability::AddChild => "add_child",
            Capability::DelChild => "del_child",
        }
    }

    pub fn is_overridable(self) -> bool {
        Self::OVERRIDABLE.contains(&self)
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.native_name().replace('_', "-"))
    }
}

fn not_overridden<R>(capability: Capability) -> CallbackResult<R> {
    Err(format!("{capability} is listed as override but not implemented").into())
}

/// A model type implemented in Rust.
///
/// Only the capabilities named in [`ModelImpl::OVERRIDES`] are routed to the implementation;
/// everything else keeps the native base behavior. Overrides receive a [`Super`] through which
/// they can reach the object and chain up to the base implementation.
pub trait ModelImpl: Send + Sync + 'static {
    /// Name the type is registered under on the native side.
    const TYPE_NAME: &'static str;

    /// Overridden capabilities. Capabilities that are not overridable are ignored.
    const OVERRIDES: &'static [Capability];

    fn get_property(&self, this: &Super<'_>, name: &str) -> CallbackResult<Value> {
        let _ = (this, name);
        not_overridden(Capability::GetProperty)
    }

    fn set_property(&self, this: &Super<'_>, name: &str, value: Value) -> CallbackResult<Value> {
        let _ = (this, name, value);
        not_overridden(Capability::SetProperty)
    }

    fn get_children_count(&self, this: &Super<'_>) -> CallbackResult<u32> {
        let _ = this;
        not_overridden(Capability::GetChildrenCount)
    }

    fn add_child(&self, this: &Super<'_>) -> CallbackResult<NativeHandle> {
        let _ = this;
        not_overridden(Capability::AddChild)
    }

    fn del_child(&self, this: &Super<'_>, child: &ObjectRef<'_>) -> CallbackResult<()> {
        let _ = (this, child);
        not_overridden(Capability::DelChild)
    }
}

/// One resolved slot of a dispatch table.
#[derive(Debug, Clone)]
pub struct DispatchEntry {
    pub capability: Capability,
    /// Symbol of the native base implementation.
    pub base_symbol: String,
    pub base: RawSymbol,
    pub overridden: bool,
}

/// Dispatch table of one Rust model type.
pub struct DispatchTable {
    type_name: &'static str,
    /// Native library the table was registered with, see [`library_identity`].
    library: usize,
    native_type: u64,
    entries: Vec<DispatchEntry>,
    class: ModelClass,
    base: ModelClass,
    api: NativeApi,
}

static TABLES: OnceLock<Mutex<HashMap<TypeId, &'static DispatchTable>>> = OnceLock::new();

/// Identity of the native code behind `lib`. Libraries loaded from the same native code share it.
fn library_identity(lib: &NativeLibrary) -> usize {
    lib.api().type_register as usize
}

impl DispatchTable {
    /// Dispatch table of `T`, built and registered on first use.
    ///
    /// # Errors
    ///
    /// Fails if `T` is already registered with a different native library.
    pub fn for_type<T: ModelImpl>(lib: &NativeLibrary) -> Result<&'static DispatchTable> {
        let mut tables = TABLES.get_or_init(Default::default).lock();
        if let Some(table) = tables.get(&TypeId::of::<T>()) {
            if table.library != library_identity(lib) {
                return Err(Error::failed(format!(
                    "model type `{}` is already registered with another native library",
                    T::TYPE_NAME
                )));
            }
            return Ok(table);
        }
        let table: &'static DispatchTable = Box::leak(Box::new(Self::build::<T>(lib)?));
        tables.insert(TypeId::of::<T>(), table);
        Ok(table)
    }

    fn cached<T: ModelImpl>() -> Option<&'static DispatchTable> {
        TABLES.get()?.lock().get(&TypeId::of::<T>()).copied()
    }

    fn build<T: ModelImpl>(lib: &NativeLibrary) -> Result<Self> {
        let mut entries = Vec::with_capacity(Capability::OVERRIDABLE.len());
        for capability in Capability::OVERRIDABLE {
            let base_symbol = format!("{}_base_{}", lib.prefix(), capability.native_name());
            let base = lib.symbol(&base_symbol)?;
            entries.push(DispatchEntry {
                capability,
                base_symbol,
                base,
                overridden: T::OVERRIDES.contains(&capability),
            });
        }

        let base_of = |index: usize| entries[index].base.as_ptr();
        // SAFETY: Every base symbol is exported with the slot signature of its capability.
        let base = unsafe {
            ModelClass {
                get_property: std::mem::transmute::<*mut c_void, GetPropertySlot>(base_of(0)),
                set_property: std::mem::transmute::<*mut c_void, SetPropertySlot>(base_of(1)),
                get_children_count: std::mem::transmute::<*mut c_void, GetChildrenCountSlot>(
                    base_of(2),
                ),
                add_child: std::mem::transmute::<*mut c_void, AddChildSlot>(base_of(3)),
                del_child: std::mem::transmute::<*mut c_void, DelChildSlot>(base_of(4)),
            }
        };
        let overrides = |capability| T::OVERRIDES.contains(&capability);
        let class = ModelClass {
            get_property: if overrides(Capability::GetProperty) {
                get_property_trampoline::<T> as GetPropertySlot
            } else {
                base.get_property
            },
            set_property: if overrides(Capability::SetProperty) {
                set_property_trampoline::<T> as SetPropertySlot
            } else {
                base.set_property
            },
            get_children_count: if overrides(Capability::GetChildrenCount) {
                get_children_count_trampoline::<T> as GetChildrenCountSlot
            } else {
                base.get_children_count
            },
            add_child: if overrides(Capability::AddChild) {
                add_child_trampoline::<T> as AddChildSlot
            } else {
                base.add_child
            },
            del_child: if overrides(Capability::DelChild) {
                del_child_trampoline::<T> as DelChildSlot
            } else {
                base.del_child
            },
        };

        // SAFETY: The name and the class record are copied by the native side.
        let native_type =
            unsafe { (lib.api().type_register)(StringView::from(T::TYPE_NAME), &class) };
        if native_type == 0 {
            return Err(Error::failed(format!(
                "native registration of model type `{}` failed",
                T::TYPE_NAME
            )));
        }
        debug!(
            "Registered model type `{}` as native type {native_type} overriding {:?}",
            T::TYPE_NAME,
            T::OVERRIDES
        );

        Ok(Self {
            type_name: T::TYPE_NAME,
            library: library_identity(lib),
            native_type,
            entries,
            class,
            base,
            api: *lib.api(),
        })
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn native_type(&self) -> u64 {
        self.native_type
    }

    pub fn entries(&self) -> &[DispatchEntry] {
        &self.entries
    }

    pub fn entry(&self, capability: Capability) -> Option<&DispatchEntry> {
        self.entries.iter().find(|entry| entry.capability == capability)
    }

    pub fn class(&self) -> &ModelClass {
        &self.class
    }

    /// Create a native instance of `T` owning `imp`.
    pub(crate) fn instantiate<T: ModelImpl>(
        &self,
        lib: &Arc<NativeLibrary>,
        imp: T,
    ) -> Result<NativeHandle> {
        let data = Box::into_raw(Box::new(Instance {
            imp,
            lib: Arc::clone(lib),
        }));
        // SAFETY: On success the native object owns `data` and calls `destroy_instance::<T>`
        // once it is finalized.
        let object =
            unsafe { (self.api.new)(self.native_type, data as *mut c_void, destroy_instance::<T>) };
        if object.is_null() {
            // SAFETY: The native side did not take `data` over.
            drop(unsafe { Box::from_raw(data) });
            return Err(Error::failed(format!(
                "native instantiation of model type `{}` failed",
                self.type_name
            )));
        }
        // SAFETY: `new` returns a transferred reference.
        unsafe { NativeHandle::from_transferred(lib, object) }
    }

    /// Instance data behind `object` if it was created by [`DispatchTable::instantiate`].
    ///
    /// # Safety
    ///
    /// `object` must be alive and dispatched through this table, so that its instance data is
    /// either null or an `Instance<T>`.
    unsafe fn instance<'a, T: ModelImpl>(
        &self,
        object: *mut NativeObject,
    ) -> Option<&'a Instance<T>> {
        // SAFETY: upheld by the caller as documented above
        let data = unsafe { (self.api.object_get_instance_data)(object) };
        // SAFETY: see above
        NonNull::new(data as *mut Instance<T>).map(|data| unsafe { &*data.as_ptr() })
    }
}

impl Debug for DispatchTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("type_name", &self.type_name)
            .field("native_type", &self.native_type)
            .field("entries", &self.entries)
            .finish()
    }
}

struct Instance<T> {
    imp: T,
    lib: Arc<NativeLibrary>,
}

unsafe extern "C" fn destroy_instance<T: ModelImpl>(data: *mut c_void) {
    let _scope = CallbackScope::enter();
    // SAFETY: `data` is the instance handed to `new`, destroyed exactly once.
    drop(unsafe { Box::from_raw(data as *mut Instance<T>) });
}

/// The object an override runs on, together with the base implementations of its type.
pub struct Super<'a> {
    lib: &'a Arc<NativeLibrary>,
    base: &'a ModelClass,
    object: ObjectRef<'a>,
}

impl<'a> Super<'a> {
    pub fn object(&self) -> ObjectRef<'a> {
        self.object
    }

    pub fn library(&self) -> &'a Arc<NativeLibrary> {
        self.lib
    }

    pub fn get_property(&self, name: &str) -> Result<Value> {
        let mut value = NativeValue::empty();
        let mut error = NativeError::default();
        // SAFETY: The object is alive for the callback, all out-parameters are writable.
        let ok = unsafe {
            (self.base.get_property)(self.object.as_ptr(), name.into(), &mut value, &mut error)
        };
        self.finish(ok, error, name)?;
        // SAFETY: The value was transferred by the base implementation.
        unsafe { Value::from_native(self.lib, &value, Ownership::Transferred) }
    }

    pub fn set_property(&self, name: &str, value: &Value) -> Result<Value> {
        let input = BorrowedValue::new(self.lib, value)?;
        let mut stored = NativeValue::empty();
        let mut error = NativeError::default();
        // SAFETY: see `get_property`
        let ok = unsafe {
            (self.base.set_property)(
                self.object.as_ptr(),
                name.into(),
                input.as_native(),
                &mut stored,
                &mut error,
            )
        };
        self.finish(ok, error, name)?;
        // SAFETY: see `get_property`
        unsafe { Value::from_native(self.lib, &stored, Ownership::Transferred) }
    }

    pub fn get_children_count(&self) -> Result<u32> {
        let mut error = NativeError::default();
        // SAFETY: see `get_property`
        let count = unsafe { (self.base.get_children_count)(self.object.as_ptr(), &mut error) };
        self.lib.check(error, "get-children-count")?;
        Ok(count)
    }

    pub fn add_child(&self) -> Result<NativeHandle> {
        let mut error = NativeError::default();
        // SAFETY: see `get_property`
        let child = unsafe { (self.base.add_child)(self.object.as_ptr(), &mut error) };
        self.lib.check(error, "add-child")?;
        // SAFETY: The child reference is transferred by the base implementation.
        unsafe { NativeHandle::from_transferred(self.lib, child) }
    }

    pub fn del_child(&self, child: &ObjectRef<'_>) -> Result<()> {
        let mut error = NativeError::default();
        // SAFETY: see `get_property`
        let ok = unsafe { (self.base.del_child)(self.object.as_ptr(), child.as_ptr(), &mut error) };
        self.finish(ok, error, "del-child")
    }

    fn finish(&self, ok: bool, error: NativeError, subject: &str) -> Result<()> {
        self.lib.check(error, subject)?;
        if ok {
            Ok(())
        } else {
            Err(Error::failed(format!("{subject} failed without error detail")))
        }
    }
}

/// Resolve the Rust instance behind `object`, or `None` if the call has to go to the base.
///
/// # Safety
///
/// `object` must be a live object dispatched through the table of `T`.
unsafe fn resolve<'a, T: ModelImpl>(
    object: *mut NativeObject,
) -> Option<(&'static DispatchTable, Option<&'a Instance<T>>)> {
    let table = DispatchTable::cached::<T>()?;
    // SAFETY: upheld by the caller as documented above
    Some((table, unsafe { table.instance::<T>(object) }))
}

/// Run `call` for an override, with the guarded region and the failure protocol.
///
/// # Safety
///
/// `object` must be alive for the call.
unsafe fn run_override<T: ModelImpl, R>(
    table: &DispatchTable,
    instance: &Instance<T>,
    object: *mut NativeObject,
    capability: Capability,
    error: *mut NativeError,
    call: impl FnOnce(&T, &Super<'_>) -> CallbackResult<R>,
) -> Option<R> {
    let _scope = CallbackScope::enter();
    let lib = &instance.lib;
    let object = NonNull::new(object)?;
    let this = Super {
        lib,
        base: &table.base,
        // SAFETY: upheld by the caller as documented above
        object: unsafe { ObjectRef::new(lib, object) },
    };
    let context = format!("{capability} override of `{}`", table.type_name);
    match guarded(lib, &context, || call(&instance.imp, &this)) {
        Ok(result) => Some(result),
        Err(failure) => {
            lib.fill_failure(error, &failure);
            None
        }
    }
}

unsafe extern "C" fn get_property_trampoline<T: ModelImpl>(
    object: *mut NativeObject,
    name: StringView,
    out_value: *mut NativeValue,
    error: *mut NativeError,
) -> bool {
    // SAFETY: Called by the native side on a live object of `T`'s type.
    let Some((table, instance)) = (unsafe { resolve::<T>(object) }) else {
        return false;
    };
    let Some(instance) = instance else {
        // SAFETY: forwarded unchanged
        return unsafe { (table.base.get_property)(object, name, out_value, error) };
    };
    // SAFETY: The name is borrowed for the call.
    let name = String::from_utf8_lossy(unsafe { name.as_bytes() });
    // SAFETY: `object` is alive for the call.
    let result = unsafe {
        run_override(table, instance, object, Capability::GetProperty, error, |imp, this| {
            let value = imp.get_property(this, &name)?;
            Ok(transfer_value(this.library(), &value)?)
        })
    };
    match result {
        Some(value) => {
            // SAFETY: The native caller passes a writable value record.
            unsafe { *out_value = value };
            true
        }
        None => false,
    }
}

unsafe extern "C" fn set_property_trampoline<T: ModelImpl>(
    object: *mut NativeObject,
    name: StringView,
    value: *const NativeValue,
    out_value: *mut NativeValue,
    error: *mut NativeError,
) -> bool {
    // SAFETY: see `get_property_trampoline`
    let Some((table, instance)) = (unsafe { resolve::<T>(object) }) else {
        return false;
    };
    let Some(instance) = instance else {
        // SAFETY: forwarded unchanged
        return unsafe { (table.base.set_property)(object, name, value, out_value, error) };
    };
    // SAFETY: see `get_property_trampoline`
    let name = String::from_utf8_lossy(unsafe { name.as_bytes() });
    let input = if value.is_null() {
        Ok(Value::Empty)
    } else {
        // SAFETY: The input value is borrowed for the call.
        unsafe { Value::from_native(&instance.lib, &*value, Ownership::Borrowed) }
    };
    // SAFETY: see `get_property_trampoline`
    let result = unsafe {
        run_override(table, instance, object, Capability::SetProperty, error, move |imp, this| {
            let stored = imp.set_property(this, &name, input?)?;
            Ok(transfer_value(this.library(), &stored)?)
        })
    };
    match result {
        Some(stored) => {
            // SAFETY: see `get_property_trampoline`
            unsafe { *out_value = stored };
            true
        }
        None => false,
    }
}

unsafe extern "C" fn get_children_count_trampoline<T: ModelImpl>(
    object: *mut NativeObject,
    error: *mut NativeError,
) -> u32 {
    // SAFETY: see `get_property_trampoline`
    let Some((table, instance)) = (unsafe { resolve::<T>(object) }) else {
        return 0;
    };
    let Some(instance) = instance else {
        // SAFETY: forwarded unchanged
        return unsafe { (table.base.get_children_count)(object, error) };
    };
    // SAFETY: see `get_property_trampoline`
    unsafe {
        run_override(table, instance, object, Capability::GetChildrenCount, error, |imp, this| {
            imp.get_children_count(this)
        })
    }
    .unwrap_or(0)
}

unsafe extern "C" fn add_child_trampoline<T: ModelImpl>(
    object: *mut NativeObject,
    error: *mut NativeError,
) -> *mut NativeObject {
    // SAFETY: see `get_property_trampoline`
    let Some((table, instance)) = (unsafe { resolve::<T>(object) }) else {
        return ptr::null_mut();
    };
    let Some(instance) = instance else {
        // SAFETY: forwarded unchanged
        return unsafe { (table.base.add_child)(object, error) };
    };
    // SAFETY: see `get_property_trampoline`
    let child = unsafe {
        run_override(table, instance, object, Capability::AddChild, error, |imp, this| {
            imp.add_child(this)
        })
    };
    match child.map(NativeHandle::into_raw) {
        Some(Ok(child)) => child,
        Some(Err(err)) => {
            let failure = instance.lib.report_unhandled(err);
            instance.lib.fill_failure(error, &failure);
            ptr::null_mut()
        }
        None => ptr::null_mut(),
    }
}

unsafe extern "C" fn del_child_trampoline<T: ModelImpl>(
    object: *mut NativeObject,
    child: *mut NativeObject,
    error: *mut NativeError,
) -> bool {
    // SAFETY: see `get_property_trampoline`
    let Some((table, instance)) = (unsafe { resolve::<T>(object) }) else {
        return false;
    };
    let Some(instance) = instance else {
        // SAFETY: forwarded unchanged
        return unsafe { (table.base.del_child)(object, child, error) };
    };
    let Some(child) = NonNull::new(child) else {
        instance.lib.fill_error(error, model_plumbing_rs::NATIVE_FAILED, "child is null");
        return false;
    };
    // SAFETY: see `get_property_trampoline`
    unsafe {
        run_override(table, instance, object, Capability::DelChild, error, |imp, this| {
            // SAFETY: The child is borrowed for the call.
            let child = unsafe { ObjectRef::new(this.library(), child) };
            imp.del_child(this, &child)
        })
    }
    .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::library;

    struct Plain;

    impl ModelImpl for Plain {
        const TYPE_NAME: &'static str = "DispatchPlain";
        const OVERRIDES: &'static [Capability] = &[];
    }

    struct Counting;

    impl ModelImpl for Counting {
        const TYPE_NAME: &'static str = "DispatchCounting";
        const OVERRIDES: &'static [Capability] =
            &[Capability::GetChildrenCount, Capability::GetProperties];

        fn get_children_count(&self, this: &Super<'_>) -> CallbackResult<u32> {
            Ok(this.get_children_count()? + 10)
        }
    }

    #[test]
    fn test_table_without_overrides_uses_base_everywhere() {
        let lib = library();
        let table = DispatchTable::for_type::<Plain>(&lib).unwrap();
        assert_eq!(table.entries().len(), Capability::OVERRIDABLE.len());
        assert!(table.entries().iter().all(|entry| !entry.overridden));
        assert_eq!(table.class().get_property as usize, table.base.get_property as usize);
        assert_eq!(
            table.entry(Capability::DelChild).unwrap().base_symbol,
            "model_base_del_child"
        );
    }

    #[test]
    fn test_table_is_built_once_per_type() {
        let lib = library();
        let first = DispatchTable::for_type::<Counting>(&lib).unwrap();
        let second = DispatchTable::for_type::<Counting>(&lib).unwrap();
        assert!(std::ptr::eq(first, second));
        assert_ne!(first.native_type(), 0);
    }

    #[test]
    fn test_only_overridable_capabilities_are_routed() {
        let lib = library();
        let table = DispatchTable::for_type::<Counting>(&lib).unwrap();
        let overridden: Vec<_> = table
            .entries()
            .iter()
            .filter(|entry| entry.overridden)
            .map(|entry| entry.capability)
            .collect();
        assert_eq!(overridden, vec![Capability::GetChildrenCount]);
        assert_ne!(
            table.class().get_children_count as usize,
            table.base.get_children_count as usize
        );
        assert_eq!(table.class().add_child as usize, table.base.add_child as usize);
    }

    struct Registered;

    impl ModelImpl for Registered {
        const TYPE_NAME: &'static str = "DispatchRegistered";
        const OVERRIDES: &'static [Capability] = &[Capability::GetChildrenCount];
    }

    /// Native code distinct from the mock's own `model_type_register`.
    unsafe extern "C" fn forwarding_type_register(
        name: StringView,
        class: *const ModelClass,
    ) -> u64 {
        type Register = unsafe extern "C" fn(StringView, *const ModelClass) -> u64;
        match model_native_mock::lookup_symbol("model_type_register") {
            // SAFETY: The mock exports the symbol with this signature.
            Some(register) => unsafe {
                std::mem::transmute::<*mut c_void, Register>(register)(name, class)
            },
            None => 0,
        }
    }

    fn other_library() -> Arc<NativeLibrary> {
        let source = |name: &str| {
            if name == "model_type_register" {
                RawSymbol::new(forwarding_type_register as usize as *mut c_void)
            } else {
                model_native_mock::lookup_symbol(name).and_then(RawSymbol::new)
            }
        };
        NativeLibrary::load(Box::new(source), &crate::config::BridgeConfig::default()).unwrap()
    }

    #[test]
    fn test_type_is_bound_to_one_native_library() {
        let lib = library();
        let other = other_library();
        let table = DispatchTable::for_type::<Registered>(&lib).unwrap();
        assert!(std::ptr::eq(table, DispatchTable::for_type::<Registered>(&library()).unwrap()));

        let err = DispatchTable::for_type::<Registered>(&other).unwrap_err();
        assert!(matches!(
            err,
            Error::OperationFailed { ref message, .. } if message.contains("another native library")
        ));
    }

    #[test]
    fn test_capability_names() {
        assert_eq!(Capability::GetChildrenSlice.to_string(), "get-children-slice");
        assert!(!Capability::GetProperties.is_overridable());
        assert!(Capability::DelChild.is_overridable());
    }
}
