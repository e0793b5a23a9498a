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

//! Mock of the native model library.
//!
//! Models live in memory with atomic reference counts, keep their properties in a map and raise
//! events synchronously on the calling thread. Every registered type gets its own copy of the
//! class record and the public capability entry points dispatch through it, so types implemented
//! on the other side of the boundary can be exercised against realistic base behavior. Futures
//! complete synchronously unless a model is told to hold them back.
//!
//! The entry points are reached by name through [`lookup_symbol`].

mod exports;
mod object;

use std::ffi::c_void;

use model_api_concept::Value;
use model_plumbing_rs::test_utils::SizeInfo;
use model_plumbing_rs::NativeObject;

pub use exports::*;
pub use object::UnknownPropertyPolicy;

use crate::object::{
    emit, emit_child_event, emit_properties_changed, object_ref, object_unref, object_value,
    MockObject, ModelBody, Ptr, EVENT_CHILDREN_COUNT_CHANGED, EVENT_CHILD_ADDED,
    EVENT_CHILD_REMOVED,
};

/// Names of all exported entry points.
pub const SYMBOLS: &[&str] = &[
    "model_object_ref",
    "model_object_unref",
    "model_object_get_instance_data",
    "model_string_new",
    "model_string_free",
    "model_value_clear",
    "model_iter_next",
    "model_iter_reset",
    "model_iter_free",
    "model_iter_new",
    "model_event_lookup",
    "model_event_connect",
    "model_event_disconnect",
    "model_future_new",
    "model_future_resolve",
    "model_future_reject",
    "model_future_then",
    "model_future_state",
    "model_future_take_value",
    "model_future_take_error",
    "model_future_cancel",
    "model_get_properties",
    "model_get_property",
    "model_set_property",
    "model_get_children_count",
    "model_get_property_ready",
    "model_get_children_slice",
    "model_add_child",
    "model_del_child",
    "model_type_register",
    "model_new",
    "model_base_get_property",
    "model_base_set_property",
    "model_base_get_children_count",
    "model_base_add_child",
    "model_base_del_child",
];

/// Address of the exported entry point `name`.
pub fn lookup_symbol(name: &str) -> Option<*mut c_void> {
    let symbol = match name {
        "model_object_ref" => model_object_ref as *mut c_void,
        "model_object_unref" => model_object_unref as *mut c_void,
        "model_object_get_instance_data" => model_object_get_instance_data as *mut c_void,
        "model_string_new" => model_string_new as *mut c_void,
        "model_string_free" => model_string_free as *mut c_void,
        "model_value_clear" => model_value_clear as *mut c_void,
        "model_iter_next" => model_iter_next as *mut c_void,
        "model_iter_reset" => model_iter_reset as *mut c_void,
        "model_iter_free" => model_iter_free as *mut c_void,
        "model_iter_new" => model_iter_new as *mut c_void,
        "model_event_lookup" => model_event_lookup as *mut c_void,
        "model_event_connect" => model_event_connect as *mut c_void,
        "model_event_disconnect" => model_event_disconnect as *mut c_void,
        "model_future_new" => model_future_new as *mut c_void,
        "model_future_resolve" => model_future_resolve as *mut c_void,
        "model_future_reject" => model_future_reject as *mut c_void,
        "model_future_then" => model_future_then as *mut c_void,
        "model_future_state" => model_future_state as *mut c_void,
        "model_future_take_value" => model_future_take_value as *mut c_void,
        "model_future_take_error" => model_future_take_error as *mut c_void,
        "model_future_cancel" => model_future_cancel as *mut c_void,
        "model_get_properties" => model_get_properties as *mut c_void,
        "model_get_property" => model_get_property as *mut c_void,
        "model_set_property" => model_set_property as *mut c_void,
        "model_get_children_count" => model_get_children_count as *mut c_void,
        "model_get_property_ready" => model_get_property_ready as *mut c_void,
        "model_get_children_slice" => model_get_children_slice as *mut c_void,
        "model_add_child" => model_add_child as *mut c_void,
        "model_del_child" => model_del_child as *mut c_void,
        "model_type_register" => model_type_register as *mut c_void,
        "model_new" => model_new as *mut c_void,
        "model_base_get_property" => model_base_get_property as *mut c_void,
        "model_base_set_property" => model_base_set_property as *mut c_void,
        "model_base_get_children_count" => model_base_get_children_count as *mut c_void,
        "model_base_add_child" => model_base_add_child as *mut c_void,
        "model_base_del_child" => model_base_del_child as *mut c_void,
        _ => return None,
    };
    Some(symbol)
}

/// Layout of the boundary records as compiled on the native side (LP64).
pub const NATIVE_LAYOUTS: &[(&str, SizeInfo)] = &[
    ("StringView", SizeInfo { size: 16, align: 8 }),
    ("NativeError", SizeInfo { size: 16, align: 8 }),
    ("NativeValue", SizeInfo { size: 16, align: 8 }),
    ("PropertiesChangedRecord", SizeInfo { size: 16, align: 8 }),
    ("ChildEventRecord", SizeInfo { size: 16, align: 8 }),
    ("ModelClass", SizeInfo { size: 40, align: 8 }),
];

pub fn native_layout(name: &str) -> Option<SizeInfo> {
    NATIVE_LAYOUTS
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, info)| *info)
}

/// Test side owner of one reference to a mock model, with knobs to steer its behavior.
#[derive(Debug)]
pub struct MockModel {
    object: Ptr,
}

impl MockModel {
    /// A base model with `children` children.
    pub fn new(children: u32) -> Self {
        let object = MockObject::new_model(exports::BASE_TYPE, None);
        let model = Self { object };
        {
            let mut state = model.body().state.lock();
            for _ in 0..children {
                state
                    .children
                    .push(MockObject::new_model(exports::BASE_TYPE, None));
            }
        }
        model
    }

    /// Take a new reference to `object`, which has to be a live model of this library.
    ///
    /// # Panics
    ///
    /// If `object` is null or not a model.
    pub fn acquire(object: *mut NativeObject) -> Self {
        let object = Ptr::from_native(object).expect("null object");
        // SAFETY: The caller guarantees a live object.
        assert!(unsafe { object.get() }.model().is_some(), "not a model");
        object_ref(object);
        Self { object }
    }

    pub fn as_ptr(&self) -> *mut NativeObject {
        self.object.as_native()
    }

    fn body(&self) -> &ModelBody {
        // SAFETY: `self` owns a reference and only models are wrapped.
        unsafe { self.object.get() }
            .model()
            .expect("mock model wraps a model")
    }

    pub fn ref_count(&self) -> usize {
        // SAFETY: `self` owns a reference.
        unsafe { self.object.get() }.ref_count()
    }

    /// Set a property without raising an event.
    pub fn seed_property(&self, name: &str, value: Value) {
        self.body()
            .state
            .lock()
            .properties
            .insert(name.to_string(), value);
    }

    /// Property value referring to this model.
    pub fn as_value(&self) -> Value {
        object_value(self.object)
    }

    pub fn property(&self, name: &str) -> Option<Value> {
        self.body().state.lock().properties.get(name).cloned()
    }

    /// Make reads of `name` answer "try again" until [`MockModel::make_ready`].
    pub fn set_not_ready(&self, name: &str) {
        self.body().state.lock().not_ready.insert(name.to_string());
    }

    /// Store `value`, complete everyone waiting for it and raise `properties-changed`.
    pub fn make_ready(&self, name: &str, value: Value) {
        exports::make_ready(self.object, self.body(), name, value);
    }

    pub fn pending_waiters(&self) -> usize {
        self.body().state.lock().waiters.len()
    }

    /// Writes to `name` are ignored and answered with the current value.
    pub fn set_read_only(&self, name: &str) {
        self.body().state.lock().read_only.insert(name.to_string());
    }

    pub fn set_unknown_property_policy(&self, policy: UnknownPropertyPolicy) {
        self.body().state.lock().policy = policy;
    }

    pub fn fail_connect(&self, fail: bool) {
        self.body().state.lock().fail_connect = fail;
    }

    /// Raise every event once on the calling thread while it is being connected.
    pub fn emit_on_connect(&self, emit: bool) {
        self.body().state.lock().emit_on_connect = emit;
    }

    /// Hand out futures pending until [`MockModel::release_held_futures`].
    pub fn hold_futures(&self, hold: bool) {
        self.body().state.lock().hold_futures = hold;
    }

    pub fn release_held_futures(&self) -> usize {
        exports::release_held(self.body())
    }

    /// Invoke every completion callback of futures handed out from now on twice.
    pub fn double_completion(&self, double: bool) {
        self.body().state.lock().double_completion = double;
    }

    /// Number of native connections for the event `key`.
    pub fn connection_count(&self, key: &str) -> usize {
        let event = object::event_id(key);
        self.body()
            .state
            .lock()
            .connections
            .iter()
            .filter(|connection| connection.event == event)
            .count()
    }

    pub fn children_count(&self) -> usize {
        self.body().state.lock().children.len()
    }

    pub fn child(&self, index: usize) -> Option<MockModel> {
        let child = *self.body().state.lock().children.get(index)?;
        object_ref(child);
        Some(MockModel { object: child })
    }

    pub fn emit_properties_changed(&self, changed: &[&str], invalidated: &[&str]) {
        emit_properties_changed(self.object, changed, invalidated);
    }

    pub fn emit_children_count_changed(&self) {
        emit(self.object, EVENT_CHILDREN_COUNT_CHANGED, std::ptr::null());
    }

    pub fn emit_child_added(&self, index: u32, child: Option<&MockModel>) {
        emit_child_event(self.object, EVENT_CHILD_ADDED, index, child.map(|c| c.object));
    }

    pub fn emit_child_removed(&self, index: u32, child: Option<&MockModel>) {
        emit_child_event(self.object, EVENT_CHILD_REMOVED, index, child.map(|c| c.object));
    }
}

impl Drop for MockModel {
    fn drop(&mut self) {
        object_unref(self.object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model_plumbing_rs::{NativeError, NativeValue, StringView, NATIVE_TRY_AGAIN};

    #[test]
    fn test_every_symbol_is_exported() {
        for name in SYMBOLS {
            assert!(lookup_symbol(name).is_some(), "{name} missing");
        }
        assert!(lookup_symbol("model_unknown").is_none());
    }

    #[test]
    fn test_iterator_copies_borrowed_values() {
        let target = MockModel::new(0);
        let text = std::ffi::CString::new("lent").unwrap();
        let items = [
            NativeValue::int(7),
            NativeValue::string(text.as_ptr() as *mut std::ffi::c_char),
            NativeValue::object(target.as_ptr()),
        ];
        // SAFETY: the items are valid for the call
        let iter = unsafe { model_iter_new(items.as_ptr(), items.len() as u32) };
        assert_eq!(target.ref_count(), 2);
        let mut value = NativeValue::iter(iter);
        // SAFETY: `value` owns the iterator
        let copied = unsafe { crate::object::value_from_native(&value) };
        assert_eq!(
            copied,
            Value::Sequence(vec![Value::Int(7), Value::from("lent"), target.as_value()])
        );
        drop(copied);
        // SAFETY: `value` owns the iterator
        unsafe { model_value_clear(&mut value) };
        assert_eq!(target.ref_count(), 1);
    }

    #[test]
    fn test_children_die_with_their_parent() {
        let parent = MockModel::new(2);
        let child = parent.child(1).unwrap();
        assert_eq!(child.ref_count(), 2);
        drop(parent);
        assert_eq!(child.ref_count(), 1);
    }

    #[test]
    fn test_not_ready_property_answers_try_again() {
        let model = MockModel::new(0);
        model.set_not_ready("size");
        let mut value = NativeValue::empty();
        let mut error = NativeError::default();
        // SAFETY: `model` is alive, all out-parameters are writable.
        let ok = unsafe {
            model_get_property(model.as_ptr(), StringView::from("size"), &mut value, &mut error)
        };
        assert!(!ok);
        assert_eq!(error.code, NATIVE_TRY_AGAIN);
        // SAFETY: the message was allocated by the library
        unsafe { model_string_free(error.message) };
    }

    #[test]
    fn test_layout_table_lists_every_record() {
        assert_eq!(native_layout("ModelClass"), Some(SizeInfo { size: 40, align: 8 }));
        assert!(native_layout("Unknown").is_none());
    }
}
