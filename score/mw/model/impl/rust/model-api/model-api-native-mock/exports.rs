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

//! The exported C entry points of the mock library.

use std::ffi::c_void;
use std::ptr;
use std::sync::OnceLock;

use parking_lot::Mutex;

use model_api_concept::{slice_bounds, Value};
use model_plumbing_rs::{
    DestroyNotify, EventCallback, FutureCallback, ModelClass, NativeError, NativeIter,
    NativeObject, NativeValue, StringView, NATIVE_FAILED, NATIVE_NOT_FOUND, NATIVE_OK,
    NATIVE_TRY_AGAIN,
};

use crate::object::{
    complete, emit, emit_child_event, emit_properties_changed, event_id, fill_error,
    future_state, future_take_error, future_take_value, future_then, malloc_string, object_ref,
    object_unref, take_error_message, value_clear, value_from_native, value_to_native,
    Connection, Instance, MockIter, MockObject, ModelBody, Outcome, Ptr,
    UnknownPropertyPolicy, EVENT_CHILDREN_COUNT_CHANGED, EVENT_CHILD_ADDED, EVENT_CHILD_REMOVED,
    EVENT_NAMESPACE, EVENT_PROPERTIES_CHANGED,
};

pub(crate) const BASE_TYPE: u64 = 1;

const BASE_CLASS: ModelClass = ModelClass {
    get_property: model_base_get_property,
    set_property: model_base_set_property,
    get_children_count: model_base_get_children_count,
    add_child: model_base_add_child,
    del_child: model_base_del_child,
};

fn types() -> &'static Mutex<Vec<(String, ModelClass)>> {
    static TYPES: OnceLock<Mutex<Vec<(String, ModelClass)>>> = OnceLock::new();
    TYPES.get_or_init(|| Mutex::new(vec![("MockModel".to_string(), BASE_CLASS)]))
}

fn class_of(model: &ModelBody) -> ModelClass {
    let index = model.type_id.saturating_sub(1) as usize;
    types()
        .lock()
        .get(index)
        .map_or(BASE_CLASS, |(_, class)| *class)
}

/// # Safety
///
/// `object` must be null or a live object.
unsafe fn model_of<'a>(object: *mut NativeObject) -> Option<(Ptr, &'a ModelBody)> {
    let ptr = Ptr::from_native(object)?;
    // SAFETY: upheld by the caller as documented above
    let model = unsafe { ptr.get() }.model()?;
    Some((ptr, model))
}

fn view_to_string(view: StringView) -> String {
    // SAFETY: Views passed in by callers borrow live memory for the call.
    String::from_utf8_lossy(unsafe { view.as_bytes() }).into_owned()
}

fn not_a_model(error: *mut NativeError) {
    fill_error(error, NATIVE_FAILED, "object is not a model");
}

/// Hand out a new future for `outcome`, completed right away unless the model holds futures.
fn deliver(model: &ModelBody, outcome: Outcome) -> *mut NativeObject {
    let (double, hold) = {
        let state = model.state.lock();
        (state.double_completion, state.hold_futures)
    };
    let future = MockObject::new_future(double);
    if hold {
        object_ref(future);
        model.state.lock().held.push((future, outcome));
    } else {
        complete(future, outcome);
    }
    future.as_native()
}

fn slot_outcome(ok: bool, value: NativeValue, mut error: NativeError) -> Outcome {
    if ok {
        return Outcome::Value(value);
    }
    let code = if error.code == NATIVE_OK {
        NATIVE_FAILED
    } else {
        error.code
    };
    Outcome::Error(code, take_error_message(&mut error))
}

#[no_mangle]
pub unsafe extern "C" fn model_object_ref(object: *mut NativeObject) -> *mut NativeObject {
    if let Some(ptr) = Ptr::from_native(object) {
        object_ref(ptr);
    }
    object
}

#[no_mangle]
pub unsafe extern "C" fn model_object_unref(object: *mut NativeObject) {
    if let Some(ptr) = Ptr::from_native(object) {
        object_unref(ptr);
    }
}

#[no_mangle]
pub unsafe extern "C" fn model_object_get_instance_data(object: *mut NativeObject) -> *mut c_void {
    // SAFETY: The caller passes a live object.
    match unsafe { model_of(object) } {
        Some((_, model)) => model
            .instance
            .as_ref()
            .map_or(ptr::null_mut(), |instance| instance.data),
        None => ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn model_string_new(view: StringView) -> *mut std::ffi::c_char {
    // SAFETY: The view borrows live memory for the call.
    malloc_string(unsafe { view.as_bytes() })
}

#[no_mangle]
pub unsafe extern "C" fn model_string_free(string: *mut std::ffi::c_char) {
    // SAFETY: Strings handed out by this library are allocated with `malloc`.
    unsafe { libc::free(string as *mut c_void) };
}

#[no_mangle]
pub unsafe extern "C" fn model_value_clear(value: *mut NativeValue) {
    // SAFETY: The caller passes an owned, writable value.
    if let Some(value) = unsafe { value.as_mut() } {
        value_clear(value);
    }
}

#[no_mangle]
pub unsafe extern "C" fn model_iter_next(iter: *mut NativeIter, out: *mut NativeValue) -> bool {
    // SAFETY: Iterators are `MockIter` allocations owned by the caller.
    let Some(iter) = (unsafe { (iter as *mut MockIter).as_mut() }) else {
        return false;
    };
    match iter.next() {
        Some(value) => {
            // SAFETY: The caller passes a writable value.
            unsafe { *out = value };
            true
        }
        None => false,
    }
}

#[no_mangle]
pub unsafe extern "C" fn model_iter_reset(iter: *mut NativeIter) -> bool {
    // SAFETY: see `model_iter_next`
    match unsafe { (iter as *mut MockIter).as_mut() } {
        Some(iter) => {
            iter.reset();
            true
        }
        None => false,
    }
}

/// Iterator over copies of `len` borrowed values.
#[no_mangle]
pub unsafe extern "C" fn model_iter_new(items: *const NativeValue, len: u32) -> *mut NativeIter {
    if items.is_null() || len == 0 {
        return MockIter::new(Vec::new());
    }
    // SAFETY: The caller lends `len` valid values for the call.
    unsafe { MockIter::copy_of(std::slice::from_raw_parts(items, len as usize)) }
}

#[no_mangle]
pub unsafe extern "C" fn model_iter_free(iter: *mut NativeIter) {
    if !iter.is_null() {
        // SAFETY: see `model_iter_next`
        drop(unsafe { Box::from_raw(iter as *mut MockIter) });
    }
}

#[no_mangle]
pub unsafe extern "C" fn model_event_lookup(namespace: StringView, key: StringView) -> u32 {
    if view_to_string(namespace) != EVENT_NAMESPACE {
        return 0;
    }
    event_id(&view_to_string(key))
}

#[no_mangle]
pub unsafe extern "C" fn model_event_connect(
    object: *mut NativeObject,
    event: u32,
    callback: EventCallback,
    user_data: *mut c_void,
    destroy: DestroyNotify,
) -> u64 {
    // SAFETY: The caller passes a live object.
    let Some((_, model)) = (unsafe { model_of(object) }) else {
        return 0;
    };
    let mut state = model.state.lock();
    if state.fail_connect || event == 0 {
        return 0;
    }
    let connection = Connection::new(event, callback, user_data, destroy);
    let id = connection.id;
    state.connections.push(std::sync::Arc::new(connection));
    let emit_now = state.emit_on_connect;
    drop(state);

    if emit_now {
        let Some(ptr) = Ptr::from_native(object) else {
            return id;
        };
        match event {
            EVENT_PROPERTIES_CHANGED => emit_properties_changed(ptr, &[], &[]),
            EVENT_CHILD_ADDED | EVENT_CHILD_REMOVED => emit_child_event(ptr, event, 0, None),
            _ => emit(ptr, event, ptr::null()),
        }
    }
    id
}

#[no_mangle]
pub unsafe extern "C" fn model_event_disconnect(object: *mut NativeObject, connection: u64) {
    // SAFETY: The caller passes a live object.
    let Some((_, model)) = (unsafe { model_of(object) }) else {
        return;
    };
    let removed = {
        let mut state = model.state.lock();
        state
            .connections
            .iter()
            .position(|candidate| candidate.id == connection)
            .map(|position| state.connections.remove(position))
    };
    drop(removed);
}

#[no_mangle]
pub unsafe extern "C" fn model_future_new() -> *mut NativeObject {
    MockObject::new_future(false).as_native()
}

/// Resolve `future`, taking ownership of `value`.
#[no_mangle]
pub unsafe extern "C" fn model_future_resolve(
    future: *mut NativeObject,
    value: *const NativeValue,
) -> bool {
    let Some(future) = Ptr::from_native(future) else {
        return false;
    };
    // SAFETY: The caller passes a valid value whose ownership moves here.
    let value = unsafe { value.as_ref() }.copied().unwrap_or_default();
    complete(future, Outcome::Value(value))
}

#[no_mangle]
pub unsafe extern "C" fn model_future_reject(
    future: *mut NativeObject,
    code: i32,
    message: StringView,
) -> bool {
    let Some(future) = Ptr::from_native(future) else {
        return false;
    };
    complete(future, Outcome::Error(code, view_to_string(message)))
}

#[no_mangle]
pub unsafe extern "C" fn model_future_then(
    future: *mut NativeObject,
    callback: FutureCallback,
    user_data: *mut c_void,
    destroy: DestroyNotify,
) {
    match Ptr::from_native(future) {
        Some(future) => future_then(future, callback, user_data, destroy),
        // SAFETY: The callback is never invoked, its context is released right away.
        None => unsafe { destroy(user_data) },
    }
}

#[no_mangle]
pub unsafe extern "C" fn model_future_state(future: *mut NativeObject) -> u32 {
    Ptr::from_native(future).map_or(model_plumbing_rs::FUTURE_FAILED, future_state)
}

#[no_mangle]
pub unsafe extern "C" fn model_future_take_value(
    future: *mut NativeObject,
    out: *mut NativeValue,
) -> bool {
    match Ptr::from_native(future).and_then(future_take_value) {
        Some(value) => {
            // SAFETY: The caller passes a writable value.
            unsafe { *out = value };
            true
        }
        None => false,
    }
}

#[no_mangle]
pub unsafe extern "C" fn model_future_take_error(
    future: *mut NativeObject,
    out: *mut NativeError,
) -> bool {
    match Ptr::from_native(future).and_then(future_take_error) {
        Some((code, message)) => {
            fill_error(out, code, &message);
            true
        }
        None => false,
    }
}

#[no_mangle]
pub unsafe extern "C" fn model_future_cancel(future: *mut NativeObject) {
    if let Some(future) = Ptr::from_native(future) {
        complete(future, Outcome::Canceled);
    }
}

#[no_mangle]
pub unsafe extern "C" fn model_get_properties(
    object: *mut NativeObject,
    error: *mut NativeError,
) -> *mut NativeIter {
    // SAFETY: The caller passes a live object.
    let Some((_, model)) = (unsafe { model_of(object) }) else {
        not_a_model(error);
        return ptr::null_mut();
    };
    let names = model
        .state
        .lock()
        .properties
        .keys()
        .map(|name| NativeValue::string(malloc_string(name.as_bytes())))
        .collect();
    MockIter::new(names)
}

#[no_mangle]
pub unsafe extern "C" fn model_get_property(
    object: *mut NativeObject,
    name: StringView,
    out: *mut NativeValue,
    error: *mut NativeError,
) -> bool {
    // SAFETY: The caller passes a live object.
    let Some((_, model)) = (unsafe { model_of(object) }) else {
        not_a_model(error);
        return false;
    };
    // SAFETY: Dispatch through the class record of the object.
    unsafe { (class_of(model).get_property)(object, name, out, error) }
}

#[no_mangle]
pub unsafe extern "C" fn model_set_property(
    object: *mut NativeObject,
    name: StringView,
    value: *const NativeValue,
    error: *mut NativeError,
) -> *mut NativeObject {
    // SAFETY: The caller passes a live object.
    let Some((_, model)) = (unsafe { model_of(object) }) else {
        not_a_model(error);
        return ptr::null_mut();
    };
    let mut stored = NativeValue::empty();
    let mut slot_error = NativeError::default();
    // SAFETY: Dispatch through the class record of the object.
    let ok = unsafe {
        (class_of(model).set_property)(object, name, value, &mut stored, &mut slot_error)
    };
    deliver(model, slot_outcome(ok, stored, slot_error))
}

#[no_mangle]
pub unsafe extern "C" fn model_get_children_count(
    object: *mut NativeObject,
    error: *mut NativeError,
) -> u32 {
    // SAFETY: The caller passes a live object.
    let Some((_, model)) = (unsafe { model_of(object) }) else {
        not_a_model(error);
        return 0;
    };
    // SAFETY: Dispatch through the class record of the object.
    unsafe { (class_of(model).get_children_count)(object, error) }
}

#[no_mangle]
pub unsafe extern "C" fn model_get_property_ready(
    object: *mut NativeObject,
    name: StringView,
    error: *mut NativeError,
) -> *mut NativeObject {
    // SAFETY: The caller passes a live object.
    let Some((_, model)) = (unsafe { model_of(object) }) else {
        not_a_model(error);
        return ptr::null_mut();
    };
    let name_string = view_to_string(name);
    let mut value = NativeValue::empty();
    let mut slot_error = NativeError::default();
    // SAFETY: Dispatch through the class record of the object.
    let ok = unsafe { (class_of(model).get_property)(object, name, &mut value, &mut slot_error) };
    if ok || slot_error.code != NATIVE_TRY_AGAIN {
        return deliver(model, slot_outcome(ok, value, slot_error));
    }
    take_error_message(&mut slot_error);

    let double = model.state.lock().double_completion;
    let future = MockObject::new_future(double);
    let mut state = model.state.lock();
    if state.not_ready.contains(&name_string) {
        object_ref(future);
        state.waiters.push((name_string, future));
    } else {
        let current = state.properties.get(&name_string).cloned();
        drop(state);
        let outcome = match current {
            Some(current) => Outcome::Value(value_to_native(&current)),
            None => Outcome::Error(NATIVE_NOT_FOUND, format!("unknown property `{name_string}`")),
        };
        complete(future, outcome);
    }
    future.as_native()
}

#[no_mangle]
pub unsafe extern "C" fn model_get_children_slice(
    object: *mut NativeObject,
    start: u32,
    count: u32,
    error: *mut NativeError,
) -> *mut NativeObject {
    // SAFETY: The caller passes a live object.
    let Some((_, model)) = (unsafe { model_of(object) }) else {
        not_a_model(error);
        return ptr::null_mut();
    };
    let items = {
        let state = model.state.lock();
        let range = slice_bounds(start, count, state.children.len() as u32);
        state.children[range.start as usize..range.end as usize]
            .iter()
            .map(|child| {
                object_ref(*child);
                NativeValue::object(child.as_native())
            })
            .collect()
    };
    deliver(model, Outcome::Value(NativeValue::iter(MockIter::new(items))))
}

#[no_mangle]
pub unsafe extern "C" fn model_add_child(
    object: *mut NativeObject,
    error: *mut NativeError,
) -> *mut NativeObject {
    // SAFETY: The caller passes a live object.
    let Some((_, model)) = (unsafe { model_of(object) }) else {
        not_a_model(error);
        return ptr::null_mut();
    };
    // SAFETY: Dispatch through the class record of the object.
    unsafe { (class_of(model).add_child)(object, error) }
}

#[no_mangle]
pub unsafe extern "C" fn model_del_child(
    object: *mut NativeObject,
    child: *mut NativeObject,
    error: *mut NativeError,
) -> bool {
    // SAFETY: The caller passes a live object.
    let Some((_, model)) = (unsafe { model_of(object) }) else {
        not_a_model(error);
        return false;
    };
    // SAFETY: Dispatch through the class record of the object.
    unsafe { (class_of(model).del_child)(object, child, error) }
}

#[no_mangle]
pub unsafe extern "C" fn model_type_register(name: StringView, class: *const ModelClass) -> u64 {
    // SAFETY: The caller passes a readable class record, copied here.
    let Some(class) = (unsafe { class.as_ref() }) else {
        return 0;
    };
    let mut types = types().lock();
    types.push((view_to_string(name), *class));
    types.len() as u64
}

#[no_mangle]
pub unsafe extern "C" fn model_new(
    type_id: u64,
    instance_data: *mut c_void,
    destroy: DestroyNotify,
) -> *mut NativeObject {
    if type_id == 0 || type_id > types().lock().len() as u64 {
        return ptr::null_mut();
    }
    let instance = (!instance_data.is_null()).then_some(Instance {
        data: instance_data,
        destroy,
    });
    MockObject::new_model(type_id, instance).as_native()
}

#[no_mangle]
pub unsafe extern "C" fn model_base_get_property(
    object: *mut NativeObject,
    name: StringView,
    out: *mut NativeValue,
    error: *mut NativeError,
) -> bool {
    // SAFETY: The caller passes a live object.
    let Some((_, model)) = (unsafe { model_of(object) }) else {
        not_a_model(error);
        return false;
    };
    let name = view_to_string(name);
    let state = model.state.lock();
    if state.not_ready.contains(&name) {
        drop(state);
        fill_error(error, NATIVE_TRY_AGAIN, &format!("property `{name}` is not ready"));
        return false;
    }
    match state.properties.get(&name) {
        Some(value) => {
            // SAFETY: The caller passes a writable value.
            unsafe { *out = value_to_native(value) };
            true
        }
        None => {
            drop(state);
            fill_error(error, NATIVE_NOT_FOUND, &format!("unknown property `{name}`"));
            false
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn model_base_set_property(
    object: *mut NativeObject,
    name: StringView,
    value: *const NativeValue,
    out: *mut NativeValue,
    error: *mut NativeError,
) -> bool {
    // SAFETY: The caller passes a live object.
    let Some((ptr, model)) = (unsafe { model_of(object) }) else {
        not_a_model(error);
        return false;
    };
    let name = view_to_string(name);
    // SAFETY: The input value is borrowed for the call.
    let input = unsafe { value.as_ref() }.map_or(Value::Empty, |value| unsafe {
        value_from_native(value)
    });

    let (stored, changed) = {
        let mut state = model.state.lock();
        if state.read_only.contains(&name) {
            (state.properties.get(&name).cloned().unwrap_or_default(), false)
        } else if !state.properties.contains_key(&name)
            && state.policy == UnknownPropertyPolicy::Reject
        {
            drop(state);
            fill_error(error, NATIVE_NOT_FOUND, &format!("unknown property `{name}`"));
            return false;
        } else {
            let previous = state.properties.insert(name.clone(), input.clone());
            state.not_ready.remove(&name);
            let changed = previous.as_ref() != Some(&input);
            (input, changed)
        }
    };
    if changed {
        emit_properties_changed(ptr, &[name.as_str()], &[]);
    }
    // SAFETY: The caller passes a writable value.
    unsafe { *out = value_to_native(&stored) };
    true
}

#[no_mangle]
pub unsafe extern "C" fn model_base_get_children_count(
    object: *mut NativeObject,
    error: *mut NativeError,
) -> u32 {
    // SAFETY: The caller passes a live object.
    match unsafe { model_of(object) } {
        Some((_, model)) => model.state.lock().children.len() as u32,
        None => {
            not_a_model(error);
            0
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn model_base_add_child(
    object: *mut NativeObject,
    error: *mut NativeError,
) -> *mut NativeObject {
    // SAFETY: The caller passes a live object.
    let Some((ptr, model)) = (unsafe { model_of(object) }) else {
        not_a_model(error);
        return ptr::null_mut();
    };
    let child = MockObject::new_model(BASE_TYPE, None);
    // The reference of the caller, taken before handlers get a chance to remove the child.
    object_ref(child);
    let index = {
        let mut state = model.state.lock();
        state.children.push(child);
        state.children.len() as u32 - 1
    };
    emit_child_event(ptr, EVENT_CHILD_ADDED, index, Some(child));
    emit(ptr, EVENT_CHILDREN_COUNT_CHANGED, ptr::null());
    child.as_native()
}

#[no_mangle]
pub unsafe extern "C" fn model_base_del_child(
    object: *mut NativeObject,
    child: *mut NativeObject,
    error: *mut NativeError,
) -> bool {
    // SAFETY: The caller passes a live object.
    let Some((ptr, model)) = (unsafe { model_of(object) }) else {
        not_a_model(error);
        return false;
    };
    let child = Ptr::from_native(child);
    let index = child.and_then(|child| {
        let mut state = model.state.lock();
        let position = state.children.iter().position(|candidate| *candidate == child)?;
        state.children.remove(position);
        Some(position)
    });
    let (Some(index), Some(child)) = (index, child) else {
        fill_error(error, NATIVE_NOT_FOUND, "object is not a child of this model");
        return false;
    };
    emit_child_event(ptr, EVENT_CHILD_REMOVED, index as u32, Some(child));
    emit(ptr, EVENT_CHILDREN_COUNT_CHANGED, ptr::null());
    object_unref(child);
    true
}

/// Complete everything waiting for `name` with `value`.
pub(crate) fn make_ready(ptr: Ptr, model: &ModelBody, name: &str, value: Value) {
    let waiters: Vec<Ptr> = {
        let mut state = model.state.lock();
        state.properties.insert(name.to_string(), value.clone());
        state.not_ready.remove(name);
        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.waiters)
            .into_iter()
            .partition(|(waiting_for, _)| waiting_for == name);
        state.waiters = pending;
        ready.into_iter().map(|(_, future)| future).collect()
    };
    for future in waiters {
        complete(future, Outcome::Value(value_to_native(&value)));
        object_unref(future);
    }
    emit_properties_changed(ptr, &[name], &[]);
}

/// Complete every held future with the outcome computed when it was handed out.
pub(crate) fn release_held(model: &ModelBody) -> usize {
    let held = std::mem::take(&mut model.state.lock().held);
    let released = held.len();
    for (future, outcome) in held {
        complete(future, outcome);
        object_unref(future);
    }
    released
}
