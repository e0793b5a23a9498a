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

//! In-memory objects of the mock library: reference counted models and futures.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::{c_char, c_void, CString};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use model_api_concept::{ObjectValue, Value};
use model_plumbing_rs::{
    ChildEventRecord, DestroyNotify, EventCallback, FutureCallback, NativeError, NativeIter,
    NativeObject, NativeValue, PropertiesChangedRecord, FUTURE_CANCELED, FUTURE_FAILED,
    FUTURE_PENDING, FUTURE_RESOLVED, VALUE_BOOL, VALUE_DOUBLE, VALUE_INT, VALUE_ITER,
    VALUE_OBJECT, VALUE_STRING, VALUE_UINT,
};

pub const EVENT_PROPERTIES_CHANGED: u32 = 1;
pub const EVENT_CHILD_ADDED: u32 = 2;
pub const EVENT_CHILD_REMOVED: u32 = 3;
pub const EVENT_CHILDREN_COUNT_CHANGED: u32 = 4;

pub(crate) const EVENT_NAMESPACE: &str = "model";

pub(crate) const EVENT_KEYS: [(&str, u32); 4] = [
    ("properties-changed", EVENT_PROPERTIES_CHANGED),
    ("child-added", EVENT_CHILD_ADDED),
    ("child-removed", EVENT_CHILD_REMOVED),
    ("children-count-changed", EVENT_CHILDREN_COUNT_CHANGED),
];

pub(crate) fn event_id(key: &str) -> u32 {
    EVENT_KEYS
        .iter()
        .find(|(candidate, _)| *candidate == key)
        .map_or(0, |(_, id)| *id)
}

/// What `set_property` does with a name the model does not know yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownPropertyPolicy {
    /// Create the property.
    #[default]
    Create,
    /// Fail with `NOT_FOUND`.
    Reject,
}

/// Raw object pointer that may cross threads; objects are internally synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ptr(pub(crate) *mut MockObject);

// SAFETY: All mutable object state is behind locks or atomics.
unsafe impl Send for Ptr {}
// SAFETY: see above
unsafe impl Sync for Ptr {}

impl Ptr {
    pub(crate) fn from_native(object: *mut NativeObject) -> Option<Self> {
        (!object.is_null()).then_some(Self(object as *mut MockObject))
    }

    pub(crate) fn as_native(self) -> *mut NativeObject {
        self.0 as *mut NativeObject
    }

    /// # Safety
    ///
    /// The object must be alive for `'a`.
    pub(crate) unsafe fn get<'a>(self) -> &'a MockObject {
        // SAFETY: upheld by the caller as documented above
        unsafe { &*self.0 }
    }
}

pub(crate) struct MockObject {
    refs: AtomicUsize,
    pub(crate) body: Body,
}

pub(crate) enum Body {
    Model(ModelBody),
    Future(FutureBody),
}

pub(crate) struct Instance {
    pub(crate) data: *mut c_void,
    pub(crate) destroy: DestroyNotify,
}

pub(crate) struct ModelBody {
    pub(crate) type_id: u64,
    pub(crate) instance: Option<Instance>,
    pub(crate) state: Mutex<ModelState>,
}

#[derive(Default)]
pub(crate) struct ModelState {
    pub(crate) properties: BTreeMap<String, Value>,
    pub(crate) not_ready: BTreeSet<String>,
    pub(crate) read_only: BTreeSet<String>,
    pub(crate) waiters: Vec<(String, Ptr)>,
    pub(crate) children: Vec<Ptr>,
    pub(crate) connections: Vec<Arc<Connection>>,
    pub(crate) policy: UnknownPropertyPolicy,
    pub(crate) fail_connect: bool,
    pub(crate) emit_on_connect: bool,
    pub(crate) hold_futures: bool,
    pub(crate) held: Vec<(Ptr, Outcome)>,
    pub(crate) double_completion: bool,
}

pub(crate) struct Connection {
    pub(crate) id: u64,
    pub(crate) event: u32,
    callback: EventCallback,
    user_data: *mut c_void,
    destroy: DestroyNotify,
}

// SAFETY: The bridge guarantees its callbacks and user data may be used from any thread.
unsafe impl Send for Connection {}
// SAFETY: see above
unsafe impl Sync for Connection {}

impl Drop for Connection {
    fn drop(&mut self) {
        // SAFETY: Runs exactly once, after the last dispatch through this connection finished.
        unsafe { (self.destroy)(self.user_data) };
    }
}

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

impl Connection {
    pub(crate) fn new(
        event: u32,
        callback: EventCallback,
        user_data: *mut c_void,
        destroy: DestroyNotify,
    ) -> Self {
        Self {
            id: NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed),
            event,
            callback,
            user_data,
            destroy,
        }
    }
}

/// Outcome of a native future.
pub(crate) enum Outcome {
    Value(NativeValue),
    Error(i32, String),
    Canceled,
}

// SAFETY: A value owned by an outcome is only touched by whoever completes the future.
unsafe impl Send for Outcome {}

struct ThenCallback {
    callback: FutureCallback,
    user_data: *mut c_void,
    destroy: DestroyNotify,
}

pub(crate) struct FutureState {
    status: u32,
    value: Option<NativeValue>,
    error: Option<(i32, String)>,
    callbacks: Vec<ThenCallback>,
    double_completion: bool,
}

pub(crate) struct FutureBody {
    pub(crate) state: Mutex<FutureState>,
}

impl MockObject {
    fn alloc(body: Body) -> Ptr {
        Ptr(Box::into_raw(Box::new(MockObject {
            refs: AtomicUsize::new(1),
            body,
        })))
    }

    pub(crate) fn new_model(type_id: u64, instance: Option<Instance>) -> Ptr {
        Self::alloc(Body::Model(ModelBody {
            type_id,
            instance,
            state: Mutex::new(ModelState::default()),
        }))
    }

    pub(crate) fn new_future(double_completion: bool) -> Ptr {
        Self::alloc(Body::Future(FutureBody {
            state: Mutex::new(FutureState {
                status: FUTURE_PENDING,
                value: None,
                error: None,
                callbacks: Vec::new(),
                double_completion,
            }),
        }))
    }

    pub(crate) fn model(&self) -> Option<&ModelBody> {
        match &self.body {
            Body::Model(model) => Some(model),
            Body::Future(_) => None,
        }
    }

    pub(crate) fn future(&self) -> Option<&FutureBody> {
        match &self.body {
            Body::Future(future) => Some(future),
            Body::Model(_) => None,
        }
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }
}

pub(crate) fn object_ref(object: Ptr) {
    // SAFETY: The caller owns a reference.
    unsafe { object.get() }.refs.fetch_add(1, Ordering::AcqRel);
}

pub(crate) fn object_unref(object: Ptr) {
    // SAFETY: The caller owns a reference.
    if unsafe { object.get() }.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }
    // SAFETY: That was the last reference.
    let object = unsafe { *Box::from_raw(object.0) };
    match object.body {
        Body::Model(model) => finalize_model(model),
        Body::Future(future) => {
            let state = future.state.into_inner();
            if let Some(mut value) = state.value {
                value_clear(&mut value);
            }
            for then in state.callbacks {
                // SAFETY: Never invoked, released once.
                unsafe { (then.destroy)(then.user_data) };
            }
        }
    }
}

fn finalize_model(model: ModelBody) {
    if let Some(instance) = model.instance {
        // SAFETY: The instance data is released once, when its object dies.
        unsafe { (instance.destroy)(instance.data) };
    }
    let state = model.state.into_inner();
    for (_, waiter) in state.waiters {
        complete(waiter, Outcome::Canceled);
        object_unref(waiter);
    }
    for (future, outcome) in state.held {
        drop_outcome(outcome);
        complete(future, Outcome::Canceled);
        object_unref(future);
    }
    for child in state.children {
        object_unref(child);
    }
    drop(state.connections);
}

/// Complete `future` and run its callbacks. Returns `false` if it was already complete.
pub(crate) fn complete(future: Ptr, outcome: Outcome) -> bool {
    // SAFETY: The caller owns a reference to the future.
    let Some(body) = (unsafe { future.get() }).future() else {
        drop_outcome(outcome);
        return false;
    };
    let (callbacks, double) = {
        let mut state = body.state.lock();
        if state.status != FUTURE_PENDING {
            drop(state);
            drop_outcome(outcome);
            return false;
        }
        match outcome {
            Outcome::Value(value) => {
                state.status = FUTURE_RESOLVED;
                state.value = Some(value);
            }
            Outcome::Error(code, message) => {
                state.status = FUTURE_FAILED;
                state.error = Some((code, message));
            }
            Outcome::Canceled => state.status = FUTURE_CANCELED,
        }
        (std::mem::take(&mut state.callbacks), state.double_completion)
    };
    for then in callbacks {
        run_then(future, then, double);
    }
    true
}

fn run_then(future: Ptr, then: ThenCallback, double: bool) {
    // SAFETY: The callback contract of `future_then`.
    unsafe {
        (then.callback)(future.as_native(), then.user_data);
        if double {
            (then.callback)(future.as_native(), then.user_data);
        }
        (then.destroy)(then.user_data);
    }
}

pub(crate) fn future_then(
    future: Ptr,
    callback: FutureCallback,
    user_data: *mut c_void,
    destroy: DestroyNotify,
) {
    let then = ThenCallback {
        callback,
        user_data,
        destroy,
    };
    // SAFETY: The caller owns a reference to the future.
    let Some(body) = (unsafe { future.get() }).future() else {
        // SAFETY: Not a future, the callback is never invoked.
        unsafe { (then.destroy)(then.user_data) };
        return;
    };
    let mut state = body.state.lock();
    if state.status == FUTURE_PENDING {
        state.callbacks.push(then);
        return;
    }
    let double = state.double_completion;
    drop(state);
    run_then(future, then, double);
}

pub(crate) fn future_state(future: Ptr) -> u32 {
    // SAFETY: The caller owns a reference to the future.
    (unsafe { future.get() })
        .future()
        .map_or(FUTURE_FAILED, |body| body.state.lock().status)
}

pub(crate) fn future_take_value(future: Ptr) -> Option<NativeValue> {
    // SAFETY: The caller owns a reference to the future.
    (unsafe { future.get() })
        .future()
        .and_then(|body| body.state.lock().value.take())
}

pub(crate) fn future_take_error(future: Ptr) -> Option<(i32, String)> {
    // SAFETY: The caller owns a reference to the future.
    (unsafe { future.get() })
        .future()
        .and_then(|body| body.state.lock().error.take())
}

fn drop_outcome(outcome: Outcome) {
    if let Outcome::Value(mut value) = outcome {
        value_clear(&mut value);
    }
}

/// Allocate a NUL terminated copy of `bytes` with the C allocator.
pub(crate) fn malloc_string(bytes: &[u8]) -> *mut c_char {
    // SAFETY: The allocation has room for the bytes and the terminator.
    unsafe {
        let raw = libc::malloc(bytes.len() + 1) as *mut u8;
        if raw.is_null() {
            return std::ptr::null_mut();
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), raw, bytes.len());
        *raw.add(bytes.len()) = 0;
        raw as *mut c_char
    }
}

pub(crate) fn fill_error(error: *mut NativeError, code: i32, message: &str) {
    if error.is_null() {
        return;
    }
    // SAFETY: The caller passes a writable error record.
    unsafe {
        (*error).code = code;
        (*error).message = malloc_string(message.as_bytes());
    }
}

/// Copy the message out of an error record and release it.
pub(crate) fn take_error_message(error: &mut NativeError) -> String {
    if error.message.is_null() {
        return String::new();
    }
    // SAFETY: Messages are allocated by `malloc_string`.
    let message = unsafe { std::ffi::CStr::from_ptr(error.message) }
        .to_string_lossy()
        .into_owned();
    // SAFETY: see above
    unsafe { libc::free(error.message as *mut c_void) };
    error.message = std::ptr::null_mut();
    message
}

/// Reference to a mock object held by a stored [`Value`].
struct MockRef(Ptr);

impl Drop for MockRef {
    fn drop(&mut self) {
        object_unref(self.0);
    }
}

/// Stored value referring to `object`, taking a reference.
pub(crate) fn object_value(object: Ptr) -> Value {
    object_ref(object);
    Value::Object(ObjectValue::new(object.0 as usize, MockRef(object)))
}

/// Native value owning its payload, as handed out to callers.
pub(crate) fn value_to_native(value: &Value) -> NativeValue {
    match value {
        Value::Empty => NativeValue::empty(),
        Value::Bool(v) => NativeValue::boolean(*v),
        Value::Int(v) => NativeValue::int(*v),
        Value::UInt(v) => NativeValue::uint(*v),
        Value::Double(v) => NativeValue::double(*v),
        Value::String(v) => NativeValue::string(malloc_string(v.as_bytes())),
        Value::Object(object) => match object.downcast_ref::<MockRef>() {
            Some(MockRef(object)) => {
                object_ref(*object);
                NativeValue::object(object.as_native())
            }
            None => NativeValue::empty(),
        },
        Value::Sequence(items) => {
            NativeValue::iter(MockIter::new(items.iter().map(value_to_native).collect()))
        }
    }
}

/// Copy a borrowed native value.
///
/// # Safety
///
/// `value` must be a valid native value.
pub(crate) unsafe fn value_from_native(value: &NativeValue) -> Value {
    // SAFETY: The tag selects the initialized union field.
    unsafe {
        match value.tag {
            VALUE_BOOL => Value::Bool(value.payload.boolean),
            VALUE_INT => Value::Int(value.payload.int),
            VALUE_UINT => Value::UInt(value.payload.uint),
            VALUE_DOUBLE => Value::Double(value.payload.double),
            VALUE_STRING if !value.payload.string.is_null() => Value::String(
                std::ffi::CStr::from_ptr(value.payload.string)
                    .to_string_lossy()
                    .into_owned(),
            ),
            VALUE_OBJECT => {
                Ptr::from_native(value.payload.object).map_or(Value::Empty, object_value)
            }
            VALUE_ITER => match (value.payload.iter as *const MockIter).as_ref() {
                Some(iter) => Value::Sequence(
                    iter.items.iter().map(|item| value_from_native(item)).collect(),
                ),
                None => Value::Empty,
            },
            _ => Value::Empty,
        }
    }
}

pub(crate) fn value_clear(value: &mut NativeValue) {
    // SAFETY: The value is owned by the caller; the tag selects the initialized field.
    unsafe {
        match value.tag {
            VALUE_STRING => libc::free(value.payload.string as *mut c_void),
            VALUE_OBJECT => {
                if let Some(object) = Ptr::from_native(value.payload.object) {
                    object_unref(object);
                }
            }
            VALUE_ITER => {
                if !value.payload.iter.is_null() {
                    drop(Box::from_raw(value.payload.iter as *mut MockIter));
                }
            }
            _ => {}
        }
    }
    *value = NativeValue::empty();
}

/// Iterator over values owned by the iterator itself.
pub(crate) struct MockIter {
    items: Vec<NativeValue>,
    position: usize,
}

impl MockIter {
    pub(crate) fn new(items: Vec<NativeValue>) -> *mut NativeIter {
        Box::into_raw(Box::new(MockIter { items, position: 0 })) as *mut NativeIter
    }

    /// Iterator owning copies of borrowed `items`.
    ///
    /// # Safety
    ///
    /// Every item must be a valid native value.
    pub(crate) unsafe fn copy_of(items: &[NativeValue]) -> *mut NativeIter {
        // SAFETY: upheld by the caller as documented above
        let owned = items
            .iter()
            .map(|item| value_to_native(&unsafe { value_from_native(item) }))
            .collect();
        Self::new(owned)
    }

    /// Next item, borrowed from the iterator.
    pub(crate) fn next(&mut self) -> Option<NativeValue> {
        let item = self.items.get(self.position)?;
        self.position += 1;
        Some(*item)
    }

    pub(crate) fn reset(&mut self) {
        self.position = 0;
    }
}

impl Drop for MockIter {
    fn drop(&mut self) {
        for item in &mut self.items {
            value_clear(item);
        }
    }
}

/// Raise `event` on `object` with the given payload record.
pub(crate) fn emit(object: Ptr, event: u32, payload: *const c_void) {
    // SAFETY: The caller owns a reference to the object.
    let Some(model) = (unsafe { object.get() }).model() else {
        return;
    };
    let targets: Vec<Arc<Connection>> = model
        .state
        .lock()
        .connections
        .iter()
        .filter(|connection| connection.event == event)
        .cloned()
        .collect();
    for connection in &targets {
        // SAFETY: The connection context stays alive while `targets` holds the connection.
        unsafe { (connection.callback)(object.as_native(), payload, connection.user_data) };
    }
}

pub(crate) fn emit_properties_changed(object: Ptr, changed: &[&str], invalidated: &[&str]) {
    let changed: Vec<CString> = changed.iter().filter_map(|s| CString::new(*s).ok()).collect();
    let invalidated: Vec<CString> = invalidated
        .iter()
        .filter_map(|s| CString::new(*s).ok())
        .collect();
    let terminated = |strings: &[CString]| -> Vec<*const c_char> {
        strings
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect()
    };
    let changed_array = terminated(&changed);
    let invalidated_array = terminated(&invalidated);
    let record = PropertiesChangedRecord {
        changed: changed_array.as_ptr(),
        invalidated: invalidated_array.as_ptr(),
    };
    emit(
        object,
        EVENT_PROPERTIES_CHANGED,
        &record as *const PropertiesChangedRecord as *const c_void,
    );
}

pub(crate) fn emit_child_event(object: Ptr, event: u32, index: u32, child: Option<Ptr>) {
    let record = ChildEventRecord {
        index,
        child: child.map_or(std::ptr::null_mut(), Ptr::as_native),
    };
    emit(object, event, &record as *const ChildEventRecord as *const c_void);
}
