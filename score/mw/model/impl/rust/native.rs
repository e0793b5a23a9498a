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

//! Access to the native model library.
//!
//! The library is reached through a [`SymbolSource`] that maps exported names to untyped entry
//! points. All required entry points are resolved once when the [`NativeLibrary`] is loaded and
//! kept in the typed [`NativeApi`] table. Besides the table, the library owns the state that is
//! shared by all handles of one bridge: the symbol and event id caches, the release queue and the
//! channel of callback failures that could not be reported at the boundary.

use std::collections::{HashMap, VecDeque};
use std::ffi::{c_char, c_void, CStr};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use model_api_concept::{Error, HandlerId, Result};
use model_plumbing_rs::{
    DestroyNotify, EventCallback, FutureCallback, ModelClass, NativeError, NativeIter,
    NativeObject, NativeValue, StringView, NATIVE_CANCELED, NATIVE_OK, NATIVE_TRY_AGAIN,
    NATIVE_UNHANDLED_CALLBACK,
};

use crate::config::BridgeConfig;
use crate::event_registry::EventDescriptor;
use crate::guard::{self, Failure};
use crate::native_symbols;

/// Prefix of native error messages that name a recorded callback failure.
const FAILURE_TAG: &str = "[callback failure #";

/// Untyped address of an exported native entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawSymbol(NonNull<c_void>);

// SAFETY: A symbol is the address of immutable code inside the native library.
unsafe impl Send for RawSymbol {}
// SAFETY: see above
unsafe impl Sync for RawSymbol {}

impl RawSymbol {
    pub fn new(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Name based lookup of native entry points.
pub trait SymbolSource: Send + Sync {
    fn lookup(&self, name: &str) -> Option<RawSymbol>;
}

impl<F> SymbolSource for F
where
    F: Fn(&str) -> Option<RawSymbol> + Send + Sync,
{
    fn lookup(&self, name: &str) -> Option<RawSymbol> {
        self(name)
    }
}

native_symbols! {
    /// Typed entry points every native model library has to export.
    pub struct NativeApi {
        object_ref: "object_ref" => unsafe extern "C" fn(*mut NativeObject) -> *mut NativeObject,
        object_unref: "object_unref" => unsafe extern "C" fn(*mut NativeObject),
        object_get_instance_data: "object_get_instance_data" =>
            unsafe extern "C" fn(*mut NativeObject) -> *mut c_void,
        string_new: "string_new" => unsafe extern "C" fn(StringView) -> *mut c_char,
        string_free: "string_free" => unsafe extern "C" fn(*mut c_char),
        value_clear: "value_clear" => unsafe extern "C" fn(*mut NativeValue),
        iter_next: "iter_next" => unsafe extern "C" fn(*mut NativeIter, *mut NativeValue) -> bool,
        iter_reset: "iter_reset" => unsafe extern "C" fn(*mut NativeIter) -> bool,
        iter_free: "iter_free" => unsafe extern "C" fn(*mut NativeIter),
        iter_new: "iter_new" => unsafe extern "C" fn(*const NativeValue, u32) -> *mut NativeIter,
        event_lookup: "event_lookup" => unsafe extern "C" fn(StringView, StringView) -> u32,
        event_connect: "event_connect" => unsafe extern "C" fn(
            *mut NativeObject,
            u32,
            EventCallback,
            *mut c_void,
            DestroyNotify,
        ) -> u64,
        event_disconnect: "event_disconnect" => unsafe extern "C" fn(*mut NativeObject, u64),
        future_then: "future_then" =>
            unsafe extern "C" fn(*mut NativeObject, FutureCallback, *mut c_void, DestroyNotify),
        future_state: "future_state" => unsafe extern "C" fn(*mut NativeObject) -> u32,
        future_take_value: "future_take_value" =>
            unsafe extern "C" fn(*mut NativeObject, *mut NativeValue) -> bool,
        future_take_error: "future_take_error" =>
            unsafe extern "C" fn(*mut NativeObject, *mut NativeError) -> bool,
        future_cancel: "future_cancel" => unsafe extern "C" fn(*mut NativeObject),
        get_properties: "get_properties" =>
            unsafe extern "C" fn(*mut NativeObject, *mut NativeError) -> *mut NativeIter,
        get_property: "get_property" => unsafe extern "C" fn(
            *mut NativeObject,
            StringView,
            *mut NativeValue,
            *mut NativeError,
        ) -> bool,
        set_property: "set_property" => unsafe extern "C" fn(
            *mut NativeObject,
            StringView,
            *const NativeValue,
            *mut NativeError,
        ) -> *mut NativeObject,
        get_children_count: "get_children_count" =>
            unsafe extern "C" fn(*mut NativeObject, *mut NativeError) -> u32,
        get_property_ready: "get_property_ready" =>
            unsafe extern "C" fn(
                *mut NativeObject,
                StringView,
                *mut NativeError,
            ) -> *mut NativeObject,
        get_children_slice: "get_children_slice" =>
            unsafe extern "C" fn(
                *mut NativeObject,
                u32,
                u32,
                *mut NativeError,
            ) -> *mut NativeObject,
        add_child: "add_child" =>
            unsafe extern "C" fn(*mut NativeObject, *mut NativeError) -> *mut NativeObject,
        del_child: "del_child" =>
            unsafe extern "C" fn(*mut NativeObject, *mut NativeObject, *mut NativeError) -> bool,
        type_register: "type_register" =>
            unsafe extern "C" fn(StringView, *const ModelClass) -> u64,
        new: "new" => unsafe extern "C" fn(u64, *mut c_void, DestroyNotify) -> *mut NativeObject,
    }
}

struct PendingRelease(NonNull<NativeObject>);

// SAFETY: Native objects are reference counted with thread safe counters; the queue only hands
// the pointer back to `object_unref`.
unsafe impl Send for PendingRelease {}

/// One loaded native model library.
pub struct NativeLibrary {
    api: NativeApi,
    prefix: String,
    defer_release: bool,
    source: Box<dyn SymbolSource>,
    symbols: Mutex<HashMap<String, RawSymbol>>,
    events: Mutex<HashMap<EventDescriptor, u32>>,
    releases: Mutex<Vec<PendingRelease>>,
    unhandled: Mutex<VecDeque<Failure>>,
    next_failure: AtomicU64,
    next_handler: AtomicU64,
}

impl NativeLibrary {
    /// Resolve every required entry point.
    ///
    /// # Errors
    ///
    /// [`Error::SymbolNotFound`] naming the first missing entry point.
    pub fn load(source: Box<dyn SymbolSource>, config: &BridgeConfig) -> Result<Arc<Self>> {
        let mut symbols = HashMap::new();
        let api = NativeApi::resolve(&config.entity_prefix, |name| {
            let symbol = source
                .lookup(name)
                .ok_or_else(|| Error::SymbolNotFound(name.to_string()))?;
            symbols.insert(name.to_string(), symbol);
            Ok(symbol)
        })?;
        debug!(
            "Resolved {} native entry points with prefix `{}`",
            symbols.len(),
            config.entity_prefix
        );

        Ok(Arc::new(Self {
            api,
            prefix: config.entity_prefix.clone(),
            defer_release: config.defer_release_in_callbacks,
            source,
            symbols: Mutex::new(symbols),
            events: Mutex::new(HashMap::new()),
            releases: Mutex::new(Vec::new()),
            unhandled: Mutex::new(VecDeque::new()),
            next_failure: AtomicU64::new(1),
            next_handler: AtomicU64::new(1),
        }))
    }

    pub fn api(&self) -> &NativeApi {
        &self.api
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Look up an arbitrary entry point by its full name, caching the result.
    pub fn symbol(&self, name: &str) -> Result<RawSymbol> {
        let mut symbols = self.symbols.lock();
        if let Some(symbol) = symbols.get(name) {
            return Ok(*symbol);
        }
        let symbol = self
            .source
            .lookup(name)
            .ok_or_else(|| Error::SymbolNotFound(name.to_string()))?;
        symbols.insert(name.to_string(), symbol);
        Ok(symbol)
    }

    /// Native id of an event, resolved on first use and cached afterwards.
    pub fn resolve_event(&self, descriptor: &EventDescriptor) -> Result<u32> {
        let mut events = self.events.lock();
        if let Some(id) = events.get(descriptor) {
            return Ok(*id);
        }
        let namespace = StringView::from(descriptor.namespace.as_str());
        let key = StringView::from(descriptor.key.as_str());
        // SAFETY: Both views borrow strings that outlive the call.
        let id = unsafe { (self.api.event_lookup)(namespace, key) };
        if id == 0 {
            return Err(descriptor.registration_failed());
        }
        debug!("Resolved event {descriptor} to native id {id}");
        events.insert(descriptor.clone(), id);
        Ok(id)
    }

    /// Prologue of every checked boundary call.
    ///
    /// Drains the release queue and surfaces the oldest callback failure that has not been
    /// reported yet, in which case the boundary call must not be performed.
    pub fn enter(&self) -> Result<()> {
        self.sweep();
        match self.unhandled.lock().pop_front() {
            Some(failure) => Err(failure.error),
            None => Ok(()),
        }
    }

    /// Turn a native error record into a result, taking ownership of its message.
    ///
    /// `subject` names what the call was about, e.g. the property for `TRY_AGAIN`.
    pub fn check(&self, error: NativeError, subject: &str) -> Result<()> {
        if error.is_ok() {
            self.free_message(error);
            return Ok(());
        }
        Err(self.error_from_native(error, subject))
    }

    pub(crate) fn error_from_native(&self, error: NativeError, subject: &str) -> Error {
        let code = error.code;
        let message = self.take_message(error);
        match code {
            NATIVE_OK => Error::failed(format!("{subject} failed without error detail")),
            NATIVE_TRY_AGAIN => Error::PropertyNotReady(subject.to_string()),
            NATIVE_CANCELED => Error::Canceled,
            NATIVE_UNHANDLED_CALLBACK => self.take_failure(subject, message),
            code => Error::OperationFailed { code, message },
        }
    }

    /// The recorded failure named by `message`, or one built from the message if it names none
    /// or was already surfaced.
    fn take_failure(&self, subject: &str, message: String) -> Error {
        let parsed = message
            .strip_prefix(FAILURE_TAG)
            .and_then(|rest| rest.split_once("] "))
            .and_then(|(token, rest)| Some((token.parse::<u64>().ok()?, rest.to_string())));
        let Some((token, rest)) = parsed else {
            return Error::UnhandledCallbackError {
                context: subject.to_string(),
                message,
            };
        };
        let mut unhandled = self.unhandled.lock();
        let recorded = unhandled
            .iter()
            .position(|failure| failure.token == token)
            .and_then(|position| unhandled.remove(position));
        match recorded {
            Some(failure) => failure.error,
            // Already drained through `take_unhandled_errors`.
            None => Error::UnhandledCallbackError {
                context: subject.to_string(),
                message: rest,
            },
        }
    }

    fn take_message(&self, error: NativeError) -> String {
        if error.message.is_null() {
            return String::new();
        }
        // SAFETY: The message is a NUL terminated string allocated by the native side and
        // transferred with the error record.
        let message = unsafe { CStr::from_ptr(error.message) }
            .to_string_lossy()
            .into_owned();
        self.free_message(error);
        message
    }

    fn free_message(&self, error: NativeError) {
        if !error.message.is_null() {
            // SAFETY: see `take_message`
            unsafe { (self.api.string_free)(error.message) };
        }
    }

    /// Allocate a copy of `value` with the native allocator.
    pub(crate) fn new_string(&self, value: &str) -> *mut c_char {
        // SAFETY: The view borrows `value` for the duration of the call only.
        unsafe { (self.api.string_new)(StringView::from(value)) }
    }

    /// Fill a native error out-parameter.
    pub(crate) fn fill_error(&self, error: *mut NativeError, code: i32, message: &str) {
        if error.is_null() {
            return;
        }
        let message = self.new_string(message);
        // SAFETY: The native caller passes a valid, writable error record.
        unsafe {
            (*error).code = code;
            (*error).message = message;
        }
    }

    /// Record a callback failure that could not cross the native boundary.
    pub fn report_unhandled(&self, error: Error) -> Failure {
        let failure = Failure {
            token: self.next_failure.fetch_add(1, Ordering::Relaxed),
            error,
        };
        self.unhandled.lock().push_back(failure.clone());
        failure
    }

    /// Fill the native error out-parameter of a failed callback so that the boundary call that
    /// receives it surfaces `failure` itself, not whatever failure is oldest.
    pub(crate) fn fill_failure(&self, error: *mut NativeError, failure: &Failure) {
        let message = format!("{FAILURE_TAG}{}] {}", failure.token, failure.error);
        self.fill_error(error, NATIVE_UNHANDLED_CALLBACK, &message);
    }

    /// Drain all recorded callback failures, oldest first.
    pub fn take_unhandled_errors(&self) -> Vec<Error> {
        self.unhandled
            .lock()
            .drain(..)
            .map(|failure| failure.error)
            .collect()
    }

    /// Handler id that is unique among all registries of this library.
    pub(crate) fn next_handler_id(&self) -> HandlerId {
        HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn release(&self, object: NonNull<NativeObject>) {
        if self.defer_release && guard::in_native_callback() {
            warn!("Deferring release of native object {object:p} raised inside a native callback");
            self.releases.lock().push(PendingRelease(object));
            return;
        }
        // SAFETY: The caller owns one reference to `object`, which is given up here.
        unsafe { (self.api.object_unref)(object.as_ptr()) };
    }

    /// Release all deferred references. Returns the number of released references.
    ///
    /// Does nothing while the current thread is inside a native callback.
    pub fn sweep(&self) -> usize {
        if guard::in_native_callback() {
            return 0;
        }
        let pending = std::mem::take(&mut *self.releases.lock());
        let released = pending.len();
        for PendingRelease(object) in pending {
            // SAFETY: Every queued pointer carries one reference owned by the queue.
            unsafe { (self.api.object_unref)(object.as_ptr()) };
        }
        if released > 0 {
            debug!("Released {released} deferred native references");
        }
        released
    }

    pub fn pending_releases(&self) -> usize {
        self.releases.lock().len()
    }
}

impl Drop for NativeLibrary {
    fn drop(&mut self) {
        for PendingRelease(object) in self.releases.get_mut().drain(..) {
            // SAFETY: see `sweep`
            unsafe { (self.api.object_unref)(object.as_ptr()) };
        }
    }
}

impl core::fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NativeLibrary")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
