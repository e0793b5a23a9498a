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
use core::future::Future;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use model_api_concept::{
    CallbackResult, ChildEvent, Error, EventKind, HandlerId, Model, ModelEvent, ObservableModel,
    Result, Value,
};
use model_plumbing_rs::{NativeError, NativeObject, NativeValue, StringView};

use crate::config::BridgeConfig;
use crate::dispatch::{DispatchTable, ModelImpl};
use crate::event_registry::{EventDescriptor, EventRegistry};
use crate::future::{CancellationToken, NativeFuture};
use crate::handle::NativeHandle;
use crate::marshal::{BorrowedValue, FromNative, ObjectRef, Ownership, ValueIter};
use crate::native::NativeLibrary;

struct BridgeInner {
    lib: Arc<NativeLibrary>,
    config: BridgeConfig,
    /// Live wrapper of every wrapped native object, keyed by its address.
    models: Mutex<HashMap<usize, Weak<ModelInner>>>,
}

/// Entry point to one loaded native model library, see [`crate::BridgeBuilder`].
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    pub(crate) fn new(lib: Arc<NativeLibrary>, config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                lib,
                config,
                models: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn library(&self) -> &Arc<NativeLibrary> {
        &self.inner.lib
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Descriptor of a model event in the configured namespace.
    pub fn descriptor(&self, kind: EventKind) -> EventDescriptor {
        EventDescriptor::model(&self.inner.config.event_namespace, kind)
    }

    /// Wrap a native model borrowed from the caller.
    pub fn wrap(&self, raw: *mut NativeObject) -> Result<NativeModel> {
        NativeHandle::acquire(&self.inner.lib, raw).map(|handle| NativeModel::new(self, handle))
    }

    /// Wrap a native model whose reference is transferred.
    ///
    /// # Safety
    ///
    /// See [`NativeHandle::from_transferred`].
    pub unsafe fn adopt(&self, raw: *mut NativeObject) -> Result<NativeModel> {
        // SAFETY: upheld by the caller
        unsafe { NativeHandle::from_transferred(&self.inner.lib, raw) }
            .map(|handle| NativeModel::new(self, handle))
    }

    /// Create a native instance of the Rust model type `T`.
    pub fn new_subclass<T: ModelImpl>(&self, imp: T) -> Result<NativeModel> {
        self.inner.lib.enter()?;
        let table = DispatchTable::for_type::<T>(&self.inner.lib)?;
        let handle = table.instantiate(&self.inner.lib, imp)?;
        Ok(NativeModel::new(self, handle))
    }

    /// Drain the callback failures recorded so far.
    pub fn take_unhandled_errors(&self) -> Vec<Error> {
        self.inner.lib.take_unhandled_errors()
    }
}

impl Debug for Bridge {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.inner.config)
            .finish()
    }
}

struct ModelInner {
    bridge: Bridge,
    handle: NativeHandle,
    events: EventRegistry,
}

impl Drop for ModelInner {
    fn drop(&mut self) {
        self.events.clear(&self.handle);
        let key = self.handle.identity();
        let mut models = self.bridge.inner.models.lock();
        // The entry may already belong to a newer wrapper of the same object.
        if models.get(&key).is_some_and(|entry| entry.strong_count() == 0) {
            models.remove(&key);
        }
    }
}

/// A native model seen through the capability contract.
///
/// A bridge keeps at most one live wrapper state per native object: every wrapper of the same
/// object shares the handle and the event subscriptions. Equality is the identity of the native
/// object.
#[derive(Clone)]
pub struct NativeModel {
    inner: Arc<ModelInner>,
}

impl NativeModel {
    /// Wrapper of the object behind `handle`. If the bridge already has a live wrapper of that
    /// object, it is returned and `handle` is released.
    pub fn new(bridge: &Bridge, handle: NativeHandle) -> Self {
        let key = handle.identity();
        let mut models = bridge.inner.models.lock();
        let existing = models.get(&key).and_then(Weak::upgrade);
        match existing {
            Some(inner) if !inner.handle.is_disposed() => {
                drop(models);
                drop(handle);
                Self { inner }
            }
            stale => {
                let inner = Arc::new(ModelInner {
                    bridge: bridge.clone(),
                    events: EventRegistry::new(bridge.library()),
                    handle,
                });
                models.insert(key, Arc::downgrade(&inner));
                drop(models);
                drop(stale);
                Self { inner }
            }
        }
    }

    pub fn handle(&self) -> &NativeHandle {
        &self.inner.handle
    }

    pub fn bridge(&self) -> &Bridge {
        &self.inner.bridge
    }

    /// Drop all subscriptions and give the native reference back. Idempotent.
    pub fn dispose(&self) {
        self.inner.events.clear(&self.inner.handle);
        self.inner.handle.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.handle.is_disposed()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .events
            .subscriber_count(&self.inner.bridge.descriptor(kind))
    }

    /// Whether the native event behind `kind` is currently connected.
    pub fn is_event_connected(&self, kind: EventKind) -> bool {
        self.inner
            .events
            .is_registered(&self.inner.bridge.descriptor(kind))
    }

    fn lib(&self) -> &Arc<NativeLibrary> {
        self.inner.bridge.library()
    }

    /// Prologue of a checked boundary call. The returned handle keeps the object alive for the
    /// call even if the model is disposed concurrently.
    fn enter(&self) -> Result<NativeHandle> {
        let pinned = self.inner.handle.pin()?;
        self.lib().enter()?;
        Ok(pinned)
    }

    fn adopt_future<T: FromNative + Send + 'static>(
        &self,
        future: *mut NativeObject,
        error: NativeError,
        subject: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<NativeFuture<T>> {
        let lib = self.lib();
        // SAFETY: The returned future is transferred, even if an error is reported.
        let future = unsafe { NativeHandle::from_transferred(lib, future) };
        lib.check(error, subject)?;
        NativeFuture::new(future?, cancel)
    }

    fn start_set_property(
        &self,
        name: &str,
        value: &Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<NativeFuture<Value>> {
        let pinned = self.enter()?;
        let object = pinned.as_ptr()?;
        let value = BorrowedValue::new(self.lib(), value)?;
        let mut error = NativeError::default();
        // SAFETY: The name and the value are borrowed for the call.
        let future = unsafe {
            (self.lib().api().set_property)(
                object,
                StringView::from(name),
                value.as_native(),
                &mut error,
            )
        };
        self.adopt_future(future, error, name, cancel)
    }

    fn start_property_ready(
        &self,
        name: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<NativeFuture<Value>> {
        let pinned = self.enter()?;
        let object = pinned.as_ptr()?;
        let mut error = NativeError::default();
        // SAFETY: The name is borrowed for the call.
        let future = unsafe {
            (self.lib().api().get_property_ready)(object, StringView::from(name), &mut error)
        };
        self.adopt_future(future, error, name, cancel)
    }

    fn start_children_slice(
        &self,
        start: u32,
        count: u32,
        cancel: Option<&CancellationToken>,
    ) -> Result<NativeFuture<Vec<NativeHandle>>> {
        let pinned = self.enter()?;
        let object = pinned.as_ptr()?;
        let mut error = NativeError::default();
        // SAFETY: `object` is kept alive by the pinned handle.
        let future =
            unsafe { (self.lib().api().get_children_slice)(object, start, count, &mut error) };
        self.adopt_future(future, error, "get-children-slice", cancel)
    }

    /// [`Model::set_property`] that can be canceled through `cancel`.
    pub fn set_property_with_cancel(
        &self,
        name: &str,
        value: Value,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Value>> + Send {
        let started = self.start_set_property(name, &value, Some(cancel));
        async move { started?.await }
    }

    /// [`Model::get_property_ready`] that can be canceled through `cancel`.
    pub fn get_property_ready_with_cancel(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Value>> + Send {
        let started = self.start_property_ready(name, Some(cancel));
        async move { started?.await }
    }

    /// [`Model::get_children_slice`] that can be canceled through `cancel`.
    pub fn get_children_slice_with_cancel(
        &self,
        start: u32,
        count: u32,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<NativeModel>>> + Send {
        self.children_slice(start, count, Some(cancel))
    }

    fn children_slice(
        &self,
        start: u32,
        count: u32,
        cancel: Option<&CancellationToken>,
    ) -> impl Future<Output = Result<Vec<NativeModel>>> + Send {
        let bridge = self.inner.bridge.clone();
        let started = self.start_children_slice(start, count, cancel);
        async move {
            let children = started?.await?;
            Ok(children
                .into_iter()
                .map(|handle| NativeModel::new(&bridge, handle))
                .collect())
        }
    }
}

impl Model for NativeModel {
    type Properties = ValueIter<String>;

    fn get_properties(&self) -> Result<Self::Properties> {
        let pinned = self.enter()?;
        let object = pinned.as_ptr()?;
        let mut error = NativeError::default();
        // SAFETY: `object` is kept alive by the pinned handle.
        let iter = unsafe { (self.lib().api().get_properties)(object, &mut error) };
        self.lib().check(error, "get-properties")?;
        // SAFETY: The iterator is transferred.
        unsafe { ValueIter::new(self.lib(), iter, Ownership::Transferred) }
    }

    fn get_property(&self, name: &str) -> Result<Value> {
        let pinned = self.enter()?;
        let object = pinned.as_ptr()?;
        let mut value = NativeValue::empty();
        let mut error = NativeError::default();
        // SAFETY: The name is borrowed for the call, the out-parameters are writable.
        let ok = unsafe {
            (self.lib().api().get_property)(object, StringView::from(name), &mut value, &mut error)
        };
        self.lib().check(error, name)?;
        if !ok {
            return Err(Error::failed(format!("reading `{name}` failed without error detail")));
        }
        // SAFETY: The value is transferred.
        unsafe { Value::from_native(self.lib(), &value, Ownership::Transferred) }
    }

    fn set_property(&self, name: &str, value: Value) -> impl Future<Output = Result<Value>> + Send {
        let started = self.start_set_property(name, &value, None);
        async move { started?.await }
    }

    fn get_children_count(&self) -> Result<u32> {
        let pinned = self.enter()?;
        let object = pinned.as_ptr()?;
        let mut error = NativeError::default();
        // SAFETY: `object` is kept alive by the pinned handle.
        let count = unsafe { (self.lib().api().get_children_count)(object, &mut error) };
        self.lib().check(error, "get-children-count")?;
        Ok(count)
    }

    fn get_property_ready(&self, name: &str) -> impl Future<Output = Result<Value>> + Send {
        let started = self.start_property_ready(name, None);
        async move { started?.await }
    }

    fn get_children_slice(
        &self,
        start: u32,
        count: u32,
    ) -> impl Future<Output = Result<Vec<Self>>> + Send {
        self.children_slice(start, count, None)
    }

    fn add_child(&self) -> Result<Self> {
        let pinned = self.enter()?;
        let object = pinned.as_ptr()?;
        let mut error = NativeError::default();
        // SAFETY: `object` is kept alive by the pinned handle.
        let child = unsafe { (self.lib().api().add_child)(object, &mut error) };
        // SAFETY: The child reference is transferred.
        let child = unsafe { NativeHandle::from_transferred(self.lib(), child) };
        self.lib().check(error, "add-child")?;
        Ok(NativeModel::new(&self.inner.bridge, child?))
    }

    fn del_child(&self, child: &Self) -> Result<()> {
        let pinned = self.enter()?;
        let object = pinned.as_ptr()?;
        let child = child.inner.handle.pin()?;
        let child = child.as_ptr()?;
        let mut error = NativeError::default();
        // SAFETY: Both objects are kept alive by the pinned handles.
        let ok = unsafe { (self.lib().api().del_child)(object, child, &mut error) };
        self.lib().check(error, "del-child")?;
        if ok {
            Ok(())
        } else {
            Err(Error::failed("removing the child failed without error detail"))
        }
    }
}

/// Turn an event with borrowed objects into one holding models.
fn own_event(
    bridge: &Bridge,
    event: &ModelEvent<ObjectRef<'_>>,
) -> Result<ModelEvent<NativeModel>> {
    let own_child = |event: &ChildEvent<ObjectRef<'_>>| -> Result<ChildEvent<NativeModel>> {
        let child = match &event.child {
            Some(child) => Some(NativeModel::new(bridge, child.to_handle()?)),
            None => None,
        };
        Ok(ChildEvent {
            index: event.index,
            child,
        })
    };
    Ok(match event {
        ModelEvent::PropertiesChanged(notification) => {
            ModelEvent::PropertiesChanged(notification.clone())
        }
        ModelEvent::ChildAdded(child) => ModelEvent::ChildAdded(own_child(child)?),
        ModelEvent::ChildRemoved(child) => ModelEvent::ChildRemoved(own_child(child)?),
        ModelEvent::ChildrenCountChanged => ModelEvent::ChildrenCountChanged,
    })
}

impl ObservableModel for NativeModel {
    fn subscribe<F>(&self, kind: EventKind, handler: F) -> Result<HandlerId>
    where
        F: Fn(&ModelEvent<Self>) -> CallbackResult + Send + Sync + 'static,
    {
        let bridge = self.inner.bridge.clone();
        self.inner.events.subscribe(
            &self.inner.handle,
            self.inner.bridge.descriptor(kind),
            move |event: &ModelEvent<ObjectRef<'_>>| -> CallbackResult {
                let event = own_event(&bridge, event)?;
                handler(&event)
            },
        )
    }

    fn unsubscribe(&self, kind: EventKind, handler: HandlerId) -> Result<()> {
        self.inner.events.unsubscribe(
            &self.inner.handle,
            &self.inner.bridge.descriptor(kind),
            handler,
        )
    }
}

impl PartialEq for NativeModel {
    fn eq(&self, other: &Self) -> bool {
        self.inner.handle == other.inner.handle
    }
}

impl Eq for NativeModel {}

impl Hash for NativeModel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.handle.hash(state);
    }
}

impl Debug for NativeModel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NativeModel").field(&self.inner.handle).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bridge, MockModel};
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_disposed_model_rejects_every_call() {
        let bridge = bridge();
        let mock = MockModel::new(2);
        let model = bridge.wrap(mock.as_ptr()).unwrap();
        model.dispose();
        model.dispose();
        assert!(model.is_disposed());
        assert_eq!(model.get_children_count(), Err(Error::InvalidHandle));
        assert_eq!(model.get_property("x"), Err(Error::InvalidHandle));
        assert!(matches!(model.get_properties(), Err(Error::InvalidHandle)));
        assert_eq!(
            block_on(model.set_property("x", Value::Int(1))),
            Err(Error::InvalidHandle)
        );
        assert!(model.subscribe(EventKind::ChildAdded, |_| Ok(())).is_err());
        assert_eq!(mock.ref_count(), 1);
    }

    #[test]
    fn test_wrappers_over_same_object_are_equal() {
        let bridge = bridge();
        let mock = MockModel::new(0);
        let first = bridge.wrap(mock.as_ptr()).unwrap();
        let second = bridge.wrap(mock.as_ptr()).unwrap();
        assert_eq!(first, second);
        let mut set = std::collections::HashSet::new();
        set.insert(first);
        assert!(set.contains(&second));
    }

    #[test]
    fn test_wrappers_over_same_object_share_subscriptions() {
        let bridge = bridge();
        let mock = MockModel::new(0);
        let first = bridge.wrap(mock.as_ptr()).unwrap();
        let second = bridge.wrap(mock.as_ptr()).unwrap();
        assert_eq!(mock.ref_count(), 2);

        let from_first = first
            .subscribe(EventKind::PropertiesChanged, |_| Ok(()))
            .unwrap();
        let from_second = second
            .subscribe(EventKind::PropertiesChanged, |_| Ok(()))
            .unwrap();
        assert_ne!(from_first, from_second);
        assert_eq!(mock.connection_count("properties-changed"), 1);
        assert_eq!(second.subscriber_count(EventKind::PropertiesChanged), 2);

        second
            .unsubscribe(EventKind::PropertiesChanged, from_first)
            .unwrap();
        assert_eq!(first.subscriber_count(EventKind::PropertiesChanged), 1);
        assert!(first
            .unsubscribe(EventKind::PropertiesChanged, from_first)
            .is_err());
        first
            .unsubscribe(EventKind::PropertiesChanged, from_second)
            .unwrap();
        assert_eq!(mock.connection_count("properties-changed"), 0);
    }

    #[test]
    fn test_disposed_wrapper_is_replaced_on_wrap() {
        let bridge = bridge();
        let mock = MockModel::new(0);
        let first = bridge.wrap(mock.as_ptr()).unwrap();
        first.dispose();
        let second = bridge.wrap(mock.as_ptr()).unwrap();
        assert!(first.is_disposed());
        assert_eq!(second.get_children_count(), Ok(0));
        drop(first);
        let third = bridge.wrap(mock.as_ptr()).unwrap();
        assert!(Arc::ptr_eq(&second.inner, &third.inner));
        drop((second, third));
        assert!(bridge.inner.models.lock().is_empty());
        assert_eq!(mock.ref_count(), 1);
    }

    #[test]
    fn test_call_survives_concurrent_dispose() {
        let bridge = bridge();
        let mock = MockModel::new(3);
        let model = bridge.wrap(mock.as_ptr()).unwrap();
        let worker = {
            let model = model.clone();
            std::thread::spawn(move || {
                (0..100)
                    .filter_map(|_| model.get_children_count().ok())
                    .all(|count| count == 3)
            })
        };
        model.dispose();
        assert!(worker.join().unwrap());
        assert_eq!(mock.ref_count(), 1);
    }

    #[test]
    fn test_child_events_carry_models() {
        let bridge = bridge();
        let mock = MockModel::new(0);
        let model = bridge.wrap(mock.as_ptr()).unwrap();
        let seen = Arc::new(AtomicU32::new(u32::MAX));
        let index = Arc::clone(&seen);
        model
            .subscribe(EventKind::ChildAdded, move |event| {
                if let ModelEvent::ChildAdded(ChildEvent {
                    index: added,
                    child: Some(child),
                }) = event
                {
                    assert_eq!(child.get_children_count().unwrap(), 0);
                    index.store(*added, Ordering::SeqCst);
                }
                Ok(())
            })
            .unwrap();
        let child = model.add_child().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(model.get_children_count().unwrap(), 1);
        drop(child);
    }

    #[test]
    fn test_dropping_last_clone_disconnects_events() {
        let bridge = bridge();
        let mock = MockModel::new(0);
        let model = bridge.wrap(mock.as_ptr()).unwrap();
        let copy = model.clone();
        copy.subscribe(EventKind::ChildrenCountChanged, |_| Ok(()))
            .unwrap();
        assert!(model.is_event_connected(EventKind::ChildrenCountChanged));
        drop(copy);
        assert_eq!(mock.connection_count("children-count-changed"), 1);
        drop(model);
        assert_eq!(mock.connection_count("children-count-changed"), 0);
    }
}
