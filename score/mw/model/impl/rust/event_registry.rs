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

//! Event proxy registry.
//!
//! Managed handlers of one native object are multiplexed onto at most one native connection per
//! event. The native connection is made when the first handler of an event is added and removed
//! together with the last one. Events raised by the native side are fanned out to a snapshot of
//! the handlers taken under the per-object lock; the handlers themselves run without the lock so
//! they can subscribe or unsubscribe freely. The native connection is also made without the lock,
//! since a native library may raise the event on the connecting thread before `event_connect`
//! returns.

use core::fmt::{self, Display, Formatter};
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use log::{debug, error, warn};
use parking_lot::Mutex;

use model_api_concept::{CallbackResult, Error, HandlerId, ModelEvent, Result};
pub use model_api_concept::EventKind;
use model_plumbing_rs::NativeObject;

use crate::guard::{guarded, CallbackScope};
use crate::handle::NativeHandle;
use crate::marshal::{decode_event, ObjectRef};
use crate::native::NativeLibrary;

/// Native keys of the model events, indexed like [`EventKind::ALL`].
pub const MODEL_EVENTS: [(EventKind, &str); 4] = [
    (EventKind::PropertiesChanged, "properties-changed"),
    (EventKind::ChildAdded, "child-added"),
    (EventKind::ChildRemoved, "child-removed"),
    (EventKind::ChildrenCountChanged, "children-count-changed"),
];

/// Identity of a native event: the `(namespace, key)` pair it is looked up by, plus the shape of
/// its payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventDescriptor {
    pub namespace: String,
    pub key: String,
    pub kind: EventKind,
}

impl EventDescriptor {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>, kind: EventKind) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
            kind,
        }
    }

    /// Descriptor of a model event within `namespace`.
    pub fn model(namespace: &str, kind: EventKind) -> Self {
        let key = MODEL_EVENTS
            .iter()
            .find(|(candidate, _)| *candidate == kind)
            .map_or("", |(_, key)| *key);
        Self::new(namespace, key, kind)
    }

    pub(crate) fn registration_failed(&self) -> Error {
        Error::EventRegistrationFailed {
            namespace: self.namespace.clone(),
            key: self.key.clone(),
        }
    }

    fn not_registered(&self) -> Error {
        Error::NotRegistered {
            namespace: self.namespace.clone(),
            key: self.key.clone(),
        }
    }
}

impl Display for EventDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.namespace, self.key)
    }
}

/// Handler as stored by the registry. Events carry borrowed views of the objects involved.
pub type EventHandler =
    Arc<dyn for<'a> Fn(&ModelEvent<ObjectRef<'a>>) -> CallbackResult + Send + Sync + 'static>;

struct Slot {
    /// `None` while the first handler is still connecting.
    connection: Option<u64>,
    /// Handler whose subscription made the connection.
    origin: HandlerId,
    handlers: Vec<(HandlerId, EventHandler)>,
}

type SlotMap = HashMap<EventDescriptor, Slot>;

/// Context handed to the native side with every connection.
struct Connection {
    lib: Arc<NativeLibrary>,
    slots: Weak<Mutex<SlotMap>>,
    descriptor: EventDescriptor,
}

/// Event subscriptions of one native object.
pub struct EventRegistry {
    lib: Arc<NativeLibrary>,
    slots: Arc<Mutex<SlotMap>>,
}

impl EventRegistry {
    pub fn new(lib: &Arc<NativeLibrary>) -> Self {
        Self {
            lib: Arc::clone(lib),
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Add `handler` for `descriptor`, connecting to the native event if it is the first one.
    ///
    /// # Errors
    ///
    /// [`Error::EventRegistrationFailed`] if the event cannot be resolved or connected. The
    /// subscription count is unchanged in that case, and handlers that were added while the
    /// connection was being made are dropped with it.
    pub fn subscribe<F>(
        &self,
        handle: &NativeHandle,
        descriptor: EventDescriptor,
        handler: F,
    ) -> Result<HandlerId>
    where
        F: for<'a> Fn(&ModelEvent<ObjectRef<'a>>) -> CallbackResult + Send + Sync + 'static,
    {
        let pinned = handle.pin()?;
        let object = pinned.as_ptr()?;
        self.lib.enter()?;

        let id = self.lib.next_handler_id();
        let handler: EventHandler = Arc::new(handler);
        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(&descriptor) {
                slot.handlers.push((id, handler));
                return Ok(id);
            }
            slots.insert(
                descriptor.clone(),
                Slot {
                    connection: None,
                    origin: id,
                    handlers: vec![(id, handler)],
                },
            );
        }

        let connected = self.connect(object, &descriptor);
        let mut slots = self.slots.lock();
        let reserved = slots
            .get(&descriptor)
            .is_some_and(|slot| slot.origin == id && slot.connection.is_none());
        match connected {
            Ok(connection) if reserved => {
                if let Some(slot) = slots.get_mut(&descriptor) {
                    slot.connection = Some(connection);
                }
                debug!("Connected {descriptor} on native object {object:p}");
                Ok(id)
            }
            Ok(connection) => {
                // Every handler went away while connecting.
                drop(slots);
                self.disconnect(object, &descriptor, connection);
                Ok(id)
            }
            Err(err) => {
                let removed = if reserved { slots.remove(&descriptor) } else { None };
                drop(slots);
                if let Some(slot) = removed.filter(|slot| slot.handlers.len() > 1) {
                    warn!(
                        "Dropping {} handlers of {descriptor} added while connecting",
                        slot.handlers.len() - 1
                    );
                }
                Err(err)
            }
        }
    }

    fn connect(&self, object: *mut NativeObject, descriptor: &EventDescriptor) -> Result<u64> {
        let event = self.lib.resolve_event(descriptor)?;
        let context = Box::into_raw(Box::new(Connection {
            lib: Arc::clone(&self.lib),
            slots: Arc::downgrade(&self.slots),
            descriptor: descriptor.clone(),
        }));
        // SAFETY: `object` is pinned by the caller. On success the native side owns
        // `context` until it calls `release_connection`.
        let connection = unsafe {
            (self.lib.api().event_connect)(
                object,
                event,
                dispatch_event,
                context as *mut c_void,
                release_connection,
            )
        };
        if connection == 0 {
            // SAFETY: The native side did not take `context` over.
            drop(unsafe { Box::from_raw(context) });
            return Err(descriptor.registration_failed());
        }
        Ok(connection)
    }

    /// Remove the handler `id`, disconnecting the native event together with the last handler.
    ///
    /// # Errors
    ///
    /// [`Error::NotRegistered`] if `id` is not subscribed to `descriptor`.
    pub fn unsubscribe(
        &self,
        handle: &NativeHandle,
        descriptor: &EventDescriptor,
        id: HandlerId,
    ) -> Result<()> {
        let pinned = handle.pin()?;
        let object = pinned.as_ptr()?;
        self.lib.enter()?;

        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(descriptor)
            .ok_or_else(|| descriptor.not_registered())?;
        let position = slot
            .handlers
            .iter()
            .position(|(handler_id, _)| *handler_id == id)
            .ok_or_else(|| descriptor.not_registered())?;
        let removed = slot.handlers.remove(position);
        let emptied = if slot.handlers.is_empty() {
            slots.remove(descriptor)
        } else {
            None
        };
        drop(slots);

        // A slot that is still connecting is disconnected by its subscriber.
        if let Some(connection) = emptied.and_then(|slot| slot.connection) {
            self.disconnect(object, descriptor, connection);
        }
        drop(removed);
        Ok(())
    }

    fn disconnect(&self, object: *mut NativeObject, descriptor: &EventDescriptor, connection: u64) {
        // SAFETY: `object` is pinned by the caller and `connection` was returned by
        // `event_connect` on it.
        unsafe { (self.lib.api().event_disconnect)(object, connection) };
        debug!("Disconnected {descriptor} on native object {object:p}");
    }

    /// Remove every handler and native connection.
    pub fn clear(&self, handle: &NativeHandle) {
        let slots = std::mem::take(&mut *self.slots.lock());
        if slots.is_empty() {
            return;
        }
        match handle.pin() {
            Ok(pinned) => {
                let Ok(object) = pinned.as_ptr() else {
                    return;
                };
                for (descriptor, slot) in &slots {
                    if let Some(connection) = slot.connection {
                        self.disconnect(object, descriptor, connection);
                    }
                }
            }
            // The connections die with the native object.
            Err(_) => debug!("Dropping {} event slots of a disposed handle", slots.len()),
        }
    }

    pub fn subscriber_count(&self, descriptor: &EventDescriptor) -> usize {
        self.slots
            .lock()
            .get(descriptor)
            .map_or(0, |slot| slot.handlers.len())
    }

    /// Whether `descriptor` is currently connected on the native side.
    pub fn is_registered(&self, descriptor: &EventDescriptor) -> bool {
        self.slots
            .lock()
            .get(descriptor)
            .is_some_and(|slot| slot.connection.is_some())
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("events", &self.slots.lock().len())
            .finish()
    }
}

unsafe extern "C" fn dispatch_event(
    object: *mut NativeObject,
    payload: *const c_void,
    user_data: *mut c_void,
) {
    let _scope = CallbackScope::enter();
    // SAFETY: `user_data` is the connection context, alive until `release_connection`.
    let connection = unsafe { &*(user_data as *const Connection) };
    let Some(slots) = connection.slots.upgrade() else {
        return;
    };
    let handlers: Vec<EventHandler> = match slots.lock().get(&connection.descriptor) {
        Some(slot) => slot.handlers.iter().map(|(_, handler)| Arc::clone(handler)).collect(),
        None => return,
    };
    drop(slots);

    let lib = &connection.lib;
    // SAFETY: The payload record matches the event kind and is borrowed for this call.
    let event = match unsafe { decode_event(lib, connection.descriptor.kind, payload) } {
        Ok(event) => event,
        Err(err) => {
            error!(
                "Dropping {} raised by {:?}: {err}",
                connection.descriptor,
                NonNull::new(object)
            );
            lib.report_unhandled(Error::UnhandledCallbackError {
                context: connection.descriptor.to_string(),
                message: err.to_string(),
            });
            return;
        }
    };

    let context = format!("handler of {}", connection.descriptor);
    for handler in handlers {
        // Failures are logged and recorded by the guard, the remaining handlers still run.
        let _ = guarded(lib, &context, || handler(&event));
    }
}

unsafe extern "C" fn release_connection(user_data: *mut c_void) {
    let _scope = CallbackScope::enter();
    // SAFETY: Called exactly once per successful connection with the context it was given.
    drop(unsafe { Box::from_raw(user_data as *mut Connection) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{library, MockModel};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn descriptor(kind: EventKind) -> EventDescriptor {
        EventDescriptor::model("model", kind)
    }

    #[test]
    fn test_native_connection_follows_first_and_last_handler() {
        let lib = library();
        let model = MockModel::new(0);
        let handle = NativeHandle::acquire(&lib, model.as_ptr()).unwrap();
        let registry = EventRegistry::new(&lib);
        let changed = descriptor(EventKind::PropertiesChanged);

        let first = registry.subscribe(&handle, changed.clone(), |_| Ok(())).unwrap();
        let second = registry.subscribe(&handle, changed.clone(), |_| Ok(())).unwrap();
        assert_ne!(first, second);
        assert_eq!(registry.subscriber_count(&changed), 2);
        assert_eq!(model.connection_count("properties-changed"), 1);

        registry.unsubscribe(&handle, &changed, first).unwrap();
        assert_eq!(model.connection_count("properties-changed"), 1);
        registry.unsubscribe(&handle, &changed, second).unwrap();
        assert_eq!(model.connection_count("properties-changed"), 0);
        assert!(!registry.is_registered(&changed));
    }

    #[test]
    fn test_unsubscribe_without_subscription_fails() {
        let lib = library();
        let model = MockModel::new(0);
        let handle = NativeHandle::acquire(&lib, model.as_ptr()).unwrap();
        let registry = EventRegistry::new(&lib);
        let added = descriptor(EventKind::ChildAdded);

        let err = registry.unsubscribe(&handle, &added, HandlerId(1)).unwrap_err();
        assert_eq!(
            err,
            Error::NotRegistered {
                namespace: "model".into(),
                key: "child-added".into()
            }
        );

        let id = registry.subscribe(&handle, added.clone(), |_| Ok(())).unwrap();
        registry.unsubscribe(&handle, &added, id).unwrap();
        assert!(registry.unsubscribe(&handle, &added, id).is_err());
    }

    #[test]
    fn test_unknown_event_is_not_counted() {
        let lib = library();
        let model = MockModel::new(0);
        let handle = NativeHandle::acquire(&lib, model.as_ptr()).unwrap();
        let registry = EventRegistry::new(&lib);
        let unknown =
            EventDescriptor::new("model", "no-such-event", EventKind::ChildrenCountChanged);

        let err = registry.subscribe(&handle, unknown.clone(), |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::EventRegistrationFailed { .. }));
        assert_eq!(registry.subscriber_count(&unknown), 0);
    }

    #[test]
    fn test_failed_connect_is_not_counted() {
        let lib = library();
        let model = MockModel::new(0);
        model.fail_connect(true);
        let handle = NativeHandle::acquire(&lib, model.as_ptr()).unwrap();
        let registry = EventRegistry::new(&lib);
        let changed = descriptor(EventKind::ChildrenCountChanged);

        assert!(registry.subscribe(&handle, changed.clone(), |_| Ok(())).is_err());
        assert!(!registry.is_registered(&changed));

        model.fail_connect(false);
        registry.subscribe(&handle, changed.clone(), |_| Ok(())).unwrap();
        assert_eq!(registry.subscriber_count(&changed), 1);
    }

    #[test]
    fn test_failing_handler_does_not_stop_fan_out() {
        let lib = library();
        let model = MockModel::new(0);
        let handle = NativeHandle::acquire(&lib, model.as_ptr()).unwrap();
        let registry = EventRegistry::new(&lib);
        let count = descriptor(EventKind::ChildrenCountChanged);
        let calls = Arc::new(AtomicUsize::new(0));

        registry.subscribe(&handle, count.clone(), |_| Err("first handler failed".into())).unwrap();
        let seen = Arc::clone(&calls);
        registry
            .subscribe(&handle, count.clone(), move |event| {
                assert_eq!(event.kind(), EventKind::ChildrenCountChanged);
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        registry.subscribe(&handle, count, |_| panic!("third handler panicked")).unwrap();

        model.emit_children_count_changed();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let errors = lib.take_unhandled_errors();
        assert_eq!(errors.len(), 2);
        assert!(errors
            .iter()
            .all(|err| matches!(err, Error::UnhandledCallbackError { .. })));
    }

    #[test]
    fn test_clear_disconnects_everything() {
        let lib = library();
        let model = MockModel::new(0);
        let handle = NativeHandle::acquire(&lib, model.as_ptr()).unwrap();
        let registry = EventRegistry::new(&lib);
        for kind in EventKind::ALL {
            registry.subscribe(&handle, descriptor(kind), |_| Ok(())).unwrap();
        }
        assert_eq!(model.connection_count("child-removed"), 1);
        registry.clear(&handle);
        for (_, key) in MODEL_EVENTS {
            assert_eq!(model.connection_count(key), 0);
        }
    }

    #[test]
    fn test_event_raised_while_connecting_reaches_the_handler() {
        let lib = library();
        let model = MockModel::new(0);
        model.emit_on_connect(true);
        let handle = NativeHandle::acquire(&lib, model.as_ptr()).unwrap();
        let registry = EventRegistry::new(&lib);
        let count = descriptor(EventKind::ChildrenCountChanged);
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&calls);
        registry
            .subscribe(&handle, count.clone(), move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_registered(&count));
        assert_eq!(model.connection_count("children-count-changed"), 1);

        model.emit_children_count_changed();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(lib.take_unhandled_errors().is_empty());
    }

    #[test]
    fn test_handler_ids_are_unique_per_library() {
        let lib = library();
        let model = MockModel::new(0);
        let handle = NativeHandle::acquire(&lib, model.as_ptr()).unwrap();
        let first = EventRegistry::new(&lib);
        let second = EventRegistry::new(&lib);
        let added = descriptor(EventKind::ChildAdded);

        let a = first.subscribe(&handle, added.clone(), |_| Ok(())).unwrap();
        let b = second.subscribe(&handle, added.clone(), |_| Ok(())).unwrap();
        assert_ne!(a, b);
        assert!(second.unsubscribe(&handle, &added, a).is_err());
        assert_eq!(second.subscriber_count(&added), 1);
    }

    #[test]
    fn test_events_after_registry_drop_are_ignored() {
        let lib = library();
        let model = MockModel::new(0);
        let handle = NativeHandle::acquire(&lib, model.as_ptr()).unwrap();
        let registry = EventRegistry::new(&lib);
        registry
            .subscribe(&handle, descriptor(EventKind::ChildrenCountChanged), |_| {
                panic!("must not run")
            })
            .unwrap();
        drop(registry);
        model.emit_children_count_changed();
        assert!(lib.take_unhandled_errors().is_empty());
    }
}
