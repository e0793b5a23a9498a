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

//! This crate defines the capability contract of an observable, hierarchical data model. It does
//! not provide any concrete implementation. It is meant to be used as the common interface for
//! application code and for every backend that exposes a model, e.g. the native bridge.
//!
//! # API Design principles
//!
//! - A model is a mapping from property names to values plus an ordered, countable collection of
//!   children, addressable by contiguous index ranges.
//! - Anything that may take time is expressed as a future. Nothing in the contract blocks the
//!   calling thread on I/O.
//! - Errors are explicit values of one taxonomy ([`Error`]); failures raised by application
//!   callbacks never unwind into the implementation.
//! - Change notification is push based: subscribers register per event kind and receive typed
//!   payloads.
//!
//! # Unknown properties
//!
//! Whether [`Model::set_property`] creates an unknown property or fails is left to the concrete
//! model type. The choice has to be consistent per model type and documented by it. In both
//! cases a successful resolution implies that the property is listed by
//! [`Model::get_properties`] afterwards.

use core::any::Any;
use core::fmt::{self, Debug, Display, Formatter};
use core::future::Future;
use core::ops::Range;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Error enumeration for the failure cases of the model contract and the layers implementing
/// it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// A call was made through a handle that has already been disposed.
    #[error("native handle has already been disposed")]
    InvalidHandle,
    /// An event descriptor could not be resolved or connected on the native side.
    #[error("failed to register event {namespace}::{key}")]
    EventRegistrationFailed { namespace: String, key: String },
    /// Unsubscribe without a matching subscription.
    #[error("no subscription for event {namespace}::{key}")]
    NotRegistered { namespace: String, key: String },
    /// The property value is not computed yet; use `get_property_ready` to wait for it.
    #[error("property `{0}` is not ready")]
    PropertyNotReady(String),
    /// A callback (override or event handler) failed and the failure was funneled into the
    /// error channel instead of crossing the native boundary.
    #[error("unhandled error in {context}: {message}")]
    UnhandledCallbackError { context: String, message: String },
    /// A one-shot result was completed a second time.
    #[error("future has already been completed")]
    FutureAlreadyCompleted,
    /// The native side confirmed the cancellation of an operation.
    #[error("operation was canceled")]
    Canceled,
    /// Generic native failure, with whatever detail the native side provided.
    #[error("native operation failed with code {code}: {message}")]
    OperationFailed { code: i32, message: String },
    /// A required native entry point is missing.
    #[error("native symbol `{0}` not found")]
    SymbolNotFound(String),
    /// Invalid bridge configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn failed(message: impl Into<String>) -> Self {
        Error::OperationFailed {
            code: 1,
            message: message.into(),
        }
    }
}

/// Result type alias with `std::result::Result` using `model_api_concept::Error` as error type
pub type Result<T> = core::result::Result<T, Error>;

/// Error type application callbacks may return.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type of application callbacks (event handlers, overrides).
pub type CallbackResult<T = ()> = core::result::Result<T, CallbackError>;

/// A factory-like trait for constructing complex objects through a builder pattern.
///
/// Consumes self to prevent reuse and ensure immutability of the constructed object.
pub trait Builder<Output> {
    /// Construct the output object from the current builder state.
    ///
    /// # Errors
    ///
    /// Errors that may occur during the build process captured in the 'Result'.
    fn build(self) -> Result<Output>;
}

/// Reference to an object carried by a [`Value`].
///
/// The referenced object is owned by whoever produced the value, e.g. a handle of the native
/// bridge. Two object values are equal if they refer to the same object.
#[derive(Clone)]
pub struct ObjectValue {
    identity: usize,
    object: Arc<dyn Any + Send + Sync>,
}

impl ObjectValue {
    /// `identity` has to be equal for all references to the same object.
    pub fn new<T: Any + Send + Sync>(identity: usize, object: T) -> Self {
        Self {
            identity,
            object: Arc::new(object),
        }
    }

    pub fn identity(&self) -> usize {
        self.identity
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.object.downcast_ref()
    }
}

impl PartialEq for ObjectValue {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Debug for ObjectValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectValue({:#x})", self.identity)
    }
}

/// Value of a model property.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Empty,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    String(String),
    Object(ObjectValue),
    Sequence(Vec<Value>),
}

impl Value {
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            Value::UInt(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectValue> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Sequence(items) => Some(items),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => f.write_str("<empty>"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v:?}"),
            Value::Object(v) => write!(f, "<object {:#x}>", v.identity()),
            Value::Sequence(items) => {
                f.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::UInt(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Sequence(items)
    }
}

/// Payload of [`EventKind::PropertiesChanged`].
///
/// Names in `changed` have new values retrievable via `get_property`; names in `invalidated` no
/// longer exist.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PropertyChangeNotification {
    pub changed: BTreeSet<String>,
    pub invalidated: BTreeSet<String>,
}

/// Payload of [`EventKind::ChildAdded`] and [`EventKind::ChildRemoved`].
///
/// `index` is an ordinal hint. `child` is a live reference if the producer could provide one.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEvent<C> {
    pub index: u32,
    pub child: Option<C>,
}

/// The kinds of events a model raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    PropertiesChanged,
    ChildAdded,
    ChildRemoved,
    ChildrenCountChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::PropertiesChanged,
        EventKind::ChildAdded,
        EventKind::ChildRemoved,
        EventKind::ChildrenCountChanged,
    ];
}

/// A typed model notification, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent<C> {
    PropertiesChanged(PropertyChangeNotification),
    ChildAdded(ChildEvent<C>),
    ChildRemoved(ChildEvent<C>),
    ChildrenCountChanged,
}

impl<C> ModelEvent<C> {
    pub fn kind(&self) -> EventKind {
        match self {
            ModelEvent::PropertiesChanged(_) => EventKind::PropertiesChanged,
            ModelEvent::ChildAdded(_) => EventKind::ChildAdded,
            ModelEvent::ChildRemoved(_) => EventKind::ChildRemoved,
            ModelEvent::ChildrenCountChanged => EventKind::ChildrenCountChanged,
        }
    }
}

/// Identifies one registered handler; returned by `subscribe`, consumed by `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

/// Resolve a children slice request against the current number of children.
///
/// A `count` of zero selects the full current range, ignoring `start`. Otherwise the range
/// `[start, start + count)` is clamped to the available children.
pub fn slice_bounds(start: u32, count: u32, len: u32) -> Range<u32> {
    if count == 0 {
        return 0..len;
    }
    let begin = start.min(len);
    let end = start.saturating_add(count).min(len);
    begin..end
}

/// Capability contract of one model entity.
///
/// Children are models themselves, so the child type is `Self`.
pub trait Model: Sized + Send + Sync {
    /// Lazy, finite listing of property names.
    type Properties: Iterator<Item = Result<String>>;

    /// List the currently known property names.
    ///
    /// Triggers no side effect beyond the enumeration itself.
    fn get_properties(&self) -> Result<Self::Properties>;

    /// Read a property.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PropertyNotReady`] if the value is not computed yet.
    fn get_property(&self, name: &str) -> Result<Value>;

    /// Write a property. Resolves to the value actually stored, which may differ from `value`.
    fn set_property(&self, name: &str, value: Value) -> impl Future<Output = Result<Value>> + Send;

    /// Best current knowledge of the number of children.
    fn get_children_count(&self) -> Result<u32>;

    /// Resolves once the property's value stabilized past the "not ready" condition.
    ///
    /// Fails if the underlying error is anything else than "not ready" and is canceled if the
    /// model is destroyed first.
    fn get_property_ready(&self, name: &str) -> impl Future<Output = Result<Value>> + Send;

    /// Fetch the children `[start, start + count)`, or all children if `count` is zero.
    fn get_children_slice(
        &self,
        start: u32,
        count: u32,
    ) -> impl Future<Output = Result<Vec<Self>>> + Send;

    /// Create a new child. The child-added event follows once the child is tracked.
    fn add_child(&self) -> Result<Self>;

    /// Request the removal of `child`. The child-removed event follows once removal completed.
    fn del_child(&self, child: &Self) -> Result<()>;
}

/// Event side of the contract.
pub trait ObservableModel: Model {
    /// Register `handler` for `kind`.
    ///
    /// Handlers run on whatever thread raises the event and must not assume a thread identity.
    /// A handler returning an error or panicking does not prevent the remaining handlers from
    /// running.
    fn subscribe<F>(&self, kind: EventKind, handler: F) -> Result<HandlerId>
    where
        F: Fn(&ModelEvent<Self>) -> CallbackResult + Send + Sync + 'static;

    /// Remove a handler registered with [`ObservableModel::subscribe`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotRegistered`] if there is no such subscription.
    fn unsubscribe(&self, kind: EventKind, handler: HandlerId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_count_selects_everything() {
        for start in [0, 1, 2, 17, u32::MAX] {
            assert_eq!(slice_bounds(start, 0, 3), 0..3);
        }
    }

    #[test]
    fn test_slice_is_clamped() {
        assert_eq!(slice_bounds(1, 2, 3), 1..3);
        assert_eq!(slice_bounds(2, 5, 3), 2..3);
        assert_eq!(slice_bounds(4, 1, 3), 3..3);
        assert_eq!(slice_bounds(u32::MAX, 2, 3), 3..3);
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::from(3_u64).as_i64(), Some(3));
        assert_eq!(Value::from(u64::MAX).as_i64(), None);
        assert!(Value::default().is_empty());
        assert_eq!(Value::Bool(true).to_string(), "true");
        let items = Value::from(vec![Value::Int(1), Value::from("a")]);
        assert_eq!(items.as_sequence().map(<[Value]>::len), Some(2));
        assert_eq!(items.to_string(), r#"[1, "a"]"#);
    }

    #[test]
    fn test_object_values_compare_by_identity() {
        let first = ObjectValue::new(0x10, "first");
        let same = ObjectValue::new(0x10, 7_u32);
        assert_eq!(Value::Object(first.clone()), Value::Object(same));
        assert_ne!(first, ObjectValue::new(0x20, "first"));
        assert_eq!(first.downcast_ref::<&str>(), Some(&"first"));
        assert_eq!(first.downcast_ref::<u32>(), None);
        assert_eq!(Value::Object(first).to_string(), "<object 0x10>");
    }

    #[test]
    fn test_event_kind_of_event() {
        let event: ModelEvent<()> = ModelEvent::ChildRemoved(ChildEvent {
            index: 0,
            child: None,
        });
        assert_eq!(event.kind(), EventKind::ChildRemoved);
    }
}
