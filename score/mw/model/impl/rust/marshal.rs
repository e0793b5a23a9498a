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

//! Conversions between native boundary records and Rust values.
//!
//! Every conversion states who owns the native data through an [`Ownership`] tag. Borrowed data
//! is copied and left alone, transferred data is copied and then released with the matching
//! native release function.

use core::fmt::{self, Debug, Formatter};
use std::collections::BTreeSet;
use std::ffi::{c_char, CStr, CString};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use model_api_concept::{
    ChildEvent, Error, EventKind, ModelEvent, ObjectValue, PropertyChangeNotification, Result,
    Value,
};
use model_plumbing_rs::{
    ChildEventRecord, NativeIter, NativeObject, NativeValue, PropertiesChangedRecord, VALUE_BOOL,
    VALUE_DOUBLE, VALUE_EMPTY, VALUE_INT, VALUE_ITER, VALUE_OBJECT, VALUE_STRING, VALUE_UINT,
};

use crate::handle::NativeHandle;
use crate::native::NativeLibrary;

/// Who is responsible for releasing a native value after conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The native side keeps ownership; the value is valid for the current call only.
    Borrowed,
    /// Ownership moved to the receiver, which has to release the value.
    Transferred,
}

/// Conversion of a native value into a Rust value.
pub trait FromNative: Sized {
    /// Convert `value`.
    ///
    /// With [`Ownership::Transferred`] the value is consumed, whether or not the conversion
    /// succeeds.
    ///
    /// # Safety
    ///
    /// `value` must be a valid native value of `lib`, alive for the duration of the call.
    unsafe fn from_native(
        lib: &Arc<NativeLibrary>,
        value: &NativeValue,
        ownership: Ownership,
    ) -> Result<Self>;
}

/// Releases a transferred value when dropped.
struct Consume<'a> {
    lib: &'a NativeLibrary,
    value: NativeValue,
    ownership: Ownership,
}

impl Drop for Consume<'_> {
    fn drop(&mut self) {
        if self.ownership == Ownership::Transferred {
            // SAFETY: The value was transferred to us and is released exactly once.
            unsafe { (self.lib.api().value_clear)(&mut self.value) };
        }
    }
}

fn type_mismatch(expected: &str, tag: u32) -> Error {
    Error::failed(format!("expected {expected} value, got native tag {tag}"))
}

impl FromNative for Value {
    unsafe fn from_native(
        lib: &Arc<NativeLibrary>,
        value: &NativeValue,
        ownership: Ownership,
    ) -> Result<Self> {
        match value.tag {
            VALUE_OBJECT => {
                // SAFETY: upheld by the caller; the handle takes over a transferred reference.
                let handle = unsafe { NativeHandle::from_native(lib, value, ownership) }?;
                return Ok(Value::from(handle));
            }
            VALUE_ITER => {
                // SAFETY: upheld by the caller; a transferred iterator is freed after reading.
                let items = unsafe { Vec::<Value>::from_native(lib, value, ownership) }?;
                return Ok(Value::Sequence(items));
            }
            _ => {}
        }
        let value = Consume {
            lib,
            value: *value,
            ownership,
        };
        let payload = value.value.payload;
        // SAFETY: The tag selects the initialized union field.
        unsafe {
            match value.value.tag {
                VALUE_EMPTY => Ok(Value::Empty),
                VALUE_BOOL => Ok(Value::Bool(payload.boolean)),
                VALUE_INT => Ok(Value::Int(payload.int)),
                VALUE_UINT => Ok(Value::UInt(payload.uint)),
                VALUE_DOUBLE => Ok(Value::Double(payload.double)),
                VALUE_STRING => copy_c_string(payload.string).map(Value::String),
                tag => Err(type_mismatch("known", tag)),
            }
        }
    }
}

impl From<NativeHandle> for Value {
    fn from(handle: NativeHandle) -> Self {
        Value::Object(ObjectValue::new(handle.identity(), handle))
    }
}

impl FromNative for String {
    unsafe fn from_native(
        lib: &Arc<NativeLibrary>,
        value: &NativeValue,
        ownership: Ownership,
    ) -> Result<Self> {
        let value = Consume {
            lib,
            value: *value,
            ownership,
        };
        match value.value.tag {
            // SAFETY: The tag selects the initialized union field.
            VALUE_STRING => unsafe { copy_c_string(value.value.payload.string) },
            tag => Err(type_mismatch("string", tag)),
        }
    }
}

impl FromNative for NativeHandle {
    unsafe fn from_native(
        lib: &Arc<NativeLibrary>,
        value: &NativeValue,
        ownership: Ownership,
    ) -> Result<Self> {
        if value.tag != VALUE_OBJECT {
            let _release = Consume {
                lib,
                value: *value,
                ownership,
            };
            return Err(type_mismatch("object", value.tag));
        }
        // SAFETY: The tag selects the initialized union field.
        let object = unsafe { value.payload.object };
        match ownership {
            Ownership::Borrowed => NativeHandle::acquire(lib, object),
            // SAFETY: The reference moves from the value into the handle.
            Ownership::Transferred => unsafe { NativeHandle::from_transferred(lib, object) },
        }
    }
}

impl<T: FromNative> FromNative for Vec<T> {
    unsafe fn from_native(
        lib: &Arc<NativeLibrary>,
        value: &NativeValue,
        ownership: Ownership,
    ) -> Result<Self> {
        match value.tag {
            VALUE_EMPTY => Ok(Vec::new()),
            VALUE_ITER => {
                // SAFETY: The tag selects the initialized union field.
                let iter = unsafe { value.payload.iter };
                // SAFETY: The iterator is owned as tagged by the caller.
                unsafe { ValueIter::<T>::new(lib, iter, ownership) }?.collect()
            }
            tag => {
                let _release = Consume {
                    lib,
                    value: *value,
                    ownership,
                };
                Err(type_mismatch("sequence", tag))
            }
        }
    }
}

/// Copy a borrowed, NUL terminated native string.
///
/// # Safety
///
/// `raw` must be null or point to a NUL terminated string that is alive for the call.
pub unsafe fn copy_c_string(raw: *const c_char) -> Result<String> {
    if raw.is_null() {
        return Ok(String::new());
    }
    // SAFETY: upheld by the caller as documented above
    let text = unsafe { CStr::from_ptr(raw) };
    text.to_str()
        .map(str::to_owned)
        .map_err(|err| Error::failed(format!("native string is not valid UTF-8: {err}")))
}

/// Copy a borrowed, NULL terminated array of native strings.
///
/// # Safety
///
/// `raw` must be null or point to a NULL terminated array of NUL terminated strings, all alive
/// for the call.
pub unsafe fn copy_c_string_array(raw: *const *const c_char) -> Result<BTreeSet<String>> {
    let mut strings = BTreeSet::new();
    if raw.is_null() {
        return Ok(strings);
    }
    let mut cursor = raw;
    // SAFETY: upheld by the caller as documented above
    unsafe {
        while !(*cursor).is_null() {
            strings.insert(copy_c_string(*cursor)?);
            cursor = cursor.add(1);
        }
    }
    Ok(strings)
}

/// A value owned by the Rust side, lent to the native side for one call.
///
/// The native side must copy the value if it keeps it; objects are lent without a reference.
pub struct BorrowedValue {
    value: NativeValue,
    _string: Option<CString>,
    _object: Option<ObjectValue>,
    /// Iterator created for a sequence, freed on drop.
    sequence: Option<(Arc<NativeLibrary>, NonNull<NativeIter>)>,
}

impl BorrowedValue {
    pub fn new(lib: &Arc<NativeLibrary>, value: &Value) -> Result<Self> {
        let mut lent = Self {
            value: NativeValue::empty(),
            _string: None,
            _object: None,
            sequence: None,
        };
        lent.value = match value {
            Value::Empty => NativeValue::empty(),
            Value::Bool(v) => NativeValue::boolean(*v),
            Value::Int(v) => NativeValue::int(*v),
            Value::UInt(v) => NativeValue::uint(*v),
            Value::Double(v) => NativeValue::double(*v),
            Value::String(v) => {
                let storage = CString::new(v.as_str())
                    .map_err(|_| Error::failed("string value contains an interior NUL byte"))?;
                let raw = storage.as_ptr() as *mut c_char;
                lent._string = Some(storage);
                NativeValue::string(raw)
            }
            Value::Object(object) => {
                let raw = native_object(object)?.as_ptr()?;
                lent._object = Some(object.clone());
                NativeValue::object(raw)
            }
            Value::Sequence(items) => {
                let iter = new_iter(lib, items)?;
                lent.sequence = Some((Arc::clone(lib), iter));
                NativeValue::iter(iter.as_ptr())
            }
        };
        Ok(lent)
    }

    pub fn as_native(&self) -> &NativeValue {
        &self.value
    }
}

impl Drop for BorrowedValue {
    fn drop(&mut self) {
        if let Some((lib, iter)) = self.sequence.take() {
            // SAFETY: The iterator was created for this value and is freed exactly once.
            unsafe { (lib.api().iter_free)(iter.as_ptr()) };
        }
    }
}

fn native_object(object: &ObjectValue) -> Result<&NativeHandle> {
    object
        .downcast_ref::<NativeHandle>()
        .ok_or_else(|| Error::failed("object value does not refer to a native object"))
}

/// Native iterator over copies of `items`, owned by the caller.
fn new_iter(lib: &Arc<NativeLibrary>, items: &[Value]) -> Result<NonNull<NativeIter>> {
    let lent = items
        .iter()
        .map(|item| BorrowedValue::new(lib, item))
        .collect::<Result<Vec<_>>>()?;
    let natives: Vec<NativeValue> = lent.iter().map(|item| *item.as_native()).collect();
    let len = u32::try_from(natives.len())
        .map_err(|_| Error::failed("sequence has too many items"))?;
    // SAFETY: The items are borrowed for the call and copied by the native side.
    let iter = unsafe { (lib.api().iter_new)(natives.as_ptr(), len) };
    NonNull::new(iter).ok_or_else(|| Error::failed("native iterator could not be created"))
}

/// Encode `value` into a native value the native side takes ownership of.
pub(crate) fn transfer_value(lib: &Arc<NativeLibrary>, value: &Value) -> Result<NativeValue> {
    Ok(match value {
        Value::Empty => NativeValue::empty(),
        Value::Bool(v) => NativeValue::boolean(*v),
        Value::Int(v) => NativeValue::int(*v),
        Value::UInt(v) => NativeValue::uint(*v),
        Value::Double(v) => NativeValue::double(*v),
        Value::String(v) => NativeValue::string(lib.new_string(v)),
        Value::Object(object) => NativeValue::object(native_object(object)?.pin()?.into_raw()?),
        Value::Sequence(items) => NativeValue::iter(new_iter(lib, items)?.as_ptr()),
    })
}

/// Non-owning view of a native object, valid for the current callback only.
#[derive(Clone, Copy)]
pub struct ObjectRef<'a> {
    object: NonNull<NativeObject>,
    lib: &'a Arc<NativeLibrary>,
    _call: PhantomData<&'a NativeObject>,
}

impl<'a> ObjectRef<'a> {
    /// # Safety
    ///
    /// `object` must stay alive for `'a`.
    pub(crate) unsafe fn new(lib: &'a Arc<NativeLibrary>, object: NonNull<NativeObject>) -> Self {
        Self {
            object,
            lib,
            _call: PhantomData,
        }
    }

    pub fn as_ptr(&self) -> *mut NativeObject {
        self.object.as_ptr()
    }

    /// Take an owned reference that outlives the callback.
    pub fn to_handle(&self) -> Result<NativeHandle> {
        NativeHandle::acquire(self.lib, self.object.as_ptr())
    }
}

impl PartialEq for ObjectRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.object == other.object
    }
}

impl Debug for ObjectRef<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectRef").field(&self.object).finish()
    }
}

/// Lazy sequence over a native iterator.
///
/// Items are borrowed from the iterator and copied as they are produced. A transferred iterator
/// is freed on drop.
pub struct ValueIter<T> {
    iter: NonNull<NativeIter>,
    lib: Arc<NativeLibrary>,
    ownership: Ownership,
    done: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T: FromNative> ValueIter<T> {
    /// # Safety
    ///
    /// `iter` must be a native iterator of `lib` owned as stated by `ownership`; a borrowed
    /// iterator must outlive the returned value.
    pub unsafe fn new(
        lib: &Arc<NativeLibrary>,
        iter: *mut NativeIter,
        ownership: Ownership,
    ) -> Result<Self> {
        let iter = NonNull::new(iter).ok_or_else(|| Error::failed("native iterator is null"))?;
        Ok(Self {
            iter,
            lib: Arc::clone(lib),
            ownership,
            done: false,
            _item: PhantomData,
        })
    }

    /// Restart the sequence from its first element.
    pub fn rewind(&mut self) -> Result<()> {
        // SAFETY: The iterator is alive while `self` is.
        if unsafe { (self.lib.api().iter_reset)(self.iter.as_ptr()) } {
            self.done = false;
            Ok(())
        } else {
            Err(Error::failed("native iterator cannot be rewound"))
        }
    }
}

impl<T: FromNative> Iterator for ValueIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut value = NativeValue::empty();
        // SAFETY: The iterator is alive while `self` is and `value` is writable.
        if !unsafe { (self.lib.api().iter_next)(self.iter.as_ptr(), &mut value) } {
            self.done = true;
            return None;
        }
        // SAFETY: Produced items stay valid until the next call on the iterator.
        Some(unsafe { T::from_native(&self.lib, &value, Ownership::Borrowed) })
    }
}

impl<T> Drop for ValueIter<T> {
    fn drop(&mut self) {
        if self.ownership == Ownership::Transferred {
            // SAFETY: The iterator was transferred to us and is freed exactly once.
            unsafe { (self.lib.api().iter_free)(self.iter.as_ptr()) };
        }
    }
}

impl<T> Debug for ValueIter<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueIter")
            .field("ownership", &self.ownership)
            .field("done", &self.done)
            .finish()
    }
}

/// Decode the payload of a model event raised by the native side.
///
/// # Safety
///
/// `payload` must be the record matching `kind`, alive for `'a`.
pub(crate) unsafe fn decode_event<'a>(
    lib: &'a Arc<NativeLibrary>,
    kind: EventKind,
    payload: *const std::ffi::c_void,
) -> Result<ModelEvent<ObjectRef<'a>>> {
    if payload.is_null() && kind != EventKind::ChildrenCountChanged {
        return Err(Error::failed(format!("{kind:?} event without payload")));
    }
    // SAFETY: upheld by the caller as documented above
    unsafe {
        match kind {
            EventKind::PropertiesChanged => {
                let record = &*(payload as *const PropertiesChangedRecord);
                Ok(ModelEvent::PropertiesChanged(PropertyChangeNotification {
                    changed: copy_c_string_array(record.changed)?,
                    invalidated: copy_c_string_array(record.invalidated)?,
                }))
            }
            EventKind::ChildAdded => Ok(ModelEvent::ChildAdded(child_event(lib, payload))),
            EventKind::ChildRemoved => Ok(ModelEvent::ChildRemoved(child_event(lib, payload))),
            EventKind::ChildrenCountChanged => Ok(ModelEvent::ChildrenCountChanged),
        }
    }
}

unsafe fn child_event<'a>(
    lib: &'a Arc<NativeLibrary>,
    payload: *const std::ffi::c_void,
) -> ChildEvent<ObjectRef<'a>> {
    // SAFETY: upheld by `decode_event`
    let record = unsafe { &*(payload as *const ChildEventRecord) };
    ChildEvent {
        index: record.index,
        // SAFETY: The child is borrowed for the duration of the event callback.
        child: NonNull::new(record.child).map(|child| unsafe { ObjectRef::new(lib, child) }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{library, MockModel};

    #[test]
    fn test_borrowed_string_is_copied_and_left_alone() {
        let lib = library();
        let raw = lib.new_string("hello");
        let native = NativeValue::string(raw);
        // SAFETY: `native` holds a live native string.
        let value = unsafe { Value::from_native(&lib, &native, Ownership::Borrowed) }.unwrap();
        assert_eq!(value, Value::String("hello".into()));
        // SAFETY: still owned by the test
        assert_eq!(unsafe { CStr::from_ptr(raw) }.to_str().unwrap(), "hello");
        // SAFETY: released exactly once
        unsafe { (lib.api().string_free)(raw) };
    }

    #[test]
    fn test_transferred_object_is_adopted() {
        let lib = library();
        let model = MockModel::new(0);
        // SAFETY: the extra reference is transferred into the value
        let native = NativeValue::object(unsafe { (lib.api().object_ref)(model.as_ptr()) });
        assert_eq!(model.ref_count(), 2);
        // SAFETY: `native` owns one reference
        let handle =
            unsafe { NativeHandle::from_native(&lib, &native, Ownership::Transferred) }.unwrap();
        assert_eq!(model.ref_count(), 2);
        drop(handle);
        assert_eq!(model.ref_count(), 1);
    }

    #[test]
    fn test_borrowed_object_takes_a_reference() {
        let lib = library();
        let model = MockModel::new(0);
        let native = NativeValue::object(model.as_ptr());
        // SAFETY: `model` keeps the object alive
        let handle =
            unsafe { NativeHandle::from_native(&lib, &native, Ownership::Borrowed) }.unwrap();
        assert_eq!(model.ref_count(), 2);
        drop(handle);
        assert_eq!(model.ref_count(), 1);
    }

    #[test]
    fn test_type_mismatch_still_releases_transferred_value() {
        let lib = library();
        let model = MockModel::new(0);
        // SAFETY: the extra reference is transferred into the value
        let native = NativeValue::object(unsafe { (lib.api().object_ref)(model.as_ptr()) });
        // SAFETY: `native` owns one reference
        let result = unsafe { String::from_native(&lib, &native, Ownership::Transferred) };
        assert!(matches!(result, Err(Error::OperationFailed { .. })));
        assert_eq!(model.ref_count(), 1);
    }

    #[test]
    fn test_borrowed_value_lends_string() {
        let lib = library();
        let value = BorrowedValue::new(&lib, &Value::String("abc".into())).unwrap();
        assert_eq!(value.as_native().tag, VALUE_STRING);
        // SAFETY: the storage lives as long as `value`
        let text = unsafe { copy_c_string(value.as_native().payload.string) }.unwrap();
        assert_eq!(text, "abc");
        assert!(BorrowedValue::new(&lib, &Value::String("a\0b".into())).is_err());
    }

    #[test]
    fn test_object_and_iterator_tags_decode() {
        let lib = library();
        let model = MockModel::new(0);
        let native = NativeValue::object(model.as_ptr());
        // SAFETY: `model` keeps the object alive
        let value = unsafe { Value::from_native(&lib, &native, Ownership::Borrowed) }.unwrap();
        assert_eq!(value.as_object().map(ObjectValue::identity), Some(model.as_ptr() as usize));
        assert_eq!(model.ref_count(), 2);

        let items = [NativeValue::int(3), NativeValue::object(model.as_ptr())];
        // SAFETY: the items are borrowed for the call and copied
        let iter = unsafe { (lib.api().iter_new)(items.as_ptr(), items.len() as u32) };
        // SAFETY: the iterator is transferred into the conversion
        let sequence =
            unsafe { Value::from_native(&lib, &NativeValue::iter(iter), Ownership::Transferred) }
                .unwrap();
        assert_eq!(sequence, Value::Sequence(vec![Value::Int(3), value.clone()]));
        drop((value, sequence));
        assert_eq!(model.ref_count(), 1);
    }

    #[test]
    fn test_lent_sequence_is_freed_with_the_value() {
        let lib = library();
        let model = MockModel::new(0);
        let handle = NativeHandle::acquire(&lib, model.as_ptr()).unwrap();
        let nested = Value::Sequence(vec![
            Value::Sequence(vec![Value::Bool(true)]),
            Value::from(handle),
        ]);
        let lent = BorrowedValue::new(&lib, &nested).unwrap();
        assert_eq!(lent.as_native().tag, VALUE_ITER);
        // SAFETY: the iterator is borrowed from `lent`
        let copy = unsafe { Value::from_native(&lib, lent.as_native(), Ownership::Borrowed) };
        assert_eq!(copy.unwrap(), nested);
        // `nested`, and the copy held by the native iterator
        assert_eq!(model.ref_count(), 3);
        drop(lent);
        assert_eq!(model.ref_count(), 2);
        drop(nested);
        assert_eq!(model.ref_count(), 1);
    }

    #[test]
    fn test_transferred_object_value_carries_a_reference() {
        let lib = library();
        let model = MockModel::new(0);
        let value = Value::from(NativeHandle::acquire(&lib, model.as_ptr()).unwrap());
        let mut native = transfer_value(&lib, &value).unwrap();
        assert_eq!(native.tag, VALUE_OBJECT);
        assert_eq!(model.ref_count(), 3);
        // SAFETY: `native` owns one reference
        unsafe { (lib.api().value_clear)(&mut native) };
        drop(value);
        assert_eq!(model.ref_count(), 1);

        let foreign = Value::Object(ObjectValue::new(1, "not a native object"));
        assert!(transfer_value(&lib, &foreign).is_err());
        assert!(BorrowedValue::new(&lib, &foreign).is_err());
    }

    #[test]
    fn test_string_array_stops_at_null() {
        let first = CString::new("a").unwrap();
        let second = CString::new("b").unwrap();
        let array = [first.as_ptr(), second.as_ptr(), std::ptr::null()];
        // SAFETY: NULL terminated array of live strings
        let strings = unsafe { copy_c_string_array(array.as_ptr()) }.unwrap();
        assert_eq!(strings, BTreeSet::from(["a".to_string(), "b".to_string()]));
        // SAFETY: null is allowed
        assert!(unsafe { copy_c_string_array(std::ptr::null()) }.unwrap().is_empty());
    }

    #[test]
    fn test_property_iterator_rewinds() {
        let lib = library();
        let model = MockModel::new(0);
        model.seed_property("b", Value::Int(2));
        model.seed_property("a", Value::Int(1));
        let mut error = model_plumbing_rs::NativeError::default();
        // SAFETY: `model` is alive and `error` writable
        let iter = unsafe { (lib.api().get_properties)(model.as_ptr(), &mut error) };
        lib.check(error, "get-properties").unwrap();
        // SAFETY: the iterator was transferred
        let mut names =
            unsafe { ValueIter::<String>::new(&lib, iter, Ownership::Transferred) }.unwrap();
        let first: Vec<String> = names.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(first, vec!["a".to_string(), "b".to_string()]);
        assert!(names.next().is_none());
        names.rewind().unwrap();
        assert_eq!(names.next().unwrap().unwrap(), "a");
    }
}
