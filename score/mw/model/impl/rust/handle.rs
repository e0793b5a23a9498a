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
use std::hash::{Hash, Hasher};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use model_api_concept::{Error, Result};
use model_plumbing_rs::NativeObject;

use crate::native::NativeLibrary;

/// Owner of exactly one reference to a native object.
///
/// The reference is given back when the handle is disposed, either explicitly through
/// [`NativeHandle::dispose`] or on drop. Disposal is idempotent and safe to race from several
/// threads; afterwards every use of the handle fails with [`Error::InvalidHandle`].
pub struct NativeHandle {
    object: AtomicPtr<NativeObject>,
    identity: usize,
    /// Serializes taking extra references against disposal, so that a reference is never taken
    /// after the owned one was given back.
    retain_lock: Mutex<()>,
    lib: Arc<NativeLibrary>,
}

impl NativeHandle {
    /// Wrap `raw` and take a new native reference to it.
    pub fn acquire(lib: &Arc<NativeLibrary>, raw: *mut NativeObject) -> Result<Self> {
        if raw.is_null() {
            return Err(Error::InvalidHandle);
        }
        // SAFETY: `raw` is a live native object, borrowed from the caller for this call.
        unsafe { (lib.api().object_ref)(raw) };
        Ok(Self::new(lib, raw))
    }

    /// Adopt the reference that was transferred together with `raw`.
    ///
    /// # Safety
    ///
    /// `raw` must be null or a native object whose reference is owned by the caller and not used
    /// by it afterwards.
    pub unsafe fn from_transferred(
        lib: &Arc<NativeLibrary>,
        raw: *mut NativeObject,
    ) -> Result<Self> {
        if raw.is_null() {
            return Err(Error::InvalidHandle);
        }
        Ok(Self::new(lib, raw))
    }

    fn new(lib: &Arc<NativeLibrary>, raw: *mut NativeObject) -> Self {
        Self {
            object: AtomicPtr::new(raw),
            identity: raw as usize,
            retain_lock: Mutex::new(()),
            lib: Arc::clone(lib),
        }
    }

    /// Take an additional native reference. Returns null if the handle is disposed.
    fn retain(&self) -> *mut NativeObject {
        let _retain = self.retain_lock.lock();
        let raw = self.object.load(Ordering::Acquire);
        if !raw.is_null() {
            // SAFETY: The owned reference cannot be given back while `retain` is held.
            unsafe { (self.lib.api().object_ref)(raw) };
        }
        raw
    }

    /// Second handle to the same object that keeps it alive for the duration of a native call,
    /// even if this handle is disposed concurrently.
    pub fn pin(&self) -> Result<NativeHandle> {
        let raw = self.retain();
        if raw.is_null() {
            return Err(Error::InvalidHandle);
        }
        Ok(Self::new(&self.lib, raw))
    }

    pub fn as_ptr(&self) -> Result<*mut NativeObject> {
        let raw = self.object.load(Ordering::Acquire);
        if raw.is_null() {
            Err(Error::InvalidHandle)
        } else {
            Ok(raw)
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.object.load(Ordering::Acquire).is_null()
    }

    /// Give the reference back. Returns `false` if the handle was already disposed.
    pub fn dispose(&self) -> bool {
        let raw = {
            let _retain = self.retain_lock.lock();
            self.object.swap(ptr::null_mut(), Ordering::AcqRel)
        };
        match NonNull::new(raw) {
            Some(object) => {
                self.lib.release(object);
                true
            }
            None => false,
        }
    }

    /// Hand the owned reference over to the caller without releasing it.
    pub fn into_raw(self) -> Result<*mut NativeObject> {
        let raw = self.object.swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            Err(Error::InvalidHandle)
        } else {
            Ok(raw)
        }
    }

    /// Address of the native object, kept after disposal.
    pub fn identity(&self) -> usize {
        self.identity
    }

    pub fn library(&self) -> &Arc<NativeLibrary> {
        &self.lib
    }
}

impl Clone for NativeHandle {
    fn clone(&self) -> Self {
        Self {
            object: AtomicPtr::new(self.retain()),
            identity: self.identity,
            retain_lock: Mutex::new(()),
            lib: Arc::clone(&self.lib),
        }
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl PartialEq for NativeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for NativeHandle {}

impl Hash for NativeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}

impl Debug for NativeHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("object", &(self.identity as *const NativeObject))
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{library, MockModel};

    #[test]
    fn test_acquire_and_drop_balance_references() {
        let lib = library();
        let model = MockModel::new(0);
        assert_eq!(model.ref_count(), 1);
        {
            let handle = NativeHandle::acquire(&lib, model.as_ptr()).unwrap();
            assert_eq!(model.ref_count(), 2);
            let copy = handle.clone();
            assert_eq!(model.ref_count(), 3);
            assert_eq!(handle, copy);
        }
        assert_eq!(model.ref_count(), 1);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let lib = library();
        let model = MockModel::new(0);
        let handle = NativeHandle::acquire(&lib, model.as_ptr()).unwrap();
        assert!(handle.dispose());
        assert!(!handle.dispose());
        assert!(handle.is_disposed());
        assert_eq!(handle.as_ptr(), Err(Error::InvalidHandle));
        drop(handle);
        assert_eq!(model.ref_count(), 1);
    }

    #[test]
    fn test_concurrent_dispose_releases_once() {
        let lib = library();
        let model = MockModel::new(0);
        let handle = Arc::new(NativeHandle::acquire(&lib, model.as_ptr()).unwrap());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let handle = Arc::clone(&handle);
                std::thread::spawn(move || handle.dispose())
            })
            .collect();
        let released = workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .filter(|released| *released)
            .count();
        assert_eq!(released, 1);
        assert_eq!(model.ref_count(), 1);
    }

    #[test]
    fn test_null_is_rejected() {
        let lib = library();
        assert_eq!(
            NativeHandle::acquire(&lib, ptr::null_mut()).unwrap_err(),
            Error::InvalidHandle
        );
    }

    #[test]
    fn test_into_raw_keeps_the_reference() {
        let lib = library();
        let model = MockModel::new(0);
        let handle = NativeHandle::acquire(&lib, model.as_ptr()).unwrap();
        let raw = handle.into_raw().unwrap();
        assert_eq!(model.ref_count(), 2);
        // SAFETY: `raw` carries the reference handed out by `into_raw`.
        let adopted = unsafe { NativeHandle::from_transferred(&lib, raw) }.unwrap();
        assert_eq!(model.ref_count(), 2);
        drop(adopted);
        assert_eq!(model.ref_count(), 1);
    }

    #[test]
    fn test_clone_of_disposed_handle_is_disposed() {
        let lib = library();
        let model = MockModel::new(0);
        let handle = NativeHandle::acquire(&lib, model.as_ptr()).unwrap();
        handle.dispose();
        let copy = handle.clone();
        assert!(copy.is_disposed());
        assert_eq!(copy, handle);
        assert_eq!(model.ref_count(), 1);
    }

    #[test]
    fn test_clone_racing_dispose_never_resurrects() {
        let lib = library();
        let model = MockModel::new(0);
        for _ in 0..200 {
            let handle = Arc::new(NativeHandle::acquire(&lib, model.as_ptr()).unwrap());
            let cloner = {
                let handle = Arc::clone(&handle);
                std::thread::spawn(move || {
                    (0..16)
                        .map(|_| handle.clone())
                        .filter(|copy| !copy.is_disposed())
                        .count()
                })
            };
            handle.dispose();
            cloner.join().unwrap();
            assert!(handle.is_disposed());
            assert_eq!(model.ref_count(), 1);
        }
    }

    #[test]
    fn test_pin_outlives_dispose() {
        let lib = library();
        let model = MockModel::new(0);
        let handle = NativeHandle::acquire(&lib, model.as_ptr()).unwrap();
        let pinned = handle.pin().unwrap();
        assert_eq!(model.ref_count(), 3);
        handle.dispose();
        assert_eq!(pinned.as_ptr().unwrap(), model.as_ptr());
        assert_eq!(model.ref_count(), 2);
        drop(pinned);
        assert_eq!(model.ref_count(), 1);
        assert_eq!(handle.pin().unwrap_err(), Error::InvalidHandle);
    }
}
