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

//! Guarded region around managed code invoked by the native side.
//!
//! Neither an error nor a panic of application code may unwind into the native caller. Both are
//! turned into [`Error::UnhandledCallbackError`], logged and recorded in the error channel of the
//! library, from where the next checked boundary call surfaces them.

use std::any::Any;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};

use log::error;

use model_api_concept::{CallbackResult, Error};

use crate::native::NativeLibrary;

thread_local! {
    static CALLBACK_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Marks the current thread as running inside a native callback while alive.
pub(crate) struct CallbackScope {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl CallbackScope {
    pub(crate) fn enter() -> Self {
        CALLBACK_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        CALLBACK_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Whether the current thread is executing a callback raised by the native library.
pub fn in_native_callback() -> bool {
    CALLBACK_DEPTH.with(|depth| depth.get() > 0)
}

/// Callback failure recorded in the error channel of a library.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    /// Names the failure in the error channel.
    pub token: u64,
    pub error: Error,
}

/// Run `callback`, containing its failures.
///
/// On failure the error is logged and recorded through [`NativeLibrary::report_unhandled`]
/// before it is returned, so the caller only has to translate it into the native default.
pub(crate) fn guarded<R>(
    lib: &NativeLibrary,
    context: &str,
    callback: impl FnOnce() -> CallbackResult<R>,
) -> std::result::Result<R, Failure> {
    let message = match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(result)) => return Ok(result),
        Ok(Err(err)) => err.to_string(),
        Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
    };
    error!("Callback failure in {context}: {message}");
    Err(lib.report_unhandled(Error::UnhandledCallbackError {
        context: context.to_string(),
        message,
    }))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_tracks_nesting() {
        assert!(!in_native_callback());
        {
            let _outer = CallbackScope::enter();
            assert!(in_native_callback());
            {
                let _inner = CallbackScope::enter();
                assert!(in_native_callback());
            }
            assert!(in_native_callback());
        }
        assert!(!in_native_callback());
    }

    #[test]
    fn test_scope_is_per_thread() {
        let _scope = CallbackScope::enter();
        let other = std::thread::spawn(in_native_callback).join().unwrap();
        assert!(!other);
        assert!(in_native_callback());
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload = catch_unwind(|| {
            panic!("boom {}", 42);
        })
        .unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 42");
        let payload = catch_unwind(|| {
            std::panic::panic_any(7_u8);
        })
        .unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "<non-string panic payload>");
    }

    #[test]
    fn test_failures_get_distinct_tokens() {
        let lib = crate::testing::library();
        let first = guarded(&lib, "first", || -> CallbackResult<()> { Err("one".into()) });
        let second = guarded(&lib, "second", || -> CallbackResult<()> { panic!("two") });
        let (first, second) = (first.unwrap_err(), second.unwrap_err());
        assert_ne!(first.token, second.token);
        assert_eq!(
            second.error,
            Error::UnhandledCallbackError {
                context: "second".into(),
                message: "panicked: two".into()
            }
        );
        assert_eq!(lib.take_unhandled_errors(), vec![first.error, second.error]);
    }
}
