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

//! Asynchronous results of native operations.
//!
//! Native futures are reference counted objects that invoke a completion callback once they are
//! resolved, failed or canceled. [`NativeFuture`] adapts them to [`std::future::Future`]; its
//! one-shot [`Completion`] cell accepts exactly one outcome. Cancellation is requested through a
//! [`CancellationToken`] and confirmed by the native side.

use core::fmt::{self, Debug, Formatter};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::task::AtomicWaker;
use log::{error, warn};
use parking_lot::Mutex;

use model_api_concept::{Error, Result};
use model_plumbing_rs::{
    NativeError, NativeObject, NativeValue, FUTURE_CANCELED, FUTURE_FAILED, FUTURE_PENDING,
    FUTURE_RESOLVED,
};

use crate::guard::CallbackScope;
use crate::handle::NativeHandle;
use crate::marshal::{FromNative, Ownership};
use crate::native::NativeLibrary;

enum State<T> {
    Pending,
    Ready(Result<T>),
    Taken,
}

/// One-shot result cell.
pub struct Completion<T> {
    state: Mutex<State<T>>,
    waker: AtomicWaker,
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::Pending),
            waker: AtomicWaker::new(),
        }
    }
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the outcome and wake the waiting task.
    ///
    /// # Errors
    ///
    /// [`Error::FutureAlreadyCompleted`] if an outcome was stored before; the earlier outcome is
    /// kept.
    pub fn complete(&self, outcome: Result<T>) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(*state, State::Pending) {
            error!("Dropping second completion of an already completed future");
            return Err(Error::FutureAlreadyCompleted);
        }
        *state = State::Ready(outcome);
        drop(state);
        self.waker.wake();
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        !matches!(*self.state.lock(), State::Pending)
    }

    pub fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Result<T>> {
        self.waker.register(cx.waker());
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, State::Taken) {
            State::Pending => {
                *state = State::Pending;
                Poll::Pending
            }
            State::Ready(outcome) => Poll::Ready(outcome),
            State::Taken => Poll::Ready(Err(Error::FutureAlreadyCompleted)),
        }
    }
}

impl<T> Debug for Completion<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("completed", &self.is_completed())
            .finish()
    }
}

type CancelHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CancelState {
    canceled: AtomicBool,
    next_hook: AtomicU64,
    hooks: Mutex<Vec<(u64, CancelHook)>>,
}

/// Cancellation signal shared between the requester and any number of pending operations.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<CancelState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of every operation watching this token. Idempotent.
    pub fn cancel(&self) {
        let hooks = {
            let mut hooks = self.state.hooks.lock();
            if self.state.canceled.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *hooks)
        };
        for (_, hook) in hooks {
            hook();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::Acquire)
    }

    /// Run `hook` on cancellation, or right away if cancellation was already requested.
    ///
    /// Returns the id to remove the hook with, `None` if it already ran.
    fn on_cancel(&self, hook: CancelHook) -> Option<u64> {
        let mut hooks = self.state.hooks.lock();
        if self.is_canceled() {
            drop(hooks);
            hook();
            return None;
        }
        let id = self.state.next_hook.fetch_add(1, Ordering::Relaxed);
        hooks.push((id, hook));
        Some(id)
    }

    fn remove_hook(&self, id: u64) {
        let removed = {
            let mut hooks = self.state.hooks.lock();
            hooks
                .iter()
                .position(|(hook_id, _)| *hook_id == id)
                .map(|position| hooks.remove(position))
        };
        drop(removed);
    }
}

impl Debug for CancellationToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

struct ThenContext<T> {
    lib: Arc<NativeLibrary>,
    completion: Arc<Completion<T>>,
}

/// Host side of a native future.
///
/// Resolves to the converted value, to the native error, or to [`Error::Canceled`] once the
/// native side confirmed a cancellation. Dropping the future does not cancel the native
/// operation.
pub struct NativeFuture<T> {
    completion: Arc<Completion<T>>,
    future: NativeHandle,
    cancel: Option<(CancellationToken, u64)>,
}

impl<T: FromNative + Send + 'static> NativeFuture<T> {
    /// Attach to `future`, whose outcome is converted into `T`.
    pub fn new(future: NativeHandle, cancel: Option<&CancellationToken>) -> Result<Self> {
        let raw = future.as_ptr()?;
        let lib = Arc::clone(future.library());
        let completion = Arc::new(Completion::new());
        let context = Box::into_raw(Box::new(ThenContext {
            lib: Arc::clone(&lib),
            completion: Arc::clone(&completion),
        }));
        // SAFETY: The native side owns `context` from here on and releases it through
        // `release_then::<T>`. The callback may run synchronously if the future is complete.
        unsafe {
            (lib.api().future_then)(
                raw,
                future_completed::<T>,
                context as *mut c_void,
                release_then::<T>,
            )
        };

        let cancel = match cancel {
            Some(token) => {
                let target = future.clone();
                token
                    .on_cancel(Box::new(move || request_cancel(&target)))
                    .map(|id| (token.clone(), id))
            }
            None => None,
        };

        Ok(Self {
            completion,
            future,
            cancel,
        })
    }

    /// Ask the native side to cancel the operation. The outcome stays authoritative.
    pub fn cancel(&self) {
        request_cancel(&self.future);
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_completed()
    }

    fn detach_cancel(&mut self) {
        if let Some((token, id)) = self.cancel.take() {
            token.remove_hook(id);
        }
    }
}

fn request_cancel(future: &NativeHandle) {
    if let Ok(raw) = future.as_ptr() {
        warn!("Requesting cancellation of native future {raw:p}");
        // SAFETY: The handle keeps the future alive.
        unsafe { (future.library().api().future_cancel)(raw) };
    }
}

impl<T: FromNative + Send + 'static> Future for NativeFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = this.completion.poll_take(cx);
        if outcome.is_ready() {
            this.detach_cancel();
        }
        outcome
    }
}

impl<T> Drop for NativeFuture<T> {
    fn drop(&mut self) {
        if let Some((token, id)) = self.cancel.take() {
            token.remove_hook(id);
        }
    }
}

impl<T> Debug for NativeFuture<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFuture")
            .field("future", &self.future)
            .field("completion", &self.completion)
            .finish()
    }
}

/// Read the outcome of a completed native future.
///
/// # Safety
///
/// `future` must be a live native future of `lib`.
unsafe fn outcome<T: FromNative>(lib: &Arc<NativeLibrary>, future: *mut NativeObject) -> Result<T> {
    let api = lib.api();
    // SAFETY: upheld by the caller as documented above
    unsafe {
        match (api.future_state)(future) {
            FUTURE_RESOLVED => {
                let mut value = NativeValue::empty();
                if !(api.future_take_value)(future, &mut value) {
                    return Err(Error::failed("resolved native future has no value"));
                }
                T::from_native(lib, &value, Ownership::Transferred)
            }
            FUTURE_FAILED => {
                let mut error = NativeError::default();
                (api.future_take_error)(future, &mut error);
                Err(lib.error_from_native(error, "native future"))
            }
            FUTURE_CANCELED => Err(Error::Canceled),
            FUTURE_PENDING => Err(Error::failed("completion reported for a pending native future")),
            state => Err(Error::failed(format!("unknown native future state {state}"))),
        }
    }
}

unsafe extern "C" fn future_completed<T: FromNative>(
    future: *mut NativeObject,
    user_data: *mut c_void,
) {
    let _scope = CallbackScope::enter();
    // SAFETY: `user_data` is the context given to `future_then`, alive until `release_then`.
    let context = unsafe { &*(user_data as *const ThenContext<T>) };
    if context.completion.is_completed() {
        // Rejected and logged by the completion, the first outcome stays.
        let _ = context.completion.complete(Err(Error::FutureAlreadyCompleted));
        return;
    }
    // SAFETY: The native side passes the future it completes.
    let outcome = unsafe { outcome::<T>(&context.lib, future) };
    let _ = context.completion.complete(outcome);
}

unsafe extern "C" fn release_then<T>(user_data: *mut c_void) {
    // SAFETY: Called exactly once with the context given to `future_then`.
    drop(unsafe { Box::from_raw(user_data as *mut ThenContext<T>) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;

    #[test]
    fn test_first_completion_wins() {
        let completion = Completion::<u32>::new();
        completion.complete(Ok(1)).unwrap();
        assert_eq!(completion.complete(Ok(2)), Err(Error::FutureAlreadyCompleted));
        let mut cx = Context::from_waker(noop_waker_ref());
        assert_eq!(completion.poll_take(&mut cx), Poll::Ready(Ok(1)));
        assert_eq!(completion.complete(Ok(3)), Err(Error::FutureAlreadyCompleted));
    }

    #[test]
    fn test_pending_until_completed() {
        let completion = Arc::new(Completion::<&'static str>::new());
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(completion.poll_take(&mut cx).is_pending());
        let remote = Arc::clone(&completion);
        std::thread::spawn(move || remote.complete(Ok("done")).unwrap())
            .join()
            .unwrap();
        assert_eq!(completion.poll_take(&mut cx), Poll::Ready(Ok("done")));
    }

    #[test]
    fn test_cancel_runs_hooks_once() {
        let token = CancellationToken::new();
        let runs = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&runs);
        token.on_cancel(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let removed = Arc::clone(&runs);
        let id = token
            .on_cancel(Box::new(move || {
                removed.fetch_add(100, Ordering::SeqCst);
            }))
            .unwrap();
        token.remove_hook(id);

        token.cancel();
        token.cancel();
        assert!(token.is_canceled());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_after_cancel_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        assert!(token
            .on_cancel(Box::new(move || flag.store(true, Ordering::SeqCst)))
            .is_none());
        assert!(ran.load(Ordering::SeqCst));
    }
}
