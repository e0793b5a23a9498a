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

//! Bridge between native hierarchical models and Rust.
//!
//! Native models are reached through [`NativeModel`], which implements the capability contract
//! of `model_api_concept`. Model types implemented in Rust are exposed to the native side through
//! [`ModelImpl`] and [`Bridge::new_subclass`].

#[macro_use]
mod macros;

mod config;
mod dispatch;
mod event_registry;
mod future;
mod guard;
mod handle;
mod marshal;
mod model;
pub mod native;

#[cfg(test)]
mod testing;

pub use config::{BridgeBuilder, BridgeConfig};
pub use dispatch::{Capability, DispatchEntry, DispatchTable, ModelImpl, Super};
pub use event_registry::{EventDescriptor, EventHandler, EventRegistry, MODEL_EVENTS};
pub use future::{CancellationToken, Completion, NativeFuture};
pub use guard::{in_native_callback, Failure};
pub use handle::NativeHandle;
pub use marshal::{BorrowedValue, FromNative, ObjectRef, Ownership, ValueIter};
pub use model::{Bridge, NativeModel};
pub use native::{NativeLibrary, RawSymbol, SymbolSource};

pub use model_api_concept::{
    Builder, CallbackError, CallbackResult, ChildEvent, Error, EventKind, HandlerId, Model,
    ModelEvent, ObjectValue, ObservableModel, PropertyChangeNotification, Result, Value,
};

pub mod ffi {
    pub use model_plumbing_rs::{
        ChildEventRecord, ModelClass, NativeError, NativeIter, NativeObject, NativeValue,
        PropertiesChangedRecord, StringView,
    };
}
