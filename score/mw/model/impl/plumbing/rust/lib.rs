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

//! Memory layout mirrors for everything that crosses the native model boundary.
//!
//! Nothing in here has behavior beyond construction helpers. The types must stay byte-compatible
//! with the native headers; the layout tests in `event_records` and the size table published by
//! the native side are the safety net against divergence.

pub mod class_record;
pub mod common;
pub mod event_records;

#[path = "test_support/test_utils.rs"]
pub mod test_utils;

pub use class_record::*;
pub use common::*;
pub use event_records::{ChildEventRecord, PropertiesChangedRecord};
