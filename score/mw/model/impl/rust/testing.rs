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

//! Fixtures for the unit tests, backed by the mock native library.

use std::sync::Arc;

use model_api_concept::Builder;

pub(crate) use model_native_mock::MockModel;

use crate::config::{BridgeBuilder, BridgeConfig};
use crate::model::Bridge;
use crate::native::{NativeLibrary, RawSymbol};

fn mock_symbols(name: &str) -> Option<RawSymbol> {
    model_native_mock::lookup_symbol(name).and_then(RawSymbol::new)
}

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn library() -> Arc<NativeLibrary> {
    init_logging();
    NativeLibrary::load(Box::new(mock_symbols), &BridgeConfig::default()).unwrap()
}

pub(crate) fn bridge() -> Bridge {
    init_logging();
    BridgeBuilder::new(mock_symbols).build().unwrap()
}
