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

use std::path::Path;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use model_api_concept::{Builder, Error, EventKind, Result};

use crate::event_registry::EventDescriptor;
use crate::model::Bridge;
use crate::native::{NativeLibrary, SymbolSource};

/// Settings of one bridge instance, read from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Prefix of every exported native symbol.
    pub entity_prefix: String,
    /// Namespace the model events are looked up in.
    pub event_namespace: String,
    /// Queue releases raised inside native callbacks instead of performing them in place.
    pub defer_release_in_callbacks: bool,
    /// Period of the background release sweeper. No sweeper thread is started if unset.
    pub sweep_interval_ms: Option<u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            entity_prefix: "model".to_string(),
            event_namespace: "model".to_string(),
            defer_release_in_callbacks: true,
            sweep_interval_ms: None,
        }
    }
}

impl BridgeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        Self::from_json(&json)
    }

    fn validate(&self) -> Result<()> {
        if self.entity_prefix.is_empty() {
            return Err(Error::Config("entity_prefix must not be empty".into()));
        }
        if self.event_namespace.is_empty() {
            return Err(Error::Config("event_namespace must not be empty".into()));
        }
        if self.sweep_interval_ms == Some(0) {
            return Err(Error::Config("sweep_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Loads the native library and sets up a [`Bridge`].
pub struct BridgeBuilder {
    symbols: Box<dyn SymbolSource>,
    config: BridgeConfig,
}

impl BridgeBuilder {
    pub fn new(symbols: impl SymbolSource + 'static) -> Self {
        Self {
            symbols: Box::new(symbols),
            config: BridgeConfig::default(),
        }
    }

    /// Replace the configuration with the content of a JSON file.
    pub fn load_config(&mut self, config: &Path) -> Result<&mut Self> {
        self.config = BridgeConfig::from_file(config)?;
        Ok(self)
    }

    pub fn with_config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }
}

impl Builder<Bridge> for BridgeBuilder {
    /// Resolve all required symbols and the model events.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid configuration, [`Error::SymbolNotFound`] for a missing
    /// entry point and [`Error::EventRegistrationFailed`] for a model event the native library
    /// does not know.
    fn build(self) -> Result<Bridge> {
        self.config.validate()?;
        let lib = NativeLibrary::load(self.symbols, &self.config)?;
        for kind in EventKind::ALL {
            lib.resolve_event(&EventDescriptor::model(&self.config.event_namespace, kind))?;
        }
        if let Some(interval) = self.config.sweep_interval_ms {
            spawn_sweeper(Arc::downgrade(&lib), Duration::from_millis(interval))?;
        }
        Ok(Bridge::new(lib, self.config))
    }
}

/// Periodically drain the release queue until the library is gone. Best effort only, releases
/// are drained at every checked boundary call anyway.
fn spawn_sweeper(lib: Weak<NativeLibrary>, interval: Duration) -> Result<()> {
    thread::Builder::new()
        .name("model-release-sweeper".into())
        .spawn(move || {
            debug!("Release sweeper started with an interval of {interval:?}");
            loop {
                thread::sleep(interval);
                match lib.upgrade() {
                    Some(lib) => {
                        lib.sweep();
                    }
                    None => break,
                }
            }
            debug!("Release sweeper stopped");
        })
        .map(drop)
        .map_err(|err| {
            warn!("Failed to start the release sweeper: {err}");
            Error::Config(format!("cannot start release sweeper: {err}"))
        })
}
