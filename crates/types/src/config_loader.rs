// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::path::PathBuf;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use tracing::debug;

use crate::config::{HintsOptions, InvalidConfigurationError};

const ENV_PREFIX: &str = "HANDOFF_";

#[derive(thiserror::Error, Debug)]
pub enum ConfigLoadError {
    #[error("configuration loading error: {0}")]
    Figment(Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(#[from] InvalidConfigurationError),
}

// Because thiserror doesn't support auto-boxing or auto implements From with boxing.
impl From<figment::Error> for ConfigLoadError {
    fn from(value: figment::Error) -> Self {
        Self::Figment(Box::new(value))
    }
}

/// Loads [`HintsOptions`] by layering, in increasing priority: defaults, an optional TOML
/// file and `HANDOFF_` prefixed environment variables (`HANDOFF_ARENA_SIZE=1MiB`).
#[derive(Debug, Default)]
pub struct ConfigLoader {
    path: Option<PathBuf>,
    load_env: bool,
    custom_default: Option<HintsOptions>,
}

impl ConfigLoader {
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn load_env(mut self, load_env: bool) -> Self {
        self.load_env = load_env;
        self
    }

    pub fn custom_default(mut self, defaults: HintsOptions) -> Self {
        self.custom_default = Some(defaults);
        self
    }

    pub fn load_once(&self) -> Result<HintsOptions, ConfigLoadError> {
        let defaults = self.custom_default.clone().unwrap_or_default();

        let mut figment = Figment::from(Serialized::defaults(defaults));
        if let Some(path) = &self.path {
            debug!("Loading hints configuration from {}", path.display());
            figment = figment.merge(Toml::file_exact(path.as_path()));
        }

        if self.load_env {
            figment = Self::merge_with_env(figment);
        }

        let options: HintsOptions = figment.extract()?;
        options.validate()?;
        Ok(options)
    }

    fn merge_with_env(figment: Figment) -> Figment {
        figment.merge(
            Env::prefixed(ENV_PREFIX)
                .split("__")
                .map(|k| k.as_str().replace('_', "-").into()),
        )
    }
}
