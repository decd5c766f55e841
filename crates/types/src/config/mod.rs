// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

mod hints;

pub use hints::*;

#[derive(Debug, thiserror::Error)]
#[error("invalid option '{option}': {reason}")]
pub struct InvalidConfigurationError {
    pub option: &'static str,
    pub reason: String,
}

impl InvalidConfigurationError {
    pub fn new(option: &'static str, reason: impl Into<String>) -> Self {
        Self {
            option,
            reason: reason.into(),
        }
    }
}
