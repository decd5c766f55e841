// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use handoff_store::StoreError;
use handoff_types::config::InvalidConfigurationError;

#[derive(Debug, thiserror::Error)]
pub enum RecordHintError {
    #[error("hint has no targets")]
    NoTargets,
    #[error("hint has {0} targets, at most {max} are supported", max = handoff_types::hint::MAX_TARGETS)]
    TooManyTargets(usize),
    #[error("hint of {size} bytes exceeds the arena size of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
    #[error("hint buffer is full, the hint was dropped")]
    Backpressure,
    #[error("hints service is shutting down")]
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    InvalidConfiguration(#[from] InvalidConfigurationError),
    #[error("cannot open the hints store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("hints service is shutting down")]
pub struct ShutdownError;
