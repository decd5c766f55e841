// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::io;
use std::path::{Path, PathBuf};

use handoff_types::errors::MaybeRetryableError;
use handoff_types::identifiers::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("segment '{}' is corrupted: {reason}", path.display())]
    Corrupted { path: PathBuf, reason: String },
    #[error("target {0} is retired")]
    Retired(NodeId),
}

impl StoreError {
    pub(crate) fn io(path: impl AsRef<Path>) -> impl FnOnce(io::Error) -> StoreError {
        let path = path.as_ref().to_path_buf();
        move |source| StoreError::Io { path, source }
    }

    pub(crate) fn corrupted(path: impl AsRef<Path>, reason: impl ToString) -> StoreError {
        StoreError::Corrupted {
            path: path.as_ref().to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

impl MaybeRetryableError for StoreError {
    fn retryable(&self) -> bool {
        match self {
            // the flush path retries every I/O failure
            StoreError::Io { .. } => true,
            StoreError::Corrupted { .. } | StoreError::Retired(_) => false,
        }
    }
}
