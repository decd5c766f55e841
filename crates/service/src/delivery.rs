// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use bytes::Bytes;

use handoff_types::errors::{GenericError, MaybeRetryableError};
use handoff_types::identifiers::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The target may accept the mutation later, dispatch pauses and retries.
    #[error("delivery failed, will retry: {0}")]
    Retryable(GenericError),
    /// The target will never accept hints again, its dispatcher is retired.
    #[error("delivery failed permanently: {0}")]
    Fatal(GenericError),
}

impl DeliveryError {
    pub fn retry_later(err: impl Into<GenericError>) -> Self {
        Self::Retryable(err.into())
    }

    pub fn fatal(err: impl Into<GenericError>) -> Self {
        Self::Fatal(err.into())
    }
}

impl MaybeRetryableError for DeliveryError {
    fn retryable(&self) -> bool {
        matches!(self, DeliveryError::Retryable(_))
    }
}

/// Sends a replayed mutation to its target over the store's replication protocol.
///
/// Returning `Ok` acknowledges the hint: it will not be delivered again by this process.
#[async_trait::async_trait]
pub trait HintDelivery: Send + Sync + 'static {
    async fn deliver(&self, target: NodeId, payload: Bytes) -> Result<(), DeliveryError>;
}
