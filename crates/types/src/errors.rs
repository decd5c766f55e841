// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

pub type GenericError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that may clear up on their own when the operation is attempted again.
pub trait MaybeRetryableError: std::error::Error + 'static {
    fn retryable(&self) -> bool {
        false
    }
}

static_assertions::assert_obj_safe!(MaybeRetryableError);
