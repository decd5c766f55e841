// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::num::NonZeroU32;
use std::time::Duration;

use tracing::trace;

pub(crate) type TokenBucket<C = gardal::TokioClock> =
    gardal::TokenBucket<gardal::PaddedAtomicSharedStorage, C>;

/// Caps the payload bytes replayed to one target per second. One token is one byte and the
/// bucket holds at most one second worth of tokens.
pub(crate) struct Throttle {
    bucket: Option<TokenBucket>,
    bytes_per_second: u32,
}

impl Throttle {
    pub fn new(bytes_per_second: Option<NonZeroU32>) -> Self {
        let Some(rate) = bytes_per_second else {
            return Self {
                bucket: None,
                bytes_per_second: 0,
            };
        };
        let limit = gardal::Limit::per_second_and_burst(rate, rate);
        let capacity = limit.burst();
        let bucket = TokenBucket::from_parts(limit, gardal::TokioClock::default());
        bucket.add_tokens(capacity.get());
        Self {
            bucket: Some(bucket),
            bytes_per_second: rate.get(),
        }
    }

    /// Waits until `bytes` may be sent. A payload above the burst is charged a full burst.
    pub async fn acquire(&self, bytes: usize) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        let charged = u32::try_from(bytes)
            .unwrap_or(u32::MAX)
            .min(self.bytes_per_second);
        let Some(tokens) = NonZeroU32::new(charged) else {
            return;
        };
        // refill time of a quarter of the charge
        let backoff = Duration::from_secs_f64(
            f64::from(charged) / f64::from(self.bytes_per_second) / 4.0,
        )
        .max(Duration::from_millis(1));
        while bucket.consume(tokens).is_none() {
            trace!(bytes, ?backoff, "Dispatch throttled");
            tokio::time::sleep(backoff).await;
        }
    }
}
